//! HTTP client for the persistence tier (dbman). Every call is a JSON POST
//! against a pool of replicas with round-robin selection and per-endpoint
//! circuit breaking.

mod api;
mod client;

pub use client::{Client, ClientSettings, DbmanError, BASE_PATH};
