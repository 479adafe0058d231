use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub const BASE_PATH: &str = "/api/internal/v1/db";

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_FAIL_THRESHOLD: u32 = 3;
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DbmanError {
    #[error("dbman endpoint is not configured")]
    NotConfigured,
    #[error("dbman status {status} endpoint={endpoint}")]
    Status { status: u16, endpoint: String },
    #[error("dbman request failed endpoint={endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("dbman response decode failed endpoint={endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("dbman request failed: all endpoints exhausted")]
    Exhausted,
}

impl DbmanError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DbmanError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub http_timeout: Duration,
    pub fail_threshold: u32,
    pub cooldown: Duration,
}

impl ClientSettings {
    pub fn from_env() -> Self {
        Self {
            http_timeout: Duration::from_millis(shoal_core::env::int(
                "DBMAN_HTTP_TIMEOUT_MS",
                DEFAULT_HTTP_TIMEOUT.as_millis() as i64,
            ) as u64),
            fail_threshold: shoal_core::env::int(
                "DBMAN_FAIL_THRESHOLD",
                DEFAULT_FAIL_THRESHOLD as i64,
            ) as u32,
            cooldown: Duration::from_millis(shoal_core::env::int(
                "DBMAN_COOLDOWN_MS",
                DEFAULT_COOLDOWN.as_millis() as i64,
            ) as u64),
        }
    }
}

#[derive(Default)]
struct BreakerState {
    failures: HashMap<String, u32>,
    cooldown_until: HashMap<String, Instant>,
}

pub struct Client {
    endpoints: Vec<String>,
    http: reqwest::Client,
    next: AtomicU32,
    fail_threshold: u32,
    cooldown: Duration,
    breaker: Mutex<BreakerState>,
}

impl Client {
    pub fn from_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::with_settings(endpoints, ClientSettings::from_env())
    }

    pub fn with_settings<I, S>(endpoints: I, settings: ClientSettings) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let http = reqwest::Client::builder()
            .timeout(settings.http_timeout)
            .build()
            .expect("build http client");
        Self {
            endpoints: normalize_endpoints(endpoints),
            http,
            next: AtomicU32::new(0),
            fail_threshold: settings.fail_threshold.max(1),
            cooldown: settings.cooldown,
            breaker: Mutex::new(BreakerState::default()),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// One JSON POST against the pool. The starting replica rotates per
    /// request; 5xx and transport errors fail over to the next replica and
    /// feed the breaker, 3xx-4xx responses are terminal.
    pub async fn post<T, P>(&self, path: &str, payload: &P) -> Result<T, DbmanError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        if self.endpoints.is_empty() {
            return Err(DbmanError::NotConfigured);
        }
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let start = self.next.fetch_add(1, Ordering::Relaxed) as usize % self.endpoints.len();
        let mut last_err = None;
        for offset in 0..self.endpoints.len() {
            let endpoint = &self.endpoints[(start + offset) % self.endpoints.len()];
            if self.is_cooling_down(endpoint) {
                continue;
            }

            let response = match self
                .http
                .post(format!("{endpoint}{path}"))
                .json(payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(source) => {
                    self.on_failure(endpoint);
                    last_err = Some(DbmanError::Transport {
                        endpoint: endpoint.clone(),
                        source,
                    });
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                self.on_failure(endpoint);
                last_err = Some(DbmanError::Status {
                    status: status.as_u16(),
                    endpoint: endpoint.clone(),
                });
                continue;
            }
            if !status.is_success() {
                return Err(DbmanError::Status {
                    status: status.as_u16(),
                    endpoint: endpoint.clone(),
                });
            }

            return match response.json::<T>().await {
                Ok(value) => {
                    self.on_success(endpoint);
                    Ok(value)
                }
                Err(source) => {
                    self.on_failure(endpoint);
                    Err(DbmanError::Decode {
                        endpoint: endpoint.clone(),
                        source,
                    })
                }
            };
        }

        Err(last_err.unwrap_or(DbmanError::Exhausted))
    }

    fn is_cooling_down(&self, endpoint: &str) -> bool {
        let mut state = self.breaker.lock().expect("breaker lock");
        let Some(until) = state.cooldown_until.get(endpoint).copied() else {
            return false;
        };
        if Instant::now() < until {
            return true;
        }
        state.cooldown_until.remove(endpoint);
        false
    }

    fn on_failure(&self, endpoint: &str) {
        let mut state = self.breaker.lock().expect("breaker lock");
        let count = state.failures.entry(endpoint.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.fail_threshold {
            *count = 0;
            state
                .cooldown_until
                .insert(endpoint.to_string(), Instant::now() + self.cooldown);
            counter!("shoal_dbman_breaker_open_total", 1, "endpoint" => endpoint.to_string());
            warn!(endpoint, cooldown_ms = self.cooldown.as_millis() as u64, "dbman endpoint cooling down");
        }
    }

    fn on_success(&self, endpoint: &str) {
        let mut state = self.breaker.lock().expect("breaker lock");
        state.failures.remove(endpoint);
        state.cooldown_until.remove(endpoint);
    }
}

fn normalize_endpoints<I, S>(endpoints: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for endpoint in endpoints {
        let normalized = endpoint.as_ref().trim().trim_end_matches('/').to_string();
        if normalized.is_empty() || !seen.insert(normalized.clone()) {
            continue;
        }
        out.push(normalized);
    }
    out
}
