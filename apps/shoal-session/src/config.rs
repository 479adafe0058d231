use shoal_core::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub log_filter: String,
    pub jwt_secret: String,
    pub jwt_ttl_minutes: i64,
    pub redis_addr: String,
    pub dbman_endpoints: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .or_else(|_| std::env::var("SESSION_PORT"))
            .ok()
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(8090);
        Self {
            port,
            log_filter: env::string("RUST_LOG", "info,shoal_session=debug"),
            jwt_secret: env::string("JWT_SECRET", "change-me-in-production"),
            jwt_ttl_minutes: env::int("JWT_TTL_MINUTES", 1440),
            redis_addr: env::string("REDIS_ADDR", "localhost:6379"),
            dbman_endpoints: env::csv("DBMAN_ENDPOINTS", &["http://localhost:8082"]),
        }
    }
}
