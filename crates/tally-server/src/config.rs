use std::env;
use std::path::PathBuf;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4317";
const DEFAULT_DB_PATH: &str = "tally.db";

/// Server configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr =
            env::var("TALLY_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let db_path = env::var("TALLY_DB_PATH")
            .map_or_else(|_| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from);
        Self { bind_addr, db_path }
    }
}
