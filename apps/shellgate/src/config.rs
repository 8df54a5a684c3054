use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Record terminal transcripts for every session.
    pub record: bool,
    pub record_path: String,
    pub audit_log_dir: String,
    pub ssh_connect_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("SHELLGATE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            record: env::var("SHELLGATE_RECORD")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            record_path: env::var("SHELLGATE_RECORD_PATH").unwrap_or_else(|_| "rec".to_string()),
            audit_log_dir: env::var("SHELLGATE_AUDIT_DIR").unwrap_or_else(|_| "logs".to_string()),
            ssh_connect_timeout_seconds: env::var("SHELLGATE_SSH_CONNECT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            record: true,
            record_path: "rec".to_string(),
            audit_log_dir: "logs".to_string(),
            ssh_connect_timeout_seconds: 30,
        }
    }
}
