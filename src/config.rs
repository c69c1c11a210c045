use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::connection::ReconnectPolicy;
use crate::error::ClientError;
use crate::models::Session;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";
pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:5000/ws";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub session: Session,
    pub reconnect: ReconnectPolicy,
}

impl Config {
    /// Reads the process environment. Call `dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("CHAT_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let ws_url = lookup("CHAT_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());

        let token = lookup("CHAT_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ClientError::Config("CHAT_TOKEN is not set".to_string()))?;
        let user_id = lookup("CHAT_USER_ID")
            .ok_or_else(|| ClientError::Config("CHAT_USER_ID is not set".to_string()))?;
        let user_id = Uuid::parse_str(user_id.trim())
            .map_err(|e| ClientError::Config(format!("CHAT_USER_ID: {}", e)))?;

        let attempts = parse_or(&lookup, "CHAT_RECONNECT_ATTEMPTS", 5u32)?;
        let delay_ms = parse_or(&lookup, "CHAT_RECONNECT_DELAY_MS", 1000u64)?;

        Ok(Config {
            api_url: api_url.trim_end_matches('/').to_string(),
            ws_url,
            session: Session::new(user_id, token),
            reconnect: ReconnectPolicy::new(attempts, Duration::from_millis(delay_ms)),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ClientError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ClientError::Config(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}
