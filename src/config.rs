use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::AppError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;

/// Startup settings, read once from the environment.
///
/// `OPENAI_API_KEY` and `OPENAI_ASSISTANT_ID` are required; everything else
/// has a default. Missing required settings fail at startup instead of
/// surfacing as a dead request later.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: String,
    pub assistant_id: String,
    pub base_url: String,
    pub port: u16,
    pub artifacts_dir: PathBuf,
    pub stream_idle_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        let api_key = require_env("OPENAI_API_KEY")?;
        let assistant_id = require_env("OPENAI_ASSISTANT_ID")?;

        let base_url = env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let port = match env::var("PORT") {
            Ok(raw) => raw.parse().map_err(|_| AppError::Config {
                message: format!("PORT must be a number, got '{raw}'"),
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let artifacts_dir = env::var("ARTIFACTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ARTIFACTS_DIR));

        let stream_idle_timeout = match env::var("STREAM_IDLE_TIMEOUT_SECS") {
            Ok(raw) => {
                let secs: u64 = raw.parse().map_err(|_| AppError::Config {
                    message: format!("STREAM_IDLE_TIMEOUT_SECS must be a number, got '{raw}'"),
                })?;
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        };

        Ok(Self {
            api_key,
            assistant_id,
            base_url,
            port,
            artifacts_dir,
            stream_idle_timeout,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, AppError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(AppError::Config {
            message: format!("{name} must be set (copy .env.example to .env)"),
        }),
    }
}
