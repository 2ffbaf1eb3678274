use std::path::PathBuf;
use std::time::Duration;

use crate::poller::PollPolicy;
use crate::session::SessionOptions;

const DEFAULT_API_BASE: &str = "http://localhost:8006/api/v1";

#[derive(Debug, Clone)]
pub struct Config {
    /// Conversation API base, including the `/api/v1` prefix
    pub api_base: String,
    /// Grant report endpoint (takes `?report_id=`)
    pub report_url: String,
    /// Where the terminal client persists identity between runs
    pub state_file: PathBuf,
    pub poll: PollPolicy,
    /// Delay before a new conversation's greeting appears
    pub greeting_delay: Duration,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let api_base = env_str("GRANTBOT_API_BASE", DEFAULT_API_BASE)
            .trim_end_matches('/')
            .to_string();
        let report_url = std::env::var("GRANTBOT_REPORT_URL")
            .unwrap_or_else(|_| format!("{api_base}/core-utils/grant-report"));

        let poll = PollPolicy {
            interval: Duration::from_millis(env_parse("GRANTBOT_POLL_INTERVAL_MS", 500)?),
            max_attempts: env_parse("GRANTBOT_POLL_MAX_ATTEMPTS", 240)?,
            max_consecutive_errors: env_parse("GRANTBOT_POLL_MAX_ERRORS", 3)?,
        };
        if poll.max_attempts == 0 || poll.max_consecutive_errors == 0 {
            anyhow::bail!("GRANTBOT_POLL_MAX_ATTEMPTS and GRANTBOT_POLL_MAX_ERRORS must be at least 1");
        }

        Ok(Self {
            api_base,
            report_url,
            state_file: std::env::var("GRANTBOT_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_state_file()),
            poll,
            greeting_delay: Duration::from_millis(env_parse("GRANTBOT_GREETING_DELAY_MS", 500)?),
            http_timeout: Duration::from_secs(env_parse("GRANTBOT_HTTP_TIMEOUT_SECS", 30)?),
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            poll: self.poll,
            greeting_delay: self.greeting_delay,
            ..SessionOptions::default()
        }
    }
}

fn default_state_file() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".grantbot/state.json")
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
