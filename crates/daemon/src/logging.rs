//! Logging setup.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to install log subscriber: {0}")]
    Init(String),
}

/// `RUST_LOG` directives if given and valid, else `default_filter`.
pub fn filter_from(env: Option<&str>, default_filter: &str) -> EnvFilter {
    env.and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}

/// Install the global fmt subscriber.
pub fn init(default_filter: &str) -> Result<(), LoggingError> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(filter_from(env.as_deref(), default_filter))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_wins_over_default() {
        let filter = filter_from(Some("publish_agent=trace"), "publish_agent=info");
        assert_eq!(filter.to_string(), "publish_agent=trace");
    }

    #[test]
    fn test_default_when_unset() {
        let filter = filter_from(None, "publish_agent=info");
        assert_eq!(filter.to_string(), "publish_agent=info");
    }
}
