//! Logging configuration module
//! Provides structured logging configuration for the migration agent.

use crate::config::LoggingConfig;
use tracing_subscriber::fmt;

impl LoggingConfig {
    /// Initialize logging based on configuration
    pub fn init(&self) -> Result<(), Box<dyn std::error::Error>> {
        let level = self.level.clone();
        let subscriber = fmt()
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_ansi(self.log_dir.is_none())
            .with_env_filter(tracing_subscriber::EnvFilter::new(level));

        if self.json_format {
            let _ = subscriber.json().try_init();
        } else {
            let _ = subscriber.try_init();
        }

        tracing::info!("logging initialized at level {}", self.level);

        Ok(())
    }

    /// Initialize with default settings
    pub fn init_default() -> Result<(), Box<dyn std::error::Error>> {
        Self::default().init()
    }

    /// Initialize with environment variables
    pub fn init_from_env() -> Result<(), Box<dyn std::error::Error>> {
        let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let log_dir = std::env::var("MIGRATION_AGENT_LOG_DIR").ok().map(Into::into);

        Self {
            level,
            log_dir,
            ..Default::default()
        }
        .init()
    }
}

/// Create a structured log context
#[macro_export]
macro_rules! log_context {
    ($($key:ident = $value:expr),* $(,)?) => {
        {
            use tracing::field;
            tracing::info_span!(
                "context",
                $(
                    $key = field::display(&$value)
                ),*
            )
        }
    };
}
