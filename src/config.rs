//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Emit JSON log lines (LOG_FORMAT=json)
    pub log_json: bool,

    /// Outbox records claimed per dispatcher cycle
    pub outbox_batch_size: i64,

    /// Failed publications tolerated before a record is poisoned
    pub outbox_max_retries: i32,

    pub outbox_poll_interval: Duration,

    /// Accounts per accrual job
    pub accrual_batch_size: i64,

    pub accrual_interval: Duration,

    /// Unacknowledged deliveries per consumer
    pub consumer_prefetch: u16,

    /// Handler attempts per delivery before dead-lettering
    pub consumer_max_attempts: u32,

    pub retry_backoff_base: Duration,

    /// Upper bound of the random delay added to each backoff
    pub retry_jitter: Duration,

    pub amqp_url: String,

    pub amqp_exchange: String,

    pub consumer_queue: String,

    /// Queue receiving every published event (AUDIT_QUEUE, unset to skip)
    pub audit_queue: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str, default: &str| -> String {
            lookup(name).unwrap_or_else(|| default.to_string())
        };

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections =
            parse(&var("DATABASE_MAX_CONNECTIONS", "10"), "DATABASE_MAX_CONNECTIONS")?;

        let host = var("HOST", "127.0.0.1");

        let port = parse(&var("PORT", "3000"), "PORT")?;

        let environment = var("ENVIRONMENT", "development");

        let log_json = var("LOG_FORMAT", "text").eq_ignore_ascii_case("json");

        let outbox_batch_size = positive(
            parse(&var("OUTBOX_BATCH_SIZE", "20"), "OUTBOX_BATCH_SIZE")?,
            "OUTBOX_BATCH_SIZE",
        )?;

        let outbox_max_retries: i32 = parse(&var("OUTBOX_MAX_RETRIES", "5"), "OUTBOX_MAX_RETRIES")?;
        if outbox_max_retries < 0 {
            return Err(ConfigError::InvalidValue("OUTBOX_MAX_RETRIES"));
        }

        let outbox_poll_interval = Duration::from_millis(parse(
            &var("OUTBOX_POLL_INTERVAL_MS", "1000"),
            "OUTBOX_POLL_INTERVAL_MS",
        )?);

        let accrual_batch_size = positive(
            parse(&var("ACCRUAL_BATCH_SIZE", "500"), "ACCRUAL_BATCH_SIZE")?,
            "ACCRUAL_BATCH_SIZE",
        )?;

        let accrual_interval = Duration::from_secs(parse(
            &var("ACCRUAL_INTERVAL_SECS", "86400"),
            "ACCRUAL_INTERVAL_SECS",
        )?);

        let consumer_prefetch: u16 = parse(&var("CONSUMER_PREFETCH", "1"), "CONSUMER_PREFETCH")?;
        if consumer_prefetch == 0 {
            return Err(ConfigError::InvalidValue("CONSUMER_PREFETCH"));
        }

        let consumer_max_attempts: u32 =
            parse(&var("CONSUMER_MAX_ATTEMPTS", "3"), "CONSUMER_MAX_ATTEMPTS")?;
        if consumer_max_attempts == 0 {
            return Err(ConfigError::InvalidValue("CONSUMER_MAX_ATTEMPTS"));
        }

        let retry_backoff_base = Duration::from_millis(parse(
            &var("RETRY_BACKOFF_BASE_MS", "200"),
            "RETRY_BACKOFF_BASE_MS",
        )?);

        let retry_jitter =
            Duration::from_millis(parse(&var("RETRY_JITTER_MS", "100"), "RETRY_JITTER_MS")?);

        let amqp_url = var("AMQP_URL", "amqp://127.0.0.1:5672/%2f");

        let amqp_exchange = var("AMQP_EXCHANGE", "account.events");

        let consumer_queue = var("CONSUMER_QUEUE", "account-service.client");

        let audit_queue = lookup("AUDIT_QUEUE").filter(|q| !q.trim().is_empty());

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            log_json,
            outbox_batch_size,
            outbox_max_retries,
            outbox_poll_interval,
            accrual_batch_size,
            accrual_interval,
            consumer_prefetch,
            consumer_max_attempts,
            retry_backoff_base,
            retry_jitter,
            amqp_url,
            amqp_exchange,
            consumer_queue,
            audit_queue,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.outbox_batch_size,
            max_retries: self.outbox_max_retries,
            poll_interval: self.outbox_poll_interval,
        }
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            queue: self.consumer_queue.clone(),
            prefetch: self.consumer_prefetch,
            max_attempts: self.consumer_max_attempts,
            backoff_base: self.retry_backoff_base,
            max_jitter: self.retry_jitter,
        }
    }

    pub fn accrual(&self) -> AccrualConfig {
        AccrualConfig {
            batch_size: self.accrual_batch_size,
            interval: self.accrual_interval,
        }
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            url: self.amqp_url.clone(),
            exchange: self.amqp_exchange.clone(),
            audit_queue: self.audit_queue.clone(),
        }
    }
}

fn parse<T: FromStr>(value: &str, name: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue(name))
}

fn positive(value: i64, name: &'static str) -> Result<i64, ConfigError> {
    if value > 0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue(name))
    }
}

// =========================================================================
// Component configuration
// =========================================================================

/// Outbox dispatcher tunables
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    pub max_retries: i32,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_retries: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Inbound consumer tunables
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub prefetch: u16,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_jitter: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: "account-service.client".to_string(),
            prefetch: 1,
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
            max_jitter: Duration::from_millis(100),
        }
    }
}

/// Interest accrual tunables
#[derive(Debug, Clone)]
pub struct AccrualConfig {
    pub batch_size: i64,
    pub interval: Duration,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            interval: Duration::from_secs(86_400),
        }
    }
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub exchange: String,
    pub audit_queue: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672/%2f".to_string(),
            exchange: "account.events".to_string(),
            audit_queue: None,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
