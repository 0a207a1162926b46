use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_url: String,
    pub redis_url: Option<String>,
    /// Shared secret internal callers send in `X-Internal-Token`. Internal routes are closed without it.
    pub internal_token: Option<String>,
    pub upstream: UpstreamConfig,
    pub social_context_ttl: Duration,
    pub feed: FeedConfig,
    pub jobs: JobsConfig,
    pub background: BackgroundConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default)]
pub struct UpstreamConfig {
    pub identity_url: Option<String>,
    pub file_url: Option<String>,
    pub reader_url: Option<String>,
    pub push_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct FeedConfig {
    /// Share of each feed page reserved for internal posts.
    pub internal_ratio: f64,
    /// Share reserved for cached fediverse posts; news gets the rest.
    pub fediverse_ratio: f64,
    pub max_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            internal_ratio: 0.5,
            fediverse_ratio: 0.25,
            max_limit: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobsConfig {
    pub view_flush_interval: Duration,
    pub view_queue_capacity: usize,
    pub purge_interval: Duration,
    pub purge_retention: chrono::Duration,
}

#[derive(Clone, Debug)]
pub struct BackgroundConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let feed = FeedConfig {
            internal_ratio: parse_or("FEED_INTERNAL_RATIO", 0.5)?,
            fediverse_ratio: parse_or("FEED_FEDIVERSE_RATIO", 0.25)?,
            max_limit: parse_or("FEED_MAX_LIMIT", 100)?,
        };
        if !(0.0..=1.0).contains(&(feed.internal_ratio + feed.fediverse_ratio)) {
            return Err(ConfigError::Invalid {
                key: "FEED_FEDIVERSE_RATIO",
                value: feed.fediverse_ratio.to_string(),
            });
        }

        Ok(Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_or("SERVER_PORT", 8444)?,
            },
            database_url,
            redis_url: optional("REDIS_URL"),
            internal_token: optional("INTERNAL_API_TOKEN"),
            upstream: UpstreamConfig {
                identity_url: optional("IDENTITY_SERVICE_URL"),
                file_url: optional("FILE_SERVICE_URL"),
                reader_url: optional("READER_SERVICE_URL"),
                push_url: optional("PUSH_SERVICE_URL"),
                timeout: Duration::from_secs(parse_or("UPSTREAM_TIMEOUT_SECS", 5)?),
            },
            social_context_ttl: Duration::from_secs(parse_or("SOCIAL_CONTEXT_TTL_SECS", 300)?),
            feed,
            jobs: JobsConfig {
                view_flush_interval: Duration::from_secs(parse_or("VIEW_FLUSH_INTERVAL_SECS", 60)?),
                view_queue_capacity: parse_or("VIEW_QUEUE_CAPACITY", 10_000)?,
                purge_interval: Duration::from_secs(parse_or("PURGE_INTERVAL_SECS", 3600)?),
                purge_retention: chrono::Duration::hours(parse_or("PURGE_RETENTION_HOURS", 1)?),
            },
            background: BackgroundConfig {
                workers: parse_or::<usize>("BACKGROUND_WORKERS", 4)?.max(1),
                queue_capacity: parse_or::<usize>("BACKGROUND_QUEUE_CAPACITY", 1024)?.max(1),
            },
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Environment is process-global; serialise the tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: &[&str] = &[
        "DATABASE_URL",
        "SERVER_PORT",
        "REDIS_URL",
        "INTERNAL_API_TOKEN",
        "FEED_INTERNAL_RATIO",
        "FEED_FEDIVERSE_RATIO",
        "PURGE_RETENTION_HOURS",
        "BACKGROUND_WORKERS",
    ];

    fn clear() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/interactive");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.server.port, 8444);
        assert!(config.redis_url.is_none());
        assert!(config.internal_token.is_none());
        assert_eq!(config.social_context_ttl, Duration::from_secs(300));
        assert_eq!(config.feed.max_limit, 100);
        assert_eq!(config.jobs.purge_retention, chrono::Duration::hours(1));
        clear();
    }

    #[test]
    fn test_blank_internal_token_is_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/interactive");
        env::set_var("INTERNAL_API_TOKEN", "   ");
        assert!(AppConfig::from_env().unwrap().internal_token.is_none());

        env::set_var("INTERNAL_API_TOKEN", "s3cret");
        assert_eq!(AppConfig::from_env().unwrap().internal_token.as_deref(), Some("s3cret"));
        clear();
    }

    #[test]
    fn test_missing_database_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        assert!(matches!(AppConfig::from_env(), Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn test_invalid_number_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/interactive");
        env::set_var("SERVER_PORT", "eighty");

        match AppConfig::from_env() {
            Err(ConfigError::Invalid { key, value }) => {
                assert_eq!(key, "SERVER_PORT");
                assert_eq!(value, "eighty");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        clear();
    }

    #[test]
    fn test_feed_ratios_must_fit_one_page() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/interactive");
        env::set_var("FEED_INTERNAL_RATIO", "0.8");
        env::set_var("FEED_FEDIVERSE_RATIO", "0.4");

        assert!(matches!(AppConfig::from_env(), Err(ConfigError::Invalid { .. })));
        clear();
    }

    #[test]
    fn test_dotenv_file_is_honoured() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "DATABASE_URL=postgres://db/from-file").unwrap();
        writeln!(file, "BACKGROUND_WORKERS=0").unwrap();
        dotenvy::from_path(file.path()).unwrap();

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://db/from-file");
        assert_eq!(config.background.workers, 1);
        clear();
    }
}
