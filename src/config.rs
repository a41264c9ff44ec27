use config::{Config as ConfigBuilder, Environment as EnvSource, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration problems; all of them prevent startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("cannot read TLS CA certificate {}: {source}", .path.display())]
    UnreadableCa {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Main configuration structure for the OnFocus API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: Environment,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Deployment environment, as named by `NODE_ENV`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
    Local,
    Staging,
    Template,
    Example,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            "local" => Ok(Environment::Local),
            "staging" => Ok(Environment::Staging),
            "template" => Ok(Environment::Template),
            "example" => Ok(Environment::Example),
            other => Err(ConfigError::Invalid {
                key: "environment",
                reason: format!("unknown environment '{}'", other),
            }),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
            Environment::Local => "local",
            Environment::Staging => "staging",
            Environment::Template => "template",
            Environment::Example => "example",
        };
        f.write_str(name)
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL, only reported at startup
    pub base_url: Option<String>,
}

/// MySQL connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// PEM file of the certificate authority that signed the server cert
    pub ssl_ca: PathBuf,
}

/// Pool sizing and wait-queue policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: u32,
    pub min_idle: Option<u32>,
    /// How long a caller may wait for a connection before `PoolExhausted`
    pub acquire_timeout_ms: u64,
    /// Maximum queued callers on a saturated pool; 0 means unbounded
    pub queue_limit: usize,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
    pub test_on_check_out: bool,
}

/// Global request rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub limit: u32,
    pub message: String,
    /// Upper bound on distinct clients tracked at once
    pub max_tracked_clients: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; when unset it follows the environment
    pub level: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            base_url: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 3306,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            ssl_ca: PathBuf::new(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: None,
            acquire_timeout_ms: 60_000,
            queue_limit: 0,
            idle_timeout_secs: Some(600),
            max_lifetime_secs: Some(1800),
            test_on_check_out: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 15 * 60,
            limit: 100,
            message: "You have exceeded the limit due to frequent requesting!".to_string(),
            max_tracked_clients: 100_000,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("database.host");
        }
        if self.user.trim().is_empty() {
            missing.push("database.user");
        }
        if self.password.is_empty() {
            missing.push("database.password");
        }
        if self.database.trim().is_empty() {
            missing.push("database.database");
        }
        if self.ssl_ca.as_os_str().is_empty() {
            missing.push("database.ssl_ca");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                key: "database.port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        Ok(())
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid {
                key: "pool.max_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "pool.acquire_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(min_idle) = self.min_idle {
            if min_idle > self.max_size {
                return Err(ConfigError::Invalid {
                    key: "pool.min_idle",
                    reason: format!("{} exceeds max_size {}", min_idle, self.max_size),
                });
            }
        }
        Ok(())
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "rate_limit.window_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.limit == 0 {
            return Err(ConfigError::Invalid {
                key: "rate_limit.limit",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl LoggingConfig {
    /// Filter directive in effect: the configured level, else `info` in
    /// development and `debug` everywhere else.
    pub fn effective_level(&self, environment: Environment) -> String {
        match &self.level {
            Some(level) if !level.trim().is_empty() => level.clone(),
            _ if environment == Environment::Development => "info".to_string(),
            _ => "debug".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Flat variables (`MYSQL_HOST`, `PORT`, `NODE_ENV`, ...)
    /// 2. Structured variables (`ONFOCUS_POOL__MAX_SIZE`, ...)
    /// 3. config.toml in the working directory (if present)
    /// 4. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let dir = std::env::current_dir().map_err(|e| ConfigError::Invalid {
            key: "config.toml",
            reason: format!("cannot resolve working directory: {}", e),
        })?;
        Self::load_from_dir(&dir)
    }

    /// Load configuration from a specific directory and the process environment
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(dir, std::env::vars().collect())
    }

    /// Load configuration from a directory and an explicit variable map
    pub fn load_with_env(dir: &Path, vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        let config_file = dir.join("config.toml");
        if config_file.exists() {
            builder = builder.add_source(File::from(config_file));
        }

        builder = builder.add_source(
            EnvSource::with_prefix("ONFOCUS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(Some(vars.clone().into_iter().collect())),
        );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;
        config.merge_flat_vars(&vars)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section, reporting all missing keys together
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                key: "server.port",
                reason: "must be between 1 and 65535".to_string(),
            });
        }
        self.pool.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }

    /// Copy safe to print or log
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.database.password.is_empty() {
            copy.database.password = "********".to_string();
        }
        copy
    }

    /// Variables used by the original deployment scripts
    fn merge_flat_vars(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        let get = |key: &str| vars.get(key).filter(|v| !v.trim().is_empty());

        if let Some(env) = get("NODE_ENV") {
            self.environment = env.parse()?;
        }
        if let Some(port) = get("PORT") {
            self.server.port = parse_number("server.port", port)?;
        }
        if let Some(url) = get("URL") {
            self.server.base_url = Some(url.clone());
        }
        if let Some(host) = get("MYSQL_HOST") {
            self.database.host = host.clone();
        }
        if let Some(port) = get("MYSQL_PORT") {
            self.database.port = parse_number("database.port", port)?;
        }
        if let Some(user) = get("MYSQL_USER") {
            self.database.user = user.clone();
        }
        if let Some(password) = get("MYSQL_PASSWORD") {
            self.database.password = password.clone();
        }
        if let Some(name) = get("MYSQL_DB_NAME") {
            self.database.database = name.clone();
        }
        if let Some(ca) = get("MYSQL_SSL_CA") {
            self.database.ssl_ca = PathBuf::from(ca);
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("'{}': {}", raw, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn database_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("MYSQL_HOST", "db.internal"),
            ("MYSQL_PORT", "3307"),
            ("MYSQL_USER", "onfocus"),
            ("MYSQL_PASSWORD", "hunter2"),
            ("MYSQL_DB_NAME", "onfocus"),
            ("MYSQL_SSL_CA", "/etc/ssl/mysql-ca.pem"),
        ]
    }

    #[test]
    fn test_config_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.queue_limit, 0);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(60));
        assert_eq!(config.rate_limit.window(), Duration::from_secs(900));
        assert_eq!(config.rate_limit.limit, 100);
    }

    #[test]
    fn test_load_from_flat_environment_variables() -> Result<(), ConfigError> {
        let temp_dir = TempDir::new().unwrap();
        let mut pairs = database_vars();
        pairs.push(("NODE_ENV", "production"));
        pairs.push(("PORT", "8081"));

        let config = AppConfig::load_with_env(temp_dir.path(), vars(&pairs))?;

        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 3307);
        assert_eq!(config.database.ssl_ca, PathBuf::from("/etc/ssl/mysql-ca.pem"));
        Ok(())
    }

    #[test]
    fn test_load_from_toml_file() -> Result<(), ConfigError> {
        let temp_dir = TempDir::new().unwrap();
        let config_content = r#"
environment = "staging"

[server]
host = "127.0.0.1"
port = 9090

[database]
host = "file-db"
user = "fileuser"
password = "filepass"
database = "focus"
ssl_ca = "/tmp/ca.pem"

[pool]
max_size = 4
queue_limit = 16

[rate_limit]
window_secs = 60
limit = 5

[logging]
format = "json"
"#;
        write(temp_dir.path().join("config.toml"), config_content).unwrap();

        let config = AppConfig::load_with_env(temp_dir.path(), HashMap::new())?;

        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.database.host, "file-db");
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.queue_limit, 16);
        // untouched keys keep their defaults
        assert_eq!(config.pool.acquire_timeout_ms, 60_000);
        assert_eq!(config.rate_limit.limit, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
        Ok(())
    }

    #[test]
    fn test_precedence_env_over_file() -> Result<(), ConfigError> {
        let temp_dir = TempDir::new().unwrap();
        write(
            temp_dir.path().join("config.toml"),
            r#"
[database]
host = "file-db"
user = "fileuser"
password = "filepass"
database = "focus"
ssl_ca = "/tmp/ca.pem"

[pool]
max_size = 4
"#,
        )
        .unwrap();

        let config = AppConfig::load_with_env(
            temp_dir.path(),
            vars(&[("MYSQL_USER", "envuser"), ("ONFOCUS_POOL__MAX_SIZE", "12")]),
        )?;

        assert_eq!(config.database.user, "envuser");
        assert_eq!(config.pool.max_size, 12);
        assert_eq!(config.database.host, "file-db");
        Ok(())
    }

    #[test]
    fn test_missing_database_settings_are_all_reported() {
        let temp_dir = TempDir::new().unwrap();
        let err = AppConfig::load_with_env(temp_dir.path(), vars(&[("MYSQL_HOST", "db")]))
            .unwrap_err();

        match err {
            ConfigError::Missing(keys) => {
                assert!(!keys.contains(&"database.host"));
                assert!(keys.contains(&"database.user"));
                assert!(keys.contains(&"database.password"));
                assert!(keys.contains(&"database.ssl_ca"));
            }
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();

        let mut pairs = database_vars();
        pairs.push(("MYSQL_PORT", "not-a-port"));
        let err = AppConfig::load_with_env(temp_dir.path(), vars(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "database.port", .. }));

        let mut pairs = database_vars();
        pairs.push(("NODE_ENV", "qa"));
        let err = AppConfig::load_with_env(temp_dir.path(), vars(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "environment", .. }));
    }

    #[test]
    fn test_pool_validation() {
        let mut pool = PoolConfig::default();
        assert!(pool.validate().is_ok());

        pool.min_idle = Some(11);
        assert!(pool.validate().is_err());

        pool.min_idle = None;
        pool.acquire_timeout_ms = 0;
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_effective_log_level_follows_environment() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.effective_level(Environment::Development), "info");
        assert_eq!(logging.effective_level(Environment::Production), "debug");

        let explicit = LoggingConfig {
            level: Some("warn".to_string()),
            ..Default::default()
        };
        assert_eq!(explicit.effective_level(Environment::Production), "warn");
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut config = AppConfig::default();
        config.database.password = "hunter2".to_string();

        let redacted = config.redacted();
        assert_eq!(redacted.database.password, "********");
        assert_eq!(config.database.password, "hunter2");
    }
}
