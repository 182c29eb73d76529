//! Application configuration module
//!
//! Resolves named settings from layered sources (built-in defaults, an optional
//! `aaa.toml` file, `.env` and the process environment) and snapshots them into
//! an immutable [`Settings`] value at startup.
//!
//! Every key can be overridden from the environment: prefix `AAA_`, dots become
//! underscores, e.g. `db.type` is overridden by `AAA_DB_TYPE`.

use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "AAA";

/// Configuration file looked up in the working directory (any format `config` supports)
const DEFAULT_CONFIG_FILE: &str = "aaa";

/// Built-in defaults, lowest priority layer
const DEFAULTS: &[(&str, &str)] = &[
    ("server.host", "0.0.0.0"),
    ("server.port", "3000"),
    ("server.log.level", "INFO"),
    ("server.timeout.graceshut", "15s"),
    ("server.timeout.write", "15s"),
    ("server.timeout.read", "15s"),
    ("server.timeout.idle", "60s"),
    ("server.http.cors.enable", "true"),
    ("server.http.cors.allow.origins", "*"),
    ("server.http.cors.allow.headers", "Accept,Authorization,Content-Type,X-CSRF-TOKEN"),
    ("server.http.cors.allow.method", "GET,PUT,DELETE,POST,OPTIONS"),
    ("server.http.cors.exposed.headers", "*"),
    ("server.http.cors.allow.credential", "true"),
    ("server.http.cors.optionpassthrough", "true"),
    ("server.http.cors.maxage", "300"),
    ("db.type", "SQLITE"),
    ("db.mysql.host", "localhost"),
    ("db.mysql.port", "3306"),
    ("db.mysql.user", "user"),
    ("db.mysql.password", "password"),
    ("db.mysql.database", "aaa"),
    ("db.mysql.maxopen", "10"),
    ("db.mysql.maxidle", "2"),
    ("db.sqlite.path", "aaa.sqlite"),
    ("mailer.type", "DUMMY"),
    ("mailer.from.address", "aaa@localhost"),
    ("mailer.from.name", "AAA"),
    ("mailer.queue.capacity", "100"),
    ("mailer.sendmail.host", "localhost"),
    ("mailer.sendmail.port", "25"),
    ("mailer.sendmail.user", "sendmail"),
    ("mailer.sendmail.password", "password"),
    ("mailer.sendgrid.token", ""),
    ("token.crypt.key", "th15mustb3CH@ngedINprodUCT10N"),
    ("token.crypt.method", "HS512"),
    ("token.issuer", "aaa.issuer"),
    ("token.access.duration", "5m"),
    ("token.refresh.duration", "1y"),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value '{value}' for '{key}' (env-var '{env_var}'): {reason}")]
    InvalidValue {
        key: String,
        value: String,
        env_var: String,
        reason: String,
    },

    #[error("Invalid duration '{value}' for '{key}' (env-var '{env_var}'): {source}")]
    InvalidDuration {
        key: String,
        value: String,
        env_var: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Name of the environment variable overriding `key`
pub fn env_var_name(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key.replace('.', "_").to_uppercase())
}

/// Split a comma-separated setting.
///
/// Entries are trimmed but never dropped: an empty string yields a single empty
/// entry, and callers decide what an empty entry means.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).collect()
}

/// Parse a human-readable duration (`15s`, `5m`, `7d`, `1h 30m`) read from `key`
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|source| ConfigError::InvalidDuration {
        key: key.to_string(),
        value: raw.to_string(),
        env_var: env_var_name(key),
        source,
    })
}

/// Human-readable rendering of a duration, truncated to whole seconds
pub fn describe_duration(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}

/// Typed access to the layered configuration sources
#[derive(Debug, Clone)]
pub struct ConfigAccessor {
    inner: Config,
}

impl ConfigAccessor {
    /// Load defaults, the optional config file, `.env` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let file = std::env::var(env_var_name("config.file"))
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let inner = Self::defaults()?
            .add_source(File::with_name(&file).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("_"))
            .build()?;

        Ok(Self { inner })
    }

    /// Defaults with explicit overrides on top, ignoring files and environment
    pub fn from_overrides(overrides: &[(&str, &str)]) -> Result<Self, ConfigError> {
        let builder = overrides
            .iter()
            .try_fold(Self::defaults()?, |builder, (key, value)| {
                builder.set_override(*key, *value)
            })?;

        Ok(Self {
            inner: builder.build()?,
        })
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let builder = DEFAULTS
            .iter()
            .try_fold(Config::builder(), |builder, (key, value)| {
                builder.set_default(*key, *value)
            })?;
        Ok(builder)
    }

    pub fn get(&self, key: &str) -> Result<String, ConfigError> {
        Ok(self.inner.get_string(key)?)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        Ok(self.inner.get_bool(key)?)
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        Ok(self.inner.get_int(key)?)
    }

    pub fn get_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        Ok(split_list(&self.get(key)?))
    }

    /// Integer setting narrowed to `T`, e.g. a port or a pool size
    pub fn get_number<T: TryFrom<i64>>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self.get_int(key)?;
        T::try_from(value).map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            env_var: env_var_name(key),
            reason: "number out of range".to_string(),
        })
    }
}

/// Server timeouts, kept as the raw expressions until the lifecycle manager resolves them
#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    pub graceful_shutdown: String,
    pub write: String,
    pub read: String,
    pub idle: String,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub timeouts: TimeoutSettings,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CORS configuration
#[derive(Debug, Clone)]
pub struct CorsSettings {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub options_passthrough: bool,
    pub max_age: u64,
}

#[derive(Debug, Clone)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_open: u32,
    pub max_idle: u32,
}

/// Database configuration; `kind` is validated by the backend selector
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub kind: String,
    pub mysql: MySqlSettings,
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct SendMailSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Mailer configuration; `kind` is validated by the backend selector
#[derive(Debug, Clone)]
pub struct MailerSettings {
    pub kind: String,
    pub from: String,
    pub from_name: String,
    pub queue_capacity: usize,
    pub sendmail: SendMailSettings,
    pub sendgrid_token: String,
}

/// Token configuration; lifetimes stay raw until the token factory builder parses them
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub crypt_key: String,
    pub crypt_method: String,
    pub issuer: String,
    pub access_duration: String,
    pub refresh_duration: String,
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub cors: CorsSettings,
    pub database: DatabaseSettings,
    pub mailer: MailerSettings,
    pub token: TokenSettings,
}

impl Settings {
    /// Load settings from all configuration layers
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_accessor(&ConfigAccessor::load()?)
    }

    /// Snapshot every setting the bootstrap needs
    pub fn from_accessor(config: &ConfigAccessor) -> Result<Self, ConfigError> {
        let server = ServerSettings {
            host: config.get("server.host")?,
            port: config.get_number("server.port")?,
            log_level: config.get("server.log.level")?,
            timeouts: TimeoutSettings {
                graceful_shutdown: config.get("server.timeout.graceshut")?,
                write: config.get("server.timeout.write")?,
                read: config.get("server.timeout.read")?,
                idle: config.get("server.timeout.idle")?,
            },
        };

        let cors = CorsSettings {
            enabled: config.get_bool("server.http.cors.enable")?,
            allowed_origins: config.get_list("server.http.cors.allow.origins")?,
            allowed_headers: config.get_list("server.http.cors.allow.headers")?,
            allowed_methods: config.get_list("server.http.cors.allow.method")?,
            exposed_headers: config.get_list("server.http.cors.exposed.headers")?,
            allow_credentials: config.get_bool("server.http.cors.allow.credential")?,
            options_passthrough: config.get_bool("server.http.cors.optionpassthrough")?,
            max_age: config.get_number("server.http.cors.maxage")?,
        };

        let database = DatabaseSettings {
            kind: config.get("db.type")?,
            mysql: MySqlSettings {
                host: config.get("db.mysql.host")?,
                port: config.get_number("db.mysql.port")?,
                user: config.get("db.mysql.user")?,
                password: config.get("db.mysql.password")?,
                database: config.get("db.mysql.database")?,
                max_open: config.get_number("db.mysql.maxopen")?,
                max_idle: config.get_number("db.mysql.maxidle")?,
            },
            sqlite_path: config.get("db.sqlite.path")?,
        };

        let mailer = MailerSettings {
            kind: config.get("mailer.type")?,
            from: config.get("mailer.from.address")?,
            from_name: config.get("mailer.from.name")?,
            queue_capacity: config.get_number("mailer.queue.capacity")?,
            sendmail: SendMailSettings {
                host: config.get("mailer.sendmail.host")?,
                port: config.get_number("mailer.sendmail.port")?,
                user: config.get("mailer.sendmail.user")?,
                password: config.get("mailer.sendmail.password")?,
            },
            sendgrid_token: config.get("mailer.sendgrid.token")?,
        };

        let token = TokenSettings {
            crypt_key: config.get("token.crypt.key")?,
            crypt_method: config.get("token.crypt.method")?,
            issuer: config.get("token.issuer")?,
            access_duration: config.get("token.access.duration")?,
            refresh_duration: config.get("token.refresh.duration")?,
        };

        Ok(Self {
            server,
            cors,
            database,
            mailer,
            token,
        })
    }

    /// Defaults plus explicit overrides, for embedding and tests
    pub fn from_overrides(overrides: &[(&str, &str)]) -> Result<Self, ConfigError> {
        Self::from_accessor(&ConfigAccessor::from_overrides(overrides)?)
    }
}

/// Map `server.log.level` onto a tracing filter directive.
///
/// Returns `None` for an unknown level; the caller falls back to `error`.
pub fn log_directive(level: &str) -> Option<&'static str> {
    match level.trim().to_uppercase().as_str() {
        "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARN" => Some("warn"),
        "ERROR" | "FATAL" => Some("error"),
        _ => None,
    }
}
