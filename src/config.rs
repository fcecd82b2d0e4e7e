use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_PORT: u16 = 5433;
const DEFAULT_ADMIN_PASSWORD: &str = "spabook";
const DEFAULT_BOOKING_PASSWORD: &str = "booking";

/// Server settings, read from `SPABOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub admin_password: String,
    pub booking_password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    Zero(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "{var}: cannot parse {value:?}"),
            ConfigError::Zero(var) => write!(f, "{var} must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_connections = parsed(&lookup, "SPABOOK_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Zero("SPABOOK_MAX_CONNECTIONS"));
        }
        let compact_threshold = parsed(&lookup, "SPABOOK_COMPACT_THRESHOLD")?.unwrap_or(1000);
        if compact_threshold == 0 {
            return Err(ConfigError::Zero("SPABOOK_COMPACT_THRESHOLD"));
        }

        Ok(Self {
            port: parsed(&lookup, "SPABOOK_PORT")?.unwrap_or(DEFAULT_PORT),
            bind: lookup("SPABOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("SPABOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            admin_password: lookup("SPABOOK_ADMIN_PASSWORD")
                .unwrap_or_else(|| DEFAULT_ADMIN_PASSWORD.into()),
            booking_password: lookup("SPABOOK_BOOKING_PASSWORD")
                .unwrap_or_else(|| DEFAULT_BOOKING_PASSWORD.into()),
            max_connections,
            compact_threshold,
            metrics_port: parsed(&lookup, "SPABOOK_METRICS_PORT")?,
            tls_cert: lookup("SPABOOK_TLS_CERT"),
            tls_key: lookup("SPABOOK_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spabook.wal")
    }

    pub fn uses_default_passwords(&self) -> bool {
        self.admin_password == DEFAULT_ADMIN_PASSWORD || self.booking_password == DEFAULT_BOOKING_PASSWORD
    }
}
