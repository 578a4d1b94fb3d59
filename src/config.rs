//! Server settings, read once at startup from `GRIDLOCK_*` variables.
//!
//! Unset variables take their defaults; set-but-unparseable ones are an
//! error rather than a silent fallback. The default schedule grid is checked
//! here too so a bad build fails at boot, not on the first commit.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use tracing::info;

use crate::grid::Grid;

const DEFAULT_PORT: u16 = 5433;
const DEFAULT_MAX_CONNECTIONS: usize = 256;
const MAX_CONNECTIONS_CEILING: usize = 65_536;
const DEFAULT_COMPACT_THRESHOLD: u64 = 1_000;
const DEFAULT_DRAIN_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions; 0 disables the compactor.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsFiles>,
    /// How long shutdown waits for open connections.
    pub drain_timeout: Duration,
    /// Grid applied to schedules created without dimensions.
    pub default_grid: Grid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    /// A variable was set to a value that cannot be used.
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    /// Only one of the certificate and key paths was given.
    TlsPair,
    Tls(io::Error),
    Grid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value, reason } => {
                write!(f, "{var}={value:?}: {reason}")
            }
            ConfigError::TlsPair => {
                write!(f, "both GRIDLOCK_TLS_CERT and GRIDLOCK_TLS_KEY must be set, or neither")
            }
            ConfigError::Tls(e) => write!(f, "tls: {e}"),
            ConfigError::Grid(msg) => write!(f, "default grid: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source, so tests need not touch the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = parsed(&lookup, "GRIDLOCK_PORT")?.unwrap_or(DEFAULT_PORT);
        let max_connections =
            parsed(&lookup, "GRIDLOCK_MAX_CONNECTIONS")?.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if !(1..=MAX_CONNECTIONS_CEILING).contains(&max_connections) {
            return Err(ConfigError::Invalid {
                var: "GRIDLOCK_MAX_CONNECTIONS",
                value: max_connections.to_string(),
                reason: format!("must be in 1..={MAX_CONNECTIONS_CEILING}"),
            });
        }
        let password = lookup("GRIDLOCK_PASSWORD").unwrap_or_else(|| "gridlock".into());
        if password.is_empty() {
            return Err(ConfigError::Invalid {
                var: "GRIDLOCK_PASSWORD",
                value: password,
                reason: "must not be empty".into(),
            });
        }
        let tls = match (lookup("GRIDLOCK_TLS_CERT"), lookup("GRIDLOCK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };
        let default_grid =
            Grid::resolve(None, None).map_err(|e| ConfigError::Grid(e.to_string()))?;

        Ok(Config {
            bind: lookup("GRIDLOCK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            data_dir: lookup("GRIDLOCK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password,
            max_connections,
            compact_threshold: parsed(&lookup, "GRIDLOCK_COMPACT_THRESHOLD")?
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            metrics_port: parsed(&lookup, "GRIDLOCK_METRICS_PORT")?,
            tls,
            drain_timeout: Duration::from_secs(
                parsed(&lookup, "GRIDLOCK_DRAIN_TIMEOUT_SECS")?.unwrap_or(DEFAULT_DRAIN_SECS),
            ),
            default_grid,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Load the certificate chain and key, if TLS is configured.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let Some(files) = &self.tls else {
            return Ok(None);
        };
        load_tls(files).map(Some).map_err(ConfigError::Tls)
    }

    pub fn log_summary(&self) {
        info!("  data_dir: {}", self.data_dir.display());
        info!("  max_connections: {}", self.max_connections);
        if self.compact_threshold == 0 {
            info!("  compaction: disabled");
        } else {
            info!("  compaction: every {} WAL appends", self.compact_threshold);
        }
        info!(
            "  default grid: {} days x {} slots ({} cells)",
            self.default_grid.days(),
            self.default_grid.slots(),
            self.default_grid.size()
        );
        info!("  tls: {}", if self.tls.is_some() { "enabled" } else { "disabled" });
        match self.metrics_port {
            Some(port) => info!("  metrics: http://0.0.0.0:{port}/metrics"),
            None => info!("  metrics: disabled"),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let result = value.trim().parse::<T>();
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn load_tls(files: &TlsFiles) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&files.cert)?))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no certificates in {}", files.cert.display()),
        ));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&files.key)?))?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no private key in {}", files.key.display()),
            )
        })?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(server)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]).unwrap();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1_000);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.drain_timeout, Duration::from_secs(10));
        assert_eq!((c.default_grid.days(), c.default_grid.slots()), (5, 8));
        assert!(c.tls.is_none());
        assert!(c.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides_apply() {
        let c = config(&[
            ("GRIDLOCK_PORT", "6000"),
            ("GRIDLOCK_BIND", "127.0.0.1"),
            ("GRIDLOCK_COMPACT_THRESHOLD", "0"),
            ("GRIDLOCK_METRICS_PORT", " 9100 "),
            ("GRIDLOCK_DATA_DIR", "/var/lib/gridlock"),
        ])
        .unwrap();
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.compact_threshold, 0);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/gridlock"));
    }

    #[test]
    fn unparseable_values_are_errors() {
        let err = config(&[("GRIDLOCK_PORT", "fifty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "GRIDLOCK_PORT", .. }));
        assert!(err.to_string().contains("fifty"));

        assert!(matches!(
            config(&[("GRIDLOCK_COMPACT_THRESHOLD", "-1")]),
            Err(ConfigError::Invalid { var: "GRIDLOCK_COMPACT_THRESHOLD", .. })
        ));
    }

    #[test]
    fn connection_limit_bounded() {
        assert!(config(&[("GRIDLOCK_MAX_CONNECTIONS", "0")]).is_err());
        assert!(config(&[("GRIDLOCK_MAX_CONNECTIONS", "100000")]).is_err());
        assert!(config(&[("GRIDLOCK_MAX_CONNECTIONS", "1")]).is_ok());
    }

    #[test]
    fn empty_password_rejected() {
        assert!(matches!(
            config(&[("GRIDLOCK_PASSWORD", "")]),
            Err(ConfigError::Invalid { var: "GRIDLOCK_PASSWORD", .. })
        ));
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(matches!(
            config(&[("GRIDLOCK_TLS_CERT", "cert.pem")]),
            Err(ConfigError::TlsPair)
        ));
        let c = config(&[
            ("GRIDLOCK_TLS_CERT", "/nonexistent/cert.pem"),
            ("GRIDLOCK_TLS_KEY", "/nonexistent/key.pem"),
        ])
        .unwrap();
        assert!(matches!(c.tls_acceptor(), Err(ConfigError::Tls(_))));
    }
}
