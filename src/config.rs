//! Environment configuration.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `BIND_HOST` | `0.0.0.0` | listen address |
//! | `BIND_PORT` | `3000` | listen port |
//! | `DRAIN_TIMEOUT_MS` | `30000` | longest allowed drain before a forced stop |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::Error;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3000")]
    pub port: u16,

    #[envconfig(from = "DRAIN_TIMEOUT_MS", default = "30000")]
    pub drain_timeout: EnvMsDuration,
}

impl Config {
    /// Loads from the process environment and validates.
    pub fn from_env() -> Result<Self, Error> {
        let config = Self::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// The drain must be bounded and leave some room to finish work.
    pub fn validate(&self) -> Result<(), Error> {
        if self.drain_timeout.0.is_zero() {
            return Err(Error::Config("DRAIN_TIMEOUT_MS must be greater than zero".to_owned()));
        }
        Ok(())
    }

    /// The `host:port` pair to bind.
    pub fn bind_addr(&self) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address {}:{}: {e}", self.host, self.port)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a whole number of milliseconds")
    }
}

impl std::error::Error for ParseEnvMsDurationError {}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, Error> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        let config = Config::init_from_hashmap(&env)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_addr().unwrap(), "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.drain_timeout, EnvMsDuration(Duration::from_secs(30)));
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("BIND_HOST", "127.0.0.1"),
            ("BIND_PORT", "8080"),
            ("DRAIN_TIMEOUT_MS", "2500"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);
        assert_eq!(config.drain_timeout.0, Duration::from_millis(2500));
    }

    #[test]
    fn zero_drain_timeout_is_rejected() {
        let err = load(&[("DRAIN_TIMEOUT_MS", "0")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn garbage_values_are_env_errors() {
        use std::error::Error as _;

        let err = load(&[("DRAIN_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(err, Error::Env(envconfig::Error::ParseError { name: "DRAIN_TIMEOUT_MS" })));
        assert!(err.to_string().contains("DRAIN_TIMEOUT_MS"));
        assert!(err.source().is_some());

        assert!(matches!(load(&[("BIND_PORT", "99999")]), Err(Error::Env(_))));
    }

    #[test]
    fn bad_host_fails_at_bind() {
        let config = load(&[("BIND_HOST", "not a host")]).unwrap();
        assert!(matches!(config.bind_addr(), Err(Error::Config(_))));
    }
}
