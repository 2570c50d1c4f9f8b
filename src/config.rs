//! Runtime configuration loaded from environment variables.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Wire message ceiling imposed by the transport.
pub const RESPONSE_MAX_SIZE: usize = 4 * 1024 * 1024;

/// Which end of the log loses lines when a response is too large.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncatePolicy {
    /// Pop from the tail of the log (most recent lines go first).
    DropNewest,
    /// Remove from the head of the log (earliest lines go first).
    DropOldest,
}

impl FromStr for TruncatePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-newest" | "newest" => Ok(Self::DropNewest),
            "drop-oldest" | "oldest" => Ok(Self::DropOldest),
            other => bail!("unknown truncate policy '{other}'"),
        }
    }
}

/// Executor configuration.
///
/// | Env Var                    | Default                            |
/// |----------------------------|------------------------------------|
/// | `CDS_DEPLOY_DIR`           | `/opt/app/onap/blueprints/deploy`  |
/// | `CDS_PYTHON_BIN`           | `python3`                          |
/// | `CDS_UTILITY_PACKAGE_DIR`  | `./cds_utils`                      |
/// | `CDS_RESPONSE_MAX_SIZE`    | `4194304`                          |
/// | `CDS_TRUNCATE_POLICY`      | `drop-newest`                      |
/// | `CDS_MAX_WORKERS`          | `10`                               |
/// | `CDS_DEFAULT_TIMEOUT_SECS` | `180`                              |
#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which blueprints are deployed as `name/version/uuid`.
    pub deploy_dir: PathBuf,
    /// Interpreter used to create each blueprint's virtual environment.
    pub python_bin: String,
    /// First-party helper package copied into every environment.
    pub utility_package_dir: PathBuf,
    pub response_max_size: usize,
    pub truncate_policy: TruncatePolicy,
    /// Upper bound on requests handled concurrently.
    pub max_workers: usize,
    /// Applied when a request carries a zero timeout.
    pub default_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deploy_dir: PathBuf::from("/opt/app/onap/blueprints/deploy"),
            python_bin: "python3".to_string(),
            utility_package_dir: PathBuf::from("./cds_utils"),
            response_max_size: RESPONSE_MAX_SIZE,
            truncate_policy: TruncatePolicy::DropNewest,
            max_workers: 10,
            default_timeout: Duration::from_secs(180),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_workers: usize = parse_or(&lookup, "CDS_MAX_WORKERS", defaults.max_workers)?;
        if max_workers == 0 {
            bail!("CDS_MAX_WORKERS must be at least 1");
        }

        Ok(Self {
            deploy_dir: lookup("CDS_DEPLOY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.deploy_dir),
            python_bin: lookup("CDS_PYTHON_BIN").unwrap_or(defaults.python_bin),
            utility_package_dir: lookup("CDS_UTILITY_PACKAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.utility_package_dir),
            response_max_size: parse_or(&lookup, "CDS_RESPONSE_MAX_SIZE", defaults.response_max_size)?,
            truncate_policy: parse_or(&lookup, "CDS_TRUNCATE_POLICY", defaults.truncate_policy)?,
            max_workers,
            default_timeout: Duration::from_secs(parse_or(
                &lookup,
                "CDS_DEFAULT_TIMEOUT_SECS",
                defaults.default_timeout.as_secs(),
            )?),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} has invalid value '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.deploy_dir, PathBuf::from("/opt/app/onap/blueprints/deploy"));
        assert_eq!(config.response_max_size, RESPONSE_MAX_SIZE);
        assert_eq!(config.truncate_policy, TruncatePolicy::DropNewest);
        assert_eq!(config.max_workers, 10);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("CDS_DEPLOY_DIR", "/tmp/deploy"),
            ("CDS_TRUNCATE_POLICY", "drop-oldest"),
            ("CDS_RESPONSE_MAX_SIZE", "1024"),
            ("CDS_DEFAULT_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.deploy_dir, PathBuf::from("/tmp/deploy"));
        assert_eq!(config.truncate_policy, TruncatePolicy::DropOldest);
        assert_eq!(config.response_max_size, 1024);
        assert_eq!(config.default_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("CDS_MAX_WORKERS", "many")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("CDS_MAX_WORKERS", "0")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("CDS_TRUNCATE_POLICY", "middle")])).is_err());
    }
}
