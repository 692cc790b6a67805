//! Reconciler configuration.

use std::path::Path;

use alb_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Provider limit on the load balancer idle timeout.
pub const MAX_IDLE_TIMEOUT_SECS: u32 = 4000;

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Cluster whose resources this reconciler owns.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Provider calls in flight per ingress.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    /// Ingresses reconciled at once by `reconcile_all`.
    #[serde(default = "default_max_concurrent_ingresses")]
    pub max_concurrent_ingresses: usize,

    /// Delete resources whose ingress no longer exists.
    #[serde(default = "default_delete_orphans")]
    pub delete_orphans: bool,

    /// Load balancer idle timeout when the ingress does not set one.
    #[serde(default = "default_idle_timeout_secs")]
    pub default_idle_timeout_secs: u32,
}

fn default_cluster_name() -> String {
    "cluster".to_string()
}

const fn default_max_concurrent_calls() -> usize {
    8
}

const fn default_max_concurrent_ingresses() -> usize {
    4
}

const fn default_delete_orphans() -> bool {
    true
}

const fn default_idle_timeout_secs() -> u32 {
    60
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            max_concurrent_calls: default_max_concurrent_calls(),
            max_concurrent_ingresses: default_max_concurrent_ingresses(),
            delete_orphans: default_delete_orphans(),
            default_idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl ReconcilerConfig {
    /// Create a config for `cluster_name` with defaults elsewhere.
    pub fn for_cluster(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document does not parse or fails
    /// [`ReconcilerConfig::validate`].
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Override fields from `ALB_*` environment variables, then validate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable does not parse or the
    /// overridden config fails [`ReconcilerConfig::validate`].
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Override fields from `ALB_*` variables resolved by `lookup`, then
    /// validate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable does not parse or the
    /// overridden config is invalid.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(cluster) = lookup("ALB_CLUSTER_NAME") {
            self.cluster_name = cluster;
        }
        if let Some(calls) = parse_var(&lookup, "ALB_MAX_CONCURRENT_CALLS")? {
            self.max_concurrent_calls = calls;
        }
        if let Some(delete) = parse_var(&lookup, "ALB_DELETE_ORPHANS")? {
            self.delete_orphans = delete;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check every field is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(Error::config("cluster_name must not be empty"));
        }
        let edges = [self.cluster_name.chars().next(), self.cluster_name.chars().next_back()];
        if !edges.iter().flatten().all(char::is_ascii_alphanumeric) {
            return Err(Error::config("cluster_name must start and end with a letter or digit"));
        }
        if self.max_concurrent_calls == 0 {
            return Err(Error::config("max_concurrent_calls must be at least 1"));
        }
        if self.max_concurrent_ingresses == 0 {
            return Err(Error::config("max_concurrent_ingresses must be at least 1"));
        }
        if !(1..=MAX_IDLE_TIMEOUT_SECS).contains(&self.default_idle_timeout_secs) {
            return Err(Error::config(format!(
                "default_idle_timeout_secs must be within 1..={MAX_IDLE_TIMEOUT_SECS}"
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("{key}={value}: {e}")))
        })
        .transpose()
}
