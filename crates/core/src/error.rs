//! Error taxonomy for load-balancer reconciliation.
//!
//! Every provider call and every builder step returns one of these. Errors
//! are cloneable so a node can keep the error that failed it while the
//! same value is also reported upward.

use thiserror::Error;

use crate::kind::ResourceKind;

/// Reconciliation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The desired input is structurally invalid. Not retryable until the
    /// input changes.
    #[error("invalid ingress input: {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The resource vanished between listing and acting.
    #[error("{kind} '{id}' not found")]
    NotFound { kind: ResourceKind, id: String },

    /// The provider rejected the call because of a concurrent external change.
    #[error("{kind} '{id}' conflict: {reason}")]
    Conflict {
        kind: ResourceKind,
        id: String,
        reason: String,
    },

    /// Transient or infrastructure failure at the provider.
    #[error("provider error: {reason}")]
    Provider { reason: String },

    /// The action must wait for another resource to change first.
    #[error("{kind} '{id}' is blocked by {blocked_by}")]
    DependencyBlocked {
        kind: ResourceKind,
        id: String,
        blocked_by: String,
    },

    /// Invalid reconciler configuration.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// The pass was cancelled before this action started.
    #[error("reconciliation pass cancelled")]
    Cancelled,
}

impl Error {
    /// Create a validation error.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(kind: ResourceKind, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a provider error.
    pub fn provider(reason: impl Into<String>) -> Self {
        Self::Provider {
            reason: reason.into(),
        }
    }

    /// Create a dependency blocked error.
    pub fn dependency_blocked(
        kind: ResourceKind,
        id: impl Into<String>,
        blocked_by: impl Into<String>,
    ) -> Self {
        Self::DependencyBlocked {
            kind,
            id: id.into(),
            blocked_by: blocked_by.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether a later pass may succeed without the input changing.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. } | Self::Conflict { .. } | Self::Cancelled | Self::DependencyBlocked { .. }
        )
    }

    /// Deferrals are reported separately from failures: nothing went wrong,
    /// the action simply did not run this pass.
    #[must_use]
    pub const fn is_deferral(&self) -> bool {
        matches!(self, Self::DependencyBlocked { .. } | Self::Cancelled)
    }

    /// Whether this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Short machine-readable category.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::NotFound { .. } => "NotFoundError",
            Self::Conflict { .. } => "ConflictError",
            Self::Provider { .. } => "ProviderError",
            Self::DependencyBlocked { .. } => "DependencyBlockedError",
            Self::Config { .. } => "ConfigError",
            Self::Cancelled => "Cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::validation("annotations.inbound_cidrs", "not a CIDR");
        assert!(err.to_string().contains("inbound_cidrs"));
        assert!(err.to_string().contains("not a CIDR"));
    }

    #[test]
    fn test_conflict_display_names_resource() {
        let err = Error::conflict(ResourceKind::Listener, "lb-l80", "modified externally");
        assert!(err.to_string().contains("listener 'lb-l80'"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(!Error::validation("f", "r").is_retryable());
        assert!(Error::provider("throttled").is_retryable());
        assert!(Error::Cancelled.is_deferral());
        assert!(Error::dependency_blocked(ResourceKind::TargetGroup, "tg", "rule").is_deferral());
        assert!(!Error::provider("boom").is_deferral());
    }

    #[test]
    fn test_categories_are_distinct() {
        let errors = [
            Error::validation("f", "r"),
            Error::not_found(ResourceKind::Rule, "r"),
            Error::conflict(ResourceKind::Rule, "r", "c"),
            Error::provider("p"),
            Error::dependency_blocked(ResourceKind::Rule, "r", "b"),
            Error::config("c"),
            Error::Cancelled,
        ];
        let mut categories: Vec<_> = errors.iter().map(Error::category).collect();
        categories.sort_unstable();
        categories.dedup();
        assert_eq!(categories.len(), errors.len());
    }
}
