//! Resource kinds managed by the reconciler.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The five levels of the load-balancer resource tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    LoadBalancer,
    Listener,
    Rule,
    TargetGroup,
    TargetGroupBinding,
}

impl ResourceKind {
    /// Stable lowercase label used in logs and provider handles.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoadBalancer => "loadbalancer",
            Self::Listener => "listener",
            Self::Rule => "listener-rule",
            Self::TargetGroup => "targetgroup",
            Self::TargetGroupBinding => "targetgroup-binding",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
