//! The cloud provider seam.
//!
//! The reconciler never talks to a cloud API directly. It lists what exists
//! through [`Provider::list`] and changes it through create, modify and
//! delete calls, each addressed by the opaque [`Handle`] the provider
//! assigned at creation. References between resources (a listener's
//! default target group, a rule's forward target) cross this seam as
//! handles, never as names.

pub mod memory;

use alb_core::{ResourceKind, Result, TagChanges, TagSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::node::Handle;
use crate::types::{FieldDiff, ListenerSpec, LoadBalancerSpec, RuleSpec, Target, TargetGroupSpec};

pub use memory::{Call, InMemoryProvider, Operation};

/// A load balancer as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerRecord {
    pub handle: Handle,
    pub spec: LoadBalancerSpec,
    #[serde(default)]
    pub tags: TagSet,
}

/// A listener as listed by the provider. `spec.default_target_group` holds
/// the target group's handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRecord {
    pub handle: Handle,
    pub load_balancer: Handle,
    pub spec: ListenerSpec,
}

/// A rule as listed by the provider. `spec.target_group` holds the target
/// group's handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub handle: Handle,
    pub listener: Handle,
    pub spec: RuleSpec,
}

/// A target group and its registered targets as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupRecord {
    pub handle: Handle,
    pub spec: TargetGroupSpec,
    #[serde(default)]
    pub tags: TagSet,
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// Everything the provider reports for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSnapshot {
    pub load_balancers: Vec<LoadBalancerRecord>,
    pub listeners: Vec<ListenerRecord>,
    pub rules: Vec<RuleRecord>,
    pub target_groups: Vec<TargetGroupRecord>,
}

impl ProviderSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.load_balancers.is_empty()
            && self.listeners.is_empty()
            && self.rules.is_empty()
            && self.target_groups.is_empty()
    }

    /// Total number of listed resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.load_balancers
            .len()
            .saturating_add(self.listeners.len())
            .saturating_add(self.rules.len())
            .saturating_add(self.target_groups.len())
    }
}

/// A create call with every reference already resolved to a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreateRequest {
    LoadBalancer {
        spec: LoadBalancerSpec,
        tags: TagSet,
    },
    Listener {
        load_balancer: Handle,
        spec: ListenerSpec,
    },
    Rule {
        listener: Handle,
        spec: RuleSpec,
    },
    TargetGroup {
        spec: TargetGroupSpec,
        tags: TagSet,
    },
    /// Register targets. The returned handle is the target group's.
    Binding {
        target_group: Handle,
        targets: Vec<Target>,
    },
}

impl CreateRequest {
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::LoadBalancer { .. } => ResourceKind::LoadBalancer,
            Self::Listener { .. } => ResourceKind::Listener,
            Self::Rule { .. } => ResourceKind::Rule,
            Self::TargetGroup { .. } => ResourceKind::TargetGroup,
            Self::Binding { .. } => ResourceKind::TargetGroupBinding,
        }
    }
}

/// A modify call. `diff` names the fields that differ; providers that
/// update field by field only need to touch those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModifyRequest {
    pub diff: FieldDiff,
    pub change: Change,
}

/// The new values of a modified resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    LoadBalancer {
        spec: LoadBalancerSpec,
        tags: TagChanges,
    },
    Listener {
        spec: ListenerSpec,
    },
    Rule {
        spec: RuleSpec,
    },
    TargetGroup {
        spec: TargetGroupSpec,
        tags: TagChanges,
    },
    Binding {
        register: Vec<Target>,
        deregister: Vec<Target>,
    },
}

impl Change {
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::LoadBalancer { .. } => ResourceKind::LoadBalancer,
            Self::Listener { .. } => ResourceKind::Listener,
            Self::Rule { .. } => ResourceKind::Rule,
            Self::TargetGroup { .. } => ResourceKind::TargetGroup,
            Self::Binding { .. } => ResourceKind::TargetGroupBinding,
        }
    }
}

/// Cloud API used by the converger.
///
/// Implementations must be safe to call concurrently; the converger issues
/// independent calls in parallel up to its concurrency bound.
#[async_trait]
pub trait Provider: Send + Sync {
    /// List every resource tagged for `cluster`.
    async fn list(&self, cluster: &str) -> Result<ProviderSnapshot>;

    /// Create a resource and return its handle.
    async fn create(&self, request: CreateRequest) -> Result<Handle>;

    /// Update a resource in place.
    async fn modify(&self, handle: &str, request: ModifyRequest) -> Result<()>;

    /// Delete a resource. Deleting a binding deregisters all of its targets.
    async fn delete(&self, kind: ResourceKind, handle: &str) -> Result<()>;
}
