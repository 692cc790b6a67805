//! Resource values for each level of the load-balancer tree.
//!
//! Each value type implements [`Resource`], the per-kind strategy: which
//! fields differ between a desired and a current value, and which of those
//! differences the provider cannot patch in place.

use std::fmt;

use alb_core::ResourceKind;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Per-kind diff strategy.
pub trait Resource: Clone + PartialEq + fmt::Debug + Serialize + Send + Sync + 'static {
    /// The resource level this value describes.
    const KIND: ResourceKind;

    /// Field-level difference between a desired and a current value.
    fn diff(desired: &Self, current: &Self) -> FieldDiff;
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    /// The provider cannot change this field in place.
    pub immutable: bool,
}

/// The set of fields that differ between desired and current.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldDiff {
    changes: Vec<FieldChange>,
}

impl FieldDiff {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    /// Compare a scalar field that can be modified in place.
    #[must_use]
    pub fn field<V: PartialEq>(self, field: &'static str, desired: &V, current: &V) -> Self {
        self.push_if(field, false, desired != current)
    }

    /// Compare a scalar field that forces replacement when it differs.
    #[must_use]
    pub fn immutable<V: PartialEq>(self, field: &'static str, desired: &V, current: &V) -> Self {
        self.push_if(field, true, desired != current)
    }

    /// Compare a list field as a set: reordering alone is not a change.
    #[must_use]
    pub fn set<V: Ord>(self, field: &'static str, desired: &[V], current: &[V]) -> Self {
        self.push_if(field, false, !same_set(desired, current))
    }

    /// Record a change unconditionally.
    #[must_use]
    pub fn changed(self, field: &'static str) -> Self {
        self.push_if(field, false, true)
    }

    fn push_if(mut self, field: &'static str, immutable: bool, differs: bool) -> Self {
        if differs {
            self.changes.push(FieldChange { field, immutable });
        }
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether any differing field is immutable.
    #[must_use]
    pub fn requires_replacement(&self) -> bool {
        self.changes.iter().any(|c| c.immutable)
    }

    /// Whether `field` differs.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.changes.iter().any(|c| c.field == field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.changes.iter().map(|c| c.field)
    }

    #[must_use]
    pub fn immutable_fields(&self) -> Vec<&'static str> {
        self.changes
            .iter()
            .filter(|c| c.immutable)
            .map(|c| c.field)
            .collect()
    }
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.fields().join(", "))
    }
}

/// Order-independent equality of two lists.
#[must_use]
pub fn same_set<V: Ord>(a: &[V], b: &[V]) -> bool {
    a.len() == b.len() && a.iter().sorted().eq(b.iter().sorted())
}

// ---------------------------------------------------------------------------
// Load balancer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    #[default]
    #[serde(rename = "internal")]
    Internal,
    #[serde(rename = "internet-facing")]
    InternetFacing,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => f.write_str("internal"),
            Self::InternetFacing => f.write_str("internet-facing"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAddressType {
    #[default]
    Ipv4,
    Dualstack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub name: String,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub ip_address_type: IpAddressType,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u32,
    #[serde(default)]
    pub inbound_cidrs: Vec<String>,
}

const fn default_idle_timeout() -> u32 {
    60
}

impl LoadBalancerSpec {
    /// A spec with only a name; every other field defaulted.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheme: Scheme::default(),
            security_groups: Vec::new(),
            subnets: Vec::new(),
            ip_address_type: IpAddressType::default(),
            idle_timeout_secs: default_idle_timeout(),
            inbound_cidrs: Vec::new(),
        }
    }
}

impl Resource for LoadBalancerSpec {
    const KIND: ResourceKind = ResourceKind::LoadBalancer;

    fn diff(desired: &Self, current: &Self) -> FieldDiff {
        FieldDiff::new()
            .immutable("name", &desired.name, &current.name)
            .immutable("scheme", &desired.scheme, &current.scheme)
            .set("security_groups", &desired.security_groups, &current.security_groups)
            .set("subnets", &desired.subnets, &current.subnets)
            .field("ip_address_type", &desired.ip_address_type, &current.ip_address_type)
            .field("idle_timeout_secs", &desired.idle_timeout_secs, &current.idle_timeout_secs)
            .set("inbound_cidrs", &desired.inbound_cidrs, &current.inbound_cidrs)
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("HTTP"),
            Self::Https => f.write_str("HTTPS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub certificate_arn: Option<String>,
    #[serde(default)]
    pub ssl_policy: Option<String>,
    /// Target group ID of the default forward action.
    pub default_target_group: String,
}

impl Resource for ListenerSpec {
    const KIND: ResourceKind = ResourceKind::Listener;

    fn diff(desired: &Self, current: &Self) -> FieldDiff {
        FieldDiff::new()
            .immutable("port", &desired.port, &current.port)
            .field("protocol", &desired.protocol, &current.protocol)
            .field("certificate_arn", &desired.certificate_arn, &current.certificate_arn)
            .field("ssl_policy", &desired.ssl_policy, &current.ssl_policy)
            .field(
                "default_target_group",
                &desired.default_target_group,
                &current.default_target_group,
            )
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionField {
    HostHeader,
    PathPattern,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: ConditionField,
    pub values: Vec<String>,
}

impl RuleCondition {
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            field: ConditionField::HostHeader,
            values: vec![host.into()],
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        Self {
            field: ConditionField::PathPattern,
            values: vec![path.into()],
        }
    }

    fn normalized(&self) -> Self {
        Self {
            field: self.field,
            values: self.values.iter().sorted().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub priority: u32,
    pub conditions: Vec<RuleCondition>,
    /// Target group ID of the forward action.
    pub target_group: String,
}

impl Resource for RuleSpec {
    const KIND: ResourceKind = ResourceKind::Rule;

    fn diff(desired: &Self, current: &Self) -> FieldDiff {
        let desired_conditions = desired.conditions.iter().map(RuleCondition::normalized).collect_vec();
        let current_conditions = current.conditions.iter().map(RuleCondition::normalized).collect_vec();
        FieldDiff::new()
            .immutable("priority", &desired.priority, &current.priority)
            .set("conditions", &desired_conditions, &current_conditions)
            .field("target_group", &desired.target_group, &current.target_group)
    }
}

// ---------------------------------------------------------------------------
// Target group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Instance,
    Ip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub path: String,
    /// `None` means the traffic port.
    pub port: Option<u16>,
    pub protocol: Protocol,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub success_codes: String,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            port: None,
            protocol: Protocol::Http,
            interval_secs: 15,
            timeout_secs: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            success_codes: "200".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupSpec {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub health_check: HealthCheck,
}

impl Resource for TargetGroupSpec {
    const KIND: ResourceKind = ResourceKind::TargetGroup;

    fn diff(desired: &Self, current: &Self) -> FieldDiff {
        FieldDiff::new()
            .immutable("name", &desired.name, &current.name)
            .immutable("port", &desired.port, &current.port)
            .immutable("protocol", &desired.protocol, &current.protocol)
            .immutable("target_type", &desired.target_type, &current.target_type)
            .field("health_check", &desired.health_check, &current.health_check)
    }
}

// ---------------------------------------------------------------------------
// Target registrations
// ---------------------------------------------------------------------------

/// A registered target: an instance or IP and the port traffic is sent to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub port: u16,
}

impl Target {
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        Self { id: id.into(), port }
    }
}

/// The targets registered in one target group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSet {
    pub targets: Vec<Target>,
}

impl TargetSet {
    #[must_use]
    pub const fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    /// Targets in `self` that `current` lacks.
    #[must_use]
    pub fn added_since(&self, current: &Self) -> Vec<Target> {
        self.targets
            .iter()
            .filter(|t| !current.targets.contains(t))
            .cloned()
            .sorted()
            .dedup()
            .collect()
    }

    /// Targets in `current` that `self` lacks.
    #[must_use]
    pub fn removed_since(&self, current: &Self) -> Vec<Target> {
        current.added_since(self)
    }
}

impl Resource for TargetSet {
    const KIND: ResourceKind = ResourceKind::TargetGroupBinding;

    fn diff(desired: &Self, current: &Self) -> FieldDiff {
        let desired_targets = desired.targets.iter().sorted().dedup().collect_vec();
        let current_targets = current.targets.iter().sorted().dedup().collect_vec();
        FieldDiff::new().field("targets", &desired_targets, &current_targets)
    }
}
