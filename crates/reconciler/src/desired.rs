//! Desired-graph builder.
//!
//! Turns an ingress (already parsed into typed annotations upstream) into a
//! graph whose nodes all carry a desired value and no current value. The
//! build is deterministic: the same input always yields the same IDs and
//! values, so repeated builds diff cleanly against each other.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use alb_core::naming::{binding_id, listener_id, load_balancer_name, rule_id, target_group_name};
use alb_core::tags::{CLUSTER_TAG, INGRESS_NAME_TAG, NAMESPACE_TAG, SERVICE_NAME_TAG, SERVICE_PORT_TAG};
use alb_core::{Error, Result, TagSet};
use ipnetwork::IpNetwork;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MAX_IDLE_TIMEOUT_SECS;
use crate::graph::{IngressGraph, IngressKey, ListenerNode, LoadBalancerNode, TargetGroupNode};
use crate::node::Node;
use crate::types::{
    HealthCheck, IpAddressType, ListenerSpec, LoadBalancerSpec, Protocol, RuleCondition, RuleSpec,
    Scheme, Target, TargetGroupSpec, TargetSet, TargetType,
};

const DEFAULT_HTTP_PORT: u16 = 80;

#[expect(clippy::expect_used)]
static RESOURCE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]+)-[0-9a-zA-Z]+$").expect("hardcoded regex pattern is valid"));

/// A service port an ingress routes to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendRef {
    pub service_name: String,
    pub service_port: u16,
}

impl BackendRef {
    pub fn new(service_name: impl Into<String>, service_port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            service_port,
        }
    }
}

/// One host/path routing rule of an ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub backend: BackendRef,
}

/// Targets currently serving a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    #[serde(flatten)]
    pub backend: BackendRef,
    pub targets: Vec<Target>,
}

/// A port the load balancer listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenPort {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Typed annotation values. Parsing the raw annotation strings happens
/// upstream; the values here are only checked structurally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Annotations {
    pub scheme: Option<Scheme>,
    pub security_groups: Vec<String>,
    pub subnets: Vec<String>,
    pub ip_address_type: Option<IpAddressType>,
    pub idle_timeout_secs: Option<u32>,
    pub inbound_cidrs: Vec<String>,
    pub listen_ports: Vec<ListenPort>,
    pub certificate_arn: Option<String>,
    pub ssl_policy: Option<String>,
    pub target_type: Option<TargetType>,
    pub backend_protocol: Option<Protocol>,
    pub health_check: Option<HealthCheck>,
}

/// Everything the desired-graph builder needs about one ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressInput {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default)]
    pub default_backend: Option<BackendRef>,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoints>,
    #[serde(default)]
    pub tags: TagSet,
}

impl IngressInput {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            annotations: Annotations::default(),
            default_backend: None,
            rules: Vec::new(),
            endpoints: Vec::new(),
            tags: TagSet::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> IngressKey {
        IngressKey::new(&self.namespace, &self.name)
    }

    /// Distinct backends in first-seen order: default backend, then rules.
    fn backends(&self) -> Vec<&BackendRef> {
        self.default_backend
            .iter()
            .chain(self.rules.iter().map(|r| &r.backend))
            .unique()
            .collect()
    }
}

/// Tags marking a resource as owned by `ingress` in `cluster`.
#[must_use]
pub fn ownership_tags(ingress: &IngressKey, cluster: &str) -> TagSet {
    [
        (INGRESS_NAME_TAG, ingress.name.as_str()),
        (NAMESPACE_TAG, ingress.namespace.as_str()),
        (CLUSTER_TAG, cluster),
    ]
    .into_iter()
    .collect()
}

/// Builds desired graphs for one cluster.
#[derive(Debug, Clone)]
pub struct DesiredGraphBuilder {
    cluster_name: String,
    default_idle_timeout_secs: u32,
}

impl DesiredGraphBuilder {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            default_idle_timeout_secs: 60,
        }
    }

    /// Idle timeout used when the annotations omit one.
    #[must_use]
    pub const fn default_idle_timeout(mut self, secs: u32) -> Self {
        self.default_idle_timeout_secs = secs;
        self
    }

    /// Build the desired graph of `input`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the input is structurally invalid.
    pub fn build(&self, input: &IngressInput) -> Result<IngressGraph> {
        validate(input)?;

        let key = input.key();
        let owner_tags = ownership_tags(&key, &self.cluster_name);
        let tags = input.tags.merge(&owner_tags);
        let annotations = &input.annotations;

        let target_groups = self.target_groups(input, &tags);
        let target_group_of = |backend: &BackendRef| {
            target_group_name(
                &input.namespace,
                &input.name,
                &self.cluster_name,
                &backend.service_name,
                backend.service_port,
            )
        };

        let default_backend = input
            .default_backend
            .as_ref()
            .or_else(|| input.rules.first().map(|r| &r.backend))
            .ok_or_else(|| Error::validation("default_backend", "ingress has no backend to route to"))?;
        let default_target_group = target_group_of(default_backend);

        let lb_name = load_balancer_name(&input.namespace, &input.name, &self.cluster_name);
        let lb_spec = LoadBalancerSpec {
            name: lb_name.clone(),
            scheme: annotations.scheme.unwrap_or_default(),
            security_groups: annotations.security_groups.clone(),
            subnets: annotations.subnets.clone(),
            ip_address_type: annotations.ip_address_type.unwrap_or_default(),
            idle_timeout_secs: annotations
                .idle_timeout_secs
                .unwrap_or(self.default_idle_timeout_secs),
            inbound_cidrs: annotations.inbound_cidrs.clone(),
        };
        let mut load_balancer = LoadBalancerNode::new(Node::desired(lb_name.clone(), lb_spec, tags));

        for listen in listen_ports(annotations) {
            let id = listener_id(&lb_name, listen.port);
            let https = listen.protocol == Protocol::Https;
            let spec = ListenerSpec {
                port: listen.port,
                protocol: listen.protocol,
                certificate_arn: annotations.certificate_arn.clone().filter(|_| https),
                ssl_policy: annotations.ssl_policy.clone().filter(|_| https),
                default_target_group: default_target_group.clone(),
            };
            let mut listener = ListenerNode::new(Node::desired(id.clone(), spec, TagSet::new()));
            for (priority, rule) in (1u32..).zip(&input.rules) {
                let spec = RuleSpec {
                    priority,
                    conditions: conditions(rule),
                    target_group: target_group_of(&rule.backend),
                };
                listener
                    .rules
                    .push(Node::desired(rule_id(&id, priority), spec, TagSet::new()));
            }
            load_balancer.listeners.push(listener);
        }

        let mut graph = IngressGraph::empty(key);
        graph.load_balancer = Some(load_balancer);
        graph.target_groups = target_groups;
        graph.sort();

        debug!(
            ingress = %graph.ingress,
            load_balancer = %lb_name,
            nodes = graph.node_count(),
            "built desired graph"
        );
        Ok(graph)
    }

    fn target_groups(&self, input: &IngressInput, tags: &TagSet) -> BTreeMap<String, TargetGroupNode> {
        let annotations = &input.annotations;
        input
            .backends()
            .into_iter()
            .map(|backend| {
                let name = target_group_name(
                    &input.namespace,
                    &input.name,
                    &self.cluster_name,
                    &backend.service_name,
                    backend.service_port,
                );
                let spec = TargetGroupSpec {
                    name: name.clone(),
                    port: backend.service_port,
                    protocol: annotations.backend_protocol.unwrap_or_default(),
                    target_type: annotations.target_type.unwrap_or_default(),
                    health_check: annotations.health_check.clone().unwrap_or_default(),
                };
                let mut tg_tags = tags.clone();
                tg_tags.insert(SERVICE_NAME_TAG, backend.service_name.clone());
                tg_tags.insert(SERVICE_PORT_TAG, backend.service_port.to_string());

                let targets = input
                    .endpoints
                    .iter()
                    .filter(|e| &e.backend == backend)
                    .flat_map(|e| e.targets.iter().cloned())
                    .sorted()
                    .dedup()
                    .collect();

                let node = TargetGroupNode {
                    node: Node::desired(name.clone(), spec, tg_tags),
                    targets: Node::desired(binding_id(&name), TargetSet::new(targets), TagSet::new()),
                };
                (name, node)
            })
            .collect()
    }
}

fn listen_ports(annotations: &Annotations) -> Vec<ListenPort> {
    if annotations.listen_ports.is_empty() {
        vec![ListenPort {
            port: DEFAULT_HTTP_PORT,
            protocol: Protocol::Http,
        }]
    } else {
        annotations.listen_ports.clone()
    }
}

fn conditions(rule: &IngressRule) -> Vec<RuleCondition> {
    rule.host
        .iter()
        .map(RuleCondition::host)
        .chain(rule.path.iter().map(RuleCondition::path))
        .collect()
}

/// Structural validation of an ingress input.
///
/// # Errors
///
/// Returns the first [`Error::Validation`] found.
pub fn validate(input: &IngressInput) -> Result<()> {
    if input.namespace.is_empty() {
        return Err(Error::validation("namespace", "must not be empty"));
    }
    if input.name.is_empty() {
        return Err(Error::validation("name", "must not be empty"));
    }
    validate_annotations(&input.annotations)?;

    for (index, rule) in input.rules.iter().enumerate() {
        let field = format!("rules[{index}]");
        if rule.host.is_none() && rule.path.is_none() {
            return Err(Error::validation(field, "rule needs a host or a path"));
        }
        if rule.host.as_deref().is_some_and(str::is_empty) {
            return Err(Error::validation(field, "host must not be empty"));
        }
        if rule.path.as_deref().is_some_and(|p| !p.starts_with('/')) {
            return Err(Error::validation(field, "path must start with '/'"));
        }
        validate_backend(&format!("rules[{index}].backend"), &rule.backend)?;
    }
    if let Some(backend) = &input.default_backend {
        validate_backend("default_backend", backend)?;
    }
    for (index, endpoints) in input.endpoints.iter().enumerate() {
        if let Some(target) = endpoints.targets.iter().find(|t| t.port == 0 || t.id.is_empty()) {
            return Err(Error::validation(
                format!("endpoints[{index}]"),
                format!("invalid target '{}:{}'", target.id, target.port),
            ));
        }
    }
    Ok(())
}

fn validate_backend(field: &str, backend: &BackendRef) -> Result<()> {
    if backend.service_name.is_empty() {
        return Err(Error::validation(field, "service name must not be empty"));
    }
    if backend.service_port == 0 {
        return Err(Error::validation(field, "service port must be between 1 and 65535"));
    }
    Ok(())
}

fn validate_annotations(annotations: &Annotations) -> Result<()> {
    validate_ids("annotations.security_groups", "sg", &annotations.security_groups)?;
    validate_ids("annotations.subnets", "subnet", &annotations.subnets)?;

    if let Some(cidr) = annotations
        .inbound_cidrs
        .iter()
        .find(|cidr| cidr.parse::<IpNetwork>().is_err())
    {
        return Err(Error::validation(
            "annotations.inbound_cidrs",
            format!("'{cidr}' is not a CIDR block"),
        ));
    }

    if let Some(secs) = annotations
        .idle_timeout_secs
        .filter(|secs| !(1..=MAX_IDLE_TIMEOUT_SECS).contains(secs))
    {
        return Err(Error::validation(
            "annotations.idle_timeout_secs",
            format!("{secs} is outside 1..={MAX_IDLE_TIMEOUT_SECS}"),
        ));
    }

    let ports = listen_ports(annotations);
    if ports.iter().any(|p| p.port == 0) {
        return Err(Error::validation("annotations.listen_ports", "port must be between 1 and 65535"));
    }
    if let Some(duplicate) = ports.iter().map(|p| p.port).duplicates().next() {
        return Err(Error::validation(
            "annotations.listen_ports",
            format!("port {duplicate} listed twice"),
        ));
    }
    if ports.iter().any(|p| p.protocol == Protocol::Https) && annotations.certificate_arn.is_none() {
        return Err(Error::validation(
            "annotations.certificate_arn",
            "an HTTPS listener needs a certificate",
        ));
    }

    if let Some(health) = &annotations.health_check {
        validate_health_check(health)?;
    }
    Ok(())
}

fn validate_ids(field: &str, prefix: &str, ids: &[String]) -> Result<()> {
    let is_valid = |id: &str| {
        RESOURCE_ID_REGEX
            .captures(id)
            .and_then(|caps| caps.get(1))
            .is_some_and(|kind| kind.as_str() == prefix)
    };
    match ids.iter().find(|id| !is_valid(id)) {
        Some(id) => Err(Error::validation(field, format!("'{id}' is not a {prefix} ID"))),
        None => Ok(()),
    }
}

fn validate_health_check(health: &HealthCheck) -> Result<()> {
    const FIELD: &str = "annotations.health_check";
    if !health.path.starts_with('/') {
        return Err(Error::validation(FIELD, "path must start with '/'"));
    }
    if health.port == Some(0) {
        return Err(Error::validation(FIELD, "port must be between 1 and 65535"));
    }
    if health.timeout_secs == 0 || health.timeout_secs >= health.interval_secs {
        return Err(Error::validation(FIELD, "timeout must be positive and shorter than the interval"));
    }
    for threshold in [health.healthy_threshold, health.unhealthy_threshold] {
        if !(2..=10).contains(&threshold) {
            return Err(Error::validation(FIELD, format!("threshold {threshold} is outside 2..=10")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const CLUSTER: &str = "cluster1";
    const NAMESPACE: &str = "namespace1";
    const INGRESS: &str = "ingress1";

    fn input() -> IngressInput {
        let mut input = IngressInput::new(NAMESPACE, INGRESS);
        input.annotations.scheme = Some(Scheme::Internal);
        input.annotations.security_groups = vec!["sg-123".into(), "sg-abc".into()];
        input.tags = [("tag1", "value1"), ("tag2", "value2")].into_iter().collect();
        input.rules = vec![
            IngressRule {
                host: Some("shop.example.com".into()),
                path: Some("/cart".into()),
                backend: BackendRef::new("cart", 80),
            },
            IngressRule {
                host: None,
                path: Some("/".into()),
                backend: BackendRef::new("web", 80),
            },
        ];
        input.endpoints = vec![ServiceEndpoints {
            backend: BackendRef::new("web", 80),
            targets: vec![Target::new("i-2", 30080), Target::new("i-1", 30080)],
        }];
        input
    }

    #[test]
    fn test_load_balancer_uses_naming_function_and_annotations() {
        let graph = DesiredGraphBuilder::new(CLUSTER).build(&input()).unwrap();
        let lb = graph.load_balancer.unwrap();
        let desired = lb.node.desired.as_ref().unwrap();

        assert_eq!(desired.name, load_balancer_name(NAMESPACE, INGRESS, CLUSTER));
        assert_eq!(lb.node.id(), desired.name);
        assert_eq!(desired.scheme, Scheme::Internal);
        // Sent in input order; sorting happens only when comparing.
        assert_eq!(desired.security_groups, vec!["sg-123", "sg-abc"]);
        assert_eq!(lb.node.desired_tags.get("tag1"), Some("value1"));
        assert_eq!(lb.node.desired_tags.get(INGRESS_NAME_TAG), Some(INGRESS));
        assert_eq!(lb.node.desired_tags.get(NAMESPACE_TAG), Some(NAMESPACE));
        assert!(lb.node.current.is_none());
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = DesiredGraphBuilder::new(CLUSTER);
        assert_eq!(builder.build(&input()).unwrap(), builder.build(&input()).unwrap());
    }

    #[test]
    fn test_rules_get_priorities_in_order_on_every_listener() {
        let mut input = input();
        input.annotations.listen_ports = vec![
            ListenPort { port: 443, protocol: Protocol::Https },
            ListenPort { port: 80, protocol: Protocol::Http },
        ];
        input.annotations.certificate_arn = Some("arn:cert".into());
        let graph = DesiredGraphBuilder::new(CLUSTER).build(&input).unwrap();

        let ports: Vec<_> = graph.listeners().map(ListenerNode::port).collect();
        assert_eq!(ports, vec![80, 443]);
        for listener in graph.listeners() {
            let priorities: Vec<_> = listener
                .rules
                .iter()
                .filter_map(|r| r.desired.as_ref().map(|s| s.priority))
                .collect();
            assert_eq!(priorities, vec![1, 2]);
        }
        let https = graph.listeners().find(|l| l.port() == 443).unwrap();
        assert_eq!(
            https.node.desired.as_ref().and_then(|s| s.certificate_arn.as_deref()),
            Some("arn:cert")
        );
        let http = graph.listeners().find(|l| l.port() == 80).unwrap();
        assert!(http.node.desired.as_ref().unwrap().certificate_arn.is_none());
    }

    #[test]
    fn test_one_target_group_per_backend_with_targets() {
        let graph = DesiredGraphBuilder::new(CLUSTER).build(&input()).unwrap();
        assert_eq!(graph.target_groups.len(), 2);

        let web = target_group_name(NAMESPACE, INGRESS, CLUSTER, "web", 80);
        let tg = graph.target_group(&web).unwrap();
        assert_eq!(tg.node.desired_tags.get(SERVICE_NAME_TAG), Some("web"));
        assert_eq!(
            tg.targets.desired.as_ref().unwrap().targets,
            vec![Target::new("i-1", 30080), Target::new("i-2", 30080)]
        );

        // Without a default backend the first rule's backend is the default action.
        let cart = target_group_name(NAMESPACE, INGRESS, CLUSTER, "cart", 80);
        let listener = graph.listeners().next().unwrap();
        assert_eq!(listener.node.desired.as_ref().unwrap().default_target_group, cart);
    }

    #[test]
    fn test_invalid_cidr_is_rejected() {
        let mut input = input();
        input.annotations.inbound_cidrs = vec!["10.0.0.0/8".into(), "10.0.0.0/99".into()];
        let err = DesiredGraphBuilder::new(CLUSTER).build(&input).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "annotations.inbound_cidrs"));
    }

    #[test]
    fn test_invalid_security_group_is_rejected() {
        let mut input = input();
        input.annotations.security_groups = vec!["default".into()];
        assert!(DesiredGraphBuilder::new(CLUSTER).build(&input).is_err());
    }

    #[test]
    fn test_id_of_the_wrong_kind_is_rejected() {
        let mut input = input();
        input.annotations.security_groups = vec!["sg-1".into(), "subnet-2".into()];
        let err = DesiredGraphBuilder::new(CLUSTER).build(&input).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "annotations.security_groups"));

        let mut swapped = self::input();
        swapped.annotations.subnets = vec!["subnet-0a1b".into(), "sg-0a1b".into()];
        let err = DesiredGraphBuilder::new(CLUSTER).build(&swapped).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "annotations.subnets"));
    }

    #[test]
    fn test_idle_timeout_above_provider_limit_is_rejected() {
        let mut input = input();
        input.annotations.idle_timeout_secs = Some(MAX_IDLE_TIMEOUT_SECS);
        assert!(DesiredGraphBuilder::new(CLUSTER).build(&input).is_ok());
        input.annotations.idle_timeout_secs = Some(MAX_IDLE_TIMEOUT_SECS + 1);
        assert!(DesiredGraphBuilder::new(CLUSTER).build(&input).is_err());
    }

    #[test]
    fn test_https_without_certificate_is_rejected() {
        let mut input = input();
        input.annotations.listen_ports = vec![ListenPort { port: 443, protocol: Protocol::Https }];
        assert!(DesiredGraphBuilder::new(CLUSTER).build(&input).is_err());
    }

    #[test]
    fn test_ingress_without_backend_is_rejected() {
        let input = IngressInput::new(NAMESPACE, INGRESS);
        let err = DesiredGraphBuilder::new(CLUSTER).build(&input).unwrap_err();
        assert_eq!(err.category(), "ValidationError");
    }

    #[test]
    fn test_idle_timeout_defaults_and_bounds() {
        let graph = DesiredGraphBuilder::new(CLUSTER)
            .default_idle_timeout(120)
            .build(&input())
            .unwrap();
        let lb = graph.load_balancer.unwrap();
        assert_eq!(lb.node.desired.unwrap().idle_timeout_secs, 120);

        let mut input = input();
        input.annotations.idle_timeout_secs = Some(0);
        assert!(DesiredGraphBuilder::new(CLUSTER).build(&input).is_err());
    }
}
