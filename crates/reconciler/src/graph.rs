//! The per-ingress resource graph.
//!
//! The load balancer is the root and owns its listeners, which own their
//! rules. Target groups may be shared by several rules, so the graph owns
//! them directly, keyed by ID; listeners and rules refer to a target group by
//! ID only. Reference counts are computed by scanning, see
//! [`IngressGraph::references_to`].

use std::collections::BTreeMap;
use std::fmt;

use alb_core::ResourceKind;
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeMut, NodeView, Verdict};
use crate::types::{ListenerSpec, LoadBalancerSpec, RuleSpec, TargetGroupSpec, TargetSet};

/// Namespace and name of an ingress object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IngressKey {
    pub namespace: String,
    pub name: String,
}

impl IngressKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for IngressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Address of a node within one graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl NodeRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn of(node: &dyn NodeView) -> Self {
        Self::new(node.kind(), node.id())
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadBalancerNode {
    pub node: Node<LoadBalancerSpec>,
    /// Ordered by port.
    pub listeners: Vec<ListenerNode>,
}

impl LoadBalancerNode {
    #[must_use]
    pub const fn new(node: Node<LoadBalancerSpec>) -> Self {
        Self {
            node,
            listeners: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerNode {
    pub node: Node<ListenerSpec>,
    /// Ordered by priority.
    pub rules: Vec<Node<RuleSpec>>,
}

impl ListenerNode {
    #[must_use]
    pub const fn new(node: Node<ListenerSpec>) -> Self {
        Self {
            node,
            rules: Vec::new(),
        }
    }

    /// Port of whichever side exists.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.node
            .desired
            .as_ref()
            .or(self.node.current.as_ref())
            .map_or(0, |spec| spec.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroupNode {
    pub node: Node<TargetGroupSpec>,
    /// Target registrations.
    pub targets: Node<TargetSet>,
}

/// Which sides of a node reference a target group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub from: NodeRef,
    pub desired: bool,
    pub current: bool,
    pub verdict: Verdict,
}

/// The merged desired/current graph of one ingress.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressGraph {
    pub ingress: IngressKey,
    pub load_balancer: Option<LoadBalancerNode>,
    pub target_groups: BTreeMap<String, TargetGroupNode>,
    /// The owning ingress no longer exists.
    pub orphaned: bool,
}

impl IngressGraph {
    /// An empty graph: nothing desired or nothing observed.
    #[must_use]
    pub const fn empty(ingress: IngressKey) -> Self {
        Self {
            ingress,
            load_balancer: None,
            target_groups: BTreeMap::new(),
            orphaned: false,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.load_balancer.is_none() && self.target_groups.is_empty()
    }

    pub fn listeners(&self) -> impl Iterator<Item = &ListenerNode> {
        self.load_balancer
            .iter()
            .flat_map(|lb| lb.listeners.iter())
    }

    /// Every rule paired with its listener.
    pub fn rules(&self) -> impl Iterator<Item = (&ListenerNode, &Node<RuleSpec>)> {
        self.listeners()
            .flat_map(|listener| listener.rules.iter().map(move |rule| (listener, rule)))
    }

    #[must_use]
    pub fn listener(&self, id: &str) -> Option<&ListenerNode> {
        self.listeners().find(|l| l.node.id() == id)
    }

    /// A rule and the listener that owns it.
    #[must_use]
    pub fn rule(&self, id: &str) -> Option<(&ListenerNode, &Node<RuleSpec>)> {
        self.rules().find(|(_, rule)| rule.id() == id)
    }

    #[must_use]
    pub fn target_group(&self, id: &str) -> Option<&TargetGroupNode> {
        self.target_groups.get(id)
    }

    /// The target group owning the binding `id`.
    #[must_use]
    pub fn binding_owner(&self, id: &str) -> Option<&TargetGroupNode> {
        self.target_groups.values().find(|tg| tg.targets.id() == id)
    }

    /// All nodes, root first: load balancer, listeners, rules, target
    /// groups, bindings.
    #[must_use]
    pub fn nodes(&self) -> Vec<&dyn NodeView> {
        let mut nodes: Vec<&dyn NodeView> = Vec::new();
        if let Some(lb) = &self.load_balancer {
            nodes.push(&lb.node);
            nodes.extend(lb.listeners.iter().map(|l| &l.node as &dyn NodeView));
            nodes.extend(self.rules().map(|(_, r)| r as &dyn NodeView));
        }
        for tg in self.target_groups.values() {
            nodes.push(&tg.node);
        }
        for tg in self.target_groups.values() {
            nodes.push(&tg.targets);
        }
        nodes
    }

    /// Apply `f` to every node.
    pub fn visit_mut(&mut self, f: &mut dyn FnMut(&mut dyn NodeMut)) {
        if let Some(lb) = &mut self.load_balancer {
            f(&mut lb.node);
            for listener in &mut lb.listeners {
                f(&mut listener.node);
                for rule in &mut listener.rules {
                    f(rule);
                }
            }
        }
        for tg in self.target_groups.values_mut() {
            f(&mut tg.node);
            f(&mut tg.targets);
        }
    }

    /// Apply `f` to the node at `at`. Returns `None` if no such node exists.
    pub fn with_node<R>(&mut self, at: &NodeRef, f: impl FnOnce(&mut dyn NodeMut) -> R) -> Option<R> {
        match at.kind {
            ResourceKind::LoadBalancer => self
                .load_balancer
                .as_mut()
                .filter(|lb| lb.node.id() == at.id)
                .map(|lb| f(&mut lb.node)),
            ResourceKind::Listener => self
                .load_balancer
                .as_mut()?
                .listeners
                .iter_mut()
                .find(|l| l.node.id() == at.id)
                .map(|l| f(&mut l.node)),
            ResourceKind::Rule => self
                .load_balancer
                .as_mut()?
                .listeners
                .iter_mut()
                .flat_map(|l| l.rules.iter_mut())
                .find(|r| r.id() == at.id)
                .map(|r| f(r)),
            ResourceKind::TargetGroup => self.target_groups.get_mut(&at.id).map(|tg| f(&mut tg.node)),
            ResourceKind::TargetGroupBinding => self
                .target_groups
                .values_mut()
                .find(|tg| tg.targets.id() == at.id)
                .map(|tg| f(&mut tg.targets)),
        }
    }

    /// Listeners and rules whose desired or current side forwards to the
    /// target group `id`.
    #[must_use]
    pub fn references_to(&self, id: &str) -> Vec<Reference> {
        let listeners = self.listeners().map(|l| {
            let desired = l.node.desired.as_ref().is_some_and(|s| s.default_target_group == id);
            let current = l.node.current.as_ref().is_some_and(|s| s.default_target_group == id);
            (NodeRef::of(&l.node), desired, current, &l.node.verdict)
        });
        let rules = self.rules().map(|(_, r)| {
            let desired = r.desired.as_ref().is_some_and(|s| s.target_group == id);
            let current = r.current.as_ref().is_some_and(|s| s.target_group == id);
            (NodeRef::of(r), desired, current, &r.verdict)
        });
        listeners
            .chain(rules)
            .filter(|(_, desired, current, _)| *desired || *current)
            .map(|(from, desired, current, verdict)| Reference {
                from,
                desired,
                current,
                verdict: verdict.clone(),
            })
            .collect()
    }

    /// Recompute every node's verdict from its own two sides.
    pub fn reconcile_nodes(&mut self) {
        self.visit_mut(&mut |node| node.reconcile());
    }

    /// Drop nodes whose deletion has been confirmed.
    pub fn prune(&mut self) {
        if let Some(lb) = &mut self.load_balancer {
            for listener in &mut lb.listeners {
                listener.rules.retain(|r| !r.is_garbage());
            }
            lb.listeners
                .retain(|l| !(l.node.is_garbage() && l.rules.is_empty()));
        }
        if self
            .load_balancer
            .as_ref()
            .is_some_and(|lb| lb.node.is_garbage() && lb.listeners.is_empty())
        {
            self.load_balancer = None;
        }
        self.target_groups
            .retain(|_, tg| !(tg.node.is_garbage() && tg.targets.is_garbage()));
    }

    /// Every node's verdict is a no-op.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.nodes().iter().all(|n| n.verdict().is_noop())
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    /// Count of nodes carrying a desired value.
    #[must_use]
    pub fn desired_count(&self) -> usize {
        let mut count = 0usize;
        if let Some(lb) = &self.load_balancer {
            count = count.saturating_add(usize::from(lb.node.desired.is_some()));
            for listener in &lb.listeners {
                count = count.saturating_add(usize::from(listener.node.desired.is_some()));
                let rules = listener.rules.iter().filter(|r| r.desired.is_some()).count();
                count = count.saturating_add(rules);
            }
        }
        for tg in self.target_groups.values() {
            count = count.saturating_add(usize::from(tg.node.desired.is_some()));
            count = count.saturating_add(usize::from(tg.targets.desired.is_some()));
        }
        count
    }

    /// Sort listeners by port and rules by priority.
    pub fn sort(&mut self) {
        if let Some(lb) = &mut self.load_balancer {
            lb.listeners.sort_by_key(ListenerNode::port);
            for listener in &mut lb.listeners {
                listener.rules.sort_by_key(rule_priority);
            }
        }
    }
}

fn rule_priority(rule: &Node<RuleSpec>) -> u32 {
    rule.desired
        .as_ref()
        .or(rule.current.as_ref())
        .map_or(0, |spec| spec.priority)
}

#[cfg(test)]
mod tests {
    use alb_core::TagSet;

    use super::*;
    use crate::node::NodeState;

    fn graph() -> IngressGraph {
        let mut lb = LoadBalancerNode::new(Node::desired("lb", LoadBalancerSpec::named("lb"), TagSet::new()));
        let mut listener = ListenerNode::new(Node::desired(
            "lb-l80",
            ListenerSpec {
                port: 80,
                protocol: crate::types::Protocol::Http,
                certificate_arn: None,
                ssl_policy: None,
                default_target_group: "tg-a".into(),
            },
            TagSet::new(),
        ));
        listener.rules.push(Node::desired(
            "lb-l80-r1",
            RuleSpec {
                priority: 1,
                conditions: vec![crate::types::RuleCondition::path("/api")],
                target_group: "tg-b".into(),
            },
            TagSet::new(),
        ));
        lb.listeners.push(listener);
        let mut graph = IngressGraph::empty(IngressKey::new("ns", "ing"));
        graph.load_balancer = Some(lb);
        for id in ["tg-a", "tg-b"] {
            graph.target_groups.insert(
                id.to_string(),
                TargetGroupNode {
                    node: Node::desired(
                        id,
                        TargetGroupSpec {
                            name: id.into(),
                            port: 80,
                            protocol: crate::types::Protocol::Http,
                            target_type: crate::types::TargetType::Instance,
                            health_check: crate::types::HealthCheck::default(),
                        },
                        TagSet::new(),
                    ),
                    targets: Node::desired(format!("{id}-targets"), TargetSet::default(), TagSet::new()),
                },
            );
        }
        graph
    }

    #[test]
    fn test_nodes_are_listed_root_first() {
        let graph = graph();
        let kinds: Vec<_> = graph.nodes().iter().map(|n| n.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::LoadBalancer,
                ResourceKind::Listener,
                ResourceKind::Rule,
                ResourceKind::TargetGroup,
                ResourceKind::TargetGroup,
                ResourceKind::TargetGroupBinding,
                ResourceKind::TargetGroupBinding,
            ]
        );
        assert_eq!(graph.desired_count(), 7);
    }

    #[test]
    fn test_references_are_found_by_scan() {
        let graph = graph();
        let refs = graph.references_to("tg-b");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs.first().map(|r| r.from.kind), Some(ResourceKind::Rule));
        assert!(graph.references_to("tg-missing").is_empty());
    }

    #[test]
    fn test_with_node_reaches_every_kind() {
        let mut graph = graph();
        for at in [
            NodeRef::new(ResourceKind::LoadBalancer, "lb"),
            NodeRef::new(ResourceKind::Listener, "lb-l80"),
            NodeRef::new(ResourceKind::Rule, "lb-l80-r1"),
            NodeRef::new(ResourceKind::TargetGroup, "tg-a"),
            NodeRef::new(ResourceKind::TargetGroupBinding, "tg-a-targets"),
        ] {
            let found = graph.with_node(&at, |node| node.set_state(NodeState::Applied));
            assert!(found.is_some(), "{at} should exist");
        }
        assert!(graph.with_node(&NodeRef::new(ResourceKind::Rule, "nope"), |_| ()).is_none());
        let applied = graph
            .nodes()
            .iter()
            .filter(|n| *n.state() == NodeState::Applied)
            .count();
        assert_eq!(applied, 5);
    }

    #[test]
    fn test_prune_drops_deleted_nodes() {
        let mut graph = graph();
        if let Some(lb) = graph.load_balancer.as_mut() {
            for listener in &mut lb.listeners {
                for rule in &mut listener.rules {
                    rule.desired = None;
                }
            }
        }
        graph.prune();
        assert_eq!(graph.rules().count(), 0);
        assert_eq!(graph.listeners().count(), 1);
    }
}
