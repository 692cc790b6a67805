//! # Step plan
//!
//! Turns the verdicts of a diffed graph into a DAG of provider calls using
//! petgraph. An edge `a -> b` means `b` may only start once `a` succeeded.
//!
//! Teardown runs bottom-up: a rule is deleted before its listener, a
//! listener before its load balancer, and anything forwarding to a target
//! group stops doing so before the target group is deleted. Build runs
//! top-down: a parent is created or modified before its children, a target
//! group before anything that forwards to it or registers into it. A
//! replaced node is deleted before it is created again.

use std::collections::HashMap;
use std::fmt;

use alb_core::{Error, ResourceKind, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::graph::{IngressGraph, NodeRef};
use crate::node::{NodeView, Verdict};

/// The provider call a step makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOp {
    Delete,
    Create,
    Modify,
}

impl fmt::Display for StepOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => f.write_str("delete"),
            Self::Create => f.write_str("create"),
            Self::Modify => f.write_str("modify"),
        }
    }
}

/// One provider call against one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Step {
    pub node: NodeRef,
    pub op: StepOp,
}

impl Step {
    #[must_use]
    pub const fn new(node: NodeRef, op: StepOp) -> Self {
        Self { node, op }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.node)
    }
}

/// Steps implied by a verdict, in execution order.
#[must_use]
pub fn steps_for(verdict: &Verdict) -> &'static [StepOp] {
    match verdict {
        Verdict::Create => &[StepOp::Create],
        Verdict::Delete => &[StepOp::Delete],
        Verdict::Modify { .. } => &[StepOp::Modify],
        Verdict::Replace { .. } => &[StepOp::Delete, StepOp::Create],
        Verdict::NoOp | Verdict::Blocked { .. } => &[],
    }
}

/// DAG of steps for one ingress.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    dag: DiGraph<Step, ()>,
    index: HashMap<Step, NodeIndex>,
}

impl Plan {
    /// Build the plan for a diffed graph.
    ///
    /// # Examples
    ///
    /// ```
    /// use alb_reconciler::graph::{IngressGraph, IngressKey};
    /// use alb_reconciler::plan::Plan;
    ///
    /// let graph = IngressGraph::empty(IngressKey::new("ns", "web"));
    /// assert!(Plan::build(&graph).is_empty());
    /// ```
    #[must_use]
    pub fn build(graph: &IngressGraph) -> Self {
        let mut plan = Self::default();
        for node in graph.nodes() {
            for op in steps_for(node.verdict()) {
                plan.add_step(Step::new(NodeRef::of(node), *op));
            }
        }
        plan.link_replacements();
        plan.link_hierarchy(graph);
        plan.link_target_groups(graph);
        plan
    }

    fn add_step(&mut self, step: Step) {
        let index = self.dag.add_node(step.clone());
        self.index.insert(step, index);
    }

    fn find(&self, node: &NodeRef, op: StepOp) -> Option<NodeIndex> {
        self.index.get(&Step::new(node.clone(), op)).copied()
    }

    /// The create or modify step of `node`.
    fn build_step(&self, node: &NodeRef) -> Option<NodeIndex> {
        self.find(node, StepOp::Create)
            .or_else(|| self.find(node, StepOp::Modify))
    }

    fn link(&mut self, from: Option<NodeIndex>, to: Option<NodeIndex>) {
        if let (Some(from), Some(to)) = (from, to) {
            if from != to && !self.dag.contains_edge(from, to) {
                self.dag.add_edge(from, to, ());
            }
        }
    }

    fn link_replacements(&mut self) {
        let pairs: Vec<_> = self
            .index
            .keys()
            .filter(|step| step.op == StepOp::Delete)
            .map(|step| (self.find(&step.node, StepOp::Delete), self.find(&step.node, StepOp::Create)))
            .collect();
        for (delete, create) in pairs {
            self.link(delete, create);
        }
    }

    /// Children are torn down before their parent and built (created or
    /// modified) after it.
    fn link_hierarchy(&mut self, graph: &IngressGraph) {
        let Some(lb) = &graph.load_balancer else {
            return;
        };
        let lb_ref = NodeRef::of(&lb.node);
        for listener in &lb.listeners {
            let listener_ref = NodeRef::of(&listener.node);
            self.link(
                self.find(&listener_ref, StepOp::Delete),
                self.find(&lb_ref, StepOp::Delete),
            );
            self.link(self.build_step(&lb_ref), self.build_step(&listener_ref));

            for rule in &listener.rules {
                let rule_ref = NodeRef::of(rule);
                let parent_delete = self
                    .find(&listener_ref, StepOp::Delete)
                    .or_else(|| self.find(&lb_ref, StepOp::Delete));
                self.link(self.find(&rule_ref, StepOp::Delete), parent_delete);
                let parent_build = self
                    .build_step(&listener_ref)
                    .or_else(|| self.build_step(&lb_ref));
                self.link(parent_build, self.build_step(&rule_ref));
            }
        }
    }

    /// A target group is created before anything forwarding to it and
    /// deleted after everything that forwarded to it has moved away.
    fn link_target_groups(&mut self, graph: &IngressGraph) {
        for (name, tg) in &graph.target_groups {
            let tg_ref = NodeRef::of(&tg.node);
            let binding_ref = NodeRef::of(&tg.targets);
            let tg_delete = self.find(&tg_ref, StepOp::Delete);
            let tg_create = self.find(&tg_ref, StepOp::Create);

            self.link(self.find(&binding_ref, StepOp::Delete), tg_delete);
            self.link(tg_create, self.build_step(&binding_ref));

            for reference in graph.references_to(name) {
                if reference.current {
                    let moves_away = self
                        .find(&reference.from, StepOp::Delete)
                        .or_else(|| self.find(&reference.from, StepOp::Modify));
                    self.link(moves_away, tg_delete);
                }
                if reference.desired {
                    self.link(tg_create, self.build_step(&reference.from));
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// All steps, in insertion order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.dag.node_weights()
    }

    /// Whether `before` must finish before `after` may start.
    #[must_use]
    pub fn precedes(&self, before: &Step, after: &Step) -> bool {
        match (self.index.get(before), self.index.get(after)) {
            (Some(&from), Some(&to)) => petgraph::algo::has_path_connecting(&self.dag, from, to, None),
            _ => false,
        }
    }

    /// Steps in a valid execution order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DependencyBlocked`] if the steps form a cycle.
    pub fn ordered_steps(&self) -> Result<Vec<Step>> {
        toposort(&self.dag, None)
            .map(|order| order.into_iter().filter_map(|i| self.dag.node_weight(i).cloned()).collect())
            .map_err(|cycle| {
                let at = self.dag.node_weight(cycle.node_id());
                Error::dependency_blocked(
                    at.map_or(ResourceKind::LoadBalancer, |s| s.node.kind),
                    at.map_or_else(String::new, |s| s.node.id.clone()),
                    "a dependency cycle",
                )
            })
    }

    pub(crate) fn dag(&self) -> &DiGraph<Step, ()> {
        &self.dag
    }

    /// Number of unfinished prerequisites of every step.
    pub(crate) fn in_degrees(&self) -> HashMap<NodeIndex, usize> {
        self.dag
            .node_indices()
            .map(|i| (i, self.dag.neighbors_directed(i, Direction::Incoming).count()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use alb_core::TagSet;

    use super::*;
    use crate::graph::{IngressKey, ListenerNode, LoadBalancerNode, TargetGroupNode};
    use crate::node::{Node, NodeMut, ReplaceReason};
    use crate::types::{
        FieldDiff, ListenerSpec, LoadBalancerSpec, Protocol, RuleCondition, RuleSpec, TargetGroupSpec,
        TargetSet,
    };

    fn listener_spec(tg: &str) -> ListenerSpec {
        ListenerSpec {
            port: 80,
            protocol: Protocol::Http,
            certificate_arn: None,
            ssl_policy: None,
            default_target_group: tg.into(),
        }
    }

    fn tg_spec(name: &str) -> TargetGroupSpec {
        TargetGroupSpec {
            name: name.into(),
            port: 80,
            protocol: Protocol::Http,
            target_type: Default::default(),
            health_check: Default::default(),
        }
    }

    fn desired_graph() -> IngressGraph {
        let mut lb = LoadBalancerNode::new(Node::desired("lb", LoadBalancerSpec::named("lb"), TagSet::new()));
        let mut listener = ListenerNode::new(Node::desired("lb-l80", listener_spec("tg"), TagSet::new()));
        listener.rules.push(Node::desired(
            "lb-l80-r1",
            RuleSpec {
                priority: 1,
                conditions: vec![RuleCondition::path("/")],
                target_group: "tg".into(),
            },
            TagSet::new(),
        ));
        lb.listeners.push(listener);
        let mut graph = IngressGraph::empty(IngressKey::new("ns", "web"));
        graph.load_balancer = Some(lb);
        graph.target_groups.insert(
            "tg".into(),
            TargetGroupNode {
                node: Node::desired("tg", tg_spec("tg"), TagSet::new()),
                targets: Node::desired("tg-targets", TargetSet::default(), TagSet::new()),
            },
        );
        graph
    }

    fn step(kind: ResourceKind, id: &str, op: StepOp) -> Step {
        Step::new(NodeRef::new(kind, id), op)
    }

    fn position(order: &[Step], wanted: &Step) -> usize {
        order.iter().position(|s| s == wanted).unwrap()
    }

    #[test]
    fn test_creation_runs_top_down() {
        let plan = Plan::build(&desired_graph());
        assert_eq!(plan.len(), 5);

        let order = plan.ordered_steps().unwrap();
        let lb = position(&order, &step(ResourceKind::LoadBalancer, "lb", StepOp::Create));
        let tg = position(&order, &step(ResourceKind::TargetGroup, "tg", StepOp::Create));
        let listener = position(&order, &step(ResourceKind::Listener, "lb-l80", StepOp::Create));
        let rule = position(&order, &step(ResourceKind::Rule, "lb-l80-r1", StepOp::Create));
        let binding = position(&order, &step(ResourceKind::TargetGroupBinding, "tg-targets", StepOp::Create));
        assert!(lb < listener && listener < rule);
        assert!(tg < listener && tg < rule && tg < binding);
    }

    #[test]
    fn test_deletion_runs_bottom_up() {
        let mut graph = desired_graph();
        graph.visit_mut(&mut |node| {
            node.mark_created(format!("arn:{}", node.id()));
            node.set_verdict(Verdict::Delete);
        });
        let plan = Plan::build(&graph);

        let rule = step(ResourceKind::Rule, "lb-l80-r1", StepOp::Delete);
        let listener = step(ResourceKind::Listener, "lb-l80", StepOp::Delete);
        let lb = step(ResourceKind::LoadBalancer, "lb", StepOp::Delete);
        let tg = step(ResourceKind::TargetGroup, "tg", StepOp::Delete);
        let binding = step(ResourceKind::TargetGroupBinding, "tg-targets", StepOp::Delete);
        assert!(plan.precedes(&rule, &listener));
        assert!(plan.precedes(&listener, &lb));
        assert!(plan.precedes(&rule, &tg));
        assert!(plan.precedes(&listener, &tg));
        assert!(plan.precedes(&binding, &tg));
        assert!(!plan.precedes(&lb, &tg));
    }

    #[test]
    fn test_replacement_deletes_before_creating() {
        let mut graph = desired_graph();
        graph.visit_mut(&mut |node| node.mark_created(format!("arn:{}", node.id())));
        graph.reconcile_nodes();
        if let Some(tg) = graph.target_groups.get_mut("tg") {
            tg.node.verdict = Verdict::Replace {
                reason: ReplaceReason::ImmutableFields { fields: vec!["port"] },
            };
        }
        if let Some(lb) = graph.load_balancer.as_mut() {
            for listener in &mut lb.listeners {
                listener.node.verdict = Verdict::Replace {
                    reason: ReplaceReason::TargetGroupReplaced { target_group: "tg".into() },
                };
            }
        }
        let plan = Plan::build(&graph);

        let listener_delete = step(ResourceKind::Listener, "lb-l80", StepOp::Delete);
        let listener_create = step(ResourceKind::Listener, "lb-l80", StepOp::Create);
        let tg_delete = step(ResourceKind::TargetGroup, "tg", StepOp::Delete);
        let tg_create = step(ResourceKind::TargetGroup, "tg", StepOp::Create);
        assert!(plan.precedes(&listener_delete, &tg_delete));
        assert!(plan.precedes(&tg_delete, &tg_create));
        assert!(plan.precedes(&tg_create, &listener_create));
        assert!(plan.ordered_steps().is_ok());
    }

    #[test]
    fn test_parent_modify_precedes_child_modify() {
        let mut graph = desired_graph();
        graph.visit_mut(&mut |node| {
            node.mark_created(format!("arn:{}", node.id()));
            node.set_verdict(Verdict::NoOp);
        });
        if let Some(lb) = graph.load_balancer.as_mut() {
            lb.node.verdict = Verdict::Modify { diff: FieldDiff::new() };
            for rule in lb.listeners.iter_mut().flat_map(|l| l.rules.iter_mut()) {
                rule.verdict = Verdict::Modify { diff: FieldDiff::new() };
            }
        }
        let plan = Plan::build(&graph);

        assert_eq!(plan.len(), 2);
        assert!(plan.precedes(
            &step(ResourceKind::LoadBalancer, "lb", StepOp::Modify),
            &step(ResourceKind::Rule, "lb-l80-r1", StepOp::Modify),
        ));
    }

    #[test]
    fn test_noop_and_blocked_produce_no_steps() {
        assert!(steps_for(&Verdict::NoOp).is_empty());
        assert!(steps_for(&Verdict::Blocked { blocked_by: "x".into() }).is_empty());
        assert_eq!(
            steps_for(&Verdict::Replace {
                reason: ReplaceReason::ParentReplaced { parent: "lb".into() }
            }),
            &[StepOp::Delete, StepOp::Create]
        );
    }
}
