//! Diff engine.
//!
//! Merges a desired and a current graph of the same ingress into one graph
//! whose nodes carry both sides, then assigns every node a [`Verdict`]:
//!
//! 1. each node is judged on its own two sides;
//! 2. replacements cascade: a replaced target group replaces its binding
//!    and every listener or rule forwarding to it, a replaced load balancer
//!    replaces its listeners, a replaced listener replaces its rules;
//! 3. deletions of target groups that a desired listener or rule still
//!    forwards to become [`Verdict::Blocked`].

use std::collections::BTreeSet;

use tracing::debug;

use crate::graph::{IngressGraph, ListenerNode, TargetGroupNode};
use crate::node::{Node, ReplaceReason, Verdict};
use crate::types::Resource;

/// Merge `desired` and `current` and compute every node's verdict.
///
/// The load balancer is matched by owning ingress; its children and the
/// target groups are matched by ID.
#[must_use]
pub fn diff(desired: IngressGraph, current: IngressGraph) -> IngressGraph {
    let mut graph = merge(desired, current);
    graph.reconcile_nodes();
    cascade_replacements(&mut graph);
    block_referenced_deletions(&mut graph);

    debug!(
        ingress = %graph.ingress,
        nodes = graph.node_count(),
        converged = graph.is_converged(),
        "computed diff"
    );
    graph
}

/// Recompute every verdict of an already merged graph, e.g. after a
/// convergence pass has rolled its current sides forward.
pub fn rediff(graph: &mut IngressGraph) {
    graph.reconcile_nodes();
    cascade_replacements(graph);
    block_referenced_deletions(graph);
}

fn merge(desired: IngressGraph, current: IngressGraph) -> IngressGraph {
    let mut graph = desired;
    graph.orphaned = current.orphaned;

    graph.load_balancer = match (graph.load_balancer.take(), current.load_balancer) {
        (Some(mut lb), Some(existing)) => {
            lb.node.absorb(existing.node);
            merge_listeners(&mut lb.listeners, existing.listeners);
            Some(lb)
        }
        (lb, existing) => lb.or(existing),
    };

    for (name, existing) in current.target_groups {
        match graph.target_groups.get_mut(&name) {
            Some(TargetGroupNode { node, targets }) => {
                node.absorb(existing.node);
                targets.absorb(existing.targets);
            }
            None => {
                graph.target_groups.insert(name, existing);
            }
        }
    }

    graph.sort();
    graph
}

fn merge_listeners(desired: &mut Vec<ListenerNode>, current: Vec<ListenerNode>) {
    for listener in current {
        match desired.iter_mut().find(|d| d.node.id() == listener.node.id()) {
            Some(matched) => {
                matched.node.absorb(listener.node);
                merge_nodes(&mut matched.rules, listener.rules);
            }
            None => desired.push(listener),
        }
    }
}

fn merge_nodes<T: Resource>(desired: &mut Vec<Node<T>>, current: Vec<Node<T>>) {
    for node in current {
        match desired.iter_mut().find(|d| d.id() == node.id()) {
            Some(matched) => matched.absorb(node),
            None => desired.push(node),
        }
    }
}

/// Propagate replacements to the nodes whose handles or references they
/// invalidate. Only nodes present on both sides change verdict; one-sided
/// nodes are already created or deleted.
pub fn cascade_replacements(graph: &mut IngressGraph) {
    let replaced_target_groups: BTreeSet<String> = graph
        .target_groups
        .iter_mut()
        .filter(|(_, tg)| matches!(tg.node.verdict, Verdict::Replace { .. }))
        .map(|(name, tg)| {
            tg.targets.force_replace(ReplaceReason::ParentReplaced { parent: name.clone() });
            name.clone()
        })
        .collect();

    let Some(lb) = graph.load_balancer.as_mut() else {
        return;
    };

    let lb_replaced = matches!(lb.node.verdict, Verdict::Replace { .. });
    for listener in &mut lb.listeners {
        if lb_replaced {
            listener.node.force_replace(ReplaceReason::ParentReplaced {
                parent: lb.node.id().to_owned(),
            });
        }
        if let Some(target_group) = forwarded_to(&listener.node, &replaced_target_groups, |s| {
            &s.default_target_group
        }) {
            listener
                .node
                .force_replace(ReplaceReason::TargetGroupReplaced { target_group });
        }

        let listener_replaced = matches!(listener.node.verdict, Verdict::Replace { .. });
        for rule in &mut listener.rules {
            if listener_replaced {
                rule.force_replace(ReplaceReason::ParentReplaced {
                    parent: listener.node.id().to_owned(),
                });
            }
            if let Some(target_group) =
                forwarded_to(rule, &replaced_target_groups, |s| &s.target_group)
            {
                rule.force_replace(ReplaceReason::TargetGroupReplaced { target_group });
            }
        }
    }
}

/// The first target group in `replaced` that either side of `node` forwards to.
fn forwarded_to<T: Resource>(
    node: &Node<T>,
    replaced: &BTreeSet<String>,
    target_group: impl Fn(&T) -> &String,
) -> Option<String> {
    node.desired
        .iter()
        .chain(node.current.iter())
        .map(target_group)
        .find(|name| replaced.contains(*name))
        .cloned()
}

/// Turn deletions of target groups still referenced by a desired listener or
/// rule into [`Verdict::Blocked`], together with their bindings.
pub fn block_referenced_deletions(graph: &mut IngressGraph) {
    let blocked: Vec<(String, String)> = graph
        .target_groups
        .iter()
        .filter(|(_, tg)| tg.node.verdict == Verdict::Delete)
        .filter_map(|(name, _)| {
            graph
                .references_to(name)
                .into_iter()
                .find(|r| r.desired)
                .map(|r| (name.clone(), r.from.to_string()))
        })
        .collect();

    for (name, blocked_by) in blocked {
        debug!(target_group = %name, %blocked_by, "target group deletion blocked");
        if let Some(tg) = graph.target_groups.get_mut(&name) {
            tg.node.verdict = Verdict::Blocked { blocked_by };
            if tg.targets.verdict == Verdict::Delete {
                tg.targets.verdict = Verdict::Blocked {
                    blocked_by: tg.node.id().to_owned(),
                };
            }
        }
    }
}
