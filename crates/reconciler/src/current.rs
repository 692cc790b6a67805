//! Current-graph builder.
//!
//! Groups a provider listing into one graph per owning ingress, using the
//! ownership tags on load balancers and target groups. Listeners and rules
//! carry no tags and are attached through their parent handle. Provider
//! handles in references are translated back to target group names so the
//! current graph compares directly against a desired graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use alb_core::naming::{binding_id, listener_id, rule_id};
use alb_core::tags::{CLUSTER_TAG, INGRESS_NAME_TAG, NAMESPACE_TAG};
use alb_core::{ResourceKind, TagSet};
use tracing::{debug, warn};

use crate::graph::{IngressGraph, IngressKey, ListenerNode, LoadBalancerNode, TargetGroupNode};
use crate::node::Node;
use crate::provider::ProviderSnapshot;
use crate::types::TargetSet;

/// A listed resource the builder could not attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub kind: ResourceKind,
    pub handle: String,
    pub reason: &'static str,
}

/// Result of [`build_current_graphs`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentGraphs {
    pub graphs: BTreeMap<IngressKey, IngressGraph>,
    pub skipped: Vec<Skipped>,
}

impl CurrentGraphs {
    /// Remove and return the graph of `key`, or an empty one.
    pub fn take(&mut self, key: &IngressKey) -> IngressGraph {
        self.graphs
            .remove(key)
            .unwrap_or_else(|| IngressGraph::empty(key.clone()))
    }
}

/// Owning ingress of a tagged resource in `cluster`.
fn owner(tags: &TagSet, cluster: &str) -> Result<IngressKey, &'static str> {
    if tags.get(CLUSTER_TAG).is_some_and(|owner| owner != cluster) {
        return Err("owned by another cluster");
    }
    match (tags.get(NAMESPACE_TAG), tags.get(INGRESS_NAME_TAG)) {
        (Some(namespace), Some(name)) => Ok(IngressKey::new(namespace, name)),
        _ => Err("missing ownership tags"),
    }
}

/// Build one current graph per ingress owning resources in `snapshot`.
///
/// When `live` is given, graphs of ingresses not in it are marked orphaned.
#[must_use]
pub fn build_current_graphs(
    snapshot: &ProviderSnapshot,
    cluster: &str,
    live: Option<&BTreeSet<IngressKey>>,
) -> CurrentGraphs {
    let mut out = CurrentGraphs::default();
    let mut skip = |kind: ResourceKind, handle: &str, reason: &'static str| {
        warn!(%kind, %handle, reason, "skipping listed resource");
        out.skipped.push(Skipped {
            kind,
            handle: handle.to_owned(),
            reason,
        });
    };

    let mut graphs: BTreeMap<IngressKey, IngressGraph> = BTreeMap::new();
    let mut tg_names: HashMap<&str, &str> = HashMap::new();

    for record in &snapshot.target_groups {
        let key = match owner(&record.tags, cluster) {
            Ok(key) => key,
            Err(reason) => {
                skip(ResourceKind::TargetGroup, &record.handle, reason);
                continue;
            }
        };
        let name = record.spec.name.clone();
        tg_names.insert(&record.handle, &record.spec.name);
        let node = TargetGroupNode {
            node: Node::current(&name, record.spec.clone(), record.handle.clone(), record.tags.clone()),
            targets: Node::current(
                binding_id(&name),
                TargetSet::new(record.targets.clone()),
                record.handle.clone(),
                TagSet::new(),
            ),
        };
        graphs
            .entry(key.clone())
            .or_insert_with(|| IngressGraph::empty(key))
            .target_groups
            .insert(name, node);
    }

    // Handle of each attributed load balancer to its owner.
    let mut lb_owners: HashMap<&str, IngressKey> = HashMap::new();
    for record in &snapshot.load_balancers {
        let key = match owner(&record.tags, cluster) {
            Ok(key) => key,
            Err(reason) => {
                skip(ResourceKind::LoadBalancer, &record.handle, reason);
                continue;
            }
        };
        let graph = graphs
            .entry(key.clone())
            .or_insert_with(|| IngressGraph::empty(key.clone()));
        if graph.load_balancer.is_some() {
            skip(ResourceKind::LoadBalancer, &record.handle, "ingress already owns a load balancer");
            continue;
        }
        graph.load_balancer = Some(LoadBalancerNode::new(Node::current(
            &record.spec.name,
            record.spec.clone(),
            record.handle.clone(),
            record.tags.clone(),
        )));
        lb_owners.insert(&record.handle, key);
    }

    // Listener handle to (owner, listener id).
    let mut listener_owners: HashMap<&str, (IngressKey, String)> = HashMap::new();
    for record in &snapshot.listeners {
        let Some(key) = lb_owners.get(record.load_balancer.as_str()) else {
            skip(ResourceKind::Listener, &record.handle, "unknown load balancer");
            continue;
        };
        let Some(&target_group) = tg_names.get(record.spec.default_target_group.as_str()) else {
            skip(ResourceKind::Listener, &record.handle, "unknown default target group");
            continue;
        };
        let Some(lb) = graphs.get_mut(key).and_then(|g| g.load_balancer.as_mut()) else {
            continue;
        };
        let id = listener_id(lb.node.id(), record.spec.port);
        let mut spec = record.spec.clone();
        spec.default_target_group = target_group.to_owned();
        lb.listeners.push(ListenerNode::new(Node::current(
            &id,
            spec,
            record.handle.clone(),
            TagSet::new(),
        )));
        listener_owners.insert(&record.handle, (key.clone(), id));
    }

    for record in &snapshot.rules {
        let Some((key, listener)) = listener_owners.get(record.listener.as_str()) else {
            skip(ResourceKind::Rule, &record.handle, "unknown listener");
            continue;
        };
        let Some(&target_group) = tg_names.get(record.spec.target_group.as_str()) else {
            skip(ResourceKind::Rule, &record.handle, "unknown target group");
            continue;
        };
        let Some(node) = graphs
            .get_mut(key)
            .and_then(|g| g.load_balancer.as_mut())
            .and_then(|lb| lb.listeners.iter_mut().find(|l| l.node.id() == listener.as_str()))
        else {
            continue;
        };
        let mut spec = record.spec.clone();
        spec.target_group = target_group.to_owned();
        node.rules.push(Node::current(
            rule_id(listener, spec.priority),
            spec,
            record.handle.clone(),
            TagSet::new(),
        ));
    }

    for graph in graphs.values_mut() {
        graph.sort();
        graph.orphaned = live.is_some_and(|live| !live.contains(&graph.ingress));
    }

    debug!(
        ingresses = graphs.len(),
        skipped = out.skipped.len(),
        "built current graphs"
    );
    out.graphs = graphs;
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::provider::{ListenerRecord, LoadBalancerRecord, RuleRecord, TargetGroupRecord};
    use crate::types::{ListenerSpec, LoadBalancerSpec, Protocol, RuleCondition, RuleSpec, Target, TargetGroupSpec};

    fn owned(namespace: &str, name: &str) -> TagSet {
        [
            (INGRESS_NAME_TAG, name),
            (NAMESPACE_TAG, namespace),
            (CLUSTER_TAG, "cluster1"),
        ]
        .into_iter()
        .collect()
    }

    fn snapshot() -> ProviderSnapshot {
        ProviderSnapshot {
            load_balancers: vec![LoadBalancerRecord {
                handle: "arn:lb".into(),
                spec: LoadBalancerSpec::named("lb"),
                tags: owned("ns", "web"),
            }],
            listeners: vec![ListenerRecord {
                handle: "arn:listener".into(),
                load_balancer: "arn:lb".into(),
                spec: ListenerSpec {
                    port: 80,
                    protocol: Protocol::Http,
                    certificate_arn: None,
                    ssl_policy: None,
                    default_target_group: "arn:tg".into(),
                },
            }],
            rules: vec![RuleRecord {
                handle: "arn:rule".into(),
                listener: "arn:listener".into(),
                spec: RuleSpec {
                    priority: 1,
                    conditions: vec![RuleCondition::path("/")],
                    target_group: "arn:tg".into(),
                },
            }],
            target_groups: vec![TargetGroupRecord {
                handle: "arn:tg".into(),
                spec: TargetGroupSpec {
                    name: "tg".into(),
                    port: 80,
                    protocol: Protocol::Http,
                    target_type: Default::default(),
                    health_check: Default::default(),
                },
                tags: owned("ns", "web"),
                targets: vec![Target::new("i-1", 80)],
            }],
        }
    }

    #[test]
    fn test_groups_by_owner_and_translates_handles() {
        let out = build_current_graphs(&snapshot(), "cluster1", None);
        assert!(out.skipped.is_empty());

        let graph = out.graphs.get(&IngressKey::new("ns", "web")).unwrap();
        let (listener, rule) = graph.rule("lb-l80-r1").unwrap();
        assert_eq!(listener.node.id(), "lb-l80");
        assert_eq!(listener.node.current.as_ref().unwrap().default_target_group, "tg");
        assert_eq!(rule.current.as_ref().unwrap().target_group, "tg");
        assert_eq!(rule.handle.as_deref(), Some("arn:rule"));

        let tg = graph.target_group("tg").unwrap();
        assert_eq!(tg.targets.handle.as_deref(), Some("arn:tg"));
        assert_eq!(tg.targets.current.as_ref().unwrap().targets.len(), 1);
        assert!(!graph.orphaned);
    }

    #[test]
    fn test_untagged_and_foreign_resources_are_skipped() {
        let mut snapshot = snapshot();
        snapshot.load_balancers.push(LoadBalancerRecord {
            handle: "arn:untagged".into(),
            spec: LoadBalancerSpec::named("untagged"),
            tags: TagSet::new(),
        });
        let mut foreign = owned("ns", "other");
        foreign.insert(CLUSTER_TAG, "cluster2");
        snapshot.load_balancers.push(LoadBalancerRecord {
            handle: "arn:foreign".into(),
            spec: LoadBalancerSpec::named("foreign"),
            tags: foreign,
        });

        let out = build_current_graphs(&snapshot, "cluster1", None);
        assert_eq!(out.graphs.len(), 1);
        assert_eq!(out.skipped.len(), 2);
        assert!(out.skipped.iter().all(|s| s.kind == ResourceKind::LoadBalancer));
    }

    #[test]
    fn test_children_of_unknown_parents_are_skipped() {
        let mut snapshot = snapshot();
        snapshot.load_balancers.clear();
        let out = build_current_graphs(&snapshot, "cluster1", None);

        let kinds: Vec<_> = out.skipped.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![ResourceKind::Listener, ResourceKind::Rule]);
        // The target group is still attributed.
        assert!(out.graphs.get(&IngressKey::new("ns", "web")).unwrap().target_group("tg").is_some());
    }

    #[test]
    fn test_missing_ingress_is_orphaned() {
        let live = BTreeSet::from([IngressKey::new("ns", "api")]);
        let mut out = build_current_graphs(&snapshot(), "cluster1", Some(&live));
        let graph = out.take(&IngressKey::new("ns", "web"));
        assert!(graph.orphaned);
        assert!(out.take(&IngressKey::new("ns", "api")).is_empty());
    }
}
