//! The generic resource node.
//!
//! A node pairs the desired and current value of one resource. Exactly one
//! side may be missing: desired only means "create", current only means
//! "delete", both means "exists, maybe modify". Both missing is garbage left
//! behind after a confirmed deletion and is pruned from the graph.

use alb_core::{Error, ResourceKind, TagSet};
use serde::Serialize;

use crate::types::{FieldDiff, Resource};

/// Opaque cloud-assigned identifier of a created resource.
pub type Handle = String;

/// Why a node must be deleted and recreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum ReplaceReason {
    /// Fields the provider cannot modify in place differ.
    ImmutableFields { fields: Vec<&'static str> },
    /// An ancestor is being replaced, so this node's parent handle changes.
    ParentReplaced { parent: String },
    /// A target group this node forwards to is being replaced.
    TargetGroupReplaced { target_group: String },
}

/// The action computed for a node by the diff engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Verdict {
    #[default]
    NoOp,
    Create,
    Delete,
    Modify { diff: FieldDiff },
    /// Delete then create.
    Replace { reason: ReplaceReason },
    /// A deletion that must wait for references to go away.
    Blocked { blocked_by: String },
}

impl Verdict {
    /// Whether the verdict removes the current resource.
    #[must_use]
    pub const fn tears_down(&self) -> bool {
        matches!(self, Self::Delete | Self::Replace { .. })
    }

    /// Whether the verdict leaves the desired resource in place.
    #[must_use]
    pub const fn builds(&self) -> bool {
        matches!(self, Self::Create | Self::Modify { .. } | Self::Replace { .. })
    }

    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Modify { .. } => "modify",
            Self::Replace { .. } => "replace",
            Self::Blocked { .. } => "blocked",
        }
    }
}

/// Convergence state of a node within one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeState {
    #[default]
    Pending,
    InProgress,
    Applied,
    Failed(Error),
}

impl NodeState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed(_))
    }
}

/// One resource in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<T: Resource> {
    id: String,
    pub desired: Option<T>,
    pub current: Option<T>,
    pub handle: Option<Handle>,
    pub desired_tags: TagSet,
    pub current_tags: TagSet,
    pub verdict: Verdict,
    pub state: NodeState,
}

impl<T: Resource> Node<T> {
    /// A node discovered by the desired-graph builder.
    pub fn desired(id: impl Into<String>, value: T, tags: TagSet) -> Self {
        Self {
            id: id.into(),
            desired: Some(value),
            current: None,
            handle: None,
            desired_tags: tags,
            current_tags: TagSet::new(),
            verdict: Verdict::Create,
            state: NodeState::Pending,
        }
    }

    /// A node discovered in a provider listing.
    pub fn current(id: impl Into<String>, value: T, handle: Handle, tags: TagSet) -> Self {
        Self {
            id: id.into(),
            desired: None,
            current: Some(value),
            handle: Some(handle),
            desired_tags: TagSet::new(),
            current_tags: tags,
            verdict: Verdict::Delete,
            state: NodeState::Pending,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        T::KIND
    }

    #[must_use]
    pub const fn needs_creation(&self) -> bool {
        self.desired.is_some() && self.current.is_none()
    }

    #[must_use]
    pub const fn needs_deletion(&self) -> bool {
        self.desired.is_none() && self.current.is_some()
    }

    #[must_use]
    pub fn needs_modification(&self) -> bool {
        self.field_diff().is_some_and(|diff| !diff.is_empty())
    }

    /// Both sides are gone.
    #[must_use]
    pub const fn is_garbage(&self) -> bool {
        self.desired.is_none() && self.current.is_none()
    }

    /// Field differences when both sides exist. Tags are compared as a set.
    #[must_use]
    pub fn field_diff(&self) -> Option<FieldDiff> {
        let (desired, current) = (self.desired.as_ref()?, self.current.as_ref()?);
        let diff = T::diff(desired, current);
        Some(if self.desired_tags == self.current_tags {
            diff
        } else {
            diff.changed("tags")
        })
    }

    /// Compute and store this node's verdict from its own two sides.
    pub fn reconcile(&mut self) -> &Verdict {
        self.verdict = match (self.desired.is_some(), self.current.is_some()) {
            (true, false) => Verdict::Create,
            (false, true) => Verdict::Delete,
            (false, false) => Verdict::NoOp,
            (true, true) => match self.field_diff() {
                Some(diff) if diff.requires_replacement() => Verdict::Replace {
                    reason: ReplaceReason::ImmutableFields {
                        fields: diff.immutable_fields(),
                    },
                },
                Some(diff) if !diff.is_empty() => Verdict::Modify { diff },
                _ => Verdict::NoOp,
            },
        };
        &self.verdict
    }

    /// Take the current half of `other`, which has the same identity.
    pub fn absorb(&mut self, other: Self) {
        self.current = other.current;
        self.handle = other.handle;
        self.current_tags = other.current_tags;
    }

    /// Force the delete-then-create sequence, unless the node only exists on
    /// one side, in which case its own create or delete already suffices.
    pub fn force_replace(&mut self, reason: ReplaceReason) {
        if self.desired.is_some() && self.current.is_some() {
            self.verdict = Verdict::Replace { reason };
        }
    }

    /// Roll the current half forward after a successful create.
    pub fn mark_created(&mut self, handle: Handle) {
        self.current.clone_from(&self.desired);
        self.current_tags.clone_from(&self.desired_tags);
        self.handle = Some(handle);
    }

    /// Roll the current half forward after a successful modify.
    pub fn mark_modified(&mut self) {
        self.current.clone_from(&self.desired);
        self.current_tags.clone_from(&self.desired_tags);
    }

    /// Clear the current half after a confirmed delete.
    pub fn mark_deleted(&mut self) {
        self.current = None;
        self.handle = None;
        self.current_tags = TagSet::new();
    }
}

/// Type-erased view of a node, for reporting and state bookkeeping.
pub trait NodeView {
    fn kind(&self) -> ResourceKind;
    fn id(&self) -> &str;
    fn verdict(&self) -> &Verdict;
    fn state(&self) -> &NodeState;
    fn handle(&self) -> Option<&str>;
    fn current_json(&self) -> Option<serde_json::Value>;
}

impl<T: Resource> NodeView for Node<T> {
    fn kind(&self) -> ResourceKind {
        T::KIND
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    fn state(&self) -> &NodeState {
        &self.state
    }

    fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    fn current_json(&self) -> Option<serde_json::Value> {
        self.current
            .as_ref()
            .and_then(|value| serde_json::to_value(value).ok())
    }
}

/// Mutable type-erased access used by the converger to record outcomes.
pub trait NodeMut: NodeView {
    fn set_state(&mut self, state: NodeState);
    fn set_verdict(&mut self, verdict: Verdict);
    fn mark_created(&mut self, handle: Handle);
    fn mark_modified(&mut self);
    fn mark_deleted(&mut self);
    fn reconcile(&mut self);
}

impl<T: Resource> NodeMut for Node<T> {
    fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    fn set_verdict(&mut self, verdict: Verdict) {
        self.verdict = verdict;
    }

    fn mark_created(&mut self, handle: Handle) {
        Self::mark_created(self, handle);
    }

    fn mark_modified(&mut self) {
        Self::mark_modified(self);
    }

    fn mark_deleted(&mut self) {
        Self::mark_deleted(self);
    }

    fn reconcile(&mut self) {
        Self::reconcile(self);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;
    use crate::types::{LoadBalancerSpec, Scheme};

    fn spec(security_groups: &[&str]) -> LoadBalancerSpec {
        LoadBalancerSpec {
            security_groups: security_groups.iter().map(ToString::to_string).collect(),
            ..LoadBalancerSpec::named("lb")
        }
    }

    fn merged(desired: LoadBalancerSpec, current: LoadBalancerSpec) -> Node<LoadBalancerSpec> {
        let mut node = Node::desired("lb", desired, TagSet::new());
        node.absorb(Node::current("lb", current, "arn:lb".into(), TagSet::new()));
        node
    }

    #[test]
    fn test_desired_only_needs_creation() {
        let mut node = Node::desired("lb", spec(&[]), TagSet::new());
        assert!(node.needs_creation());
        assert!(!node.needs_deletion());
        assert_eq!(node.reconcile(), &Verdict::Create);
    }

    #[test]
    fn test_current_only_needs_deletion() {
        let mut node = Node::current("lb", spec(&[]), "arn:lb".into(), TagSet::new());
        assert!(node.needs_deletion());
        assert_eq!(node.reconcile(), &Verdict::Delete);
    }

    #[test]
    fn test_reordered_security_groups_are_noop() {
        let mut node = merged(spec(&["sg-123", "sg-abc"]), spec(&["sg-abc", "sg-123"]));
        assert!(!node.needs_modification());
        assert_eq!(node.reconcile(), &Verdict::NoOp);
    }

    #[test]
    fn test_added_security_group_is_modify() {
        let mut node = merged(spec(&["sg-123"]), spec(&["sg-123", "sg-abc"]));
        assert!(node.needs_modification());
        assert!(matches!(node.reconcile(), Verdict::Modify { .. }));
    }

    #[test]
    fn test_tag_change_is_modify() {
        let mut node = merged(spec(&[]), spec(&[]));
        node.desired_tags.insert("team", "payments");
        let verdict = node.reconcile().clone();
        let Verdict::Modify { diff } = verdict else {
            panic!("expected modify, got {verdict:?}");
        };
        assert!(diff.contains("tags"));
    }

    #[test]
    fn test_scheme_change_is_replace() {
        let desired = LoadBalancerSpec {
            scheme: Scheme::InternetFacing,
            ..spec(&[])
        };
        let mut node = merged(desired, spec(&[]));
        assert_eq!(
            node.reconcile(),
            &Verdict::Replace {
                reason: ReplaceReason::ImmutableFields {
                    fields: vec!["scheme"]
                }
            }
        );
    }

    #[test]
    fn test_mark_created_rolls_current_forward() {
        let mut node = Node::desired("lb", spec(&["sg-1"]), TagSet::new());
        node.mark_created("arn:new".into());
        assert_eq!(node.current, node.desired);
        assert_eq!(node.handle.as_deref(), Some("arn:new"));
        assert_eq!(node.reconcile(), &Verdict::NoOp);
    }

    #[test]
    fn test_force_replace_leaves_one_sided_nodes_alone() {
        let mut node = Node::desired("lb", spec(&[]), TagSet::new());
        node.reconcile();
        node.force_replace(ReplaceReason::ParentReplaced { parent: "x".into() });
        assert_eq!(node.verdict, Verdict::Create);
    }
}
