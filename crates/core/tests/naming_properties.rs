//! Property-based tests for naming and tag comparison.
//!
//! Properties verified:
//! - Names are pure functions of their inputs
//! - Names stay within the provider length limit and character set
//! - Names never start or end with a dash, whatever the cluster name
//! - Distinct ingresses never share a load balancer name
//! - Tag set equality ignores insertion order

use alb_core::naming::{load_balancer_name, target_group_name, MAX_NAME_LEN};
use alb_core::TagSet;
use proptest::prelude::*;

fn k8s_name() -> impl Strategy<Value = String> {
    "[a-z0-9]([-a-z0-9.]{0,40}[a-z0-9])?"
}

proptest! {
    #[test]
    fn prop_load_balancer_name_is_deterministic(
        namespace in k8s_name(),
        ingress in k8s_name(),
        cluster in k8s_name(),
    ) {
        prop_assert_eq!(
            load_balancer_name(&namespace, &ingress, &cluster),
            load_balancer_name(&namespace, &ingress, &cluster)
        );
    }

    #[test]
    fn prop_names_respect_provider_limits(
        namespace in k8s_name(),
        ingress in k8s_name(),
        cluster in k8s_name(),
        service in k8s_name(),
        port in 1u16..,
    ) {
        for name in [
            load_balancer_name(&namespace, &ingress, &cluster),
            target_group_name(&namespace, &ingress, &cluster, &service, port),
        ] {
            prop_assert!(name.len() <= MAX_NAME_LEN);
            prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
            prop_assert!(!name.starts_with('-'));
        }
    }

    #[test]
    fn prop_names_have_no_edge_dashes(
        namespace in k8s_name(),
        ingress in k8s_name(),
        cluster in "[-_.a-z0-9]{0,24}",
        port in 1u16..,
    ) {
        for name in [
            load_balancer_name(&namespace, &ingress, &cluster),
            target_group_name(&namespace, &ingress, &cluster, "svc", port),
        ] {
            prop_assert!(!name.is_empty());
            prop_assert!(!name.starts_with('-'), "{}", name);
            prop_assert!(!name.ends_with('-'), "{}", name);
        }
    }

    #[test]
    fn prop_distinct_ingresses_get_distinct_names(
        namespace in k8s_name(),
        first in k8s_name(),
        second in k8s_name(),
        cluster in k8s_name(),
    ) {
        prop_assume!(first != second);
        prop_assert_ne!(
            load_balancer_name(&namespace, &first, &cluster),
            load_balancer_name(&namespace, &second, &cluster)
        );
    }

    #[test]
    fn prop_tag_equality_ignores_order(
        pairs in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..8),
    ) {
        let forward: TagSet = pairs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let backward: TagSet = pairs.iter().rev().map(|(k, v)| (k.clone(), v.clone())).collect();
        prop_assert_eq!(forward, backward);
    }
}
