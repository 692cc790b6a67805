//! Deterministic names for cloud resources.
//!
//! Names are the join key between a desired graph and a provider listing
//! until a cloud handle is known. They must be stable across processes and
//! distinct across ingresses sharing a namespace and cluster, so each name
//! ends in a digest of every input it was derived from.

use sha2::{Digest, Sha256};

/// Provider limit on load balancer and target group names.
pub const MAX_NAME_LEN: usize = 32;

const LB_PREFIX_LEN: usize = 26;
const LB_DIGEST_LEN: usize = 5;
const TG_PREFIX_LEN: usize = 20;
const TG_DIGEST_LEN: usize = 11;

/// Name of the load balancer serving an ingress.
///
/// # Examples
///
/// ```
/// use alb_core::naming::load_balancer_name;
///
/// let name = load_balancer_name("namespace1", "ingress1", "cluster1");
/// assert_eq!(name, load_balancer_name("namespace1", "ingress1", "cluster1"));
/// assert!(name.len() <= 32);
/// assert!(name.starts_with("cluster1-namespace1-ingres"));
/// ```
#[must_use]
pub fn load_balancer_name(namespace: &str, ingress: &str, cluster: &str) -> String {
    let prefix = format!(
        "{}-{}-{}",
        dashed(cluster),
        alphanumeric(namespace),
        alphanumeric(ingress)
    );
    finish(&prefix, LB_PREFIX_LEN, &digest(&[namespace, ingress, cluster]), LB_DIGEST_LEN)
}

/// Name of the target group for one service backend of an ingress.
#[must_use]
pub fn target_group_name(
    namespace: &str,
    ingress: &str,
    cluster: &str,
    service: &str,
    port: u16,
) -> String {
    let port = port.to_string();
    finish(
        &dashed(cluster),
        TG_PREFIX_LEN,
        &digest(&[namespace, ingress, cluster, service, &port]),
        TG_DIGEST_LEN,
    )
}

/// Identity of a listener within its load balancer.
#[must_use]
pub fn listener_id(load_balancer: &str, port: u16) -> String {
    format!("{load_balancer}-l{port}")
}

/// Identity of a rule within its listener.
#[must_use]
pub fn rule_id(listener: &str, priority: u32) -> String {
    format!("{listener}-r{priority}")
}

/// Identity of the target registrations of a target group.
#[must_use]
pub fn binding_id(target_group: &str) -> String {
    format!("{target_group}-targets")
}

fn finish(prefix: &str, prefix_len: usize, digest: &str, digest_len: usize) -> String {
    let prefix: String = prefix.chars().take(prefix_len).collect();
    let prefix = prefix.trim_matches('-');
    let digest: String = digest.chars().take(digest_len).collect();
    if prefix.is_empty() {
        return digest;
    }
    format!("{prefix}-{digest}")
}

/// Hex SHA-256 over length-prefixed parts so `("ab", "c")` and `("a", "bc")`
/// never collide.
fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let len = u64::try_from(part.len()).unwrap_or(u64::MAX);
        hasher.update(len.to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn alphanumeric(value: &str) -> String {
    value.chars().filter(char::is_ascii_alphanumeric).collect()
}

fn dashed(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_balancer_name_is_stable() {
        let first = load_balancer_name("namespace1", "ingress1", "cluster1");
        let second = load_balancer_name("namespace1", "ingress1", "cluster1");
        assert_eq!(first, second);
        assert!(first.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_load_balancer_name_strips_punctuation() {
        let name = load_balancer_name("kube-system", "my.ingress", "prod_east");
        assert!(name.starts_with("prod-east-kubesystem-myin"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn test_names_differ_for_shifted_boundaries() {
        assert_ne!(
            load_balancer_name("ab", "c", "cluster"),
            load_balancer_name("a", "bc", "cluster")
        );
    }

    #[test]
    fn test_target_group_name_depends_on_backend() {
        let a = target_group_name("ns", "ing", "cluster1", "web", 80);
        let b = target_group_name("ns", "ing", "cluster1", "web", 8080);
        let c = target_group_name("ns", "ing", "cluster1", "api", 80);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.len() <= MAX_NAME_LEN);
        assert!(a.starts_with("cluster1-"));
    }

    #[test]
    fn test_long_cluster_name_is_truncated() {
        let cluster = "a-very-long-cluster-name-that-goes-on-and-on";
        let name = load_balancer_name("namespace", "ingress", cluster);
        assert_eq!(name.len(), MAX_NAME_LEN);
        let tg = target_group_name("namespace", "ingress", cluster, "svc", 80);
        assert!(tg.len() <= MAX_NAME_LEN);
        assert!(!tg.contains("--"));
    }

    #[test]
    fn test_names_never_start_or_end_with_dash() {
        let lb = load_balancer_name("ns", "ing", "_prod");
        let tg = target_group_name("ns", "ing", "_prod", "web", 80);
        for name in [&lb, &tg] {
            assert!(!name.starts_with('-'), "{name}");
            assert!(!name.ends_with('-'), "{name}");
        }
        assert!(lb.starts_with("prod-ns-ing-"));

        let bare = target_group_name("ns", "ing", "__", "web", 80);
        assert_eq!(bare.len(), TG_DIGEST_LEN);
    }

    #[test]
    fn test_child_ids() {
        let listener = listener_id("lb", 443);
        assert_eq!(listener, "lb-l443");
        assert_eq!(rule_id(&listener, 2), "lb-l443-r2");
        assert_eq!(binding_id("tg"), "tg-targets");
    }
}
