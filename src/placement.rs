//! Placement engine
//!
//! Pure memory bin-packing over candidate nodes. Only `active` nodes are
//! candidates: `returning`, `draining`, and `recovering` nodes keep their
//! spare capacity out of the pool until their episodes finish. Ties break
//! toward the most free memory, then ascending id for determinism.

use crate::registry::Node;

/// Pick the best node for `estimated_mb`, or none
pub fn find_placement(nodes: &[Node], estimated_mb: u64) -> Option<&Node> {
    find_placement_excluding(nodes, estimated_mb, &[])
}

/// Pick the best node, excluding specific node ids (migration excludes the
/// source, recovery excludes the dead node)
pub fn find_placement_excluding<'a>(
    nodes: &'a [Node],
    estimated_mb: u64,
    exclude: &[&str],
) -> Option<&'a Node> {
    nodes
        .iter()
        .filter(|n| n.status.is_placement_candidate())
        .filter(|n| n.free_mb() >= estimated_mb)
        .filter(|n| !exclude.contains(&n.id.as_str()))
        .max_by(|a, b| {
            a.free_mb()
                .cmp(&b.free_mb())
                .then_with(|| b.id.cmp(&a.id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeStatus;

    fn node(id: &str, capacity: u64, used: u64, status: NodeStatus) -> Node {
        Node {
            id: id.to_string(),
            host: format!("{}.local", id),
            capacity_mb: capacity,
            used_mb: used,
            status,
            last_heartbeat_at: None,
            agent_version: "1.0.0".to_string(),
            secret_hash: None,
            registered_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_most_free_wins() {
        let nodes = vec![
            node("n1", 8192, 0, NodeStatus::Active),
            node("n2", 4096, 0, NodeStatus::Active),
        ];
        assert_eq!(find_placement(&nodes, 100).unwrap().id, "n1");
    }

    #[test]
    fn test_saturation_falls_through_then_exhausts() {
        let nodes = vec![
            node("n1", 8192, 8100, NodeStatus::Active),
            node("n2", 4096, 0, NodeStatus::Active),
        ];
        assert_eq!(find_placement(&nodes, 100).unwrap().id, "n2");

        let nodes = vec![
            node("n1", 8192, 8100, NodeStatus::Active),
            node("n2", 4096, 4000, NodeStatus::Active),
        ];
        assert!(find_placement(&nodes, 100).is_none());
    }

    #[test]
    fn test_tie_breaks_by_id_ascending() {
        let nodes = vec![
            node("n2", 4096, 0, NodeStatus::Active),
            node("n1", 4096, 0, NodeStatus::Active),
        ];
        assert_eq!(find_placement(&nodes, 100).unwrap().id, "n1");
    }

    #[test]
    fn test_non_active_nodes_are_never_candidates() {
        for status in [
            NodeStatus::Returning,
            NodeStatus::Draining,
            NodeStatus::Recovering,
            NodeStatus::Unhealthy,
            NodeStatus::Offline,
            NodeStatus::Failed,
        ] {
            let nodes = vec![node("n1", 8192, 0, status)];
            assert!(find_placement(&nodes, 100).is_none(), "{:?}", status);
        }
    }

    #[test]
    fn test_exclusion() {
        let nodes = vec![
            node("n1", 8192, 0, NodeStatus::Active),
            node("n2", 4096, 0, NodeStatus::Active),
        ];
        assert_eq!(
            find_placement_excluding(&nodes, 100, &["n1"]).unwrap().id,
            "n2"
        );
        assert!(find_placement_excluding(&nodes, 100, &["n1", "n2"]).is_none());
    }
}
