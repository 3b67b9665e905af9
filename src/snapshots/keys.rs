//! Remote key conventions for backup archives
//!
//! Shared between coordinator and node agents; changing a shape here is a
//! fleet-wide migration.

/// `nightly/<node>/<tenant>/<tenant>_<YYYY-MM-DD>.tar.gz`
pub fn nightly(node_id: &str, tenant_id: &str, date: &str) -> String {
    format!("nightly/{}/{}/{}_{}.tar.gz", node_id, tenant_id, tenant_id, date)
}

/// `on-demand/<tenant>/<snapshotId>[_<name>].tar.gz`
pub fn on_demand(tenant_id: &str, snapshot_id: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("on-demand/{}/{}_{}.tar.gz", tenant_id, snapshot_id, name),
        None => format!("on-demand/{}/{}.tar.gz", tenant_id, snapshot_id),
    }
}

/// `latest/<containerName>/latest.tar.gz`, the rolling hot backup recovery
/// pulls from
pub fn hot_backup(container_name: &str) -> String {
    format!("latest/{}/latest.tar.gz", container_name)
}

/// `pre-restore/<tenant>/<tenant>_pre_restore.tar.gz`
pub fn pre_restore(tenant_id: &str) -> String {
    format!("pre-restore/{}/{}_pre_restore.tar.gz", tenant_id, tenant_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(
            nightly("n1", "t1", "2024-01-15"),
            "nightly/n1/t1/t1_2024-01-15.tar.gz"
        );
        assert_eq!(on_demand("t1", "s9", None), "on-demand/t1/s9.tar.gz");
        assert_eq!(
            on_demand("t1", "s9", Some("pre-upgrade")),
            "on-demand/t1/s9_pre-upgrade.tar.gz"
        );
        assert_eq!(hot_backup("bot-abc"), "latest/bot-abc/latest.tar.gz");
        assert_eq!(
            pre_restore("t1"),
            "pre-restore/t1/t1_pre_restore.tar.gz"
        );
    }
}
