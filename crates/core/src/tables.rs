//! Kind registry: maps a resource kind to the table its records land in.
//!
//! Lookups are case-insensitive and total. Kinds that are not built into
//! Kubernetes (CRDs, aggregated APIs) share [`CUSTOM_RESOURCE_TABLE`].

#![forbid(unsafe_code)]

/// Table for every kind not listed in [`KNOWN_TABLES`].
pub const CUSTOM_RESOURCE_TABLE: &str = "k8s_custom_resources";

/// Built-in kinds (lower-cased) and their tables.
pub const KNOWN_TABLES: &[(&str, &str)] = &[
    // core/v1
    ("pod", "k8s_pods"),
    ("service", "k8s_services"),
    ("configmap", "k8s_config_maps"),
    ("secret", "k8s_secrets"),
    ("namespace", "k8s_namespaces"),
    ("node", "k8s_nodes"),
    ("persistentvolume", "k8s_persistent_volumes"),
    ("persistentvolumeclaim", "k8s_persistent_volume_claims"),
    ("serviceaccount", "k8s_service_accounts"),
    ("endpoints", "k8s_endpoints"),
    ("event", "k8s_events"),
    ("limitrange", "k8s_limit_ranges"),
    ("resourcequota", "k8s_resource_quotas"),
    ("replicationcontroller", "k8s_replication_controllers"),
    // apps/v1
    ("deployment", "k8s_deployments"),
    ("statefulset", "k8s_stateful_sets"),
    ("daemonset", "k8s_daemon_sets"),
    ("replicaset", "k8s_replica_sets"),
    // batch/v1
    ("job", "k8s_jobs"),
    ("cronjob", "k8s_cron_jobs"),
    // networking
    ("ingress", "k8s_ingresses"),
    ("ingressclass", "k8s_ingress_classes"),
    ("networkpolicy", "k8s_network_policies"),
    ("endpointslice", "k8s_endpoint_slices"),
    // rbac
    ("role", "k8s_roles"),
    ("rolebinding", "k8s_role_bindings"),
    ("clusterrole", "k8s_cluster_roles"),
    ("clusterrolebinding", "k8s_cluster_role_bindings"),
    // storage, scheduling, policy, autoscaling
    ("storageclass", "k8s_storage_classes"),
    ("csidriver", "k8s_csi_drivers"),
    ("priorityclass", "k8s_priority_classes"),
    ("poddisruptionbudget", "k8s_pod_disruption_budgets"),
    ("horizontalpodautoscaler", "k8s_horizontal_pod_autoscalers"),
    ("lease", "k8s_leases"),
    // extension points
    ("customresourcedefinition", "k8s_custom_resource_definitions"),
    ("mutatingwebhookconfiguration", "k8s_mutating_webhook_configurations"),
    ("validatingwebhookconfiguration", "k8s_validating_webhook_configurations"),
];

fn lookup(kind: &str) -> Option<&'static str> {
    let kind = kind.to_ascii_lowercase();
    KNOWN_TABLES.iter().find(|(k, _)| *k == kind).map(|(_, t)| *t)
}

/// Table for `kind`, falling back to [`CUSTOM_RESOURCE_TABLE`].
pub fn table_for(kind: &str) -> &'static str {
    lookup(kind).unwrap_or(CUSTOM_RESOURCE_TABLE)
}

pub fn is_builtin(kind: &str) -> bool {
    lookup(kind).is_some()
}

/// Lower-cased kinds the registry knows about, in registry order.
pub fn known_kinds() -> impl Iterator<Item = &'static str> {
    KNOWN_TABLES.iter().map(|(k, _)| *k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        for kind in known_kinds() {
            let upper = kind.to_ascii_uppercase();
            assert_eq!(table_for(kind), table_for(&upper), "kind {kind}");
        }
        assert_eq!(table_for("Pod"), "k8s_pods");
        assert_eq!(table_for("DEPLOYMENT"), "k8s_deployments");
        assert_eq!(table_for("ClusterRoleBinding"), "k8s_cluster_role_bindings");
    }

    #[test]
    fn unknown_kinds_fall_back_to_custom_table() {
        assert_eq!(table_for("Certificate"), CUSTOM_RESOURCE_TABLE);
        assert_eq!(table_for(""), CUSTOM_RESOURCE_TABLE);
        assert_eq!(table_for("pods"), CUSTOM_RESOURCE_TABLE);
        assert!(!table_for("VirtualService").is_empty());
        assert!(!is_builtin("Certificate"));
        assert!(is_builtin("cronJob"));
    }

    #[test]
    fn registry_has_no_duplicates_or_blank_tables() {
        let mut kinds: Vec<_> = known_kinds().collect();
        let total = kinds.len();
        kinds.sort_unstable();
        kinds.dedup();
        assert_eq!(kinds.len(), total);
        assert!(total >= 30);
        for (kind, table) in KNOWN_TABLES {
            assert_eq!(*kind, kind.to_ascii_lowercase());
            assert!(!table.is_empty());
            assert_ne!(*table, CUSTOM_RESOURCE_TABLE);
        }
    }
}
