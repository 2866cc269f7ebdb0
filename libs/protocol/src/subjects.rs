//! Subject and queue-group naming for a federation broker cluster.
//!
//! All broker instances sharing a cluster name subscribe with the same queue
//! group, so the bus delivers each inbound message to exactly one of them.

/// Subject the collective side of a broker cluster listens on
pub fn collective_subject(cluster: &str) -> String {
    format!("choria.federation.{}.collective", cluster)
}

/// Subject the federation side of a broker cluster listens on
pub fn federation_subject(cluster: &str) -> String {
    format!("choria.federation.{}.federation", cluster)
}

/// Subject broker instances publish their stats snapshots on
pub fn stats_subject(cluster: &str) -> String {
    format!("choria.federation.{}.stats", cluster)
}

/// Queue group shared by the collective-side consumers of a cluster
pub fn collective_queue_group(cluster: &str) -> String {
    format!("{}_collective", cluster)
}

/// Queue group shared by the federation-side consumers of a cluster
pub fn federation_queue_group(cluster: &str) -> String {
    format!("{}_federation", cluster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_naming() {
        assert_eq!(
            collective_subject("prod"),
            "choria.federation.prod.collective"
        );
        assert_eq!(
            federation_subject("prod"),
            "choria.federation.prod.federation"
        );
        assert_eq!(stats_subject("prod"), "choria.federation.prod.stats");
    }

    #[test]
    fn test_queue_group_naming() {
        assert_eq!(collective_queue_group("prod"), "prod_collective");
        assert_eq!(federation_queue_group("prod"), "prod_federation");
    }
}
