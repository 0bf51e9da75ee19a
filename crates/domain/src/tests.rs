//! Unit tests for domain layer
use serde_json::json;

use crate::node::{NodeTemplate, head_service_selector};
use crate::shared_kernel::{
    COMPONENT_LABEL, ClusterName, NodePhase, NodeProviderError, ResourceKind, SSH_BRIDGE_LABEL,
};

mod phase_tests {
    use super::*;

    #[test]
    fn test_parse_known_phases() {
        assert_eq!(NodePhase::parse("Pending"), NodePhase::Pending);
        assert_eq!(NodePhase::parse("Running"), NodePhase::Running);
        assert_eq!(NodePhase::parse("Failed"), NodePhase::Failed);
        assert_eq!(NodePhase::parse("Succeeded"), NodePhase::Succeeded);
        assert_eq!(NodePhase::parse("Terminating"), NodePhase::Terminating);
    }

    #[test]
    fn test_parse_unknown_phase_maps_to_unknown() {
        assert_eq!(NodePhase::parse("Evicted"), NodePhase::Unknown);
        assert_eq!(NodePhase::parse(""), NodePhase::Unknown);
    }

    #[test]
    fn test_live_phases() {
        assert!(NodePhase::Pending.is_live());
        assert!(NodePhase::Running.is_live());
        assert!(!NodePhase::Failed.is_live());
        assert!(!NodePhase::Unknown.is_live());
        assert!(!NodePhase::Succeeded.is_live());
        assert!(!NodePhase::Terminating.is_live());
    }

    #[test]
    fn test_terminated_is_complement_of_live() {
        for phase in [
            NodePhase::Pending,
            NodePhase::Running,
            NodePhase::Failed,
            NodePhase::Unknown,
            NodePhase::Succeeded,
            NodePhase::Terminating,
        ] {
            assert_eq!(phase.is_terminated(), !phase.is_live());
        }
    }
}

mod cluster_name_tests {
    use super::*;

    #[test]
    fn test_display_name_strips_user_hash() {
        let name = ClusterName::new("trainer-ab12");
        assert_eq!(name.display_name(), "trainer");
    }

    #[test]
    fn test_display_name_short_name_unchanged() {
        let name = ClusterName::new("ab12");
        assert_eq!(name.display_name(), "ab12");
    }
}

mod template_tests {
    use super::*;

    #[test]
    fn test_unit_labels_extracted() {
        let template = NodeTemplate::new(json!({
            "metadata": {
                "labels": {
                    "app": "gantry-node",
                    (SSH_BRIDGE_LABEL): "trainer-ab12-bridge",
                }
            }
        }));
        let labels = template.unit_labels();
        assert_eq!(labels.get("app"), Some(&"gantry-node".to_string()));
        assert_eq!(
            template.bridge_unit_name(),
            Some("trainer-ab12-bridge".to_string())
        );
    }

    #[test]
    fn test_unit_labels_missing_metadata() {
        let template = NodeTemplate::new(json!({"spec": {}}));
        assert!(template.unit_labels().is_empty());
        assert!(template.bridge_unit_name().is_none());
    }

    #[test]
    fn test_head_service_selector() {
        let selector = head_service_selector(&ClusterName::new("trainer-ab12"));
        assert_eq!(
            selector.get(COMPONENT_LABEL),
            Some(&"trainer-ab12-head".to_string())
        );
    }
}

mod error_tests {
    use super::*;

    #[test]
    fn test_insufficient_resource_names_kind() {
        let err = NodeProviderError::InsufficientResource {
            kind: ResourceKind::Gpu,
            detail: "Verify if nvidia-a100 is available in the cluster.".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("insufficient GPU capacity"));
        assert!(msg.contains("nvidia-a100"));
    }

    #[test]
    fn test_scheduling_timeout_carries_detail() {
        let err = NodeProviderError::SchedulingTimeout {
            phase: Some(NodePhase::Pending),
            detail: "0/3 nodes are available".to_string(),
        };
        assert!(err.to_string().contains("0/3 nodes are available"));
    }

    #[test]
    fn test_address_not_found_lists_known() {
        let err = NodeProviderError::AddressNotFound {
            address: "10.0.0.9".to_string(),
            use_internal_address: true,
            known: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.9"));
        assert!(msg.contains("10.0.0.1"));
    }
}
