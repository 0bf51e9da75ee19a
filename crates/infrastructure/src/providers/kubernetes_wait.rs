//! Readiness waits for freshly created units
//!
//! Two stages gate provisioning: a bounded wait for the scheduler to accept
//! every unit, and an unbounded wait for all containers to run. When the
//! scheduling wait times out, the control plane's event stream is inspected
//! to replace the generic timeout with the actual cause.

use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, ListParams};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use gantry_domain::{NodePhase, NodeProviderError, ResourceKind, Result};

use crate::providers::kubernetes::control_plane_error;

/// Delay between control-plane re-reads within a wait stage.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The only waiting-reason that is a normal part of container start; any
/// other reason (ImagePullBackOff, CreateContainerConfigError, ...) is
/// unrecoverable for this launch.
const CONTAINER_CREATING_REASON: &str = "ContainerCreating";

/// Node-selector keys that request an accelerator class. A scheduling
/// failure on a unit carrying one of these is reported as a GPU shortage.
const ACCELERATOR_LABEL_KEYS: &[&str] = &[
    "gantry.io/accelerator",
    "cloud.google.com/gke-accelerator",
    "accelerator",
    "nvidia.com/gpu.product",
];

const TIMEOUT_DETAIL: &str =
    "Cluster may be out of resources or may be too slow to autoscale.";

const LACK_RESOURCE_DETAIL: &str = "Other workloads or units may be using resources. \
Check resource usage by running `kubectl describe nodes`.";

// ============================================================================
// Scheduling wait
// ============================================================================

/// Wait for every unit in the wait set (workers plus the bridge unit) to be
/// accepted by the scheduler, polling every second up to `timeout`. A unit
/// with a non-empty container-status list has been bound to a host, so
/// resources are allocated even if containers are still creating.
pub(crate) async fn wait_for_units_to_schedule(
    units: &Api<Pod>,
    events: &Api<Event>,
    wait_set: &[String],
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        let mut all_scheduled = true;
        for name in wait_set {
            let pod = units
                .get(name)
                .await
                .map_err(|e| control_plane_error("failed to read unit while waiting", e))?;
            if !unit_scheduled(&pod) {
                all_scheduled = false;
                break;
            }
        }
        if all_scheduled {
            return Ok(());
        }
        sleep(POLL_INTERVAL).await;
    }

    Err(scheduling_failure(units, events, wait_set).await)
}

/// A unit counts as scheduled once its container-status list is non-empty;
/// absence means the control plane has not bound it to a host yet.
pub(crate) fn unit_scheduled(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    match status.phase.as_deref() {
        Some("Pending") | None => status
            .container_statuses
            .as_ref()
            .is_some_and(|statuses| !statuses.is_empty()),
        _ => true,
    }
}

// ============================================================================
// Run wait
// ============================================================================

/// Wait for every unit's containers to reach a running state. Unbounded:
/// the caller's own supervision is expected to cap it. Fails fast when a
/// container reports an unrecoverable start error instead of waiting out
/// the image pull backoff.
pub(crate) async fn wait_for_units_to_run(units: &Api<Pod>, wait_set: &[String]) -> Result<()> {
    loop {
        let mut all_running = true;
        for name in wait_set {
            let pod = units
                .get(name)
                .await
                .map_err(|e| control_plane_error("failed to read unit while waiting", e))?;

            if unit_running(&pod) {
                continue;
            }

            all_running = false;
            if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending") {
                if let Some(message) = container_start_failure(&pod) {
                    return Err(NodeProviderError::ContainerStartFailure {
                        node_id: name.clone(),
                        message,
                    });
                }
            }
            // One unit is not ready; no point checking the rest this round.
            break;
        }

        if all_running {
            return Ok(());
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Running phase with every container's state reporting running.
pub(crate) fn unit_running(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status.phase.as_deref() == Some("Running")
        && status.container_statuses.as_ref().is_some_and(|statuses| {
            statuses
                .iter()
                .all(|cs| cs.state.as_ref().is_some_and(|s| s.running.is_some()))
        })
}

/// A waiting-reason other than the transient creating reason means the unit
/// cannot start (image pull failure, bad config, ...). Returns the
/// container's reported message.
pub(crate) fn container_start_failure(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    for container in statuses {
        let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) else {
            continue;
        };
        if let Some(reason) = waiting.reason.as_deref() {
            if reason != CONTAINER_CREATING_REASON {
                return Some(
                    waiting
                        .message
                        .clone()
                        .unwrap_or_else(|| reason.to_string()),
                );
            }
        }
    }
    None
}

// ============================================================================
// Failure diagnosis
// ============================================================================

/// Translate a scheduling-wait timeout into the most specific error the
/// control plane's events support. Diagnosis failures are folded into the
/// generic timeout rather than masking it.
pub(crate) async fn scheduling_failure(
    units: &Api<Pod>,
    events: &Api<Event>,
    wait_set: &[String],
) -> NodeProviderError {
    match diagnose_scheduling_failure(units, events, wait_set).await {
        Ok(Some(cause)) => cause,
        Ok(None) => NodeProviderError::SchedulingTimeout {
            phase: None,
            detail: TIMEOUT_DETAIL.to_string(),
        },
        Err(e) => NodeProviderError::SchedulingTimeout {
            phase: None,
            detail: format!(
                "An error occurred while trying to fetch the reason for unit \
                 scheduling failure: {}",
                e
            ),
        },
    }
}

async fn diagnose_scheduling_failure(
    units: &Api<Pod>,
    events: &Api<Event>,
    wait_set: &[String],
) -> Result<Option<NodeProviderError>> {
    for name in wait_set {
        let pod = units
            .get(name)
            .await
            .map_err(|e| control_plane_error("failed to read unit for diagnosis", e))?;

        // A unit that left Pending was scheduled at some point; it is never
        // the one to blame for the timeout.
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        if phase != "Pending" {
            continue;
        }

        let lp = ListParams::default().fields(&format!(
            "involvedObject.name={},involvedObject.kind=Pod",
            name
        ));
        let mut unit_events = events
            .list(&lp)
            .await
            .map_err(|e| control_plane_error("failed to list unit events", e))?
            .items;

        // The event store keeps hours of history; surface the most recent
        // scheduling verdict.
        unit_events.sort_by(|a, b| creation_time(b).cmp(&creation_time(a)));
        let Some(message) = unit_events
            .iter()
            .find(|e| e.reason.as_deref() == Some("FailedScheduling"))
            .and_then(|e| e.message.clone())
        else {
            continue;
        };

        let node_selector = pod.spec.as_ref().and_then(|s| s.node_selector.as_ref());
        return Ok(Some(classify_failed_scheduling(
            NodePhase::parse(phase),
            node_selector,
            &message,
        )));
    }
    Ok(None)
}

fn creation_time(event: &Event) -> Option<chrono::DateTime<chrono::Utc>> {
    event
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| {
            chrono::DateTime::from_timestamp(t.0.as_second(), t.0.subsec_nanosecond() as u32)
        })
}

/// Classify the most recent FailedScheduling message for a still-Pending
/// unit, in priority order: CPU shortage, memory shortage, accelerator
/// shortage (only when the unit's node selector requests one), then the
/// generic timeout carrying the raw message.
pub(crate) fn classify_failed_scheduling(
    phase: NodePhase,
    node_selector: Option<&BTreeMap<String, String>>,
    message: &str,
) -> NodeProviderError {
    if phase == NodePhase::Pending {
        if message.contains("Insufficient cpu") {
            return NodeProviderError::InsufficientResource {
                kind: ResourceKind::Cpu,
                detail: LACK_RESOURCE_DETAIL.to_string(),
            };
        }
        if message.contains("Insufficient memory") {
            return NodeProviderError::InsufficientResource {
                kind: ResourceKind::Memory,
                detail: LACK_RESOURCE_DETAIL.to_string(),
            };
        }
        if let Some(selector) = node_selector {
            for key in ACCELERATOR_LABEL_KEYS {
                let Some(requested) = selector.get(*key) else {
                    continue;
                };
                if message.contains("Insufficient nvidia.com/gpu")
                    || message.contains("didn't match Pod's node affinity/selector")
                {
                    return NodeProviderError::InsufficientResource {
                        kind: ResourceKind::Gpu,
                        detail: format!(
                            "{} Verify if {} is available in the cluster.",
                            LACK_RESOURCE_DETAIL, requested
                        ),
                    };
                }
            }
        }
    }
    NodeProviderError::SchedulingTimeout {
        phase: Some(phase),
        detail: format!("{} Details: '{}'", TIMEOUT_DETAIL, message),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).expect("valid pod fixture")
    }

    mod scheduling_predicate {
        use super::*;

        #[test]
        fn test_no_status_is_unscheduled() {
            assert!(!unit_scheduled(&pod(json!({}))));
        }

        #[test]
        fn test_pending_without_container_statuses_is_unscheduled() {
            assert!(!unit_scheduled(&pod(json!({
                "status": {"phase": "Pending"}
            }))));
            assert!(!unit_scheduled(&pod(json!({
                "status": {"phase": "Pending", "containerStatuses": []}
            }))));
        }

        #[test]
        fn test_pending_with_container_statuses_is_scheduled() {
            assert!(unit_scheduled(&pod(json!({
                "status": {
                    "phase": "Pending",
                    "containerStatuses": [{
                        "name": "node", "image": "img", "imageID": "", "ready": false,
                        "restartCount": 0,
                        "state": {"waiting": {"reason": "ContainerCreating"}}
                    }]
                }
            }))));
        }

        #[test]
        fn test_running_is_scheduled() {
            assert!(unit_scheduled(&pod(json!({
                "status": {"phase": "Running"}
            }))));
        }
    }

    mod run_predicate {
        use super::*;

        fn container_status(state: serde_json::Value) -> serde_json::Value {
            json!({
                "name": "node", "image": "img", "imageID": "", "ready": true,
                "restartCount": 0, "state": state
            })
        }

        #[test]
        fn test_all_containers_running() {
            let p = pod(json!({
                "status": {
                    "phase": "Running",
                    "containerStatuses": [
                        container_status(json!({"running": {}})),
                        container_status(json!({"running": {}})),
                    ]
                }
            }));
            assert!(unit_running(&p));
        }

        #[test]
        fn test_one_container_still_waiting_is_not_running() {
            let p = pod(json!({
                "status": {
                    "phase": "Running",
                    "containerStatuses": [
                        container_status(json!({"running": {}})),
                        container_status(json!({"waiting": {"reason": "ContainerCreating"}})),
                    ]
                }
            }));
            assert!(!unit_running(&p));
        }

        #[test]
        fn test_image_pull_backoff_is_a_start_failure() {
            let p = pod(json!({
                "status": {
                    "phase": "Pending",
                    "containerStatuses": [container_status(json!({
                        "waiting": {
                            "reason": "ImagePullBackOff",
                            "message": "Back-off pulling image \"gantry/node:latest\""
                        }
                    }))]
                }
            }));
            let message = container_start_failure(&p).expect("failure detected");
            assert!(message.contains("Back-off pulling image"));
        }

        #[test]
        fn test_container_creating_is_not_a_failure() {
            let p = pod(json!({
                "status": {
                    "phase": "Pending",
                    "containerStatuses": [container_status(json!({
                        "waiting": {"reason": "ContainerCreating"}
                    }))]
                }
            }));
            assert!(container_start_failure(&p).is_none());
        }

        #[test]
        fn test_waiting_without_reason_is_not_a_failure() {
            let p = pod(json!({
                "status": {
                    "phase": "Pending",
                    "containerStatuses": [container_status(json!({"waiting": {}}))]
                }
            }));
            assert!(container_start_failure(&p).is_none());
        }
    }

    mod classification {
        use super::*;

        fn gpu_selector() -> BTreeMap<String, String> {
            let mut selector = BTreeMap::new();
            selector.insert(
                "gantry.io/accelerator".to_string(),
                "nvidia-a100".to_string(),
            );
            selector
        }

        #[test]
        fn test_insufficient_cpu() {
            let err = classify_failed_scheduling(
                NodePhase::Pending,
                None,
                "0/3 nodes are available: 3 Insufficient cpu.",
            );
            assert!(matches!(
                err,
                NodeProviderError::InsufficientResource {
                    kind: ResourceKind::Cpu,
                    ..
                }
            ));
        }

        #[test]
        fn test_insufficient_memory() {
            let err = classify_failed_scheduling(
                NodePhase::Pending,
                None,
                "0/3 nodes are available: 3 Insufficient memory.",
            );
            assert!(matches!(
                err,
                NodeProviderError::InsufficientResource {
                    kind: ResourceKind::Memory,
                    ..
                }
            ));
        }

        #[test]
        fn test_insufficient_gpu_with_selector() {
            let err = classify_failed_scheduling(
                NodePhase::Pending,
                Some(&gpu_selector()),
                "0/3 nodes are available: 3 Insufficient nvidia.com/gpu.",
            );
            match err {
                NodeProviderError::InsufficientResource {
                    kind: ResourceKind::Gpu,
                    detail,
                } => assert!(detail.contains("nvidia-a100")),
                other => panic!("expected GPU shortage, got {:?}", other),
            }
        }

        #[test]
        fn test_affinity_mismatch_counts_as_gpu_shortage() {
            let err = classify_failed_scheduling(
                NodePhase::Pending,
                Some(&gpu_selector()),
                "0/3 nodes are available: 3 node(s) didn't match Pod's node affinity/selector.",
            );
            assert!(matches!(
                err,
                NodeProviderError::InsufficientResource {
                    kind: ResourceKind::Gpu,
                    ..
                }
            ));
        }

        #[test]
        fn test_gpu_message_without_selector_is_generic() {
            let err = classify_failed_scheduling(
                NodePhase::Pending,
                None,
                "0/3 nodes are available: 3 Insufficient nvidia.com/gpu.",
            );
            assert!(matches!(
                err,
                NodeProviderError::SchedulingTimeout { .. }
            ));
        }

        #[test]
        fn test_unrecognized_message_carries_raw_details() {
            let err = classify_failed_scheduling(
                NodePhase::Pending,
                None,
                "0/3 nodes are available: 3 node(s) had untolerated taint.",
            );
            match err {
                NodeProviderError::SchedulingTimeout { phase, detail } => {
                    assert_eq!(phase, Some(NodePhase::Pending));
                    assert!(detail.contains("untolerated taint"));
                }
                other => panic!("expected scheduling timeout, got {:?}", other),
            }
        }

        #[test]
        fn test_cpu_takes_priority_over_gpu() {
            // Priority order is CPU, memory, then accelerator.
            let err = classify_failed_scheduling(
                NodePhase::Pending,
                Some(&gpu_selector()),
                "Insufficient cpu, Insufficient nvidia.com/gpu",
            );
            assert!(matches!(
                err,
                NodeProviderError::InsufficientResource {
                    kind: ResourceKind::Cpu,
                    ..
                }
            ));
        }
    }

    mod event_ordering {
        use super::*;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

        fn event(reason: &str, message: &str, secs: i64) -> Event {
            Event {
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    creation_timestamp: Some(Time(
                        k8s_openapi::jiff::Timestamp::from_second(secs).expect("time"),
                    )),
                    ..Default::default()
                },
                ..Default::default()
            }
        }

        #[test]
        fn test_latest_failed_scheduling_event_wins() {
            let mut events = vec![
                event("FailedScheduling", "older message", 100),
                event("Scheduled", "assigned to host", 300),
                event("FailedScheduling", "newest message", 200),
            ];
            events.sort_by(|a, b| creation_time(b).cmp(&creation_time(a)));
            let message = events
                .iter()
                .find(|e| e.reason.as_deref() == Some("FailedScheduling"))
                .and_then(|e| e.message.clone());
            assert_eq!(message.as_deref(), Some("newest message"));
        }

        #[test]
        fn test_events_without_timestamp_sort_last() {
            let mut events = vec![
                Event {
                    reason: Some("FailedScheduling".to_string()),
                    message: Some("no timestamp".to_string()),
                    ..Default::default()
                },
                event("FailedScheduling", "timestamped", 100),
            ];
            events.sort_by(|a, b| creation_time(b).cmp(&creation_time(a)));
            assert_eq!(events[0].message.as_deref(), Some("timestamped"));
        }
    }
}
