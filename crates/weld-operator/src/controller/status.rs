//! Status and condition computation
//!
//! Conditions are compared field-wise before anything is written:
//! `lastTransitionTime` moves only when the status flips, `lastUpdateTime`
//! moves when any other field changes. Structural equality would thrash the
//! bundle on every pass.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use weld_common::crd::{
    condition_reasons, condition_types, BundleSpec, Condition, ConditionStatus, PluginStatus,
    PluginStatusValue, Resource, ResourceName,
};

use crate::plugin::PluginRegistry;

use super::resource_sync::{ResourceInfo, ResourceOutcome};

/// Merge a freshly computed condition with its previous incarnation.
///
/// Returns the condition to store and whether anything observable changed.
pub(crate) fn merge_condition(
    old: Option<&Condition>,
    mut next: Condition,
    now: DateTime<Utc>,
) -> (Condition, bool) {
    next.last_transition_time = now;
    next.last_update_time = now;

    let Some(old) = old else {
        // Brand new condition
        return (next, true);
    };

    if next.status == old.status {
        next.last_transition_time = old.last_transition_time;
    }
    let unchanged =
        next.status == old.status && next.reason == old.reason && next.message == old.message;
    if unchanged {
        next.last_update_time = old.last_update_time;
    }
    (next, !unchanged)
}

/// Compute the four conditions of one resource from its pass outcome.
///
/// Order: Blocked, InProgress, Ready, Error.
pub(crate) fn resource_conditions(
    processed: &BTreeMap<ResourceName, ResourceInfo>,
    res: &Resource,
) -> [Condition; 4] {
    let mut blocked = Condition::of(condition_types::BLOCKED, ConditionStatus::False);
    let mut in_progress = Condition::of(condition_types::IN_PROGRESS, ConditionStatus::False);
    let mut ready = Condition::of(condition_types::READY, ConditionStatus::False);
    let mut error = Condition::of(condition_types::ERROR, ConditionStatus::False);

    match processed.get(&res.name) {
        Some(info) => match &info.outcome {
            ResourceOutcome::DependenciesNotReady { dependencies } => {
                blocked.status = ConditionStatus::True;
                blocked.reason = condition_reasons::DEPENDENCIES_NOT_READY.to_string();
                blocked.message = format!("Not ready: {dependencies:?}");
            }
            ResourceOutcome::InProgress => {
                in_progress.status = ConditionStatus::True;
            }
            ResourceOutcome::Ready => {
                ready.status = ConditionStatus::True;
            }
            ResourceOutcome::Failed { error: cause } => {
                error.status = ConditionStatus::True;
                error.message = cause.to_string();
                if cause.is_retriable() {
                    error.reason = condition_reasons::RETRIABLE_ERROR.to_string();
                    in_progress.status = ConditionStatus::True;
                } else {
                    error.reason = condition_reasons::TERMINAL_ERROR.to_string();
                }
            }
        },
        None => {
            // Not processed this pass (earlier failure stopped the walk)
            blocked.status = ConditionStatus::Unknown;
            in_progress.status = ConditionStatus::Unknown;
            ready.status = ConditionStatus::Unknown;
            error.status = ConditionStatus::Unknown;
        }
    }

    [blocked, in_progress, ready, error]
}

/// One status per distinct plugin name, in order of first mention in the
/// spec, so the output is stable across passes.
pub(crate) fn plugin_statuses(spec: &BundleSpec, plugins: &PluginRegistry) -> Vec<PluginStatus> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut statuses = Vec::new();
    for res in &spec.resources {
        let Some(invocation) = &res.plugin else {
            continue;
        };
        if !seen.insert(invocation.name.as_str()) {
            continue;
        }
        let status = match plugins.lookup(&invocation.name) {
            Some(plugin) => {
                let description = plugin.describe();
                PluginStatus {
                    name: invocation.name.clone(),
                    group: description.gvk.group,
                    version: description.gvk.version,
                    kind: description.gvk.kind,
                    status: PluginStatusValue::Ok,
                }
            }
            None => PluginStatus {
                name: invocation.name.clone(),
                group: String::new(),
                version: String::new(),
                kind: String::new(),
                status: PluginStatusValue::NoSuchPlugin,
            },
        };
        statuses.push(status);
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginContext, PluginDescription};
    use chrono::TimeZone;
    use kube::core::GroupVersionKind;
    use serde_json::Value;
    use std::sync::Arc;
    use weld_common::crd::PluginInvocation;
    use weld_common::Error;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn condition(status: ConditionStatus, reason: &str, message: &str) -> Condition {
        let mut c = Condition::of("Ready", status);
        c.reason = reason.to_string();
        c.message = message.to_string();
        c
    }

    // =========================================================================
    // Condition merge semantics
    // =========================================================================

    #[test]
    fn test_new_condition_gets_both_timestamps() {
        let (merged, changed) =
            merge_condition(None, condition(ConditionStatus::True, "", ""), at(100));
        assert!(changed);
        assert_eq!(merged.last_transition_time, at(100));
        assert_eq!(merged.last_update_time, at(100));
    }

    #[test]
    fn test_unchanged_condition_keeps_both_timestamps() {
        let mut old = condition(ConditionStatus::True, "AllGood", "");
        old.last_transition_time = at(50);
        old.last_update_time = at(60);

        let (merged, changed) = merge_condition(
            Some(&old),
            condition(ConditionStatus::True, "AllGood", ""),
            at(100),
        );
        assert!(!changed);
        assert_eq!(merged.last_transition_time, at(50));
        assert_eq!(merged.last_update_time, at(60));
    }

    #[test]
    fn test_status_flip_moves_both_timestamps() {
        let mut old = condition(ConditionStatus::False, "", "");
        old.last_transition_time = at(50);
        old.last_update_time = at(50);

        let (merged, changed) =
            merge_condition(Some(&old), condition(ConditionStatus::True, "", ""), at(100));
        assert!(changed);
        assert_eq!(merged.last_transition_time, at(100));
        assert_eq!(merged.last_update_time, at(100));
    }

    #[test]
    fn test_message_change_moves_only_update_time() {
        let mut old = condition(ConditionStatus::True, "Reason", "old message");
        old.last_transition_time = at(50);
        old.last_update_time = at(50);

        let (merged, changed) = merge_condition(
            Some(&old),
            condition(ConditionStatus::True, "Reason", "new message"),
            at(100),
        );
        assert!(changed);
        assert_eq!(merged.last_transition_time, at(50));
        assert_eq!(merged.last_update_time, at(100));
    }

    // =========================================================================
    // The per-resource condition table
    // =========================================================================

    fn info(outcome: ResourceOutcome) -> ResourceInfo {
        ResourceInfo {
            outcome,
            actual: None,
        }
    }

    fn resource(name: &str) -> Resource {
        Resource {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn statuses(conds: &[Condition; 4]) -> [ConditionStatus; 4] {
        [
            conds[0].status.clone(),
            conds[1].status.clone(),
            conds[2].status.clone(),
            conds[3].status.clone(),
        ]
    }

    #[test]
    fn test_blocked_row() {
        let mut processed = BTreeMap::new();
        processed.insert(
            "app".to_string(),
            info(ResourceOutcome::DependenciesNotReady {
                dependencies: vec!["db".to_string()],
            }),
        );
        let conds = resource_conditions(&processed, &resource("app"));
        use ConditionStatus::*;
        assert_eq!(statuses(&conds), [True, False, False, False]);
        assert_eq!(conds[0].reason, condition_reasons::DEPENDENCIES_NOT_READY);
        assert!(conds[0].message.contains("db"));
    }

    #[test]
    fn test_in_progress_and_ready_rows() {
        let mut processed = BTreeMap::new();
        processed.insert("a".to_string(), info(ResourceOutcome::InProgress));
        processed.insert("b".to_string(), info(ResourceOutcome::Ready));
        use ConditionStatus::*;
        assert_eq!(
            statuses(&resource_conditions(&processed, &resource("a"))),
            [False, True, False, False]
        );
        assert_eq!(
            statuses(&resource_conditions(&processed, &resource("b"))),
            [False, False, True, False]
        );
    }

    #[test]
    fn test_retriable_error_row_is_also_in_progress() {
        let mut processed = BTreeMap::new();
        processed.insert(
            "app".to_string(),
            info(ResourceOutcome::Failed {
                error: Error::reference_pending("app", "path missing"),
            }),
        );
        let conds = resource_conditions(&processed, &resource("app"));
        use ConditionStatus::*;
        assert_eq!(statuses(&conds), [False, True, False, True]);
        assert_eq!(conds[3].reason, condition_reasons::RETRIABLE_ERROR);
        assert!(conds[3].message.contains("path missing"));
    }

    #[test]
    fn test_terminal_error_row() {
        let mut processed = BTreeMap::new();
        processed.insert(
            "app".to_string(),
            info(ResourceOutcome::Failed {
                error: Error::foreign_object("ConfigMap", "shared"),
            }),
        );
        let conds = resource_conditions(&processed, &resource("app"));
        use ConditionStatus::*;
        assert_eq!(statuses(&conds), [False, False, False, True]);
        assert_eq!(conds[3].reason, condition_reasons::TERMINAL_ERROR);
    }

    #[test]
    fn test_unprocessed_resource_is_unknown_across_the_board() {
        let processed = BTreeMap::new();
        let conds = resource_conditions(&processed, &resource("app"));
        use ConditionStatus::*;
        assert_eq!(statuses(&conds), [Unknown, Unknown, Unknown, Unknown]);
    }

    // =========================================================================
    // Plugin statuses
    // =========================================================================

    struct NullPlugin(GroupVersionKind);

    impl Plugin for NullPlugin {
        fn describe(&self) -> PluginDescription {
            PluginDescription {
                gvk: self.0.clone(),
            }
        }

        fn process(&self, _ctx: &PluginContext<'_>) -> Result<Value, Error> {
            unimplemented!("not invoked in these tests")
        }
    }

    fn plugin_resource(res_name: &str, plugin_name: &str) -> Resource {
        Resource {
            name: res_name.to_string(),
            plugin: Some(PluginInvocation {
                name: plugin_name.to_string(),
                object_name: "obj".to_string(),
                spec: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_plugin_statuses_follow_spec_order_and_dedup() {
        let registry = PluginRegistry::new().with_plugin(
            "queue",
            Arc::new(NullPlugin(GroupVersionKind::gvk("example.com", "v1", "Queue"))),
        );
        let spec = BundleSpec {
            resources: vec![
                plugin_resource("z-first", "queue"),
                plugin_resource("a-missing", "ghost"),
                plugin_resource("again", "queue"),
                resource("inline"),
            ],
        };

        let statuses = plugin_statuses(&spec, &registry);
        assert_eq!(statuses.len(), 2);
        // First mention order, not lexical order
        assert_eq!(statuses[0].name, "queue");
        assert_eq!(statuses[0].status, PluginStatusValue::Ok);
        assert_eq!(statuses[0].kind, "Queue");
        assert_eq!(statuses[0].group, "example.com");
        assert_eq!(statuses[1].name, "ghost");
        assert_eq!(statuses[1].status, PluginStatusValue::NoSuchPlugin);
        assert!(statuses[1].kind.is_empty());
    }

    #[test]
    fn test_no_plugins_means_no_statuses() {
        let registry = PluginRegistry::new();
        let spec = BundleSpec {
            resources: vec![resource("inline")],
        };
        assert!(plugin_statuses(&spec, &registry).is_empty());
    }
}
