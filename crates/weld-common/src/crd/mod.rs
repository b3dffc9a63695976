//! Custom Resource Definitions for Weld

mod bundle;
mod types;

pub use bundle::{
    add_delete_resources_finalizer, condition_reasons, condition_types,
    remove_delete_resources_finalizer, Bundle, BundleSpec, BundleStatus, ObjectToDelete,
    PluginInvocation, PluginStatus, PluginStatusValue, Reference, Resource, ResourceName,
    ResourceStatus,
};
pub use types::{Condition, ConditionStatus};
