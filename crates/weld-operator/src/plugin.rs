//! Plugin registry
//!
//! A plugin synthesizes one cluster object from an opaque spec plus the
//! resolved live objects of the resource's dependencies. The registry is
//! populated at startup and immutable afterwards. A plugin that panics is
//! contained: the resource fails terminally, the pass continues.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde_json::Value;
use tracing::error;

use weld_common::crd::ResourceName;
use weld_common::Error;

/// What a plugin produces
#[derive(Clone, Debug)]
pub struct PluginDescription {
    /// Group/version/kind of every object this plugin emits
    pub gvk: GroupVersionKind,
}

/// Input handed to a plugin invocation
pub struct PluginContext<'a> {
    /// Name of the bundle being reconciled
    pub bundle_name: &'a str,
    /// Namespace of the bundle
    pub bundle_namespace: &'a str,
    /// UID of the bundle
    pub bundle_uid: &'a str,
    /// metadata.name the produced object must carry
    pub object_name: &'a str,
    /// Opaque plugin spec from the bundle resource
    pub spec: Option<&'a Value>,
    /// Live objects of the resource's named dependencies, keyed by resource
    /// name
    pub dependencies: &'a BTreeMap<ResourceName, DynamicObject>,
}

/// A registered object synthesizer
pub trait Plugin: Send + Sync {
    /// Describe the kind of object this plugin produces
    fn describe(&self) -> PluginDescription;

    /// Produce the full desired object for the given invocation
    fn process(&self, ctx: &PluginContext<'_>) -> Result<Value, Error>;
}

/// Immutable name -> plugin table, shared across reconciliation passes
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin under the given name (builder style, used at startup)
    pub fn with_plugin(mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.insert(name.into(), plugin);
        self
    }

    /// Look up a plugin by name
    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    /// Invoke a plugin, containing panics.
    ///
    /// A missing plugin and a panicking plugin are both terminal errors for
    /// the resource that referenced them.
    pub fn invoke(&self, name: &str, ctx: &PluginContext<'_>) -> Result<Value, Error> {
        let plugin = self
            .lookup(name)
            .ok_or_else(|| Error::plugin(name, "no such plugin"))?;
        match catch_unwind(AssertUnwindSafe(|| plugin.process(ctx))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(plugin = %name, panic = %message, "plugin panicked");
                Err(Error::plugin(name, format!("plugin panicked: {message}")))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
