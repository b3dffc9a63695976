//! Weld operator: reconciles Bundle resources into live cluster objects
//!
//! A Bundle declares a DAG of cluster objects plus plugin-synthesized ones.
//! Each reconciliation pass sorts the resources by their reference edges,
//! processes them in dependency order, garbage-collects objects that left the
//! spec, and writes the aggregate outcome back as bundle status.

pub mod client;
pub mod controller;
pub mod controller_runner;
pub mod plugin;
pub mod ready;
pub mod refs;
pub mod spec_check;
pub mod store;

pub use weld_common::{crd, Error, Result};
