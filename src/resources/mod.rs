//! Typed custom resources consumed and produced by the deployers.
//!
//! None of these are reconciled here; they are the API contracts of the
//! external controllers (gardener-resource-manager, etcd-druid and the
//! autoscalers) that this crate configures.

mod autoscaling;
mod etcd;
mod managed_resource;

pub use autoscaling::*;
pub use etcd::*;
pub use managed_resource::*;
