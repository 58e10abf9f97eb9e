//! Core types, configuration and errors shared by the operator crates.
//!
//! - [`model`]: raw observations from the runtime and the workload
//! - [`config`]: the operator's own layered configuration
//! - [`error`] / [`result`]: typed errors and logging combinators

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod model;
pub mod result;

pub use config::{EndpointSource, OperatorConfig, PortConfig, TimeoutConfig};
pub use error::Error;
pub use model::{
    ConfigOptions, DataBag, Liveness, Observation, OptionValue, RelationRecord, WorkloadFacts,
};
pub use result::{Result, ResultExt};
