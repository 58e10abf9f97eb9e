#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # maas-operator
//!
//! Command-line front end and host adaptors for the MAAS region reconciler:
//!
//! - [`runtime::FileRuntime`]: observations and publications as JSON files
//! - [`process::CommandWorkload`] / [`process::CommandSupervisor`]: the
//!   workload's package manager, admin CLI and service commands
//! - [`objstore::S3Stores`]: S3-compatible buckets for the backup actions
//! - [`cli`]: argument parsing and the JSON report format

pub mod cli;
pub mod objstore;
pub mod process;
pub mod runtime;

pub use objstore::S3Stores;
pub use process::{CommandSupervisor, CommandWorkload};
pub use runtime::FileRuntime;
