//! Event-driven reconciliation for a MAAS region controller unit.
//!
//! Each lifecycle event is handled the same way:
//!
//! - **Observe**: snapshot config, relations and leadership from the
//!   [`Runtime`], and facts from the [`Workload`]
//! - **Derive**: compute the [`DesiredState`] as a pure function of those
//!   inputs and the operator [`Policy`]
//! - **Diff**: compare section fingerprints with the [`AppliedState`]
//! - **Apply**: write artifacts atomically, restart once, run leader duties
//!
//! Nothing is carried over between events except the applied state, so
//! the outcome does not depend on the order events arrived in.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use maas_operator_reconciler::{
//!     ArtifactStore, Event, InMemoryRuntime, InMemorySupervisor, InMemoryWorkload, Reconciler,
//! };
//!
//! let mut reconciler = Reconciler::builder()
//!     .with_runtime(Arc::new(InMemoryRuntime::new(observation)))
//!     .with_workload(Arc::new(InMemoryWorkload::installed("3.6/stable")))
//!     .with_supervisor(Arc::new(InMemorySupervisor::new()))
//!     .with_store(ArtifactStore::new("/var/snap/maas/current", "applied-state.json"))
//!     .build()?;
//!
//! let handled = reconciler.handle(Event::ConfigChanged).await;
//! println!("{}", handled.status);
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod actions;
pub mod artifact;
pub mod backup;
pub mod desired;
pub mod error;
pub mod fingerprint;
pub mod r#loop;
pub mod memory;
pub mod reconciler;
pub mod render;
pub mod runtime;
pub mod types;
pub mod workload;

pub use actions::{Action, ActionError, ActionKind, ActionOutput, ActionRequest};
pub use artifact::ArtifactStore;
pub use backup::{ObjectStore, ObjectStoreProvider};
pub use desired::{DesiredState, Policy};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use memory::{InMemoryObjectStore, InMemoryRuntime, InMemorySupervisor, InMemoryWorkload};
pub use r#loop::EventLoop;
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use render::{Artifact, Render, YamlRenderer};
pub use runtime::{Publication, Runtime, Scope, Secret};
pub use types::{AppliedState, Event, Handled, RelationRef, Status};
pub use workload::{AdminAccount, ArchiveKind, Supervisor, TlsFiles, Workload};
