//! # sdb-backend
//!
//! Reconstructs source-level views of EVM execution traces: call frames, internal function
//! invocations, decoded variables and events, from compiler artifacts and raw VM steps.

#[macro_use]
extern crate tracing;

pub mod analysis;
pub mod artifact;
pub mod config;
pub mod decode;
pub mod inspector;
pub mod trace;
pub mod utils;

pub use analysis::matcher::BytecodeMatcher;
pub use artifact::ArtifactIndex;
pub use config::DebuggerConfig;
pub use decode::Value;
pub use inspector::{collect_steps, CollectedTrace, StepCollector};
pub use trace::{reconstruct, RawStep, RootCall, Trace, TraceReconstructor, TraceStep};
