//! Superfuse Code Generator
//!
//! Turns a fusion request (an ordered list of precompiled sub-operators) into the source text of
//! one fused kernel entry point. The generator works out the dependency graph between the
//! sub-operators, inserts the minimal synchronization on the cube and vector units, lays out the
//! flat parameter array and emits the entry, its helpers and the launch metadata.
//!
//! ```no_run
//! use superfuse_codegen::{FusionGenerator, FusionRequest};
//!
//! let request = FusionRequest::parse(&std::fs::read_to_string("request.json")?)?;
//! let kernel = FusionGenerator::new().generate(&request)?;
//! std::fs::write(format!("{}.cpp", kernel.kernel_name), &kernel.source)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod abi;
pub mod context;
pub mod descriptor;
pub mod dispatch;
pub mod dynamic;
pub mod emit;
pub mod error;
pub mod events;
pub mod generator;
pub mod graph;
pub mod kernel;
pub mod options;
pub mod primitives;
pub mod profiling;
pub mod render;
pub mod schedule;
pub mod scheduler;
pub mod stream;
pub mod summary;
pub mod sync;

pub use abi::AbiLayout;
pub use descriptor::{FusionRequest, HardwareProfile, OperatorDescriptor, TaskType};
pub use error::{CodegenError, Result};
pub use events::{EventPlan, ScheduleMode};
pub use generator::{FusedKernel, FusionGenerator};
pub use graph::{OperatorGraph, OperatorId, OperatorNode};
pub use options::{EarlyStartMode, FusionOptions, PreloadMode};
pub use summary::FusionSummary;
pub use sync::SyncStats;
