//! # Superfuse Core – Hardware Vocabulary
//!
//! `superfuse-core` holds the types every other superfuse crate speaks in: the two engine
//! domains of the accelerator, the kernel-type classes a sub-operator can be compiled as, the
//! parameter-table ABI of a fused launch, the profiling record format, and the core-mix metadata
//! record read by the host launcher.
//!
//! ## Architecture Overview
//!
//! - [`domain`] describes the cube and vector domains and the observed kernel-type classes.
//! - [`abi`] fixes the parameter-table contract, lock states and the packed dynamic block count.
//! - [`profiling`] defines the 16-byte profiling record and a host model of the per-unit ring.
//! - [`metadata`] encodes the core-mix record in JSON and in its fixed binary layout.
//!
//! ## Quick Start
//!
//! ```
//! use superfuse_core::{CoreMixMetadata, DomainAffinity, KernelType, PackedBlockCount};
//!
//! let kernel_type = KernelType::from_name("KERNEL_TYPE_AIC_ONLY").unwrap();
//! assert_eq!(kernel_type.affinity(), DomainAffinity::CubeOnly);
//!
//! // Dynamic operators publish their resolved class and block count in one 64-bit word.
//! let packed = PackedBlockCount::new(kernel_type, 48).pack();
//! let decoded = PackedBlockCount::unpack(packed).unwrap();
//! assert_eq!(decoded.block_count, 48);
//!
//! // The launcher reads the per-domain ratio from the metadata record.
//! let meta = CoreMixMetadata::for_kernel("fused", KernelType::MixAic1_2);
//! assert_eq!((meta.aic_ratio, meta.aiv_ratio), (1, 2));
//! ```

pub mod abi;
pub mod constants;
pub mod domain;
pub mod metadata;
pub mod profiling;

pub use abi::*;
pub use constants::*;
pub use domain::*;
pub use metadata::*;
pub use profiling::*;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while interpreting hardware vocabulary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("Unsupported kernel type value: {code} (observed classes are 0, 1, 4, 5, 6, 7)")]
    UnsupportedKernelType { code: u64 },

    #[error("Unknown kernel type name: {0}")]
    UnknownKernelTypeName(String),

    #[error("Malformed core-mix metadata: {0}")]
    MalformedMetadata(String),

    #[error("Invalid lock state: {0} (must be 0 or 1)")]
    InvalidLockState(u64),
}
