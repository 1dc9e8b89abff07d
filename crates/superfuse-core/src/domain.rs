//! Engine domains and kernel-type classes
//!
//! The accelerator exposes two heterogeneous engine domains. Every sub-operator is compiled for
//! one of a small set of kernel-type classes that fixes which domain(s) it occupies and how the
//! launcher pairs cube and vector units.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two engine domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Cube,
    Vector,
}

impl Domain {
    /// Both domains, cube first
    pub const ALL: [Domain; 2] = [Domain::Cube, Domain::Vector];

    /// Compile-time guard that is true only on units of this domain
    pub fn guard(self) -> &'static str {
        match self {
            Domain::Cube => "ASCEND_IS_AIC",
            Domain::Vector => "ASCEND_IS_AIV",
        }
    }

    /// Short architecture tag used in generated symbol names
    pub fn arch(self) -> &'static str {
        match self {
            Domain::Cube => "aic",
            Domain::Vector => "aiv",
        }
    }

    /// Tag used in sync diagnostics (`vec:cub`)
    pub fn sync_tag(self) -> &'static str {
        match self {
            Domain::Cube => "cub",
            Domain::Vector => "vec",
        }
    }

    pub fn other(self) -> Domain {
        match self {
            Domain::Cube => Domain::Vector,
            Domain::Vector => Domain::Cube,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Domain::Cube => "cube",
            Domain::Vector => "vec",
        })
    }
}

/// Which domain(s) an operator occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainAffinity {
    CubeOnly,
    VectorOnly,
    Mixed,
}

impl DomainAffinity {
    /// Domains in emission order (cube portion first for mixed operators)
    pub fn domains(self) -> &'static [Domain] {
        match self {
            DomainAffinity::CubeOnly => &[Domain::Cube],
            DomainAffinity::VectorOnly => &[Domain::Vector],
            DomainAffinity::Mixed => &[Domain::Cube, Domain::Vector],
        }
    }

    pub fn contains(self, domain: Domain) -> bool {
        self.domains().contains(&domain)
    }

    /// Domain whose guard is emitted first
    pub fn primary(self) -> Domain {
        match self {
            DomainAffinity::VectorOnly => Domain::Vector,
            DomainAffinity::CubeOnly | DomainAffinity::Mixed => Domain::Cube,
        }
    }
}

/// Observed kernel-type classes
///
/// The numeric values are the ones the runtime publishes in the high half of a packed dynamic
/// block count. Values outside this set are rejected rather than guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KernelType {
    AivOnly,
    AicOnly,
    MixAiv1_0,
    MixAic1_0,
    MixAic1_1,
    MixAic1_2,
}

impl KernelType {
    pub const ALL: [KernelType; 6] = [
        KernelType::AivOnly,
        KernelType::AicOnly,
        KernelType::MixAiv1_0,
        KernelType::MixAic1_0,
        KernelType::MixAic1_1,
        KernelType::MixAic1_2,
    ];

    pub fn code(self) -> u32 {
        match self {
            KernelType::AivOnly => 0,
            KernelType::AicOnly => 1,
            KernelType::MixAiv1_0 => 4,
            KernelType::MixAic1_0 => 5,
            KernelType::MixAic1_1 => 6,
            KernelType::MixAic1_2 => 7,
        }
    }

    pub fn from_code(code: u64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kt| u64::from(kt.code()) == code)
            .ok_or(CoreError::UnsupportedKernelType { code })
    }

    pub fn name(self) -> &'static str {
        match self {
            KernelType::AivOnly => "KERNEL_TYPE_AIV_ONLY",
            KernelType::AicOnly => "KERNEL_TYPE_AIC_ONLY",
            KernelType::MixAiv1_0 => "KERNEL_TYPE_MIX_AIV_1_0",
            KernelType::MixAic1_0 => "KERNEL_TYPE_MIX_AIC_1_0",
            KernelType::MixAic1_1 => "KERNEL_TYPE_MIX_AIC_1_1",
            KernelType::MixAic1_2 => "KERNEL_TYPE_MIX_AIC_1_2",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kt| kt.name() == name.trim())
            .ok_or_else(|| CoreError::UnknownKernelTypeName(name.to_string()))
    }

    pub fn affinity(self) -> DomainAffinity {
        match self {
            KernelType::AivOnly | KernelType::MixAiv1_0 => DomainAffinity::VectorOnly,
            KernelType::AicOnly | KernelType::MixAic1_0 => DomainAffinity::CubeOnly,
            KernelType::MixAic1_1 | KernelType::MixAic1_2 => DomainAffinity::Mixed,
        }
    }

    pub fn is_mixed(self) -> bool {
        self.affinity() == DomainAffinity::Mixed
    }

    /// Block-index intrinsic used to gate units of `domain` for this class
    ///
    /// Vector-only classes use the logical vector index; every other class gates on the
    /// hardware block index.
    pub fn block_index_fn(self, domain: Domain) -> &'static str {
        match (self.affinity(), domain) {
            (DomainAffinity::VectorOnly, Domain::Vector) => "AscendC::GetBlockIdx",
            _ => "get_block_idx",
        }
    }

    /// Class code used in the early-start handshake configuration (cube 0, vector 1, mixed 2)
    pub fn early_start_class(self) -> u32 {
        match self.affinity() {
            DomainAffinity::CubeOnly => 0,
            DomainAffinity::VectorOnly => 1,
            DomainAffinity::Mixed => 2,
        }
    }

    /// Flag OR-ed into the fused-kernel summary
    pub fn summary_flag(self) -> u32 {
        match self {
            KernelType::AivOnly => 0b1,
            KernelType::AicOnly => 0b10,
            KernelType::MixAiv1_0 => 0b100,
            KernelType::MixAic1_0 => 0b1000,
            KernelType::MixAic1_1 => 0b10000,
            KernelType::MixAic1_2 => 0b100000,
        }
    }
}

impl fmt::Display for KernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_for_observed_classes() {
        for kt in KernelType::ALL {
            assert_eq!(KernelType::from_code(u64::from(kt.code())).unwrap(), kt);
            assert_eq!(KernelType::from_name(kt.name()).unwrap(), kt);
        }
    }

    #[test]
    fn test_unseen_codes_are_rejected() {
        for code in [2u64, 3, 8, 255, u64::from(u32::MAX)] {
            assert_eq!(
                KernelType::from_code(code),
                Err(CoreError::UnsupportedKernelType { code })
            );
        }
        assert!(KernelType::from_name("KERNEL_TYPE_MIX_AIV_1_1").is_err());
    }

    #[test]
    fn test_affinity_and_guards() {
        assert_eq!(KernelType::MixAiv1_0.affinity(), DomainAffinity::VectorOnly);
        assert_eq!(KernelType::MixAic1_0.affinity(), DomainAffinity::CubeOnly);
        assert_eq!(DomainAffinity::Mixed.domains(), &[Domain::Cube, Domain::Vector]);
        assert_eq!(KernelType::AivOnly.block_index_fn(Domain::Vector), "AscendC::GetBlockIdx");
        assert_eq!(KernelType::MixAic1_1.block_index_fn(Domain::Vector), "get_block_idx");
        assert_eq!(Domain::Vector.guard(), "ASCEND_IS_AIV");
    }
}
