//! Core-mix metadata record
//!
//! Every fused kernel carries one record stating which domain drives the launch and the ratio
//! of cube to vector units per logical block. The host launcher reads it to size the grid.
//!
//! # Formats
//!
//! - **JSON**: human-readable form for tooling and golden files
//! - **Binary**: the fixed 16-byte layout placed in the kernel's metadata section

use crate::{CoreError, KernelType, Result};
use serde::{Deserialize, Serialize};

/// Type-length tag of the kernel-type field
pub const TLV_KERNEL_TYPE: u16 = 1;

/// Type-length tag of the mix ratio field
pub const TLV_MIX_RATIO: u16 = 2;

/// Size of the binary record in bytes
pub const CORE_MIX_RECORD_BYTES: usize = 16;

/// Domain that drives the launch grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixMain {
    Aic,
    Aiv,
}

impl MixMain {
    pub fn code(self) -> u32 {
        match self {
            MixMain::Aic => 1,
            MixMain::Aiv => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(MixMain::Aic),
            2 => Ok(MixMain::Aiv),
            other => Err(CoreError::MalformedMetadata(format!("unknown main domain code {other}"))),
        }
    }

    /// Symbolic constant used in the emitted section initializer
    pub fn symbol(self) -> &'static str {
        match self {
            MixMain::Aic => "K_TYPE_MIX_AIC_MAIN",
            MixMain::Aiv => "K_TYPE_MIX_AIV_MAIN",
        }
    }

    /// Suffix of the metadata section name
    pub fn section_suffix(self) -> &'static str {
        match self {
            MixMain::Aic => "mix_aic",
            MixMain::Aiv => "mix_aiv",
        }
    }
}

/// Core-mix metadata of one fused kernel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreMixMetadata {
    /// Fused kernel name
    pub kernel_name: String,
    /// Driving domain
    pub main: MixMain,
    /// Cube units per logical block
    pub aic_ratio: u16,
    /// Vector units per logical block
    pub aiv_ratio: u16,
}

impl CoreMixMetadata {
    /// Derive the record from the fused kernel's summarised type
    pub fn for_kernel(kernel_name: impl Into<String>, kernel_type: KernelType) -> Self {
        let (main, aic_ratio, aiv_ratio) = match kernel_type {
            KernelType::AivOnly | KernelType::MixAiv1_0 => (MixMain::Aiv, 0, 1),
            KernelType::AicOnly | KernelType::MixAic1_0 => (MixMain::Aic, 1, 0),
            KernelType::MixAic1_1 => (MixMain::Aic, 1, 1),
            KernelType::MixAic1_2 => (MixMain::Aic, 1, 2),
        };
        Self {
            kernel_name: kernel_name.into(),
            main,
            aic_ratio,
            aiv_ratio,
        }
    }

    /// Whether both domains take part in the launch
    pub fn is_mixed(&self) -> bool {
        self.aic_ratio > 0 && self.aiv_ratio > 0
    }

    /// Name of the metadata section (`.ascend.meta.<name>`)
    pub fn section_name(&self) -> String {
        format!("{}_{}", self.kernel_name, self.main.section_suffix())
    }

    /// Serialize to JSON format for tooling
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CoreError::MalformedMetadata(e.to_string()))
    }

    /// Deserialize from JSON format
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::MalformedMetadata(e.to_string()))
    }

    /// Serialize to the fixed binary layout
    ///
    /// # Binary Layout
    ///
    /// ```text
    /// [tag: u16 = 1][len: u16 = 4][main: u32]
    /// [tag: u16 = 2][len: u16 = 4][aic_ratio: u16][aiv_ratio: u16]
    /// ```
    ///
    /// All fields are little-endian. The kernel name is not part of the record; it is carried
    /// by the section name.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(CORE_MIX_RECORD_BYTES);

        buffer.extend_from_slice(&TLV_KERNEL_TYPE.to_le_bytes());
        buffer.extend_from_slice(&4u16.to_le_bytes());
        buffer.extend_from_slice(&self.main.code().to_le_bytes());

        buffer.extend_from_slice(&TLV_MIX_RATIO.to_le_bytes());
        buffer.extend_from_slice(&4u16.to_le_bytes());
        buffer.extend_from_slice(&self.aic_ratio.to_le_bytes());
        buffer.extend_from_slice(&self.aiv_ratio.to_le_bytes());

        buffer
    }

    /// Deserialize from the fixed binary layout
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is truncated, carries unexpected tags, or names an unknown
    /// driving domain.
    pub fn from_binary(kernel_name: impl Into<String>, buffer: &[u8]) -> Result<Self> {
        if buffer.len() != CORE_MIX_RECORD_BYTES {
            return Err(CoreError::MalformedMetadata(format!(
                "expected {CORE_MIX_RECORD_BYTES} bytes, found {}",
                buffer.len()
            )));
        }

        let read_u16 = |off: usize| u16::from_le_bytes([buffer[off], buffer[off + 1]]);

        let expect_header = |off: usize, tag: u16| -> Result<()> {
            let found_tag = read_u16(off);
            let found_len = read_u16(off + 2);
            if found_tag != tag || found_len != 4 {
                return Err(CoreError::MalformedMetadata(format!(
                    "bad field header at {off}: tag {found_tag}, len {found_len}"
                )));
            }
            Ok(())
        };

        expect_header(0, TLV_KERNEL_TYPE)?;
        let main = MixMain::from_code(u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]))?;

        expect_header(8, TLV_MIX_RATIO)?;
        let aic_ratio = read_u16(12);
        let aiv_ratio = read_u16(14);

        Ok(Self {
            kernel_name: kernel_name.into(),
            main,
            aic_ratio,
            aiv_ratio,
        })
    }

    /// Size of the binary record
    pub fn size_bytes(&self) -> usize {
        CORE_MIX_RECORD_BYTES
    }
}
