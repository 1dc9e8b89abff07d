//! Parameter-table ABI of a fused launch
//!
//! A fused kernel receives one opaque table of 64-bit slots. The generator and the host-side
//! argument packer must agree on the slot order exactly, so the ordering rules live here rather
//! than in the generator.
//!
//! ## Slot order
//!
//! ```text
//! [0]                 cross-unit sync controller base (installed when non-null)
//! [1..]               operator argument blocks, in operator order
//! [..]                event lock cells (notify cells, then wait cells, per operator)
//! [..]                dynamic triples: tiling key, block count, readiness lock
//! [..]                workspace pointer (optional)
//! [..]                profiling region pointer, task id (optional)
//! ```

use crate::{CoreError, KernelType, Result};
use serde::{Deserialize, Serialize};

/// ABI version of the slot contract
pub const ABI_VERSION: u32 = 1;

/// Slot 0 always carries the sync controller base address
pub const SYNC_CONTROLLER_SLOT: u32 = 0;

/// What a parameter slot holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotKind {
    SyncController,
    OperatorArgument { operator: String, name: String },
    NotifyLock { operator: String, event: u32 },
    WaitLock { operator: String, event: u32 },
    DynamicTilingKey { operator: String },
    DynamicBlockCount { operator: String },
    DynamicReadyLock { operator: String },
    Workspace,
    ProfilingRegion,
    TaskId,
}

impl SlotKind {
    /// Ordering class; slots of a lower class always precede higher ones
    pub fn class_rank(&self) -> u8 {
        match self {
            SlotKind::SyncController => 0,
            SlotKind::OperatorArgument { .. } => 1,
            SlotKind::NotifyLock { .. } | SlotKind::WaitLock { .. } => 2,
            SlotKind::DynamicTilingKey { .. }
            | SlotKind::DynamicBlockCount { .. }
            | SlotKind::DynamicReadyLock { .. } => 3,
            SlotKind::Workspace => 4,
            SlotKind::ProfilingRegion => 5,
            SlotKind::TaskId => 6,
        }
    }

    /// Whether the slot is a one-shot readiness cell
    pub fn is_lock(&self) -> bool {
        matches!(
            self,
            SlotKind::NotifyLock { .. } | SlotKind::WaitLock { .. } | SlotKind::DynamicReadyLock { .. }
        )
    }
}

/// Logical state of a lock slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    NotReady,
    Ready,
}

impl LockState {
    pub fn value(self) -> u64 {
        match self {
            LockState::NotReady => 0,
            LockState::Ready => 1,
        }
    }

    pub fn from_value(value: u64) -> Result<Self> {
        match value {
            0 => Ok(LockState::NotReady),
            1 => Ok(LockState::Ready),
            other => Err(CoreError::InvalidLockState(other)),
        }
    }
}

/// Runtime-resolved kernel class and block count of a dynamic operator
///
/// The switch code publishes both in one word: the class code in the high 32 bits and the
/// literal block count in the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedBlockCount {
    pub kernel_type: KernelType,
    pub block_count: u32,
}

impl PackedBlockCount {
    pub fn new(kernel_type: KernelType, block_count: u32) -> Self {
        Self {
            kernel_type,
            block_count,
        }
    }

    pub fn pack(self) -> u64 {
        (u64::from(self.kernel_type.code()) << 32) | u64::from(self.block_count)
    }

    /// Decode a packed word, rejecting class values that were never observed
    pub fn unpack(word: u64) -> Result<Self> {
        let kernel_type = KernelType::from_code(word >> 32)?;
        Ok(Self {
            kernel_type,
            block_count: (word & 0xFFFF_FFFF) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_version() {
        assert_eq!(ABI_VERSION, 1);
        assert_eq!(SYNC_CONTROLLER_SLOT, 0);
    }

    #[test]
    fn test_packed_block_count_layout() {
        let packed = PackedBlockCount::new(KernelType::AicOnly, 48).pack();
        assert_eq!(packed, (1u64 << 32) | 48);

        let decoded = PackedBlockCount::unpack(packed).unwrap();
        assert_eq!(decoded.kernel_type, KernelType::AicOnly);
        assert_eq!(decoded.block_count, 48);
    }

    #[test]
    fn test_unpack_rejects_unseen_class() {
        let word = (3u64 << 32) | 8;
        assert_eq!(
            PackedBlockCount::unpack(word),
            Err(CoreError::UnsupportedKernelType { code: 3 })
        );
    }

    #[test]
    fn test_lock_states() {
        assert_eq!(LockState::from_value(1).unwrap(), LockState::Ready);
        assert_eq!(LockState::NotReady.value(), 0);
        assert!(LockState::from_value(2).is_err());
    }

    #[test]
    fn test_slot_class_order() {
        let lock = SlotKind::WaitLock {
            operator: "a".into(),
            event: 1,
        };
        let key = SlotKind::DynamicTilingKey { operator: "b".into() };
        assert!(lock.class_rank() < key.class_rank());
        assert!(SlotKind::Workspace.class_rank() < SlotKind::ProfilingRegion.class_rank());
        assert!(lock.is_lock());
        assert!(!key.is_lock());
    }
}
