//! Hardware and layout constants of the fused-kernel target

/// Bytes per parameter-table slot
pub const PARAM_SLOT_BYTES: u32 = 8;

/// Default cube-domain unit count of the reference part
pub const DEFAULT_CUBE_UNITS: u32 = 24;

/// Default vector-domain unit count of the reference part
pub const DEFAULT_VECTOR_UNITS: u32 = 48;

/// Default entry-point alignment in bytes
pub const DEFAULT_FUNC_ALIGN: u32 = 512;

/// Default split factor applied to every operator
pub const DEFAULT_SPLIT_MODE: u32 = 4;

/// Largest accepted split factor
pub const MAX_SPLIT_MODE: u32 = 64;

/// Instruction preload granule in bytes
pub const PRELOAD_UNIT_BYTES: u64 = 2048;

/// Instruction bytes considered for one preload hint
pub const MAX_PRELOAD_TEXT_BYTES: u64 = 16384;

/// Preload size hint used for runtime-resolved vector addresses
pub const DYNAMIC_VECTOR_PRELOAD_UNITS: u32 = 8;

/// Preload size hint used for runtime-resolved cube addresses
pub const DYNAMIC_CUBE_PRELOAD_UNITS: u32 = 16;

/// Units passed to the whole-kernel preload
pub const WHOLE_KERNEL_PRELOAD_UNITS: u32 = 8;

/// First hardware flag id handed out to cross-domain edges
pub const CROSS_DOMAIN_FLAG_BASE: u8 = 1;

/// Number of hardware flag ids reserved for cross-domain edges
pub const CROSS_DOMAIN_FLAG_COUNT: u8 = 8;

/// Base workspace size of the auto sync-all feed, in bytes
pub const FEED_SYNC_ALL_BASE_BYTES: u64 = 512;

/// Bytes of auto sync-all configuration required per operator
pub const FEED_SYNC_ALL_BYTES_PER_OP: u64 = 128;

/// Stride between per-operator auto sync-all configuration blocks
pub const FEED_SYNC_ALL_CONFIG_STRIDE: u64 = 64;

/// Per-unit dump area used by timestamp and printf instrumentation (1 MiB)
pub const DUMP_BYTES_PER_UNIT: u64 = 1024 * 1024;

/// Error code carried by every option diagnostic
pub const OPTION_ERROR_CODE: &str = "EB0500";
