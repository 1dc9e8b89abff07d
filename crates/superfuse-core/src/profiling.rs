//! Profiling record format and per-unit ring model
//!
//! Instrumented fused kernels write fixed 16-byte records into one region per physical unit.
//! Each region starts with a header `{magic, write cursor, capacity}`; once the cursor reaches
//! the capacity, or the magic no longer matches, the unit stops recording for the rest of the
//! launch. Computation never waits on profiling.
//!
//! [`ProfilingRing`] mirrors the device-side helpers on the host so the fail-open behaviour
//! can be exercised without hardware.

use crate::Domain;
use serde::{Deserialize, Serialize};

/// Magic value stored at the start of every valid per-unit region
pub const PROFILING_MAGIC: u64 = 0xbdca_8756;

/// Size of one record in bytes
pub const PROFILING_RECORD_BYTES: u64 = 16;

/// Size of the global region header preceding the per-unit regions
pub const PROFILING_REGION_HEADER_BYTES: u64 = 64;

/// Byte offset of the per-unit region size inside the global header
pub const PROFILING_PER_UNIT_SIZE_OFFSET: u64 = 12;

/// Offset added to cube block indices so they never collide with vector sub-blocks
pub const CUBE_PROFILING_UNIT_OFFSET: u32 = 50;

/// Category of a profiling record (the value stored in bits 8..12)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfilingEventKind {
    /// The fused kernel as a whole
    Kernel,
    /// An outgoing event notification
    Notify,
    /// One sub-operator invocation
    SubOperator,
    /// An incoming event wait
    Wait,
}

impl ProfilingEventKind {
    pub fn code(self) -> u8 {
        match self {
            ProfilingEventKind::Kernel => 0x0,
            ProfilingEventKind::Notify => 0x4,
            ProfilingEventKind::SubOperator => 0x8,
            ProfilingEventKind::Wait => 0xC,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(ProfilingEventKind::Kernel),
            0x4 => Some(ProfilingEventKind::Notify),
            0x8 => Some(ProfilingEventKind::SubOperator),
            0xC => Some(ProfilingEventKind::Wait),
            _ => None,
        }
    }
}

/// One decoded profiling entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfilingRecord {
    /// First record of every unit: identifies the launch and the writing unit
    TaskHeader { task_id: u32, unit: u8, cycles: u64 },
    /// Start or stop mark of an instrumented region
    Event {
        event_id: u32,
        kind: ProfilingEventKind,
        stop: bool,
        cycles: u64,
    },
}

impl ProfilingRecord {
    /// Encode as the two little-endian words written by the device helpers
    pub fn encode(&self) -> [u8; 16] {
        let (tag, cycles) = match *self {
            ProfilingRecord::TaskHeader { task_id, unit, cycles } => {
                ((u64::from(task_id) << 32) | (u64::from(unit) << 8) | 0xff, cycles)
            }
            ProfilingRecord::Event {
                event_id,
                kind,
                stop,
                cycles,
            } => {
                let stop_bit = if stop { 1u64 << 12 } else { 0 };
                (
                    (u64::from(event_id) << 32) | stop_bit | ((u64::from(kind.code()) & 0xf) << 8),
                    cycles,
                )
            }
        };
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&tag.to_le_bytes());
        out[8..].copy_from_slice(&cycles.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; 16]) -> Option<Self> {
        let mut tag_bytes = [0u8; 8];
        let mut cycle_bytes = [0u8; 8];
        tag_bytes.copy_from_slice(&bytes[..8]);
        cycle_bytes.copy_from_slice(&bytes[8..]);
        let tag = u64::from_le_bytes(tag_bytes);
        let cycles = u64::from_le_bytes(cycle_bytes);

        if tag & 0xff == 0xff {
            return Some(ProfilingRecord::TaskHeader {
                task_id: (tag >> 32) as u32,
                unit: ((tag >> 8) & 0xff) as u8,
                cycles,
            });
        }
        let kind = ProfilingEventKind::from_code(((tag >> 8) & 0xf) as u8)?;
        Some(ProfilingRecord::Event {
            event_id: (tag >> 32) as u32,
            kind,
            stop: tag & (1 << 12) != 0,
            cycles,
        })
    }
}

/// Region index of a physical unit
///
/// Vector units are numbered by sub-block; cube units are shifted past them.
pub fn profiling_unit_index(domain: Domain, block_idx: u32, sub_block_dim: u32, sub_block_id: u32) -> u32 {
    match domain {
        Domain::Vector => block_idx * sub_block_dim + sub_block_id,
        Domain::Cube => block_idx + CUBE_PROFILING_UNIT_OFFSET,
    }
}

/// Host model of one unit's profiling region
#[derive(Debug, Clone)]
pub struct ProfilingRing {
    magic: u64,
    capacity_bytes: u64,
    cursor_bytes: u64,
    off: bool,
    records: Vec<ProfilingRecord>,
}

impl ProfilingRing {
    /// Region able to hold `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self::with_header(PROFILING_MAGIC, 0, capacity as u64 * PROFILING_RECORD_BYTES)
    }

    /// Region with an explicit header, as found in device memory
    pub fn with_header(magic: u64, cursor_bytes: u64, capacity_bytes: u64) -> Self {
        Self {
            magic,
            capacity_bytes,
            cursor_bytes,
            off: false,
            records: Vec::new(),
        }
    }

    fn area_is_valid(&self) -> bool {
        self.magic == PROFILING_MAGIC && self.cursor_bytes < self.capacity_bytes
    }

    /// Mirror of `InitProfiling`: validate the header and write the task record
    pub fn init(&mut self, task_id: u32, unit: u8, cycles: u64) {
        self.off = false;
        if !self.area_is_valid() {
            self.off = true;
            return;
        }
        self.push(ProfilingRecord::TaskHeader { task_id, unit, cycles });
    }

    /// Mirror of `RecordProfiling(index, type, start)`; returns whether the record was kept
    pub fn record(&mut self, event_id: u32, kind: ProfilingEventKind, start: bool, cycles: u64) -> bool {
        if self.off {
            return false;
        }
        self.push(ProfilingRecord::Event {
            event_id,
            kind,
            stop: !start,
            cycles,
        });
        true
    }

    fn push(&mut self, record: ProfilingRecord) {
        self.records.push(record);
        self.cursor_bytes += PROFILING_RECORD_BYTES;
        if !self.area_is_valid() {
            self.off = true;
        }
    }

    /// Whether the unit has permanently stopped recording
    pub fn is_disabled(&self) -> bool {
        self.off
    }

    pub fn records(&self) -> &[ProfilingRecord] {
        &self.records
    }
}
