//! Fused-kernel summary
//!
//! Folds the per-operator kernel types and block counts into the launch-level kernel type and
//! block dimension, and collects the request-wide switches (dump, feed-sync workspace) that
//! shape the entry prologue.

use crate::graph::OperatorNode;
use serde::Serialize;
use superfuse_core::{
    Domain, DomainAffinity, KernelType, DUMP_BYTES_PER_UNIT, FEED_SYNC_ALL_BASE_BYTES, FEED_SYNC_ALL_BYTES_PER_OP,
};

/// Launch-level view of a fusion request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusionSummary {
    pub kernel_type: KernelType,
    pub block_dim: u32,
    pub max_cube_blocks: u32,
    pub max_vector_blocks: u32,
    /// Some operator carries timestamp/printf/assert instrumentation
    pub dump: bool,
    /// Union of the operators' debug options, in first-seen order
    pub debug_options: Vec<String>,
    pub debug_buf_size: u64,
    /// Auto sync-all configuration workspace; 0 when feed-sync-all is off
    pub feed_sync_bytes: u64,
    pub operator_count: usize,
}

impl FusionSummary {
    pub fn new(nodes: &[OperatorNode], feed_sync_all: bool) -> Self {
        let mut flags = 0u32;
        let (mut max_cube, mut max_vector) = (0u32, 0u32);
        let mut dump = false;
        let mut debug_options: Vec<String> = Vec::new();
        let mut debug_buf_size = 0u64;

        for node in nodes {
            flags |= node.kernel_type.summary_flag();
            max_cube = max_cube.max(node.required_units(Domain::Cube));
            max_vector = max_vector.max(node.required_units(Domain::Vector));

            if node.dump {
                dump = true;
                debug_buf_size = debug_buf_size.max(node.debug_buf_size);
                for option in node.debug_options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
                    if !debug_options.iter().any(|seen| seen == option) {
                        debug_options.push(option.to_string());
                    }
                }
            }
        }

        let (kernel_type, block_dim) = resolve_kernel_type(flags, max_cube, max_vector);
        let feed_sync_bytes = if feed_sync_all {
            feed_sync_workspace_bytes(kernel_type, block_dim, nodes.len())
        } else {
            0
        };

        Self {
            kernel_type,
            block_dim,
            max_cube_blocks: max_cube,
            max_vector_blocks: max_vector,
            dump,
            debug_options,
            debug_buf_size,
            feed_sync_bytes,
            operator_count: nodes.len(),
        }
    }

    /// The entry point binds a workspace slot
    pub fn needs_workspace(&self) -> bool {
        self.dump || self.feed_sync_bytes > 0
    }

    /// Per-unit dump area handed to `InitDump`
    pub fn dump_size(&self) -> u64 {
        if self.debug_buf_size > 0 {
            self.debug_buf_size
        } else {
            DUMP_BYTES_PER_UNIT
        }
    }

    /// An operator that synchronizes internally needs the auto sync-all feed when it runs on
    /// fewer units than the launch provides
    pub fn needs_feed_sync_all(&self, node: &OperatorNode) -> bool {
        if !node.with_sync_all {
            return false;
        }
        if self.block_dim == node.block_count && self.kernel_type == node.kernel_type {
            return false;
        }
        match self.kernel_type {
            KernelType::MixAic1_0 | KernelType::MixAiv1_0 | KernelType::MixAic1_1 => node.block_count < self.block_dim,
            _ => match node.affinity() {
                DomainAffinity::VectorOnly => node.block_count < self.block_dim.saturating_mul(2),
                DomainAffinity::CubeOnly | DomainAffinity::Mixed => node.block_count < self.block_dim,
            },
        }
    }
}

/// Fold the OR-ed class flags into the launch kernel type and block dimension
pub fn resolve_kernel_type(flags: u32, max_cube: u32, max_vector: u32) -> (KernelType, u32) {
    match flags {
        0b1 | 0b100 | 0b101 => (KernelType::MixAiv1_0, max_vector),
        0b10 | 0b1000 | 0b1010 => (KernelType::MixAic1_0, max_cube),
        0b10000 => (KernelType::MixAic1_1, max_cube),
        _ if max_vector <= max_cube => (KernelType::MixAic1_1, max_cube),
        _ => (KernelType::MixAic1_2, max_cube.max(max_vector.div_ceil(2))),
    }
}

/// Smallest power-of-two multiple of the base size that leaves headroom for every operator
pub fn feed_sync_workspace_bytes(kernel_type: KernelType, block_dim: u32, operators: usize) -> u64 {
    let units = match kernel_type {
        KernelType::MixAic1_2 => u64::from(block_dim) * 2,
        _ => u64::from(block_dim),
    };
    let needed = operators as u64 * FEED_SYNC_ALL_BYTES_PER_OP;
    let mut size = FEED_SYNC_ALL_BASE_BYTES;
    while units * size <= needed {
        size *= 2;
    }
    units * size
}
