//! Per-launch generation context
//!
//! Everything derived from one fusion request that the schedulers and the renderer share. It is
//! built once by the generator and passed by reference; nothing here is global.

use crate::abi::AbiLayout;
use crate::events::EventPlan;
use crate::graph::{OperatorGraph, OperatorId, OperatorNode};
use crate::options::FusionOptions;
use crate::summary::FusionSummary;

#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub kernel_name: &'a str,
    pub options: &'a FusionOptions,
    pub graph: &'a OperatorGraph,
    pub events: &'a EventPlan,
    pub layout: &'a AbiLayout,
    pub summary: &'a FusionSummary,
    /// Early start after mode resolution; two-stream schedules force it off
    pub early_start: bool,
}

impl<'a> LaunchContext<'a> {
    pub fn node(&self, id: OperatorId) -> &'a OperatorNode {
        self.graph.node(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = OperatorId> {
        (0..self.graph.len()).map(OperatorId)
    }

    pub fn is_last(&self, id: OperatorId) -> bool {
        id.0 + 1 == self.graph.len()
    }

    /// The operator is fed the auto sync-all configuration
    pub fn feeds_sync_all(&self, id: OperatorId) -> bool {
        self.options.feed_sync_all && self.summary.needs_feed_sync_all(self.node(id))
    }
}
