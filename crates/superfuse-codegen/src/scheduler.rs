//! Single-stream scheduler
//!
//! Builds the step list of a single-stream fused kernel. Per operator, in order:
//!
//! 1. dynamic resolve (followed by a full barrier when the operator comes first)
//! 2. instruction preloads: this operator when nothing preloaded it yet, the next one ahead
//! 3. the boundary with the previous operator: sync rules, early-start handshake, events
//! 4. the profiled invocation
//! 5. the dynamic lock release and the debug barriers
//!
//! Preload and early-start blocks are also rendered here.

use crate::context::LaunchContext;
use crate::dispatch::{render_guarded, variant_symbols, GuardedCall};
use crate::emit::CodeWriter;
use crate::error::Result;
use crate::graph::{OperatorId, OperatorNode};
use crate::options::PreloadMode;
use crate::primitives::preload;
use crate::schedule::{Barrier, Step};
use crate::sync::RuleEngine;
use superfuse_core::{Domain, ProfilingEventKind, MAX_PRELOAD_TEXT_BYTES, PRELOAD_UNIT_BYTES};
use tracing::debug;

const FIRST_DYNAMIC_REASON: &str = "reason3: dynamic gen_switch_case_block when no pre op";
const DYNAMIC_RELEASE_REASON: &str = "reason4: all readers of the dynamic ready lock are done";
const CONTINUOUS_EVENT_REASON: &str = "// reason3: for continues notify/wait event";

pub struct SingleStreamScheduler<'c, 'a> {
    ctx: &'c LaunchContext<'a>,
    rules: RuleEngine<'a>,
    steps: Vec<Step>,
}

impl<'c, 'a> SingleStreamScheduler<'c, 'a> {
    pub fn new(ctx: &'c LaunchContext<'a>) -> Self {
        Self {
            ctx,
            rules: RuleEngine::new(ctx.graph, ctx.early_start),
            steps: Vec::new(),
        }
    }

    pub fn build(mut self) -> Result<Vec<Step>> {
        let ctx = self.ctx;
        if ctx.options.preload == PreloadMode::Whole {
            self.steps.push(Step::PreloadWhole);
        }
        if ctx.options.profiling {
            self.steps.push(Step::Profile {
                event: 0,
                kind: ProfilingEventKind::Kernel,
                start: true,
            });
        }

        let ids: Vec<OperatorId> = ctx.ids().collect();
        for (position, &op) in ids.iter().enumerate() {
            let prev = position.checked_sub(1).map(|p| ids[p]);
            let next = ids.get(position + 1).copied();
            self.operator(prev, op, next)?;
        }

        self.steps.push(Step::ClearWaitLocks);
        self.steps.push(Step::InstructionCacheEpilogue);
        if ctx.options.profiling {
            self.steps.push(Step::Profile {
                event: 0,
                kind: ProfilingEventKind::Kernel,
                start: false,
            });
        }
        Ok(self.steps)
    }

    fn operator(&mut self, prev: Option<OperatorId>, op: OperatorId, next: Option<OperatorId>) -> Result<()> {
        let ctx = self.ctx;
        let node = ctx.node(op);
        debug!(operator = %node.name, index = op.0, dynamic = node.is_dynamic(), "scheduling operator");

        self.steps
            .push(Step::Comment(format!("//begin func call of sub operator {}", node.name)));

        if node.is_dynamic() {
            self.steps.push(Step::DynamicResolve { op });
            if prev.is_none() {
                self.steps.push(Step::PipeAll);
                self.steps.push(Step::Barrier(Barrier::full(FIRST_DYNAMIC_REASON)));
            }
        }

        if ctx.options.preload == PreloadMode::PerFunc {
            if node.is_dynamic() || prev.is_none() {
                self.steps.push(Step::Preload { op });
            }
            if let Some(next) = next.filter(|&n| !ctx.node(n).is_dynamic()) {
                self.steps.push(Step::Preload { op: next });
            }
        }

        if let Some(prev) = prev {
            self.boundary(prev, op)?;
        }

        if ctx.options.feed_sync_all {
            self.steps.push(Step::FeedSyncInit { op });
        }

        let event = op.0 as u32 + 1;
        if ctx.options.profiling {
            self.steps.push(Step::Profile {
                event,
                kind: ProfilingEventKind::SubOperator,
                start: true,
            });
        }
        self.steps.push(Step::Invoke { op });

        if node.is_dynamic() {
            self.steps.push(Step::Barrier(Barrier::full(DYNAMIC_RELEASE_REASON)));
            self.steps.push(Step::LockReset { op });
        }
        if ctx.options.debug_dcci_all {
            self.steps.push(Step::Comment("// op end debug dcci all.".to_string()));
            self.steps.push(Step::CacheFlushAll);
        }
        if ctx.options.debug_sync_all {
            self.steps.push(Step::Comment("// op end debug sync all.".to_string()));
            self.steps.push(Step::Barrier(Barrier::covering(ctx.summary.kernel_type)));
        }
        if ctx.options.profiling {
            self.steps.push(Step::Profile {
                event,
                kind: ProfilingEventKind::SubOperator,
                start: false,
            });
        }
        Ok(())
    }

    /// Sync and external events between `prev` and `cur`
    fn boundary(&mut self, prev: OperatorId, cur: OperatorId) -> Result<()> {
        let ctx = self.ctx;
        let recvs = !ctx.events.external_recvs(cur).is_empty();
        let sends = !ctx.events.external_sends(prev).is_empty();

        if recvs && sends {
            self.inter_op_sync(prev, cur)?;
            self.steps.push(Step::Notify { op: prev });
            self.steps.push(Step::EventWait { op: cur });
            self.steps.push(Step::Comment(CONTINUOUS_EVENT_REASON.to_string()));
            self.steps.push(Step::Barrier(Barrier::covering(ctx.summary.kernel_type)));
        } else {
            if recvs {
                self.steps.push(Step::EventWait { op: cur });
            }
            self.inter_op_sync(prev, cur)?;
            if sends {
                self.steps.push(Step::Notify { op: prev });
            }
        }
        Ok(())
    }

    fn inter_op_sync(&mut self, prev: OperatorId, cur: OperatorId) -> Result<()> {
        if !self.ctx.early_start {
            let barrier = self.rules.inter_op_barrier();
            self.steps.extend(barrier);
            return Ok(());
        }

        let sends = self.rules.producer_side(prev, cur)?;
        self.steps.extend(sends);
        if self.rules.needs_boundary_sync(cur) {
            let config = early_start_config(self.ctx.node(prev), self.ctx.node(cur));
            self.steps.push(Step::EarlyStartSet { op: prev });
            self.steps.push(Step::EarlyStartConfig { config });
            self.steps.push(Step::EarlyStartWait { op: cur, config });
        }
        let waits = self.rules.consumer_side(cur)?;
        self.steps.extend(waits);
        Ok(())
    }
}

/// Handshake configuration: previous class in bits 2..4, current class in bits 0..2
pub fn early_start_config(prev: &OperatorNode, cur: &OperatorNode) -> u32 {
    (prev.kernel_type.early_start_class() << 2) | cur.kernel_type.early_start_class()
}

/// Preload units for an instruction footprint, capped at the cache size
pub fn preload_units(text_size: u64) -> u64 {
    text_size.min(MAX_PRELOAD_TEXT_BYTES).div_ceil(PRELOAD_UNIT_BYTES)
}

/// Preload every variant of a static operator on the units that will run it
pub fn render_static_preload(w: &mut CodeWriter, node: &OperatorNode, arch: Option<Domain>) {
    for &domain in node.affinity().domains() {
        let units = preload_units(node.text_size.get(domain));
        let Some(base) = node.functions.get(domain) else { continue };
        if units == 0 || arch.is_some_and(|a| a != domain) {
            continue;
        }
        let variants = variant_symbols(base, node.split)
            .iter()
            .map(|symbol| preload(symbol, units))
            .collect();
        let call = GuardedCall::new(
            domain,
            node.kernel_type.block_index_fn(domain),
            node.block_count,
            variants,
        );
        render_guarded(w, &call, arch);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStartSide {
    Set,
    Wait { config: u32 },
}

/// Early-start blocks of `node`, one per domain with its primary domain first
///
/// Units past the operator's block count (the complement) set or wait early when the operator
/// carries the matching flag; otherwise every unit of the domain does.
pub fn render_early_start(w: &mut CodeWriter, node: &OperatorNode, side: EarlyStartSide) {
    let primary = node.affinity().primary();
    for domain in [primary, primary.other()] {
        let flagged = match side {
            EarlyStartSide::Set => node.early_start.set,
            EarlyStartSide::Wait { .. } => node.early_start.wait,
        };
        let has_domain = node.affinity().contains(domain);
        let cond = if flagged && has_domain && !node.is_dynamic() {
            format!("{}() >= {}", node.kernel_type.block_index_fn(domain), node.block_count)
        } else {
            "true".to_string()
        };
        let body = match side {
            EarlyStartSide::Set if has_domain => "AscendC::SetNextTaskStart();".to_string(),
            EarlyStartSide::Set => match domain {
                Domain::Cube => "// AIV only, no complement early start set flag.".to_string(),
                Domain::Vector => "// AIC only, no complement early start set flag.".to_string(),
            },
            EarlyStartSide::Wait { config } => format!("AscendC::WaitPreTaskEndImpl<{config}>();"),
        };

        w.open(format!("if {}", domain.guard()));
        w.open(format!("if ({cond})"));
        w.line(body);
        w.close();
        w.close();
        w.blank();
    }
}
