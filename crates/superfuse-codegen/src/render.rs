//! Step renderer
//!
//! Turns a verified step list into device statements. A renderer bound to an arch (two-stream
//! per-domain functions) drops guards for its own domain and skips work of the other one.

use crate::context::LaunchContext;
use crate::dispatch::{render_guarded, variant_symbols, GuardedCall};
use crate::dynamic;
use crate::emit::CodeWriter;
use crate::events::{event_domain, render_clear_wait_locks, render_event_block, EventDirection};
use crate::graph::{OperatorId, OperatorNode};
use crate::primitives::{
    cross_signal, cross_wait, domain_barrier, full_barrier, preload_whole, DCCI_ALL, PIPE_ALL_BARRIER,
};
use crate::profiling::record_call;
use crate::schedule::{Barrier, BarrierScope, Step};
use crate::scheduler::{render_early_start, render_static_preload, EarlyStartSide};
use superfuse_core::{Domain, FEED_SYNC_ALL_CONFIG_STRIDE, WHOLE_KERNEL_PRELOAD_UNITS};

const INSTRUCTION_CACHE_EPILOGUE: &str = "#if defined(__DAV_C310__) || defined(__DAV_310R6__) || (__NPU_ARCH__ == 5102)
    pipe_barrier(PIPE_ALL);
    dsb(mem_dsb_t::DSB_ALL);
    dci();
#endif
";

pub struct Renderer<'c, 'a> {
    ctx: &'c LaunchContext<'a>,
    arch: Option<Domain>,
}

impl<'c, 'a> Renderer<'c, 'a> {
    pub fn new(ctx: &'c LaunchContext<'a>) -> Self {
        Self { ctx, arch: None }
    }

    /// Renderer for the body of one per-domain function
    pub fn for_arch(ctx: &'c LaunchContext<'a>, arch: Domain) -> Self {
        Self { ctx, arch: Some(arch) }
    }

    pub fn render(&self, w: &mut CodeWriter, steps: &[Step]) {
        for step in steps {
            self.step(w, step);
        }
    }

    fn guarded(&self, w: &mut CodeWriter, domain: Domain, body: impl FnOnce(&mut CodeWriter)) {
        match self.arch {
            Some(arch) if arch == domain => body(w),
            Some(_) => {}
            None => {
                w.open(format!("if {}", domain.guard()));
                body(w);
                w.close();
            }
        }
    }

    pub fn barrier(&self, w: &mut CodeWriter, barrier: &Barrier) {
        match barrier.scope {
            BarrierScope::Full => {
                w.line(full_barrier(barrier.reason.as_deref()));
            }
            BarrierScope::Domain(domain) => {
                if let Some(reason) = &barrier.reason {
                    w.line(format!("// {reason}"));
                }
                self.guarded(w, domain, |w| {
                    w.lines(domain_barrier(domain));
                });
            }
        }
    }

    fn step(&self, w: &mut CodeWriter, step: &Step) {
        let ctx = self.ctx;
        match step {
            Step::Comment(text) => {
                w.line(text);
            }
            Step::PipeAll => {
                w.line(PIPE_ALL_BARRIER);
            }
            Step::Barrier(barrier) => self.barrier(w, barrier),
            Step::Signal { producer, pipe, flag, .. } => {
                self.guarded(w, *producer, |w| {
                    w.line(cross_signal(*pipe, *flag));
                });
            }
            Step::Wait { consumer, flag, .. } => {
                self.guarded(w, *consumer, |w| {
                    w.line(cross_wait(*flag));
                });
            }
            Step::PreloadWhole => {
                w.line(preload_whole(WHOLE_KERNEL_PRELOAD_UNITS));
            }
            Step::Preload { op } => {
                let node = ctx.node(*op);
                if node.is_dynamic() {
                    dynamic::render_preload(w, node, self.arch);
                } else {
                    render_static_preload(w, node, self.arch);
                }
            }
            Step::EarlyStartSet { op } => render_early_start(w, ctx.node(*op), EarlyStartSide::Set),
            Step::EarlyStartConfig { config } => {
                w.line(format!("g_super_kernel_early_start_config = {config};"));
            }
            Step::EarlyStartWait { op, config } => {
                render_early_start(w, ctx.node(*op), EarlyStartSide::Wait { config: *config })
            }
            Step::Notify { op } => self.event(w, *op, EventDirection::Notify),
            Step::EventWait { op } => self.event(w, *op, EventDirection::Wait),
            Step::DynamicResolve { op } => {
                if let Some(slots) = ctx.layout.operator(*op).dynamic {
                    dynamic::render_resolve(w, ctx.node(*op), slots);
                }
            }
            Step::FeedSyncInit { op } => self.feed_sync_init(w, *op),
            Step::Profile { event, kind, start } => {
                w.line(record_call(*event, *kind, *start));
            }
            Step::Invoke { op } => self.invoke(w, *op),
            Step::LockReset { op } => {
                if let Some(slots) = ctx.layout.operator(*op).dynamic {
                    dynamic::render_lock_reset(w, ctx.node(*op), slots);
                }
            }
            Step::CacheFlushAll => {
                w.line(DCCI_ALL);
            }
            Step::ClearWaitLocks => {
                let locks = ctx
                    .ids()
                    .map(|id| (ctx.node(id), ctx.layout.operator(id).wait.as_slice()));
                render_clear_wait_locks(w, locks);
            }
            Step::InstructionCacheEpilogue => {
                w.block(INSTRUCTION_CACHE_EPILOGUE);
            }
        }
    }

    fn event(&self, w: &mut CodeWriter, op: OperatorId, direction: EventDirection) {
        let slots = self.ctx.layout.operator(op);
        let locks = match direction {
            EventDirection::Notify => &slots.notify,
            EventDirection::Wait => &slots.wait,
        };
        let node = self.ctx.node(op);
        let domain = self.arch.unwrap_or_else(|| event_domain(node));
        render_event_block(w, node, domain, direction, locks, self.ctx.options.profiling);
    }

    fn feed_sync_init(&self, w: &mut CodeWriter, op: OperatorId) {
        if !self.ctx.feeds_sync_all(op) {
            w.line("AscendC::g_superKernelAutoSyncAllEnable = false;");
            return;
        }
        let index = op.0;
        let total = self.ctx.summary.operator_count;
        w.line("AscendC::g_superKernelAutoSyncAllSyncIdx = 0;");
        w.line("AscendC::g_superKernelAutoSyncAllEnable = true;");
        self.guarded(w, Domain::Cube, |w| {
            w.line(format!(
                "AscendC::g_superKernelAutoSyncAllConfigGmAddr = AscendC::g_superKernelAutoSyncAllConfigGmBaseAddr + \
                 {index} * {FEED_SYNC_ALL_CONFIG_STRIDE};"
            ));
        });
        self.guarded(w, Domain::Vector, |w| {
            w.line(format!(
                "AscendC::g_superKernelAutoSyncAllConfigGmAddr = AscendC::g_superKernelAutoSyncAllConfigGmBaseAddr + \
                 {total} * {FEED_SYNC_ALL_CONFIG_STRIDE} + {index} * {FEED_SYNC_ALL_CONFIG_STRIDE};"
            ));
        });
    }

    fn invoke(&self, w: &mut CodeWriter, op: OperatorId) {
        let node = self.ctx.node(op);
        let args_offset = self.ctx.layout.operator(op).args_offset;
        let (before, after) = cache_lines(node);

        if node.is_dynamic() {
            dynamic::render_invoke(w, node, args_offset, &before, &after);
            return;
        }

        let feed = self.ctx.feeds_sync_all(op);
        for &domain in node.affinity().domains() {
            if self.arch.is_some_and(|arch| arch != domain) {
                continue;
            }
            let Some(base) = node.functions.get(domain) else { continue };
            let variants = variant_symbols(base, node.split)
                .into_iter()
                .map(|symbol| format!("{symbol}({args_offset});"))
                .collect();
            let mut call = GuardedCall::new(
                domain,
                node.kernel_type.block_index_fn(domain),
                node.block_count,
                variants,
            );
            call.before = before.clone();
            call.after = after.clone();
            if feed {
                call.variant_tail = Some("AscendC::SuperKernelAutoSyncAllEndImpl();".to_string());
                call.complement = Some("AscendC::SuperKernelAutoSyncAllComplementImpl();".to_string());
            }
            render_guarded(w, &call, self.arch);
        }
    }
}

fn cache_lines(node: &OperatorNode) -> (Vec<String>, Vec<String>) {
    let flush = |label: &str| vec![format!("// option: {label}"), DCCI_ALL.to_string(), String::new()];
    let before = if node.cache.before { flush("dcci-before-kernel-start") } else { Vec::new() };
    let after = if node.cache.after { flush("dcci-after-kernel-end") } else { Vec::new() };
    (before, after)
}
