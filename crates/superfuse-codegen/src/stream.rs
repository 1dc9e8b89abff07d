//! Two-stream scheduler
//!
//! A request whose operators switch streams without a connecting event is split into one
//! function per domain. Each domain runs every operator that has work on it, in request order;
//! order across the two functions comes only from cross-domain signals on the fixed stream
//! flags, which the hardware consumes first-in first-out.
//!
//! Before any step is emitted the cross-domain edges are thinned out:
//!
//! 1. an edge whose receiver is already ordered behind a later sender of the same pair is dropped
//! 2. a sender keeps only the edge to its earliest receiver per pair
//! 3. a receiver keeps only the edge from its latest sender per pair
//!
//! What remains never crosses, so the signal order of each direction equals its wait order.

use crate::context::LaunchContext;
use crate::emit::CodeWriter;
use crate::error::{CodegenError, Result};
use crate::events::event_domain;
use crate::graph::{DomainPair, EdgeId, OperatorId};
use crate::options::PreloadMode;
use crate::primitives::{CrossFlag, Pipe};
use crate::render::Renderer;
use crate::schedule::{Barrier, Step};
use std::collections::{BTreeMap, BTreeSet};
use superfuse_core::{Domain, DomainAffinity, ProfilingEventKind};
use tracing::debug;

const CONTINUOUS_EVENT_REASON: &str = "reason3: for continues notify/wait event";

pub struct StreamPlan<'c, 'a> {
    ctx: &'c LaunchContext<'a>,
    cube: Vec<OperatorId>,
    vector: Vec<OperatorId>,
    /// Kept sync edges per operator, by producer
    sends: Vec<Vec<EdgeId>>,
    /// Kept sync edges per operator, by consumer
    recvs: Vec<Vec<EdgeId>>,
    /// Last operator of each stream
    stream_last: BTreeSet<OperatorId>,
}

impl<'c, 'a> StreamPlan<'c, 'a> {
    pub fn new(ctx: &'c LaunchContext<'a>) -> Result<Self> {
        if let Some(node) = ctx.graph.nodes().iter().find(|n| n.is_dynamic()) {
            return Err(CodegenError::operator(
                &node.name,
                "dynamic operators are not supported in two-stream schedules",
            ));
        }
        let members = |domain: Domain| {
            ctx.ids()
                .filter(|&id| ctx.node(id).affinity().contains(domain))
                .collect::<Vec<_>>()
        };
        let mut last_by_stream = BTreeMap::new();
        for id in ctx.ids() {
            last_by_stream.insert(ctx.node(id).stream, id);
        }

        let mut plan = Self {
            ctx,
            cube: members(Domain::Cube),
            vector: members(Domain::Vector),
            sends: vec![Vec::new(); ctx.graph.len()],
            recvs: vec![Vec::new(); ctx.graph.len()],
            stream_last: last_by_stream.into_values().collect(),
        };

        let live = plan.reduce();
        for edge in ctx.graph.edges() {
            if edge.requires_explicit_sync && (!edge.pair.is_cross() || live.contains(&edge.id)) {
                plan.sends[edge.producer.0].push(edge.id);
                plan.recvs[edge.consumer.0].push(edge.id);
            }
        }
        Ok(plan)
    }

    pub fn list(&self, domain: Domain) -> &[OperatorId] {
        match domain {
            Domain::Cube => &self.cube,
            Domain::Vector => &self.vector,
        }
    }

    fn position(&self, domain: Domain, op: OperatorId) -> usize {
        self.list(domain).iter().position(|&o| o == op).unwrap_or(usize::MAX)
    }

    /// Cross-domain sync edges left after the three reductions
    fn reduce(&self) -> BTreeSet<EdgeId> {
        let graph = self.ctx.graph;
        let mut live: BTreeSet<EdgeId> = graph
            .edges()
            .iter()
            .filter(|e| e.requires_explicit_sync && e.pair.is_cross())
            .map(|e| e.id)
            .collect();
        let total = live.len();

        let crossed: Vec<EdgeId> = live
            .iter()
            .copied()
            .filter(|&id| {
                let e = graph.edge(id);
                let (from, to) = (e.pair.producer(), e.pair.consumer());
                live.iter().any(|&other| {
                    let o = graph.edge(other);
                    o.pair == e.pair
                        && self.position(to, o.consumer) < self.position(to, e.consumer)
                        && self.position(from, o.producer) > self.position(from, e.producer)
                })
            })
            .collect();
        for id in &crossed {
            live.remove(id);
        }

        let mut earliest: BTreeMap<(OperatorId, DomainPair), EdgeId> = BTreeMap::new();
        for &id in &live {
            let e = graph.edge(id);
            let to = e.pair.consumer();
            earliest
                .entry((e.producer, e.pair))
                .and_modify(|kept| {
                    if self.position(to, e.consumer) < self.position(to, graph.edge(*kept).consumer) {
                        *kept = id;
                    }
                })
                .or_insert(id);
        }
        live = earliest.into_values().collect();

        let mut latest: BTreeMap<(OperatorId, DomainPair), EdgeId> = BTreeMap::new();
        for &id in &live {
            let e = graph.edge(id);
            let from = e.pair.producer();
            latest
                .entry((e.consumer, e.pair))
                .and_modify(|kept| {
                    if self.position(from, e.producer) > self.position(from, graph.edge(*kept).producer) {
                        *kept = id;
                    }
                })
                .or_insert(id);
        }
        live = latest.into_values().collect();

        debug!(total, crossed = crossed.len(), kept = live.len(), "two-stream edge reduction");
        live
    }

    /// Domain an operator's external notify is raised from
    ///
    /// A mixed operator followed by a cube-only one notifies from the cube side, after the
    /// handoff edge has ordered its vector half before it.
    fn notify_domain(&self, op: OperatorId) -> Domain {
        let node = self.ctx.node(op);
        let next = OperatorId(op.0 + 1);
        if node.affinity() == DomainAffinity::Mixed
            && next.0 < self.ctx.graph.len()
            && self.ctx.node(next).affinity() == DomainAffinity::CubeOnly
        {
            return Domain::Cube;
        }
        event_domain(node)
    }

    fn notifies(&self, op: OperatorId, arch: Domain) -> bool {
        !self.ctx.events.external_sends(op).is_empty() && self.notify_domain(op) == arch
    }

    fn waits(&self, op: OperatorId, arch: Domain) -> bool {
        !self.ctx.events.external_recvs(op).is_empty() && event_domain(self.ctx.node(op)) == arch
    }

    /// Step list of the function running on `arch`
    pub fn steps(&self, arch: Domain) -> Vec<Step> {
        let ctx = self.ctx;
        let list = self.list(arch);
        let mut steps = Vec::new();
        if ctx.options.preload == PreloadMode::Whole {
            steps.push(Step::PreloadWhole);
        }

        for (position, &op) in list.iter().enumerate() {
            let prev = position.checked_sub(1).map(|p| list[p]);
            let next = list.get(position + 1).copied();
            let node = ctx.node(op);
            debug!(operator = %node.name, arch = arch.arch(), "scheduling operator");

            steps.push(Step::Comment(format!("//begin func call of sub operator {}", node.name)));
            if ctx.options.preload == PreloadMode::PerFunc {
                if prev.is_none() {
                    steps.push(Step::Preload { op });
                }
                if let Some(next) = next {
                    steps.push(Step::Preload { op: next });
                }
            }
            self.boundary(&mut steps, prev, op, arch);
            if ctx.options.feed_sync_all {
                steps.push(Step::FeedSyncInit { op });
            }

            let event = op.0 as u32 + 1;
            if ctx.options.profiling {
                steps.push(Step::Profile {
                    event,
                    kind: ProfilingEventKind::SubOperator,
                    start: true,
                });
            }
            steps.push(Step::Invoke { op });
            if ctx.options.debug_dcci_all {
                steps.push(Step::Comment("// op end debug dcci all.".to_string()));
                steps.push(Step::CacheFlushAll);
            }
            if ctx.options.debug_sync_all {
                steps.push(Step::Comment("// op end debug sync all.".to_string()));
                steps.push(Step::PipeAll);
                steps.push(Step::Barrier(Barrier::domain(arch)));
            }
            if ctx.options.profiling {
                steps.push(Step::Profile {
                    event,
                    kind: ProfilingEventKind::SubOperator,
                    start: false,
                });
            }

            if next.is_none() {
                steps.extend(self.send_steps(op, arch));
                if self.notifies(op, arch) {
                    steps.push(Step::Notify { op });
                }
            }
        }
        steps
    }

    fn boundary(&self, steps: &mut Vec<Step>, prev: Option<OperatorId>, cur: OperatorId, arch: Domain) {
        let node = self.ctx.node(cur);
        if let Some(prev) = prev {
            steps.extend(self.send_steps(prev, arch));
        }
        steps.extend(self.recv_steps(cur, arch));
        if let Some(prev) = prev.filter(|&p| self.notifies(p, arch)) {
            steps.push(Step::Notify { op: prev });
        }
        if node.recv_events.is_empty() {
            return;
        }

        if self.waits(cur, arch) {
            steps.push(Step::EventWait { op: cur });
        }
        steps.push(Step::Comment(
            "// two stream when has wait event, add sync by current operator kernel type".to_string(),
        ));
        match node.affinity() {
            DomainAffinity::Mixed => steps.push(Step::Barrier(Barrier::full(CONTINUOUS_EVENT_REASON))),
            affinity => {
                steps.push(Step::Comment(format!("// {CONTINUOUS_EVENT_REASON}")));
                steps.push(Step::Barrier(Barrier::domain(affinity.primary())));
            }
        }
    }

    /// Rules 1 and 3.1 behind `op` on `arch`
    fn send_steps(&self, op: OperatorId, arch: Domain) -> Vec<Step> {
        let ctx = self.ctx;
        if ctx.is_last(op) {
            return Vec::new();
        }
        let graph = ctx.graph;
        let node = ctx.node(op);
        let sends = &self.sends[op.0];
        let external = !ctx.events.external_sends(op).is_empty();
        let touches = sends.iter().any(|&id| {
            let pair = graph.edge(id).pair;
            pair.producer() == arch || pair.consumer() == arch
        });

        let mut steps = Vec::new();
        if touches || (external && self.stream_last.contains(&op)) {
            let name = arch.arch();
            let info = sends
                .iter()
                .map(|&id| {
                    let edge = graph.edge(id);
                    format!("{}->{}", edge.pair, ctx.node(edge.consumer).name)
                })
                .collect::<Vec<_>>()
                .join(" ");
            steps.push(Step::Comment(format!(
                "// Rule 1 : sync all {name} must be insert behind each {name} sub operator, when has real send info"
            )));
            steps.push(Step::Comment(format!(
                "// sync all C->C|V->V kernel_name:{}, send_info:[{info}]",
                node.name
            )));
            steps.push(Step::Barrier(Barrier::domain(arch)));

            for &id in sends {
                let edge = graph.edge(id);
                if !edge.pair.is_cross() || edge.pair.producer() != arch {
                    continue;
                }
                steps.push(Step::Comment(format!(
                    "// Rule 3.1 : send sync of {} from {} to {}",
                    edge.pair,
                    node.name,
                    ctx.node(edge.consumer).name
                )));
                steps.push(Step::Signal {
                    edge: id,
                    producer: arch,
                    pipe: Pipe::Mte3,
                    flag: CrossFlag::stream_flag(arch),
                });
            }
        } else if sends.is_empty() && self.list(arch).last() != Some(&op) {
            steps.push(Step::Comment("// insert pipe all for ops".to_string()));
            steps.push(Step::PipeAll);
        }
        steps
    }

    /// Rule 3.2 before `op` on `arch`
    fn recv_steps(&self, op: OperatorId, arch: Domain) -> Vec<Step> {
        let ctx = self.ctx;
        let mut steps = Vec::new();
        for &id in &self.recvs[op.0] {
            let edge = ctx.graph.edge(id);
            if !edge.pair.is_cross() || edge.pair.consumer() != arch {
                continue;
            }
            steps.push(Step::Comment(format!(
                "// Rule 3.2 : receive sync of {} from {} to {}",
                edge.pair,
                ctx.node(edge.producer).name,
                ctx.node(op).name
            )));
            steps.push(Step::Wait {
                edge: id,
                consumer: arch,
                flag: CrossFlag::stream_flag(edge.pair.producer()),
            });
        }
        steps
    }
}

pub fn arch_function_name(kernel_name: &str, arch: Domain) -> String {
    format!("auto_gen_{kernel_name}_kernel_{}", arch.arch())
}

/// Device function holding the step list of one domain
pub fn render_arch_function(ctx: &LaunchContext<'_>, arch: Domain, steps: &[Step]) -> String {
    let mut w = CodeWriter::new();
    w.open(format!(
        "__aicore__ inline void {}(void)",
        arch_function_name(ctx.kernel_name, arch)
    ));
    w.line("GM_ADDR *param_base = (GM_ADDR *)get_para_base();");
    Renderer::for_arch(ctx, arch).render(&mut w, steps);
    w.close();
    w.blank();
    w.finish()
}

/// Entry-point dispatch into the per-domain functions, cube first
pub fn render_arch_calls(w: &mut CodeWriter, ctx: &LaunchContext<'_>, arches: &[Domain]) {
    for &arch in arches {
        w.open(format!("if {}", arch.guard()));
        w.line(format!("{}();", arch_function_name(ctx.kernel_name, arch)));
        w.close();
    }
}
