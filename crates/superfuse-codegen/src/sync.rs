//! Synchronization rule engine
//!
//! Decides, per graph edge, which primitive realizes the dependency:
//!
//! | Rule | Edge | Realization |
//! |---|---|---|
//! | 1 | any sync edge, producer side | barrier over the producer's domain right after the producer, plus the consumer's domain for a mixed producer |
//! | 2 | any boundary while early start is disabled | full barrier over both domains |
//! | 3.1 | cross-domain edge, producer domain | signal on an allocated flag channel at the consumer's boundary |
//! | 3.2 | cross-domain edge, consumer side | wait on the same channel before the consumer |
//!
//! Edges whose `requires_explicit_sync` is false get nothing. When early start is disabled Rule 2
//! covers every edge and Rules 1 and 3 are not applied.
//!
//! [`verify`] re-walks a finished schedule and proves every edge is realized and every wait has
//! exactly one matching earlier signal. [`verify_streams`] does the same for the two per-domain
//! step lists of a two-stream schedule.

use crate::error::{CodegenError, Result};
use crate::graph::{Edge, EdgeId, OperatorGraph, OperatorId};
use crate::primitives::{CrossFlag, Pipe};
use crate::schedule::{Barrier, BarrierScope, Step};
use std::collections::BTreeMap;
use superfuse_core::{Domain, DomainAffinity, CROSS_DOMAIN_FLAG_BASE, CROSS_DOMAIN_FLAG_COUNT};
use tracing::debug;

pub const RULE2_REASON: &str = "reason2: inter op barrier when EarlyStartDisable";
pub const CHANNEL_OVERFLOW_REASON: &str = "reason5: more cross edges than free flags";

/// Pool of hardware flag ids for in-flight cross-domain edges
#[derive(Debug, Clone, Default)]
pub struct ChannelAllocator {
    live: BTreeMap<u8, EdgeId>,
}

impl ChannelAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest free channel, held until [`ChannelAllocator::release`]
    pub fn acquire(&mut self, edge: &Edge) -> Result<u8> {
        let channel = (CROSS_DOMAIN_FLAG_BASE..CROSS_DOMAIN_FLAG_BASE + CROSS_DOMAIN_FLAG_COUNT)
            .find(|ch| !self.live.contains_key(ch))
            .ok_or_else(|| CodegenError::ChannelExhausted { edge: edge.to_string() })?;
        self.live.insert(channel, edge.id);
        Ok(channel)
    }

    pub fn release(&mut self, channel: u8) -> Option<EdgeId> {
        self.live.remove(&channel)
    }

    pub fn in_flight(&self) -> usize {
        self.live.len()
    }
}

/// Applies the sync rules boundary by boundary
///
/// Rule 1 runs at the producer's own boundary. The Rule 3.1 signal of an edge is deferred to the
/// boundary right before its consumer, so a channel is held only across that one boundary and
/// any number of later consumers can share a producer. A boundary that needs more channels than
/// the pool holds covers its overflow edges with one full barrier.
#[derive(Debug)]
pub struct RuleEngine<'g> {
    graph: &'g OperatorGraph,
    early_start: bool,
    channels: ChannelAllocator,
    pending: BTreeMap<EdgeId, u8>,
}

impl<'g> RuleEngine<'g> {
    pub fn new(graph: &'g OperatorGraph, early_start: bool) -> Self {
        Self {
            graph,
            early_start,
            channels: ChannelAllocator::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Whether the boundary before `cur` needs the inter-operator barrier or handshake
    pub fn needs_boundary_sync(&self, cur: OperatorId) -> bool {
        let mut incoming = self.graph.incoming(cur).peekable();
        incoming.peek().is_none() || self.graph.incoming(cur).any(|e| e.requires_explicit_sync)
    }

    /// Rule 2
    pub fn inter_op_barrier(&self) -> Vec<Step> {
        vec![
            Step::Comment("// begin inter ops barrier".to_string()),
            Step::Barrier(Barrier::full(RULE2_REASON)),
        ]
    }

    /// Rule 1 for the edges leaving `pre`, then Rule 3.1 for the cross edges entering `cur`
    pub fn producer_side(&mut self, pre: OperatorId, cur: OperatorId) -> Result<Vec<Step>> {
        if !self.early_start {
            return Ok(Vec::new());
        }
        let graph = self.graph;
        let mut steps = Vec::new();
        let name = &graph.node(pre).name;

        // A mixed producer also guards the domain its consumer reads in, which stands in for the
        // same-domain half its pairs leave out.
        let affinity = graph.node(pre).affinity();
        for domain in Domain::ALL {
            if graph.outgoing(pre).any(|e| {
                e.requires_explicit_sync
                    && (e.pair.producer() == domain
                        || (affinity == DomainAffinity::Mixed && e.pair.consumer() == domain))
            }) {
                debug!(operator = %name, %domain, "rule 1 domain barrier");
                steps.push(Step::Barrier(Barrier {
                    scope: BarrierScope::Domain(domain),
                    reason: Some(format!("Rule 1 : sync all {} behind {name}", domain.arch())),
                }));
            }
        }

        let mut overflow = false;
        for edge in graph.incoming(cur).filter(|e| e.requires_explicit_sync && e.pair.is_cross()) {
            let channel = match self.channels.acquire(edge) {
                Ok(channel) => channel,
                Err(CodegenError::ChannelExhausted { .. }) => {
                    debug!(%edge, "no free channel, covering with a full barrier");
                    overflow = true;
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.pending.insert(edge.id, channel);
            debug!(%edge, channel, "rule 3.1 signal");
            steps.push(Step::Comment(format!("// Rule 3.1 : send {} of {edge} on flag {channel}", edge.pair)));
            steps.push(Step::Signal {
                edge: edge.id,
                producer: edge.pair.producer(),
                pipe: Pipe::draining(edge.pair.producer()),
                flag: CrossFlag::Channel(channel),
            });
        }
        if overflow {
            steps.push(Step::Barrier(Barrier::full(CHANNEL_OVERFLOW_REASON)));
        }
        Ok(steps)
    }

    /// Rule 3.2 for the edges entering `cur` that were signalled
    pub fn consumer_side(&mut self, cur: OperatorId) -> Result<Vec<Step>> {
        if !self.early_start {
            return Ok(Vec::new());
        }
        let graph = self.graph;
        let mut steps = Vec::new();
        for edge in graph.incoming(cur).filter(|e| e.requires_explicit_sync && e.pair.is_cross()) {
            let Some(channel) = self.pending.remove(&edge.id) else {
                continue;
            };
            self.channels.release(channel);
            debug!(%edge, channel, "rule 3.2 wait");
            steps.push(Step::Comment(format!("// Rule 3.2 : receive {} of {edge} on flag {channel}", edge.pair)));
            steps.push(Step::Wait {
                edge: edge.id,
                consumer: edge.pair.consumer(),
                flag: CrossFlag::Channel(channel),
            });
        }
        Ok(steps)
    }

    /// Signals raised but not yet consumed
    pub fn in_flight(&self) -> usize {
        self.channels.in_flight()
    }
}

/// Counts reported after a schedule verifies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub full_barriers: usize,
    pub domain_barriers: usize,
    pub signal_pairs: usize,
}

/// Prove every edge of `graph` is realized by `steps`
///
/// A sync edge is realized by exactly one signal and one wait between the producer's and the
/// consumer's invocation, or by a covering barrier in that interval. Channel use is simulated in
/// order: a signal on a live channel, a wait on a channel holding a different edge, and a signal
/// never consumed are all rejected.
pub fn verify(graph: &OperatorGraph, steps: &[Step]) -> Result<SyncStats> {
    let mut stats = SyncStats::default();
    let mut live: BTreeMap<CrossFlag, EdgeId> = BTreeMap::new();

    for step in steps {
        match step {
            Step::Barrier(barrier) => match barrier.scope {
                BarrierScope::Full => stats.full_barriers += 1,
                BarrierScope::Domain(_) => stats.domain_barriers += 1,
            },
            Step::Signal { edge, flag, .. } => {
                if let Some(holder) = live.insert(*flag, *edge) {
                    return Err(unmatched(
                        graph.edge(*edge),
                        format!("flag {flag} is still held by edge {}", graph.edge(holder)),
                    ));
                }
            }
            Step::Wait { edge, flag, .. } => match live.remove(flag) {
                Some(holder) if holder == *edge => stats.signal_pairs += 1,
                Some(holder) => {
                    return Err(unmatched(
                        graph.edge(*edge),
                        format!("flag {flag} carries edge {}", graph.edge(holder)),
                    ))
                }
                None => return Err(unmatched(graph.edge(*edge), format!("nothing signalled flag {flag}"))),
            },
            _ => {}
        }
    }
    if let Some((flag, edge)) = live.into_iter().next() {
        return Err(unmatched(graph.edge(edge), format!("signal on flag {flag} is never consumed")));
    }

    for edge in graph.edges() {
        let signals = positions(steps, |s| matches!(s, Step::Signal { edge: e, .. } if *e == edge.id));
        let waits = positions(steps, |s| matches!(s, Step::Wait { edge: e, .. } if *e == edge.id));

        if !edge.requires_explicit_sync {
            if !signals.is_empty() || !waits.is_empty() {
                return Err(unmatched(edge, "unit-local edge carries a signal"));
            }
            continue;
        }

        let producer = invoke_position(steps, edge.producer)?;
        let consumer = invoke_position(steps, edge.consumer)?;
        match (signals.as_slice(), waits.as_slice()) {
            ([s], [w]) if producer < *s && s < w && *w < consumer => {}
            ([_], [_]) => return Err(unmatched(edge, "signal and wait are out of order")),
            ([], []) => {
                let covered = steps[producer..consumer].iter().any(|step| match step {
                    Step::Barrier(b) => match b.scope {
                        BarrierScope::Full => true,
                        BarrierScope::Domain(d) => !edge.pair.is_cross() && d == edge.pair.producer(),
                    },
                    _ => false,
                });
                if !covered {
                    return Err(unmatched(edge, "no barrier or signal realizes the dependency"));
                }
            }
            _ => return Err(unmatched(edge, "expected exactly one signal and one wait")),
        }
    }
    Ok(stats)
}

/// Prove the per-domain step lists of a two-stream schedule realize every edge of `graph`
///
/// Both lists must hit the same number of full barriers. Signals use the fixed stream flag of
/// their producer and are consumed in the order they are raised, so the signal sequence of each
/// direction must equal its wait sequence. Reductions may drop a cross edge when another kept
/// edge of the same pair already orders its ends; coverage accepts such a transitive signal.
pub fn verify_streams(graph: &OperatorGraph, cube: &[Step], vector: &[Step]) -> Result<SyncStats> {
    let list = |domain: Domain| match domain {
        Domain::Cube => cube,
        Domain::Vector => vector,
    };
    let mut stats = SyncStats::default();
    for step in cube.iter().chain(vector) {
        if let Step::Barrier(barrier) = step {
            match barrier.scope {
                BarrierScope::Full => stats.full_barriers += 1,
                BarrierScope::Domain(_) => stats.domain_barriers += 1,
            }
        }
    }
    let full = |steps: &[Step]| steps.iter().filter(|s| s.is_full_barrier()).count();
    if full(cube) != full(vector) {
        return Err(CodegenError::malformed(format!(
            "cube stream reaches {} full barriers but vector stream reaches {}",
            full(cube),
            full(vector)
        )));
    }

    for producer in Domain::ALL {
        let expected = CrossFlag::stream_flag(producer);
        let mut signals = Vec::new();
        for step in list(producer) {
            if let Step::Signal { edge, flag, .. } = step {
                if *flag != expected {
                    return Err(unmatched(graph.edge(*edge), format!("signal on {flag} instead of {expected}")));
                }
                signals.push(*edge);
            }
        }
        let waits: Vec<EdgeId> = list(producer.other())
            .iter()
            .filter_map(|step| match step {
                Step::Wait { edge, flag, .. } if *flag == expected => Some(*edge),
                _ => None,
            })
            .collect();
        let mismatch = (0..signals.len().max(waits.len()))
            .filter(|&i| signals.get(i) != waits.get(i))
            .find_map(|i| signals.get(i).or(waits.get(i)));
        if let Some(&edge) = mismatch {
            return Err(unmatched(graph.edge(edge), "waits do not follow the signal order"));
        }
        stats.signal_pairs += signals.len();
    }

    let over = |domain: Domain| {
        move |step: &Step| match step {
            Step::Barrier(b) => b.scope == BarrierScope::Full || b.scope == BarrierScope::Domain(domain),
            _ => false,
        }
    };
    for edge in graph.edges().iter().filter(|e| e.requires_explicit_sync) {
        let (from, to) = (edge.pair.producer(), edge.pair.consumer());
        let (producer_steps, consumer_steps) = (list(from), list(to));
        let p = invoke_position(producer_steps, edge.producer)?;
        let c = invoke_position(consumer_steps, edge.consumer)?;
        let covered = if edge.pair.is_cross() {
            producer_steps.iter().enumerate().skip(p).any(|(i, step)| match step {
                Step::Signal { edge: kept, .. } if graph.edge(*kept).pair == edge.pair => {
                    producer_steps[p..i].iter().any(over(from))
                        && consumer_steps[..c]
                            .iter()
                            .any(|w| matches!(w, Step::Wait { edge: e, .. } if e == kept))
                }
                _ => false,
            })
        } else {
            p < c && producer_steps[p..c].iter().any(over(from))
        };
        if !covered {
            return Err(unmatched(edge, "no barrier or signal realizes the dependency"));
        }
    }
    Ok(stats)
}

fn positions(steps: &[Step], pred: impl Fn(&Step) -> bool) -> Vec<usize> {
    steps
        .iter()
        .enumerate()
        .filter(|(_, s)| pred(s))
        .map(|(i, _)| i)
        .collect()
}

pub(crate) fn invoke_position(steps: &[Step], op: OperatorId) -> Result<usize> {
    steps
        .iter()
        .position(|s| matches!(s, Step::Invoke { op: o } if *o == op))
        .ok_or_else(|| CodegenError::malformed(format!("operator {op} is never invoked")))
}

fn unmatched(edge: &Edge, reason: impl Into<String>) -> CodegenError {
    CodegenError::UnmatchedWait {
        edge: edge.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HardwareProfile;
    use crate::graph::tests::node;
    use crate::graph::DomainPair;
    use superfuse_core::KernelType;

    fn chain(kinds: &[KernelType]) -> OperatorGraph {
        let mut g = OperatorGraph::new(HardwareProfile::default());
        let ids: Vec<_> = kinds
            .iter()
            .enumerate()
            .map(|(i, kt)| g.add_operator(node(&format!("op{i}"), *kt, 8)).unwrap())
            .collect();
        for w in ids.windows(2) {
            for pair in DomainPair::derive(kinds[w[0].0], kinds[w[1].0]) {
                g.add_edge(w[0], w[1], pair).unwrap();
            }
        }
        g
    }

    #[test]
    fn test_allocator_hands_out_lowest_free() {
        let g = chain(&[KernelType::AivOnly, KernelType::AicOnly]);
        let edge = g.edge(EdgeId(0));
        let mut pool = ChannelAllocator::new();
        let first = pool.acquire(edge).unwrap();
        let second = pool.acquire(edge).unwrap();
        assert_eq!((first, second), (1, 2));
        pool.release(first);
        assert_eq!(pool.acquire(edge).unwrap(), 1);
    }

    #[test]
    fn test_allocator_exhaustion() {
        let g = chain(&[KernelType::AivOnly, KernelType::AicOnly]);
        let mut pool = ChannelAllocator::new();
        for _ in 0..CROSS_DOMAIN_FLAG_COUNT {
            pool.acquire(g.edge(EdgeId(0))).unwrap();
        }
        let err = pool.acquire(g.edge(EdgeId(0))).unwrap_err();
        assert!(matches!(err, CodegenError::ChannelExhausted { .. }));
    }

    #[test]
    fn test_vec_to_cube_uses_signal_pair() {
        let g = chain(&[KernelType::AivOnly, KernelType::AicOnly]);
        let mut engine = RuleEngine::new(&g, true);
        let send = engine.producer_side(OperatorId(0), OperatorId(1)).unwrap();
        assert!(matches!(
            send[0],
            Step::Barrier(Barrier { scope: BarrierScope::Domain(Domain::Vector), .. })
        ));
        assert!(send.iter().any(|s| matches!(s, Step::Signal { flag: CrossFlag::Channel(1), .. })));
        assert_eq!(engine.in_flight(), 1);
        let recv = engine.consumer_side(OperatorId(1)).unwrap();
        assert!(recv.iter().any(|s| matches!(s, Step::Wait { flag: CrossFlag::Channel(1), .. })));
        assert_eq!(engine.in_flight(), 0);
        assert!(!send.iter().chain(&recv).any(|s| matches!(s, Step::Barrier(b) if b.scope == BarrierScope::Full)));
    }

    #[test]
    fn test_mixed_producer_guards_consumer_domain() {
        let g = chain(&[KernelType::MixAic1_1, KernelType::AicOnly]);
        let mut engine = RuleEngine::new(&g, true);
        let send = engine.producer_side(OperatorId(0), OperatorId(1)).unwrap();
        let domains: Vec<Domain> = send
            .iter()
            .filter_map(|s| match s {
                Step::Barrier(Barrier { scope: BarrierScope::Domain(d), .. }) => Some(*d),
                _ => None,
            })
            .collect();
        assert_eq!(domains.len(), 2);
        assert!(domains.contains(&Domain::Cube) && domains.contains(&Domain::Vector));

        // A single-domain producer only guards its own domain.
        let g = chain(&[KernelType::AivOnly, KernelType::MixAic1_1]);
        let mut engine = RuleEngine::new(&g, true);
        let send = engine.producer_side(OperatorId(0), OperatorId(1)).unwrap();
        assert_eq!(
            send.iter()
                .filter(|s| matches!(s, Step::Barrier(Barrier { scope: BarrierScope::Domain(_), .. })))
                .count(),
            1
        );
    }

    fn fan(producers: usize, consumers: usize) -> OperatorGraph {
        let mut g = OperatorGraph::new(HardwareProfile::default());
        let vec: Vec<_> = (0..producers)
            .map(|i| g.add_operator(node(&format!("v{i}"), KernelType::AivOnly, 8)).unwrap())
            .collect();
        let cube: Vec<_> = (0..consumers)
            .map(|i| g.add_operator(node(&format!("c{i}"), KernelType::AicOnly, 8)).unwrap())
            .collect();
        for &p in &vec {
            for &c in &cube {
                g.add_edge(p, c, DomainPair::VecCube).unwrap();
            }
        }
        g
    }

    fn walk(g: &OperatorGraph, engine: &mut RuleEngine<'_>) -> (Vec<Step>, usize) {
        let mut steps = vec![Step::Invoke { op: OperatorId(0) }];
        let mut peak = 0;
        for i in 1..g.len() {
            steps.extend(engine.producer_side(OperatorId(i - 1), OperatorId(i)).unwrap());
            peak = peak.max(engine.in_flight());
            steps.extend(engine.consumer_side(OperatorId(i)).unwrap());
            steps.push(Step::Invoke { op: OperatorId(i) });
        }
        (steps, peak)
    }

    #[test]
    fn test_fan_out_holds_one_channel_per_boundary() {
        let g = fan(1, 10);
        let mut engine = RuleEngine::new(&g, true);
        let (steps, peak) = walk(&g, &mut engine);
        assert_eq!(peak, 1);
        let stats = verify(&g, &steps).unwrap();
        assert_eq!(stats.signal_pairs, 10);
        assert_eq!(stats.full_barriers, 0);
        assert_eq!(stats.domain_barriers, 1);
    }

    #[test]
    fn test_fan_in_overflow_falls_back_to_full_barrier() {
        let producers = usize::from(CROSS_DOMAIN_FLAG_COUNT) + 1;
        let g = fan(producers, 1);
        let mut engine = RuleEngine::new(&g, true);
        let (steps, _) = walk(&g, &mut engine);
        let stats = verify(&g, &steps).unwrap();
        assert_eq!(stats.signal_pairs, usize::from(CROSS_DOMAIN_FLAG_COUNT));
        assert_eq!(stats.full_barriers, 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn test_disabled_early_start_defers_to_rule_two() {
        let g = chain(&[KernelType::AivOnly, KernelType::AicOnly]);
        let mut engine = RuleEngine::new(&g, false);
        assert!(engine.producer_side(OperatorId(0), OperatorId(1)).unwrap().is_empty());
        assert!(engine.consumer_side(OperatorId(1)).unwrap().is_empty());
        assert!(matches!(engine.inter_op_barrier()[1], Step::Barrier(Barrier { scope: BarrierScope::Full, .. })));
    }

    #[test]
    fn test_verify_rejects_unrealized_edge() {
        let g = chain(&[KernelType::AivOnly, KernelType::AivOnly]);
        let steps = vec![Step::Invoke { op: OperatorId(0) }, Step::Invoke { op: OperatorId(1) }];
        assert!(matches!(verify(&g, &steps), Err(CodegenError::UnmatchedWait { .. })));

        let covered = vec![
            Step::Invoke { op: OperatorId(0) },
            Step::Barrier(Barrier {
                scope: BarrierScope::Domain(Domain::Vector),
                reason: None,
            }),
            Step::Invoke { op: OperatorId(1) },
        ];
        assert_eq!(verify(&g, &covered).unwrap().domain_barriers, 1);
    }

    #[test]
    fn test_verify_rejects_aliased_channel() {
        let g = chain(&[KernelType::MixAic1_1, KernelType::MixAic1_1]);
        let signal = |edge: usize| Step::Signal {
            edge: EdgeId(edge),
            producer: Domain::Cube,
            pipe: Pipe::Fix,
            flag: CrossFlag::Channel(1),
        };
        let steps = vec![Step::Invoke { op: OperatorId(0) }, signal(0), signal(1)];
        let err = verify(&g, &steps).unwrap_err();
        assert!(err.to_string().contains("still held"));
    }

    #[test]
    fn test_verify_rejects_wait_without_signal() {
        let g = chain(&[KernelType::AivOnly, KernelType::AicOnly]);
        let steps = vec![
            Step::Invoke { op: OperatorId(0) },
            Step::Wait {
                edge: EdgeId(0),
                consumer: Domain::Cube,
                flag: CrossFlag::Channel(2),
            },
            Step::Invoke { op: OperatorId(1) },
        ];
        assert!(verify(&g, &steps).unwrap_err().to_string().contains("nothing signalled"));
    }
}
