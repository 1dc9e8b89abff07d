//! Inter-operator events
//!
//! Operators may carry send/recv event ids. An id sent by one operator of the request and
//! received by a later one is an inner event and becomes a graph edge. Every other id is
//! external: it talks to a task outside the fused kernel through a lock slot, with
//! `NotifyFunc`/`WaitFunc` emitted in the operator's event domain.
//!
//! Event analysis also decides the schedule mode. Consecutive operators on different streams
//! must be connected by an event, or the request must opt into two-stream fusion.

use crate::emit::CodeWriter;
use crate::error::{CodegenError, Result};
use crate::graph::{DomainPair, EdgeOrigin, OperatorGraph, OperatorId, OperatorNode};
use crate::profiling::record_call;
use serde::Serialize;
use std::collections::BTreeSet;
use superfuse_core::{Domain, DomainAffinity, ProfilingEventKind};
use tracing::debug;

/// How operators are laid out across the two domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// One instruction stream; each operator runs after the previous one
    SingleStream,
    /// One function per domain; cross-domain order comes only from signals
    TwoStream,
}

/// An event id matched inside the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerEvent {
    pub event: u32,
    pub sender: OperatorId,
    pub receiver: OperatorId,
}

#[derive(Debug, Clone)]
pub struct EventPlan {
    mode: ScheduleMode,
    inner_ids: BTreeSet<u32>,
    inner: Vec<InnerEvent>,
    external_sends: Vec<Vec<u32>>,
    external_recvs: Vec<Vec<u32>>,
}

impl EventPlan {
    /// Classify every event id and pick the schedule mode
    pub fn analyze(nodes: &[OperatorNode], stream_fusion: bool) -> Result<Self> {
        let mut mode = ScheduleMode::SingleStream;

        for node in nodes {
            if let Some(id) = node.send_events.iter().find(|id| node.recv_events.contains(id)) {
                return Err(event_error(node, format!("sends and receives event {id}")));
            }
        }
        if let Some(first) = nodes.first() {
            if !first.recv_events.is_empty() {
                return Err(event_error(first, "the first operator must not wait on any event"));
            }
        }
        if let Some(last) = nodes.last() {
            if !last.send_events.is_empty() {
                return Err(event_error(last, "the last operator must not send any event"));
            }
        }

        for pair in nodes.windows(2) {
            let (former, node) = (&pair[0], &pair[1]);
            let connected = former.send_events.iter().any(|id| node.recv_events.contains(id));
            if former.stream == node.stream && connected {
                return Err(event_error(node, format!("is connected by an event to `{}` on the same stream", former.name)));
            }
            if former.stream != node.stream && !connected {
                if !stream_fusion {
                    return Err(event_error(
                        node,
                        format!(
                            "switches from stream {} to {} without a connecting event; set stream-fusion=1",
                            former.stream, node.stream
                        ),
                    ));
                }
                mode = ScheduleMode::TwoStream;
            }
        }

        let mut inner = Vec::new();
        let mut inner_ids = BTreeSet::new();
        for (i, sender) in nodes.iter().enumerate() {
            for (j, receiver) in nodes.iter().enumerate().skip(i + 1) {
                for &event in sender.send_events.iter().filter(|id| receiver.recv_events.contains(id)) {
                    if sender.stream == receiver.stream {
                        return Err(event_error(
                            receiver,
                            format!("inner event {event} from `{}` stays on one stream", sender.name),
                        ));
                    }
                    inner_ids.insert(event);
                    inner.push(InnerEvent {
                        event,
                        sender: OperatorId(i),
                        receiver: OperatorId(j),
                    });
                }
            }
        }

        let external = |ids: &[u32]| ids.iter().copied().filter(|id| !inner_ids.contains(id)).collect::<Vec<_>>();
        let external_sends = nodes.iter().map(|n| external(&n.send_events)).collect();
        let external_recvs = nodes.iter().map(|n| external(&n.recv_events)).collect();

        debug!(?mode, inner = ?inner_ids, "event analysis");
        Ok(Self {
            mode,
            inner_ids,
            inner,
            external_sends,
            external_recvs,
        })
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    pub fn is_inner(&self, event: u32) -> bool {
        self.inner_ids.contains(&event)
    }

    pub fn inner(&self) -> &[InnerEvent] {
        &self.inner
    }

    pub fn external_sends(&self, op: OperatorId) -> &[u32] {
        self.external_sends.get(op.0).map_or(&[], Vec::as_slice)
    }

    pub fn external_recvs(&self, op: OperatorId) -> &[u32] {
        self.external_recvs.get(op.0).map_or(&[], Vec::as_slice)
    }

    /// Add the program-order and inner-event edges to `graph`
    ///
    /// Two-stream schedules also get a handoff edge from a mixed operator with external sends to
    /// the next operator when that one runs on another stream and is not yet connected.
    pub fn connect(&self, graph: &mut OperatorGraph) -> Result<()> {
        let count = graph.len();
        for index in 1..count {
            let consumer = OperatorId(index);
            let producer = match self.mode {
                ScheduleMode::SingleStream => Some(OperatorId(index - 1)),
                ScheduleMode::TwoStream => {
                    let stream = graph.node(consumer).stream;
                    (0..index).rev().map(OperatorId).find(|&p| graph.node(p).stream == stream)
                }
            };
            let Some(producer) = producer else { continue };
            let hint = graph.node(consumer).unit_local;
            for pair in DomainPair::derive(graph.node(producer).kernel_type, graph.node(consumer).kernel_type) {
                graph.add_edge_with(producer, consumer, pair, EdgeOrigin::Sequence, hint)?;
            }
        }

        for inner in &self.inner {
            let pairs = DomainPair::derive(
                graph.node(inner.sender).kernel_type,
                graph.node(inner.receiver).kernel_type,
            );
            for pair in pairs {
                let exists = graph
                    .edges()
                    .iter()
                    .any(|e| e.producer == inner.sender && e.consumer == inner.receiver && e.pair == pair);
                if !exists {
                    graph.add_edge_with(inner.sender, inner.receiver, pair, EdgeOrigin::Event(inner.event), false)?;
                }
            }
        }

        if self.mode == ScheduleMode::TwoStream {
            for index in 1..count {
                let (producer, consumer) = (OperatorId(index - 1), OperatorId(index));
                let (p, c) = (graph.node(producer), graph.node(consumer));
                let hands_off = p.affinity() == DomainAffinity::Mixed
                    && !self.external_sends(producer).is_empty()
                    && p.stream != c.stream;
                if !hands_off || graph.outgoing(producer).any(|e| e.consumer == consumer) {
                    continue;
                }
                for pair in DomainPair::derive(p.kernel_type, c.kernel_type) {
                    graph.add_edge_with(producer, consumer, pair, EdgeOrigin::Handoff, false)?;
                }
            }
        }
        Ok(())
    }
}

fn event_error(node: &OperatorNode, reason: impl Into<String>) -> CodegenError {
    CodegenError::InvalidEvent {
        operator: node.name.clone(),
        reason: reason.into(),
    }
}

/// Domain whose block 0 signals, waits on and clears an operator's external lock cells
pub fn event_domain(node: &OperatorNode) -> Domain {
    match node.affinity() {
        DomainAffinity::CubeOnly => Domain::Cube,
        DomainAffinity::VectorOnly | DomainAffinity::Mixed => Domain::Vector,
    }
}

/// Device templates for the external event handshake
pub const NOTIFY_WAIT_FUNCS: &str = r#"
template<bool aic_flag>
__aicore__ inline void NotifyFunc(GM_ADDR notify_lock_addr)
{
    if constexpr (aic_flag) {
        if (get_block_idx() == 0) {
            __gm__ uint64_t* notifyLock = reinterpret_cast<__gm__ uint64_t*>(notify_lock_addr);
            *notifyLock = 1;
            dcci(notifyLock, 0, 2);
        }
    } else {
        if (AscendC::GetBlockIdx() == 0) {
            __gm__ uint64_t* notifyLock = reinterpret_cast<__gm__ uint64_t*>(notify_lock_addr);
            *notifyLock = 1;
            dcci(notifyLock, 0, 2);
        }
    }
}

template<bool aic_flag>
__aicore__ inline void WaitFunc(GM_ADDR wait_lock_addr)
{
    if constexpr (aic_flag) {
        __gm__ volatile uint64_t* waitLock = reinterpret_cast<__gm__ uint64_t*>(wait_lock_addr);
        if (get_block_idx() == 0) {
            dcci(waitLock, 0, 2);
            while(*waitLock != 1) {
                dcci(waitLock, 0, 2);
            }
        }
    } else {
        __gm__ volatile uint64_t* waitLock = reinterpret_cast<__gm__ uint64_t*>(wait_lock_addr);
        if (AscendC::GetBlockIdx() == 0) {
            dcci(waitLock, 0, 2);
            while(*waitLock != 1) {
                dcci(waitLock, 0, 2);
            }
        }
    }
}

"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    Notify,
    Wait,
}

/// Emit the external notify or wait block of one operator from `domain`; `locks` are
/// `(event, slot)` pairs
pub fn render_event_block(
    w: &mut CodeWriter,
    node: &OperatorNode,
    domain: Domain,
    direction: EventDirection,
    locks: &[(u32, u32)],
    profiling: bool,
) {
    if locks.is_empty() {
        return;
    }
    let aic_flag = domain == Domain::Cube;
    let (func, kind) = match direction {
        EventDirection::Notify => ("NotifyFunc", ProfilingEventKind::Notify),
        EventDirection::Wait => ("WaitFunc", ProfilingEventKind::Wait),
    };

    w.open(format!("if {}", domain.guard()));
    for &(event, slot) in locks {
        w.line(format!("// kernel={}, ev={event}, param_offset={slot}", node.name));
        if profiling {
            w.line(record_call(event, kind, true));
        }
        w.line(format!("{func}<{aic_flag}>(param_base[{slot}]);"));
        if profiling {
            w.line(record_call(event, kind, false));
        }
    }
    w.close();
}

/// Reset every external wait lock from block 0 of its operator's event domain
pub fn render_clear_wait_locks<'a>(
    w: &mut CodeWriter,
    locks: impl IntoIterator<Item = (&'a OperatorNode, &'a [(u32, u32)])>,
) {
    for (node, slots) in locks {
        if slots.is_empty() {
            continue;
        }
        let domain = event_domain(node);
        w.open(format!("if {}", domain.guard()));
        w.open(format!("if ({}() == 0)", node.kernel_type.block_index_fn(domain)));
        for &(_, slot) in slots {
            w.line(format!("*(reinterpret_cast<__gm__ uint64_t*>(param_base[{slot}])) = 0;"));
        }
        w.close();
        w.close();
    }
}
