//! Schedule IR
//!
//! A schedule is the ordered list of steps one instruction stream executes. The schedulers build
//! it, [`crate::sync::verify`] and [`crate::dynamic::prove_single_writer`] check it, and
//! [`crate::render::Renderer`] turns it into device source. Keeping decisions and text apart
//! lets the checks run on exactly what gets emitted.

use crate::graph::{EdgeId, OperatorId};
use crate::primitives::{CrossFlag, Pipe};
use superfuse_core::{Domain, DomainAffinity, KernelType, ProfilingEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierScope {
    /// Every unit of both domains
    Full,
    /// Every unit of one domain
    Domain(Domain),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub scope: BarrierScope,
    /// Trailing comment of a full barrier, leading comment of a domain barrier
    pub reason: Option<String>,
}

impl Barrier {
    pub fn full(reason: impl Into<String>) -> Self {
        Self {
            scope: BarrierScope::Full,
            reason: Some(reason.into()),
        }
    }

    pub fn domain(domain: Domain) -> Self {
        Self {
            scope: BarrierScope::Domain(domain),
            reason: None,
        }
    }

    /// Barrier covering every unit a kernel of `kernel_type` runs on
    pub fn covering(kernel_type: KernelType) -> Self {
        match kernel_type.affinity() {
            DomainAffinity::Mixed => Self {
                scope: BarrierScope::Full,
                reason: None,
            },
            affinity => Self::domain(affinity.primary()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Verbatim comment line, including the leading `//`
    Comment(String),
    PipeAll,
    Barrier(Barrier),
    /// Cross-domain send realizing `edge`
    Signal {
        edge: EdgeId,
        producer: Domain,
        pipe: Pipe,
        flag: CrossFlag,
    },
    /// Cross-domain receive realizing `edge`
    Wait {
        edge: EdgeId,
        consumer: Domain,
        flag: CrossFlag,
    },
    PreloadWhole,
    Preload {
        op: OperatorId,
    },
    /// Let the next task start on units `op` leaves idle
    EarlyStartSet {
        op: OperatorId,
    },
    EarlyStartConfig {
        config: u32,
    },
    /// Wait for the previous task before `op` runs
    EarlyStartWait {
        op: OperatorId,
        config: u32,
    },
    /// External event notify of `op`
    Notify {
        op: OperatorId,
    },
    /// External event wait of `op`
    EventWait {
        op: OperatorId,
    },
    /// Spin on the ready lock and select the implementation of a dynamic operator
    DynamicResolve {
        op: OperatorId,
    },
    FeedSyncInit {
        op: OperatorId,
    },
    Profile {
        event: u32,
        kind: ProfilingEventKind,
        start: bool,
    },
    Invoke {
        op: OperatorId,
    },
    /// Return a dynamic operator's ready lock to NotReady
    LockReset {
        op: OperatorId,
    },
    CacheFlushAll,
    ClearWaitLocks,
    InstructionCacheEpilogue,
}

impl Step {
    /// Operator a step belongs to, if any
    pub fn operator(&self) -> Option<OperatorId> {
        match self {
            Step::Preload { op }
            | Step::EarlyStartSet { op }
            | Step::EarlyStartWait { op, .. }
            | Step::Notify { op }
            | Step::EventWait { op }
            | Step::DynamicResolve { op }
            | Step::FeedSyncInit { op }
            | Step::Invoke { op }
            | Step::LockReset { op } => Some(*op),
            _ => None,
        }
    }

    pub fn is_full_barrier(&self) -> bool {
        matches!(self, Step::Barrier(Barrier { scope: BarrierScope::Full, .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_barrier_by_kernel_type() {
        assert_eq!(Barrier::covering(KernelType::MixAic1_1).scope, BarrierScope::Full);
        assert_eq!(
            Barrier::covering(KernelType::MixAiv1_0).scope,
            BarrierScope::Domain(Domain::Vector)
        );
        assert_eq!(
            Barrier::covering(KernelType::MixAic1_0).scope,
            BarrierScope::Domain(Domain::Cube)
        );
    }

    #[test]
    fn test_step_operator() {
        assert_eq!(Step::Invoke { op: OperatorId(2) }.operator(), Some(OperatorId(2)));
        assert_eq!(Step::PipeAll.operator(), None);
        assert!(Step::Barrier(Barrier::full("x")).is_full_barrier());
    }
}
