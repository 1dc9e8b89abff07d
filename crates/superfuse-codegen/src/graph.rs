//! Operator graph model
//!
//! Nodes are the sub-operators of one fusion request, in the order they must run. Edges are
//! producer → consumer dependencies tagged with the pair of domains they connect. The graph is
//! built once per request and never reordered: [`OperatorGraph::topological_order`] only checks
//! that the insertion order already is a valid topological order.

use crate::descriptor::{EarlyStartFlags, FunctionNames, HardwareProfile, OperatorDescriptor, TextSize};
use crate::error::{CodegenError, Result};
use crate::options::FusionOptions;
use serde::Serialize;
use std::fmt;
use superfuse_core::{Domain, DomainAffinity, KernelType};
use tracing::debug;

/// Position of an operator in the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct OperatorId(pub usize);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EdgeId(pub usize);

/// One row of a dynamic operator's tiling table, with its class resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingEntry {
    pub tiling_key: u64,
    pub kernel_type: KernelType,
    pub functions: FunctionNames,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchKind {
    Static,
    /// Implementation and block count are chosen at launch time; entries sorted by key
    Dynamic(Vec<TilingEntry>),
}

/// Whole-cache flushes requested around one invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheFlags {
    pub before: bool,
    pub after: bool,
}

/// A sub-operator invocation
#[derive(Debug, Clone)]
pub struct OperatorNode {
    pub name: String,
    pub kernel_type: KernelType,
    /// Logical block count; for dynamic operators the full unit count of the primary domain
    pub block_count: u32,
    /// Number of interchangeable code variants
    pub split: u32,
    pub dispatch: DispatchKind,
    pub stream: u32,
    /// Argument slot names, suffixed with the operator position
    pub params: Vec<String>,
    pub functions: FunctionNames,
    pub text_size: TextSize,
    pub send_events: Vec<u32>,
    pub recv_events: Vec<u32>,
    pub early_start: EarlyStartFlags,
    pub cache: CacheFlags,
    pub with_sync_all: bool,
    pub dump: bool,
    pub debug_buf_size: u64,
    pub debug_options: String,
    /// Hint that the inbound sequence edge stays on one unit in program order
    pub unit_local: bool,
}

impl OperatorNode {
    /// Resolve a descriptor against the fused options and hardware
    pub fn from_descriptor(
        index: usize,
        desc: &OperatorDescriptor,
        options: &FusionOptions,
        hardware: &HardwareProfile,
    ) -> Result<Self> {
        let kernel_type = desc.kernel_type()?;

        if let Some(split) = desc.split_mode {
            if split != options.split_mode {
                return Err(CodegenError::operator(
                    &desc.name,
                    format!(
                        "split_mode {split} does not match the fused split mode {}",
                        options.split_mode
                    ),
                ));
            }
        }

        let mut early_start = desc.early_start;
        if (early_start.set || early_start.wait) && !options.early_start.is_enabled() {
            return Err(CodegenError::operator(
                &desc.name,
                format!(
                    "early-start flags set:{} wait:{} do not match the disabled fused early-start mode",
                    early_start.set, early_start.wait
                ),
            ));
        }
        if (early_start.set || early_start.wait) && desc.is_dynamic() {
            return Err(CodegenError::operator(
                &desc.name,
                "dynamic operators do not support early start",
            ));
        }
        if !options.early_start.honors_sub_kernel_flags() {
            early_start = EarlyStartFlags::default();
        }

        let (dispatch, block_count) = if desc.is_dynamic() {
            let mut entries = desc
                .tiling
                .iter()
                .map(|case| {
                    Ok(TilingEntry {
                        tiling_key: case.tiling_key,
                        kernel_type: KernelType::from_name(&case.kernel_type)
                            .map_err(|e| CodegenError::operator(&desc.name, e.to_string()))?,
                        functions: case.functions.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            entries.sort_by_key(|entry| entry.tiling_key);
            (DispatchKind::Dynamic(entries), hardware.dynamic_block_count(kernel_type))
        } else {
            (DispatchKind::Static, desc.block_dim)
        };

        let disabled = desc.dcci_disable_on_kernel || options.dcci_disable_on_kernel.contains(&desc.name);
        let cache = CacheFlags {
            before: !disabled
                && (desc.dcci_before_kernel_start || options.dcci_before_kernel_start.contains(&desc.name)),
            after: !disabled && (desc.dcci_after_kernel_end || options.dcci_after_kernel_end.contains(&desc.name)),
        };

        Ok(Self {
            name: desc.name.clone(),
            kernel_type,
            block_count,
            split: options.split_mode,
            dispatch,
            stream: desc.stream_id,
            params: desc.params.iter().map(|p| format!("{p}_{index}")).collect(),
            functions: desc.functions.clone(),
            text_size: desc.text_size,
            send_events: desc.send_events.clone(),
            recv_events: desc.recv_events.clone(),
            early_start,
            cache,
            with_sync_all: desc.with_sync_all,
            dump: desc.needs_dump(),
            debug_buf_size: desc.debug_buf_size,
            debug_options: desc.debug_options.clone(),
            unit_local: desc.unit_local,
        })
    }

    pub fn affinity(&self) -> DomainAffinity {
        self.kernel_type.affinity()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.dispatch, DispatchKind::Dynamic(_))
    }

    pub fn tiling(&self) -> &[TilingEntry] {
        match &self.dispatch {
            DispatchKind::Dynamic(entries) => entries,
            DispatchKind::Static => &[],
        }
    }

    /// Physical units of `domain` the operator occupies
    pub fn required_units(&self, domain: Domain) -> u32 {
        if !self.affinity().contains(domain) {
            return 0;
        }
        match (self.kernel_type, domain) {
            (KernelType::MixAic1_2, Domain::Vector) => self.block_count.saturating_mul(2),
            _ => self.block_count,
        }
    }
}

/// Domains on either end of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DomainPair {
    VecVec,
    VecCube,
    CubeVec,
    CubeCube,
}

impl DomainPair {
    pub fn new(producer: Domain, consumer: Domain) -> Self {
        match (producer, consumer) {
            (Domain::Vector, Domain::Vector) => DomainPair::VecVec,
            (Domain::Vector, Domain::Cube) => DomainPair::VecCube,
            (Domain::Cube, Domain::Vector) => DomainPair::CubeVec,
            (Domain::Cube, Domain::Cube) => DomainPair::CubeCube,
        }
    }

    pub fn producer(self) -> Domain {
        match self {
            DomainPair::VecVec | DomainPair::VecCube => Domain::Vector,
            DomainPair::CubeVec | DomainPair::CubeCube => Domain::Cube,
        }
    }

    pub fn consumer(self) -> Domain {
        match self {
            DomainPair::VecVec | DomainPair::CubeVec => Domain::Vector,
            DomainPair::VecCube | DomainPair::CubeCube => Domain::Cube,
        }
    }

    pub fn is_cross(self) -> bool {
        self.producer() != self.consumer()
    }

    /// Pairs that order a `producer` class before a `consumer` class
    ///
    /// Mixed operators only contribute their cross-domain pairs. The same-domain half of a mixed
    /// dependency has no edge of its own; Rule 1 covers it with a barrier over the consumer's
    /// domain behind a mixed producer, and two-stream send steps barrier every domain a send
    /// touches.
    pub fn derive(producer: KernelType, consumer: KernelType) -> Vec<DomainPair> {
        use DomainAffinity::*;
        match (producer.affinity(), consumer.affinity()) {
            (Mixed, Mixed) => vec![DomainPair::CubeVec, DomainPair::VecCube],
            (Mixed, CubeOnly) => vec![DomainPair::VecCube],
            (Mixed, VectorOnly) => vec![DomainPair::CubeVec],
            (CubeOnly, Mixed) => vec![DomainPair::CubeVec],
            (VectorOnly, Mixed) => vec![DomainPair::VecCube],
            (p, c) => vec![DomainPair::new(p.primary(), c.primary())],
        }
    }
}

impl fmt::Display for DomainPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer(), self.consumer())
    }
}

/// Why an edge exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EdgeOrigin {
    /// Program order of adjacent operators on one stream
    Sequence,
    /// A send/recv event matched inside the request
    Event(u32),
    /// A mixed operator hands its external notify to the next operator on another stream
    Handoff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub id: EdgeId,
    pub producer: OperatorId,
    pub consumer: OperatorId,
    pub pair: DomainPair,
    pub origin: EdgeOrigin,
    /// False only when both ends provably run on the same unit in program order
    pub requires_explicit_sync: bool,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.producer, self.consumer, self.pair)
    }
}

/// Dependency graph of one fusion request
#[derive(Debug, Clone)]
pub struct OperatorGraph {
    hardware: HardwareProfile,
    nodes: Vec<OperatorNode>,
    edges: Vec<Edge>,
}

impl OperatorGraph {
    pub fn new(hardware: HardwareProfile) -> Self {
        Self {
            hardware,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Append an operator; it runs after every operator added before it
    pub fn add_operator(&mut self, node: OperatorNode) -> Result<OperatorId> {
        if node.split == 0 {
            return Err(CodegenError::operator(&node.name, "split factor must be at least 1"));
        }
        if node.block_count == 0 {
            return Err(CodegenError::operator(&node.name, "block count must be positive"));
        }
        for &domain in node.affinity().domains() {
            let available = self.hardware.units(domain);
            if node.required_units(domain) > available {
                return Err(CodegenError::operator(
                    &node.name,
                    format!(
                        "needs {} {domain} units but the hardware has {available}",
                        node.required_units(domain)
                    ),
                ));
            }
        }
        let id = OperatorId(self.nodes.len());
        debug!(operator = %node.name, id = id.0, kernel_type = %node.kernel_type, "add_operator");
        self.nodes.push(node);
        Ok(id)
    }

    /// Add a dependency that always needs explicit synchronization
    pub fn add_edge(&mut self, producer: OperatorId, consumer: OperatorId, pair: DomainPair) -> Result<EdgeId> {
        self.add_edge_with(producer, consumer, pair, EdgeOrigin::Sequence, false)
    }

    /// Add a dependency with its origin and an optional unit-local hint
    ///
    /// The hint only clears `requires_explicit_sync` when it can be proven: adjacent static
    /// operators of one single-domain class, one stream, with equal block counts and split
    /// factors, connected by a same-domain pair.
    pub fn add_edge_with(
        &mut self,
        producer: OperatorId,
        consumer: OperatorId,
        pair: DomainPair,
        origin: EdgeOrigin,
        unit_local_hint: bool,
    ) -> Result<EdgeId> {
        for id in [producer, consumer] {
            if id.0 >= self.nodes.len() {
                return Err(CodegenError::malformed(format!("edge references unknown operator {id}")));
            }
        }
        if self
            .edges
            .iter()
            .any(|e| e.producer == producer && e.consumer == consumer && e.pair == pair)
        {
            return Err(CodegenError::malformed(format!(
                "duplicate edge {producer} -> {consumer} ({pair})"
            )));
        }

        let unit_local = unit_local_hint && self.provably_unit_local(producer, consumer, pair);
        if unit_local_hint && !unit_local {
            debug!(%producer, %consumer, %pair, "unit-local hint not provable, keeping explicit sync");
        }

        let id = EdgeId(self.edges.len());
        self.edges.push(Edge {
            id,
            producer,
            consumer,
            pair,
            origin,
            requires_explicit_sync: !unit_local,
        });
        Ok(id)
    }

    fn provably_unit_local(&self, producer: OperatorId, consumer: OperatorId, pair: DomainPair) -> bool {
        let (p, c) = (&self.nodes[producer.0], &self.nodes[consumer.0]);
        consumer.0 == producer.0 + 1
            && !pair.is_cross()
            && !p.is_dynamic()
            && !c.is_dynamic()
            && p.affinity() == c.affinity()
            && p.affinity() != DomainAffinity::Mixed
            && p.affinity().primary() == pair.producer()
            && p.block_count == c.block_count
            && p.split == c.split
            && p.stream == c.stream
    }

    /// Operators in emission order, after checking every edge points forward
    pub fn topological_order(&self) -> Result<impl Iterator<Item = (OperatorId, &OperatorNode)> + '_> {
        if let Some(edge) = self.edges.iter().find(|e| e.producer >= e.consumer) {
            return Err(CodegenError::malformed(format!(
                "edge {edge} does not follow operator order ({} -> {})",
                self.nodes[edge.producer.0].name, self.nodes[edge.consumer.0].name
            )));
        }
        Ok(self.nodes.iter().enumerate().map(|(i, node)| (OperatorId(i), node)))
    }

    pub fn node(&self, id: OperatorId) -> &OperatorNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[OperatorNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0]
    }

    pub fn incoming(&self, id: OperatorId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.consumer == id)
    }

    pub fn outgoing(&self, id: OperatorId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.producer == id)
    }

    pub fn hardware(&self) -> &HardwareProfile {
        &self.hardware
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_dynamic(&self) -> bool {
        self.nodes.iter().any(OperatorNode::is_dynamic)
    }
}
