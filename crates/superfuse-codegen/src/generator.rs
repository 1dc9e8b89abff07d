//! Fusion pipeline
//!
//! [`FusionGenerator::generate`] runs one request through every stage: options, validation,
//! operator resolution, event analysis, graph construction, summary, parameter layout,
//! scheduling, verification and emission. Nothing is shared between calls, so generating the same
//! request twice yields byte-identical output.

use crate::abi::AbiLayout;
use crate::context::LaunchContext;
use crate::descriptor::FusionRequest;
use crate::dynamic::prove_single_writer;
use crate::error::Result;
use crate::events::{EventPlan, ScheduleMode};
use crate::graph::{OperatorGraph, OperatorNode};
use crate::kernel::{assemble, compile_defines, entry_symbol, KernelBody};
use crate::options::FusionOptions;
use crate::scheduler::SingleStreamScheduler;
use crate::stream::StreamPlan;
use crate::summary::FusionSummary;
use crate::sync::{verify, verify_streams, SyncStats};
use serde::Serialize;
use std::time::Instant;
use superfuse_core::{CoreMixMetadata, Domain, KernelType};
use superfuse_tracing::performance::{record_emission, record_sync_summary};
use superfuse_tracing::stage_span;
use tracing::{debug, info};

/// Everything the build needs from one fused kernel
#[derive(Debug, Clone, Serialize)]
pub struct FusedKernel {
    pub kernel_name: String,
    /// Symbol of the emitted entry point
    pub entry_symbol: String,
    pub source: String,
    pub metadata: CoreMixMetadata,
    pub layout: AbiLayout,
    pub compile_defines: Vec<String>,
    pub mode: ScheduleMode,
    pub kernel_type: KernelType,
    pub block_dim: u32,
    /// Bytes the host must bind to the workspace slot; 0 when there is none
    pub workspace_bytes: u64,
    #[serde(skip)]
    pub sync: SyncStats,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FusionGenerator;

impl FusionGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, request: &FusionRequest) -> Result<FusedKernel> {
        let started = Instant::now();
        info!(
            kernel = %request.kernel_name,
            operators = request.operators.len(),
            "generating fused kernel"
        );

        let options = {
            let _stage = stage_span!("options");
            FusionOptions::parse(&request.options)?
        };
        let mut hardware = request.hardware;
        if let Some(cube) = options.debug_aic_num {
            hardware.cube_units = cube;
        }
        if let Some(vector) = options.debug_aiv_num {
            hardware.vector_units = vector;
        }

        let nodes = {
            let _stage = stage_span!("resolve", operators = request.operators.len());
            request.validate()?;
            request
                .operators
                .iter()
                .enumerate()
                .map(|(index, desc)| OperatorNode::from_descriptor(index, desc, &options, &hardware))
                .collect::<Result<Vec<_>>>()?
        };

        let events = EventPlan::analyze(&nodes, options.stream_fusion)?;
        let summary = FusionSummary::new(&nodes, options.feed_sync_all);

        let graph = {
            let _stage = stage_span!("graph");
            let mut graph = OperatorGraph::new(hardware);
            for node in nodes {
                graph.add_operator(node)?;
            }
            events.connect(&mut graph)?;
            let ordered = graph.topological_order()?.count();
            debug!(operators = ordered, edges = graph.edges().len(), "operator graph built");
            graph
        };

        let layout = AbiLayout::assign(&graph, &events, summary.needs_workspace(), options.profiling);
        let mode = events.mode();
        let ctx = LaunchContext {
            kernel_name: &request.kernel_name,
            options: &options,
            graph: &graph,
            events: &events,
            layout: &layout,
            summary: &summary,
            early_start: options.early_start.is_enabled() && mode == ScheduleMode::SingleStream,
        };

        let (body, sync) = {
            let _stage = stage_span!("schedule", operators = graph.len());
            debug!(mode = ?mode, "scheduling");
            match mode {
                ScheduleMode::SingleStream => {
                    let steps = SingleStreamScheduler::new(&ctx).build()?;
                    let sync = verify(&graph, &steps)?;
                    prove_single_writer(&graph, &layout, &steps)?;
                    (KernelBody::SingleStream(steps), sync)
                }
                ScheduleMode::TwoStream => {
                    let plan = StreamPlan::new(&ctx)?;
                    let cube = plan.steps(Domain::Cube);
                    let vector = plan.steps(Domain::Vector);
                    let sync = verify_streams(&graph, &cube, &vector)?;
                    (KernelBody::TwoStream { cube, vector }, sync)
                }
            }
        };
        record_sync_summary(
            &request.kernel_name,
            sync.full_barriers,
            sync.domain_barriers,
            sync.signal_pairs,
        );

        let source = {
            let _stage = stage_span!("emit");
            assemble(&ctx, &body)
        };
        let entry = entry_symbol(&request.kernel_name);
        let kernel = FusedKernel {
            kernel_name: request.kernel_name.clone(),
            metadata: CoreMixMetadata::for_kernel(entry.clone(), summary.kernel_type),
            entry_symbol: entry,
            compile_defines: compile_defines(&ctx),
            mode,
            kernel_type: summary.kernel_type,
            block_dim: summary.block_dim,
            workspace_bytes: workspace_bytes(&summary),
            sync,
            source,
            layout: layout.clone(),
        };

        let elapsed = started.elapsed().as_micros() as u64;
        record_emission(&kernel.kernel_name, graph.len(), kernel.source.len(), elapsed);
        info!(
            kernel = %kernel.kernel_name,
            kernel_type = %kernel.kernel_type,
            block_dim = kernel.block_dim,
            mode = ?kernel.mode,
            "fused kernel generated"
        );
        Ok(kernel)
    }
}

/// Feed-sync configuration area followed by one dump area per physical unit
fn workspace_bytes(summary: &FusionSummary) -> u64 {
    if !summary.dump {
        return summary.feed_sync_bytes;
    }
    let meta = CoreMixMetadata::for_kernel(String::new(), summary.kernel_type);
    let units_per_block = u64::from(meta.aic_ratio) + u64::from(meta.aiv_ratio);
    summary.feed_sync_bytes + summary.dump_size() * u64::from(summary.block_dim) * units_per_block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodegenError;

    fn request(json: &str) -> FusionRequest {
        FusionRequest::parse(json).unwrap()
    }

    const PAIR: &str = r#"{
        "kernel_name": "fused",
        "operators": [
            { "name": "add", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 16,
              "params": ["x"], "functions": { "vector": "add_kernel" } },
            { "name": "mm", "kernel_type": "KERNEL_TYPE_AIC_ONLY", "block_dim": 8,
              "params": ["a", "b"], "functions": { "cube": "mm_kernel" } }
        ]
    }"#;

    #[test]
    fn test_generate_single_stream() {
        let kernel = FusionGenerator::new().generate(&request(PAIR)).unwrap();
        assert_eq!(kernel.mode, ScheduleMode::SingleStream);
        assert_eq!(kernel.kernel_type, KernelType::MixAic1_2);
        assert_eq!(kernel.block_dim, 8);
        assert_eq!(kernel.entry_symbol, "auto_gen_fused_kernel");
        assert!(kernel.source.contains("void auto_gen_fused_kernel(void) {"));
        assert_eq!(kernel.sync.signal_pairs, 1);
        assert!(kernel.compile_defines.contains(&"-D__ASCENDC_SUPERKERNEL_EARLY_START_V2".to_string()));
        assert_eq!(kernel.workspace_bytes, 0);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let generator = FusionGenerator::new();
        let first = generator.generate(&request(PAIR)).unwrap();
        let second = generator.generate(&request(PAIR)).unwrap();
        assert_eq!(first.source, second.source);
        assert_eq!(first.layout, second.layout);
    }

    #[test]
    fn test_debug_unit_override_gates_dynamic_blocks() {
        let mut req = request(
            r#"{
            "kernel_name": "fused",
            "operators": [
                { "name": "dyn", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "task_type": "dynamic",
                  "tiling": [ { "tiling_key": 1, "kernel_type": "KERNEL_TYPE_AIV_ONLY",
                                "functions": { "vector": "dyn_k1" } } ] }
            ]
        }"#,
        );
        req.options = "debug-aiv-num=12".to_string();
        let kernel = FusionGenerator::new().generate(&req).unwrap();
        assert_eq!(kernel.kernel_type, KernelType::MixAiv1_0);
        assert_eq!(kernel.block_dim, 12);
        assert!(kernel
            .compile_defines
            .contains(&"-D__SUPER_KERNEL_DYNAMIC_BLOCK_NUM__".to_string()));
    }

    #[test]
    fn test_debug_unit_override_limits_blocks() {
        let mut req = request(PAIR);
        req.options = "debug-aic-num=4".to_string();
        let err = FusionGenerator::new().generate(&req).unwrap_err();
        assert!(matches!(err, CodegenError::InvalidOperator { ref operator, .. } if operator == "mm"));
    }

    #[test]
    fn test_dump_workspace_covers_every_unit() {
        let mut req = request(PAIR);
        req.operators[0].debug_options = "printf".to_string();
        req.operators[0].debug_buf_size = 4096;
        let kernel = FusionGenerator::new().generate(&req).unwrap();
        // MixAic1_2 runs three units per block.
        assert_eq!(kernel.workspace_bytes, 4096 * 8 * 3);
        assert!(kernel.layout.workspace().is_some());
        assert!(kernel.compile_defines.contains(&"-DASCENDC_DUMP".to_string()));
    }

    #[test]
    fn test_invalid_option_is_reported_first() {
        let mut req = request(PAIR);
        req.options = "split-mode=0".to_string();
        assert!(matches!(
            FusionGenerator::new().generate(&req),
            Err(CodegenError::InvalidOption { .. })
        ));
    }
}
