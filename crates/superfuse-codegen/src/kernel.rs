//! Source assembly
//!
//! Lays out the translation unit of one fused kernel: file header, helper templates, sub-kernel
//! declarations, dynamic dispatch functions, the per-domain functions of a two-stream schedule,
//! the entry point and the core-mix metadata section. Also derives the compile defines the
//! downstream compiler needs.

use crate::abi::metadata_section;
use crate::context::LaunchContext;
use crate::descriptor::FunctionNames;
use crate::dispatch::variant_symbols;
use crate::dynamic;
use crate::emit::CodeWriter;
use crate::events::{render_clear_wait_locks, NOTIFY_WAIT_FUNCS};
use crate::graph::OperatorGraph;
use crate::profiling::{device_helpers, init_lines, record_call};
use crate::render::Renderer;
use crate::schedule::Step;
use crate::stream::{render_arch_calls, render_arch_function};
use std::collections::BTreeSet;
use superfuse_core::{CoreMixMetadata, Domain, KernelType, ProfilingEventKind};

/// Schedule of the entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelBody {
    SingleStream(Vec<Step>),
    /// Step lists of the cube and vector functions; an empty list gets no function
    TwoStream { cube: Vec<Step>, vector: Vec<Step> },
}

pub fn entry_symbol(kernel_name: &str) -> String {
    format!("auto_gen_{kernel_name}_kernel")
}

pub fn func_align_attribute(align: u32) -> String {
    if align == 0 {
        String::new()
    } else {
        format!("__attribute__((aligned({align})))")
    }
}

fn file_header(kernel_type: KernelType, split: u32) -> String {
    let mut w = CodeWriter::new();
    w.line(format!("// fused kernel type: {kernel_type}, split mode: {split}"));
    w.line("#include \"kernel_operator.h\"");
    w.blank();
    w.line("#ifndef TILING_KEY_VAR");
    w.line("#define TILING_KEY_VAR 0UL");
    w.line("#endif");
    w.finish()
}

/// One declaration per distinct sub-kernel symbol, in first-use order
///
/// Covers every variant of every static operator and every tiling entry of a dynamic one.
pub fn declarations(graph: &OperatorGraph) -> String {
    let mut seen = BTreeSet::new();
    let mut w = CodeWriter::new();
    let mut declare = |w: &mut CodeWriter, symbol: String| {
        if seen.insert(symbol.clone()) {
            w.line(format!("extern \"C\"  __aicore__ void {symbol}(uint64_t args_offset);"));
        }
    };

    for node in graph.nodes() {
        let tables: Vec<(KernelType, &FunctionNames)> = if node.is_dynamic() {
            node.tiling().iter().map(|e| (e.kernel_type, &e.functions)).collect()
        } else {
            vec![(node.kernel_type, &node.functions)]
        };
        for (kernel_type, functions) in tables {
            for &domain in kernel_type.affinity().domains() {
                let Some(base) = functions.get(domain) else { continue };
                for symbol in variant_symbols(base, node.split) {
                    declare(&mut w, symbol);
                }
            }
        }
    }
    w.finish()
}

/// Workspace zeroing run before any operator when feed-sync-all is on
///
/// Every unit zeroes its slice through a 512-byte on-chip buffer. Mixed launches clear from the
/// vector side and release the cube side with a cross-domain flag.
pub fn clear_workspace(kernel_type: KernelType, workspace_bytes: u64) -> String {
    let vector_clear = |size: u64, release: &str| {
        format!(
            "if ASCEND_IS_AIV {{
    uint32_t sizePerCore = {size} / get_block_num();
    const uint32_t repeatTimes = sizePerCore / 512;
    __gm__ uint8_t* startAddr  = (__gm__ uint8_t*)(workspace + sizePerCore * AscendC::GetBlockIdxImpl());
    AscendC::DuplicateImpl((__ubuf__ uint32_t*)(0), (uint32_t)0, 128);
    AscendC::SetFlag<AscendC::HardEvent::V_MTE3>(EVENT_ID0);
    AscendC::WaitFlag<AscendC::HardEvent::V_MTE3>(EVENT_ID0);
    for (size_t i = 0; i < repeatTimes; i++) {{
        copy_ubuf_to_gm((__gm__ void*)(startAddr), (__ubuf__ void*)(0), 0, 1, 16, 1, 1);
        startAddr += 512;
    }}
    AscendC::PipeBarrier<PIPE_ALL>();
    ffts_cross_core_sync(PIPE_MTE3, AscendC::GetffstMsg(0x0, AscendC::SYNC_AIV_ONLY_ALL));
    wait_flag_dev(AscendC::SYNC_AIV_ONLY_ALL);
{release}}}
"
        )
    };

    match kernel_type {
        KernelType::AicOnly | KernelType::MixAic1_0 => format!(
            "if ASCEND_IS_AIC {{
    uint32_t sizePerCore = {workspace_bytes} / get_block_num();
    const uint32_t repeatTimes = sizePerCore / 512;
    __gm__ uint8_t* startAddr  = (__gm__ uint8_t*)(workspace + sizePerCore * AscendC::GetBlockIdxImpl());
    create_cbuf_matrix((__cbuf__ uint32_t*)(0), 0x10010, 0);
    AscendC::SetFlag<AscendC::HardEvent::MTE2_MTE3>(EVENT_ID0);
    AscendC::WaitFlag<AscendC::HardEvent::MTE2_MTE3>(EVENT_ID0);
    for (size_t i = 0; i < repeatTimes; i++) {{
        copy_cbuf_to_gm((__gm__ void*)(startAddr), (__cbuf__ void*)(0), 0, 1, 16, 1, 1);
        startAddr += 512;
    }}
    AscendC::PipeBarrier<PIPE_ALL>();
    ffts_cross_core_sync(PIPE_FIX, AscendC::GetffstMsg(0x0, AscendC::SYNC_AIC_FLAG));
    wait_flag_dev(AscendC::SYNC_AIC_FLAG);
}}
"
        ),
        KernelType::AivOnly | KernelType::MixAiv1_0 => vector_clear(workspace_bytes, ""),
        KernelType::MixAic1_1 | KernelType::MixAic1_2 => {
            let size = if kernel_type == KernelType::MixAic1_1 {
                workspace_bytes
            } else {
                workspace_bytes / 2
            };
            let mut code = vector_clear(
                size,
                "    ffts_cross_core_sync(PIPE_MTE3, AscendC::GetffstMsg(0x02, AscendC::SYNC_AIV_FLAG));\n",
            );
            code.push_str("\nif ASCEND_IS_AIC {\n    wait_flag_dev(AscendC::SYNC_AIV_FLAG);\n}\n");
            code
        }
    }
}

/// `-D` flags and extra options for the downstream compiler
pub fn compile_defines(ctx: &LaunchContext<'_>) -> Vec<String> {
    let mut defines = Vec::new();
    if ctx.graph.has_dynamic() {
        defines.push("-D__SUPER_KERNEL_DYNAMIC_BLOCK_NUM__".to_string());
    }
    if ctx.early_start {
        defines.push("-D__ASCENDC_ENABLE_SET_NEXT_TASK_START".to_string());
        defines.push("-D__ASCENDC_ENABLE_WAIT_PRE_TASK_END".to_string());
        defines.push("-D__ASCENDC_SUPERKERNEL_EARLY_START_V2".to_string());
    }
    if ctx.options.feed_sync_all {
        defines.push("-D__ASCENDC_SUPERKERNEL_AUTO_SYNC_ALL__".to_string());
    }
    if ctx.summary.dump {
        defines.push("-DASCENDC_DUMP".to_string());
    } else {
        defines.push("-DASCENDC_DUMP=0".to_string());
    }
    if let Some(scope) = &ctx.options.strict_scope_check {
        defines.push(format!("-D__SUPER_KERNEL_STRICT_SCOPE_CHECK__={scope}"));
    }
    defines.extend(ctx.options.compile_options.iter().cloned());
    defines
}

fn render_prologue(w: &mut CodeWriter, ctx: &LaunchContext<'_>) {
    let summary = ctx.summary;
    if let Some(slot) = ctx.layout.workspace() {
        w.line(format!("GM_ADDR workspace = param_base[{slot}];"));
    }
    if ctx.options.feed_sync_all {
        w.line("AscendC::g_superKernelAutoSyncAllConfigGmBaseAddr = workspace;");
    }
    if summary.dump {
        let is_mix = matches!(summary.kernel_type, KernelType::MixAic1_1 | KernelType::MixAic1_2);
        w.line("#if defined ASCENDC_DUMP || defined ASCENDC_TIME_STAMP_ON");
        w.line(format!("constexpr uint32_t ASCENDC_DUMP_SIZE = {};", summary.dump_size()));
        w.line(format!(
            "AscendC::InitDump({is_mix}, workspace + {}, ASCENDC_DUMP_SIZE);",
            summary.feed_sync_bytes
        ));
        w.line("#endif");
    }
    if let Some((region, task)) = ctx.layout.profiling() {
        w.lines(init_lines(region, task));
    }
    w.line("GM_ADDR ffts_addr = param_base[0];");
    w.open("if (ffts_addr != nullptr)");
    w.line("set_ffts_base_addr((uint64_t)ffts_addr);");
    w.close();
    w.blank();
}

fn kernel_record(w: &mut CodeWriter, ctx: &LaunchContext<'_>, start: bool) {
    if ctx.options.profiling {
        w.line(record_call(0, ProfilingEventKind::Kernel, start));
    }
}

/// Whole translation unit of the fused kernel
pub fn assemble(ctx: &LaunchContext<'_>, body: &KernelBody) -> String {
    let summary = ctx.summary;
    let mut source = file_header(summary.kernel_type, ctx.options.split_mode);
    if ctx.options.profiling {
        source.push_str(&device_helpers());
    }
    source.push_str(NOTIFY_WAIT_FUNCS);
    source.push_str(&declarations(ctx.graph));

    let mut emitted = BTreeSet::new();
    for node in ctx.graph.nodes().iter().filter(|n| n.is_dynamic()) {
        if emitted.insert(node.name.as_str()) {
            source.push_str(&dynamic::render_functions(node));
        }
    }

    if let KernelBody::TwoStream { cube, vector } = body {
        for (arch, steps) in [(Domain::Cube, cube), (Domain::Vector, vector)] {
            if !steps.is_empty() {
                source.push_str(&render_arch_function(ctx, arch, steps));
            }
        }
    }

    let mut w = CodeWriter::new();
    let align = func_align_attribute(ctx.options.func_align);
    w.open(format!(
        "extern \"C\"  __global__ {align} __aicore__ void {}(void)",
        entry_symbol(ctx.kernel_name)
    ));
    w.line("GM_ADDR *param_base = (GM_ADDR *)get_para_base();");
    render_prologue(&mut w, ctx);

    let clear = ctx
        .options
        .feed_sync_all
        .then(|| clear_workspace(summary.kernel_type, summary.feed_sync_bytes));
    match body {
        KernelBody::SingleStream(steps) => {
            if let Some(clear) = &clear {
                w.block(clear);
            }
            if ctx.graph.has_dynamic() {
                w.lines(dynamic::entry_locals(ctx.options.split_mode));
            }
            Renderer::new(ctx).render(&mut w, steps);
        }
        KernelBody::TwoStream { cube, vector } => {
            kernel_record(&mut w, ctx, true);
            if let Some(clear) = &clear {
                w.block(clear);
            }
            let arches: Vec<Domain> = [(Domain::Cube, cube), (Domain::Vector, vector)]
                .into_iter()
                .filter(|(_, steps)| !steps.is_empty())
                .map(|(arch, _)| arch)
                .collect();
            render_arch_calls(&mut w, ctx, &arches);
            let locks = ctx
                .ids()
                .map(|id| (ctx.node(id), ctx.layout.operator(id).wait.as_slice()));
            render_clear_wait_locks(&mut w, locks);
            kernel_record(&mut w, ctx, false);
        }
    }
    w.close();
    w.blank();
    source.push_str(&w.finish());

    let meta = CoreMixMetadata::for_kernel(entry_symbol(ctx.kernel_name), summary.kernel_type);
    source.push_str(&metadata_section(&meta, summary.kernel_type));
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HardwareProfile;
    use crate::graph::tests::node;

    #[test]
    fn test_func_align_attribute() {
        assert_eq!(func_align_attribute(0), "");
        assert_eq!(func_align_attribute(512), "__attribute__((aligned(512)))");
    }

    #[test]
    fn test_declarations_are_deduplicated() {
        let mut graph = OperatorGraph::new(HardwareProfile::default());
        let mut first = node("mm", KernelType::MixAic1_1, 8);
        first.split = 2;
        let mut second = first.clone();
        second.name = "mm_again".to_string();
        graph.add_operator(first).unwrap();
        graph.add_operator(second).unwrap();
        let text = declarations(&graph);
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("extern \"C\"  __aicore__ void mm_cube_split1(uint64_t args_offset);"));
        assert!(text.contains("extern \"C\"  __aicore__ void mm_vec(uint64_t args_offset);"));
    }

    #[test]
    fn test_clear_workspace_by_kernel_type() {
        let cube = clear_workspace(KernelType::MixAic1_0, 12288);
        assert!(cube.starts_with("if ASCEND_IS_AIC {"));
        assert!(cube.contains("uint32_t sizePerCore = 12288 / get_block_num();"));
        assert!(cube.contains("create_cbuf_matrix"));

        let vector = clear_workspace(KernelType::MixAiv1_0, 4096);
        assert!(vector.contains("copy_ubuf_to_gm"));
        assert!(!vector.contains("ASCEND_IS_AIC"));

        let half = clear_workspace(KernelType::MixAic1_2, 8192);
        assert!(half.contains("uint32_t sizePerCore = 4096 / get_block_num();"));
        assert!(half.contains("GetffstMsg(0x02, AscendC::SYNC_AIV_FLAG)"));
        assert!(half.trim_end().ends_with("wait_flag_dev(AscendC::SYNC_AIV_FLAG);\n}"));
    }
}
