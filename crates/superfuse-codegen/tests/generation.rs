//! End-to-end generation scenarios
//!
//! Each test feeds a JSON request through `FusionGenerator::generate` and checks the emitted
//! translation unit and the launch facts reported alongside it.

use superfuse_codegen::summary::feed_sync_workspace_bytes;
use superfuse_codegen::{CodegenError, FusionGenerator, FusionRequest, ScheduleMode};
use superfuse_core::KernelType;

fn generate(json: &str) -> superfuse_codegen::Result<superfuse_codegen::FusedKernel> {
    FusionGenerator::new().generate(&FusionRequest::parse(json)?)
}

const VEC_THEN_CUBE: &str = r#"{
    "kernel_name": "attn",
    "operators": [
        { "name": "add", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 8,
          "params": ["x", "y"], "functions": { "vector": "add_kernel" } },
        { "name": "mm", "kernel_type": "KERNEL_TYPE_AIC_ONLY", "block_dim": 8,
          "params": ["a", "b", "c"], "functions": { "cube": "mm_kernel" } }
    ]
}"#;

#[test]
fn test_single_stream_vector_to_cube() {
    let kernel = generate(VEC_THEN_CUBE).unwrap();

    assert_eq!(kernel.mode, ScheduleMode::SingleStream);
    assert_eq!(kernel.kernel_type, KernelType::MixAic1_1);
    assert_eq!(kernel.block_dim, 8);
    assert_eq!(kernel.sync.signal_pairs, 1);
    assert_eq!(kernel.metadata.kernel_name, "auto_gen_attn_kernel");

    let source = &kernel.source;
    assert!(source.starts_with("// fused kernel type: KERNEL_TYPE_MIX_AIC_1_1"));
    assert!(source.contains("__attribute__((aligned(512))) __aicore__ void auto_gen_attn_kernel(void) {"));
    assert!(source.contains("extern \"C\"  __aicore__ void add_kernel(uint64_t args_offset);"));
    assert!(source.contains("extern \"C\"  __aicore__ void mm_kernel(uint64_t args_offset);"));
    assert!(source.contains("auto_gen_attn_kernel_mix_aic_section"));
    assert!(source.ends_with("#endif\n"));
}

#[test]
fn test_output_is_byte_identical_across_generators() {
    let request = FusionRequest::parse(VEC_THEN_CUBE).unwrap();
    let first = FusionGenerator::new().generate(&request).unwrap();

    let reparsed = FusionRequest::parse(&request.to_json().unwrap()).unwrap();
    let second = FusionGenerator::default().generate(&reparsed).unwrap();

    assert_eq!(first.source, second.source);
    assert_eq!(first.compile_defines, second.compile_defines);
    assert_eq!(first.layout, second.layout);
}

#[test]
fn test_func_align_zero_drops_attribute() {
    let mut request = FusionRequest::parse(VEC_THEN_CUBE).unwrap();
    request.options = "func-align=0".to_string();
    let kernel = FusionGenerator::new().generate(&request).unwrap();
    assert!(!kernel.source.contains("aligned("));
}

#[test]
fn test_two_stream_request() {
    let kernel = generate(
        r#"{
        "kernel_name": "pipe",
        "options": "stream-fusion=1",
        "operators": [
            { "name": "add", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 8,
              "functions": { "vector": "add_kernel" } },
            { "name": "cast", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 8, "stream_id": 1,
              "functions": { "vector": "cast_kernel" } },
            { "name": "mm", "kernel_type": "KERNEL_TYPE_AIC_ONLY", "block_dim": 8,
              "functions": { "cube": "mm_kernel" } }
        ]
    }"#,
    )
    .unwrap();

    assert_eq!(kernel.mode, ScheduleMode::TwoStream);
    assert_eq!(kernel.sync.signal_pairs, 1);
    let source = &kernel.source;
    assert!(source.contains("__aicore__ inline void auto_gen_pipe_kernel_aic(void) {"));
    assert!(source.contains("__aicore__ inline void auto_gen_pipe_kernel_aiv(void) {"));
    assert!(source.contains("auto_gen_pipe_kernel_aiv();"));
    // Two-stream schedules never use the early-start handshake.
    assert!(!kernel
        .compile_defines
        .iter()
        .any(|d| d.contains("EARLY_START")));
}

#[test]
fn test_stream_switch_requires_stream_fusion() {
    let err = generate(
        r#"{
        "kernel_name": "pipe",
        "operators": [
            { "name": "add", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 8,
              "functions": { "vector": "add_kernel" } },
            { "name": "cast", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 8, "stream_id": 1,
              "functions": { "vector": "cast_kernel" } }
        ]
    }"#,
    )
    .unwrap_err();
    assert!(matches!(err, CodegenError::InvalidEvent { ref operator, .. } if operator == "cast"));
}

#[test]
fn test_feed_sync_all_reserves_workspace() {
    let kernel = generate(
        r#"{
        "kernel_name": "norm",
        "options": "feed-sync-all=1",
        "operators": [
            { "name": "small", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 8,
              "with_sync_all": true, "functions": { "vector": "small_kernel" } },
            { "name": "big", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 32,
              "functions": { "vector": "big_kernel" } }
        ]
    }"#,
    )
    .unwrap();

    assert_eq!(kernel.kernel_type, KernelType::MixAiv1_0);
    assert_eq!(kernel.workspace_bytes, feed_sync_workspace_bytes(KernelType::MixAiv1_0, 32, 2));
    assert!(kernel.layout.workspace().is_some());
    assert!(kernel
        .source
        .contains("AscendC::g_superKernelAutoSyncAllConfigGmBaseAddr = workspace;"));
    assert!(kernel
        .compile_defines
        .contains(&"-D__ASCENDC_SUPERKERNEL_AUTO_SYNC_ALL__".to_string()));
}

#[test]
fn test_profiling_binds_two_slots() {
    let mut request = FusionRequest::parse(VEC_THEN_CUBE).unwrap();
    request.options = "profiling=1".to_string();
    let kernel = FusionGenerator::new().generate(&request).unwrap();

    assert!(kernel.layout.profiling().is_some());
    assert!(kernel.source.contains("PROFILING_MAGIC_NUMBER"));
}

#[test]
fn test_split_mode_mismatch_is_rejected() {
    let mut request = FusionRequest::parse(VEC_THEN_CUBE).unwrap();
    request.options = "split-mode=2".to_string();
    request.operators[1].split_mode = Some(4);
    let err = FusionGenerator::new().generate(&request).unwrap_err();
    assert!(matches!(err, CodegenError::InvalidOperator { ref operator, .. } if operator == "mm"));
}

#[test]
fn test_compile_options_pass_through() {
    let mut request = FusionRequest::parse(VEC_THEN_CUBE).unwrap();
    request.options = "compile-options=-O2,-g:strict-scope-check=on".to_string();
    let kernel = FusionGenerator::new().generate(&request).unwrap();

    let tail: Vec<&str> = kernel.compile_defines.iter().rev().take(3).map(String::as_str).collect();
    assert_eq!(tail, vec!["-g", "-O2", "-D__SUPER_KERNEL_STRICT_SCOPE_CHECK__=on"]);
}

/// Text of the entry point, after every helper function
fn entry_body<'a>(source: &'a str, kernel_name: &str) -> &'a str {
    let start = source
        .find(&format!("void auto_gen_{kernel_name}_kernel(void) {{"))
        .unwrap();
    &source[start..]
}

fn position(text: &str, needle: &str) -> usize {
    text.find(needle).unwrap_or_else(|| panic!("`{needle}` not emitted"))
}

#[test]
fn test_vector_to_vector_without_early_start_uses_full_barrier() {
    let kernel = generate(
        r#"{
        "kernel_name": "pair",
        "options": "early-start=0",
        "hardware": { "cube_units": 24, "vector_units": 32 },
        "operators": [
            { "name": "a", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 32,
              "functions": { "vector": "a_kernel" } },
            { "name": "b", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 32,
              "functions": { "vector": "b_kernel" } }
        ]
    }"#,
    )
    .unwrap();
    let body = entry_body(&kernel.source, "pair");

    let guard_a = position(body, "if (AscendC::GetBlockIdx() < 32) {");
    let call_a = position(body, "a_kernel(");
    let barrier = position(body, "AscendC::SyncAll<false>(); // reason2: inter op barrier when EarlyStartDisable");
    let guard_b = guard_a + 1 + position(&body[guard_a + 1..], "if (AscendC::GetBlockIdx() < 32) {");
    let call_b = position(body, "b_kernel(");
    assert!(guard_a < call_a && call_a < barrier && barrier < guard_b && guard_b < call_b);

    assert!(!body.contains("GetffstMsg(0x02"));
    assert!(!body.contains("wait_flag_dev(1);"));
    assert_eq!(kernel.sync.signal_pairs, 0);
    assert_eq!(kernel.sync.full_barriers, 1);
}

#[test]
fn test_vector_to_cube_signals_before_handshake() {
    let kernel = generate(VEC_THEN_CUBE).unwrap();
    let body = entry_body(&kernel.source, "attn");

    let rule_one = position(body, "// Rule 1 : sync all aiv behind add");
    let domain_barrier = position(
        body,
        "ffts_cross_core_sync(PIPE_MTE3, AscendC::GetffstMsg(0x0, AscendC::SYNC_AIV_ONLY_ALL));",
    );
    let signal = position(body, "ffts_cross_core_sync(PIPE_MTE3, AscendC::GetffstMsg(0x02, 1));");
    let handshake = position(body, "AscendC::WaitPreTaskEndImpl<4>();");
    let wait = position(body, "wait_flag_dev(1);");
    let call = position(body, "mm_kernel(");
    assert!(rule_one < domain_barrier);
    assert!(domain_barrier < signal);
    assert!(signal < handshake);
    assert!(handshake < wait);
    assert!(wait < call);

    assert!(!body.contains("SyncAll<false>"));
    assert_eq!(kernel.sync.full_barriers, 0);
}

#[test]
fn test_dynamic_cube_operator_resolves_then_releases_lock() {
    let kernel = generate(
        r#"{
        "kernel_name": "dyn",
        "operators": [
            { "name": "mm", "kernel_type": "KERNEL_TYPE_AIC_ONLY", "task_type": "dynamic",
              "tiling": [
                  { "tiling_key": 1, "kernel_type": "KERNEL_TYPE_AIC_ONLY", "functions": { "cube": "mm_k1" } },
                  { "tiling_key": 2, "kernel_type": "KERNEL_TYPE_AIC_ONLY", "functions": { "cube": "mm_k2" } }
              ] }
        ]
    }"#,
    )
    .unwrap();
    let source = &kernel.source;

    let spin = position(source, "while(*lockAddr != 1)");
    let search = position(source, "if (*tilingKeyAddr == 1) {");
    let class_gate = position(source, "if (kernelType == 1 || kernelType == 5) {");
    let block_gate = position(source, "if (get_block_idx() < numBlocks) {");
    assert!(spin < search && search < class_gate && class_gate < block_gate);

    let body = entry_body(source, "dyn");
    let resolve = position(body, "switch_func_of_mm(");
    let call = position(body, "call_func_of_mm(");
    let release = position(
        body,
        "AscendC::SyncAll<false>(); // reason4: all readers of the dynamic ready lock are done",
    );
    let reset = release + position(&body[release..], "*lockAddr = 0;");
    assert!(resolve < call && call < release && release < reset);
    assert!(body[release..reset].contains("if (get_block_idx() == 0) {"));
}

#[test]
fn test_wide_fan_out_reuses_one_flag() {
    let consumers: Vec<String> = (1..=9)
        .map(|k| {
            format!(
                r#"{{ "name": "mm{k}", "kernel_type": "KERNEL_TYPE_AIC_ONLY", "block_dim": 8, "stream_id": 1,
                     "recv_events": [{k}], "functions": {{ "cube": "mm{k}_kernel" }} }}"#
            )
        })
        .collect();
    let json = format!(
        r#"{{ "kernel_name": "fan", "operators": [
            {{ "name": "src", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 8,
               "send_events": [1, 2, 3, 4, 5, 6, 7, 8, 9], "functions": {{ "vector": "src_kernel" }} }},
            {}
        ] }}"#,
        consumers.join(",")
    );
    let kernel = generate(&json).unwrap();

    assert_eq!(kernel.mode, ScheduleMode::SingleStream);
    assert_eq!(kernel.sync.signal_pairs, 9);
    let body = entry_body(&kernel.source, "fan");
    assert_eq!(body.matches("ffts_cross_core_sync(PIPE_MTE3, AscendC::GetffstMsg(0x02, 1));").count(), 9);
    assert_eq!(body.matches("wait_flag_dev(1);").count(), 9);
    assert!(!body.contains("wait_flag_dev(2);"));
}
