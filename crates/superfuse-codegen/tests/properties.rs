//! Property tests over random operator chains

use proptest::prelude::*;
use superfuse_codegen::{FusionGenerator, FusionRequest};

const KERNEL_TYPES: [&str; 6] = [
    "KERNEL_TYPE_AIV_ONLY",
    "KERNEL_TYPE_AIC_ONLY",
    "KERNEL_TYPE_MIX_AIV_1_0",
    "KERNEL_TYPE_MIX_AIC_1_0",
    "KERNEL_TYPE_MIX_AIC_1_1",
    "KERNEL_TYPE_MIX_AIC_1_2",
];

fn chain_request(ops: &[(usize, u32)], options: &str) -> FusionRequest {
    let operators: Vec<String> = ops
        .iter()
        .enumerate()
        .map(|(i, (kind, blocks))| {
            format!(
                r#"{{ "name": "op{i}", "kernel_type": "{}", "block_dim": {blocks}, "params": ["x"],
                     "functions": {{ "vector": "op{i}_vec", "cube": "op{i}_cube" }} }}"#,
                KERNEL_TYPES[*kind]
            )
        })
        .collect();
    let json = format!(
        r#"{{ "kernel_name": "prop", "options": "{options}", "operators": [{}] }}"#,
        operators.join(",")
    );
    FusionRequest::parse(&json).unwrap()
}

/// Sync primitives in emission order
fn sync_lines(source: &str) -> Vec<&str> {
    source
        .lines()
        .map(str::trim)
        .filter(|line| {
            ["AscendC::SyncAll", "ffts_cross_core_sync", "wait_flag_dev"]
                .iter()
                .any(|prefix| line.starts_with(prefix))
        })
        .collect()
}

fn chain() -> impl Strategy<Value = Vec<(usize, u32)>> {
    prop::collection::vec((0..KERNEL_TYPES.len(), 1u32..=24), 1..8)
}

proptest! {
    #[test]
    fn prop_generation_is_deterministic(ops in chain(), early in prop::bool::ANY) {
        let options = if early { "early-start=1" } else { "early-start=0" };
        let request = chain_request(&ops, options);
        let first = FusionGenerator::new().generate(&request).unwrap();
        let second = FusionGenerator::new().generate(&request).unwrap();
        prop_assert_eq!(first.source, second.source);
        prop_assert_eq!(first.layout, second.layout);
        prop_assert_eq!(first.compile_defines, second.compile_defines);
    }

    #[test]
    fn prop_disabled_early_start_uses_only_full_barriers(ops in chain()) {
        let kernel = FusionGenerator::new()
            .generate(&chain_request(&ops, "early-start=0"))
            .unwrap();
        prop_assert_eq!(kernel.sync.signal_pairs, 0);
        prop_assert!(kernel.sync.full_barriers >= ops.len() - 1);
    }

    #[test]
    fn prop_split_leaves_sync_skeleton_unchanged(ops in chain(), split in 2u32..=8, early in prop::bool::ANY) {
        let early = if early { "early-start=1" } else { "early-start=0" };
        let single = FusionGenerator::new()
            .generate(&chain_request(&ops, &format!("{early}:split-mode=1")))
            .unwrap();
        let wide = FusionGenerator::new()
            .generate(&chain_request(&ops, &format!("{early}:split-mode={split}")))
            .unwrap();
        prop_assert_eq!(single.sync, wide.sync);
        prop_assert_eq!(sync_lines(&single.source), sync_lines(&wide.source));
    }
}
