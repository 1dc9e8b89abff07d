//! Per-unit dispatch of sub-operator code variants
//!
//! A sub-operator compiled with split factor `S` ships `S` interchangeable copies of its code
//! (`fn`, `fn_split1`, …, `fn_split{S-1}`). At run time each physical unit first checks it is one
//! of the operator's `block_count` logical blocks, then picks the copy given by its hardware core
//! id modulo `S`. [`RoutingRule::route`] is the host model of that decision; [`render_guarded`]
//! emits the device form.

use crate::emit::CodeWriter;
use superfuse_core::Domain;

/// A physical unit as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalUnit {
    pub domain: Domain,
    /// Logical block index reported by the unit's block-index intrinsic
    pub block_index: u32,
    /// Hardware core id
    pub core_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The unit runs nothing for this operator
    Skip,
    /// The unit runs the given code variant
    Variant(u32),
}

/// Dispatch rule of one operator portion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingRule {
    pub domain: Domain,
    pub block_count: u32,
    pub split: u32,
}

impl RoutingRule {
    pub fn new(domain: Domain, block_count: u32, split: u32) -> Self {
        Self {
            domain,
            block_count,
            split: split.max(1),
        }
    }

    pub fn route(&self, unit: PhysicalUnit) -> Route {
        if unit.domain != self.domain || unit.block_index >= self.block_count {
            return Route::Skip;
        }
        Route::Variant(unit.core_id % self.split)
    }
}

/// Symbol of variant `index` of `base`; variant 0 is the base symbol itself
pub fn variant_symbol(base: &str, index: u32) -> String {
    if index == 0 {
        base.to_string()
    } else {
        format!("{base}_split{index}")
    }
}

pub fn variant_symbols(base: &str, split: u32) -> Vec<String> {
    (0..split.max(1)).map(|i| variant_symbol(base, i)).collect()
}

/// Emit the core-id selection among per-variant statements
///
/// A single variant is emitted without selection. `tail` is appended to every variant body.
pub fn render_variant_chain(w: &mut CodeWriter, variants: &[String], tail: Option<&str>) {
    if variants.len() <= 1 {
        if let Some(stmt) = variants.first() {
            w.line(stmt);
        }
        if let Some(tail) = tail {
            w.line(tail);
        }
        return;
    }

    let split = variants.len();
    w.line("uint8_t coreid = (uint8_t)get_coreid();");
    for (i, stmt) in variants.iter().enumerate() {
        if i == 0 {
            w.open(format!("if ((coreid % {split}) == 0)"));
        } else if i + 1 == split {
            w.reopen("else");
        } else {
            w.reopen(format!("else if ((coreid % {split}) == {i})"));
        }
        w.line(stmt);
        if let Some(tail) = tail {
            w.line(tail);
        }
    }
    w.close();
}

/// One domain-guarded, block-gated, variant-routed statement group
#[derive(Debug, Clone)]
pub struct GuardedCall {
    pub domain: Domain,
    /// Block-index intrinsic, e.g. `AscendC::GetBlockIdx`
    pub block_fn: &'static str,
    /// Right-hand side of the block gate (a literal count or a runtime expression)
    pub limit: String,
    /// One statement per code variant
    pub variants: Vec<String>,
    /// Lines emitted inside the domain guard before the gate
    pub before: Vec<String>,
    /// Lines emitted inside the domain guard after the gate
    pub after: Vec<String>,
    /// Appended to every variant body
    pub variant_tail: Option<String>,
    /// Body of the branch taken by units outside the gate
    pub complement: Option<String>,
}

impl GuardedCall {
    pub fn new(domain: Domain, block_fn: &'static str, limit: impl ToString, variants: Vec<String>) -> Self {
        Self {
            domain,
            block_fn,
            limit: limit.to_string(),
            variants,
            before: Vec::new(),
            after: Vec::new(),
            variant_tail: None,
            complement: None,
        }
    }
}

/// Emit a guarded call; the domain guard is dropped when already inside `arch`
pub fn render_guarded(w: &mut CodeWriter, call: &GuardedCall, arch: Option<Domain>) {
    let guarded = arch != Some(call.domain);
    if guarded {
        w.open(format!("if {}", call.domain.guard()));
    }
    w.lines(&call.before);
    w.open(format!("if ({}() < {})", call.block_fn, call.limit));
    render_variant_chain(w, &call.variants, call.variant_tail.as_deref());
    match &call.complement {
        Some(body) => {
            w.reopen("else");
            w.line(body);
            w.close();
        }
        None => {
            w.close();
        }
    }
    w.lines(&call.after);
    if guarded {
        w.close();
    }
    w.blank();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unit(block_index: u32, core_id: u32) -> PhysicalUnit {
        PhysicalUnit {
            domain: Domain::Vector,
            block_index,
            core_id,
        }
    }

    #[test]
    fn test_route_gates_on_block_count() {
        let rule = RoutingRule::new(Domain::Vector, 32, 4);
        assert_eq!(rule.route(unit(31, 6)), Route::Variant(2));
        assert_eq!(rule.route(unit(32, 6)), Route::Skip);
        let cube = PhysicalUnit {
            domain: Domain::Cube,
            ..unit(0, 0)
        };
        assert_eq!(rule.route(cube), Route::Skip);
    }

    #[test]
    fn test_variant_symbols() {
        assert_eq!(variant_symbols("add", 3), vec!["add", "add_split1", "add_split2"]);
        assert_eq!(variant_symbols("add", 1), vec!["add"]);
    }

    #[test]
    fn test_render_four_way_split() {
        let mut w = CodeWriter::new();
        let call = GuardedCall::new(
            Domain::Vector,
            "AscendC::GetBlockIdx",
            32,
            variant_symbols("add", 4).into_iter().map(|s| format!("{s}(1);")).collect(),
        );
        render_guarded(&mut w, &call, None);
        insta::assert_snapshot!(w.finish(), @r###"
        if ASCEND_IS_AIV {
            if (AscendC::GetBlockIdx() < 32) {
                uint8_t coreid = (uint8_t)get_coreid();
                if ((coreid % 4) == 0) {
                    add(1);
                } else if ((coreid % 4) == 1) {
                    add_split1(1);
                } else if ((coreid % 4) == 2) {
                    add_split2(1);
                } else {
                    add_split3(1);
                }
            }
        }
        "###);
    }

    #[test]
    fn test_render_single_variant_inside_arch_function() {
        let mut w = CodeWriter::new();
        let mut call = GuardedCall::new(Domain::Cube, "get_block_idx", 8, vec!["mm(3);".to_string()]);
        call.complement = Some("AscendC::SuperKernelAutoSyncAllComplementImpl();".to_string());
        render_guarded(&mut w, &call, Some(Domain::Cube));
        let text = w.finish();
        assert!(!text.contains("ASCEND_IS_AIC"));
        assert!(!text.contains("coreid"));
        assert!(text.contains("} else {\n    AscendC::SuperKernelAutoSyncAllComplementImpl();"));
    }

    proptest! {
        // Units inside the gate are partitioned across all variants, each unit picking exactly one.
        #[test]
        fn prop_active_units_cover_every_variant(blocks in 1u32..48, split in 1u32..8) {
            let rule = RoutingRule::new(Domain::Vector, blocks, split);
            let mut seen = vec![false; split as usize];
            for core in 0..48u32 {
                match rule.route(unit(core, core)) {
                    Route::Variant(v) => {
                        prop_assert!(core < blocks);
                        prop_assert!(v < split);
                        seen[v as usize] = true;
                    }
                    Route::Skip => {
                        prop_assert!(core >= blocks);
                    }
                }
            }
            if blocks >= split {
                prop_assert!(seen.iter().all(|s| *s));
            }
        }
    }
}
