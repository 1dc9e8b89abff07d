//! Dynamic dispatch resolver
//!
//! A dynamic operator learns its implementation and block count only at launch time, from three
//! cells the host fills: tiling key, block count and a ready lock. Two device functions are
//! emitted per operator:
//!
//! - `switch_func_of_NAME` spins on the ready lock, binary-searches the sorted tiling table and
//!   stores every variant's function address plus the packed block count
//!   (class code in the high word, literal count in the low word).
//! - `call_func_of_NAME` unpacks the class and gates the call on the runtime count, with the
//!   same domain guards a static operator of that class would get.
//!
//! After the call a full barrier guarantees every reader is past the spin before block 0 of the
//! primary domain resets the lock. [`prove_single_writer`] checks that shape on the schedule.

use crate::abi::{AbiLayout, DynamicSlots};
use crate::dispatch::{render_guarded, render_variant_chain, variant_symbols, GuardedCall};
use crate::emit::CodeWriter;
use crate::error::{CodegenError, Result};
use crate::graph::{OperatorGraph, OperatorId, OperatorNode, TilingEntry};
use crate::primitives::{lock_cell, preload, spin_until, store_and_flush};
use crate::schedule::Step;
use std::collections::BTreeSet;
use superfuse_core::{
    Domain, DomainAffinity, KernelType, LockState, SlotKind, DYNAMIC_CUBE_PRELOAD_UNITS, DYNAMIC_VECTOR_PRELOAD_UNITS,
};

/// Address variables are declared vector first
const ADDRESS_ORDER: [Domain; 2] = [Domain::Vector, Domain::Cube];

/// Local variables holding the resolved addresses of `domain`, one per variant
pub fn address_vars(domain: Domain, split: u32) -> Vec<String> {
    variant_symbols(&format!("{}_func_addr", domain.arch()), split)
}

fn address_args(split: u32) -> String {
    ADDRESS_ORDER
        .iter()
        .flat_map(|&d| address_vars(d, split))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Entry-point locals shared by every dynamic operator
pub fn entry_locals(split: u32) -> Vec<String> {
    let mut lines: Vec<String> = ADDRESS_ORDER
        .iter()
        .flat_map(|&d| address_vars(d, split))
        .map(|var| format!("uint64_t {var} = 0;"))
        .collect();
    lines.push("uint64_t dy_blockNum = 0;".to_string());
    lines
}

/// Switch and call functions of one dynamic operator
pub fn render_functions(node: &OperatorNode) -> String {
    let mut code = String::new();
    code.push_str(&switch_function(node));
    code.push_str(&call_function(node));
    code
}

fn switch_function(node: &OperatorNode) -> String {
    let refs = ADDRESS_ORDER
        .iter()
        .flat_map(|&d| address_vars(d, node.split))
        .map(|var| format!("uint64_t& {var}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut w = CodeWriter::new();
    w.line(format!("// begin implement of dynamic op {}", node.name));
    w.open(format!(
        "static __aicore__ void switch_func_of_{}(GM_ADDR __ac_dynamic_tiling_key, GM_ADDR __ac_dynamic_block_num, \
         GM_ADDR __ac_dynamic_lock, {refs}, uint64_t& dy_block_num)",
        node.name
    ));
    w.line(lock_cell("tilingKeyAddr", "__ac_dynamic_tiling_key", false));
    w.line(lock_cell("blockNumAddr", "__ac_dynamic_block_num", false));
    w.line(lock_cell("lockAddr", "__ac_dynamic_lock", true));
    w.lines(spin_until("lockAddr", LockState::Ready.value()));
    w.blank();
    let entries: Vec<&TilingEntry> = node.tiling().iter().collect();
    render_search(&mut w, &entries, node.split);
    w.line("return;");
    w.close();
    w.blank();
    w.finish()
}

/// Binary search over entries sorted by tiling key
fn render_search(w: &mut CodeWriter, entries: &[&TilingEntry], split: u32) {
    match entries {
        [] => {}
        [only] => {
            w.open(format!("if (*tilingKeyAddr == {})", only.tiling_key));
            render_case(w, only, split);
            w.close();
        }
        [first, second] => {
            w.open(format!("if (*tilingKeyAddr == {})", first.tiling_key));
            render_case(w, first, split);
            w.reopen("else");
            render_case(w, second, split);
            w.close();
        }
        _ => {
            let mid = entries.len() / 2;
            w.open(format!("if (*tilingKeyAddr < {})", entries[mid].tiling_key));
            render_search(w, &entries[..mid], split);
            w.reopen("else");
            render_search(w, &entries[mid..], split);
            w.close();
        }
    }
}

fn render_case(w: &mut CodeWriter, entry: &TilingEntry, split: u32) {
    for domain in ADDRESS_ORDER {
        if !entry.kernel_type.affinity().contains(domain) {
            continue;
        }
        let Some(base) = entry.functions.get(domain) else { continue };
        for (var, symbol) in address_vars(domain, split).iter().zip(variant_symbols(base, split)) {
            w.line(format!("{var} = (uint64_t)({symbol});"));
        }
    }
    w.line(format!(
        "dy_block_num = ((uint64_t){}) << 32 | (*blockNumAddr);",
        entry.kernel_type.code()
    ));
}

fn call_function(node: &OperatorNode) -> String {
    let ptr_params = ADDRESS_ORDER
        .iter()
        .flat_map(|&d| variant_symbols(&format!("const uint64_t dy_{}_func_ptr", d.arch()), node.split))
        .collect::<Vec<_>>()
        .join(", ");

    let mut w = CodeWriter::new();
    w.open(format!(
        "__aicore__ inline void call_func_of_{}(uint64_t args_offset, {ptr_params}, const uint64_t dy_block_num)",
        node.name
    ));
    w.line("uint64_t kernelType = dy_block_num >> 32;");
    w.line("uint64_t numBlocks = dy_block_num & 0xFFFFFFFF;");
    w.line("g_super_kernel_dynamic_block_num = numBlocks;");
    w.line("using FuncType = void (*)(uint64_t args_offset);");
    for domain in ADDRESS_ORDER {
        let arch = domain.arch();
        for (ptr, src) in variant_symbols(&format!("{arch}_ptr"), node.split)
            .iter()
            .zip(variant_symbols(&format!("dy_{arch}_func_ptr"), node.split))
        {
            w.line(format!("FuncType {ptr} = (FuncType)({src});"));
        }
    }

    let calls = |domain: Domain| -> Vec<String> {
        variant_symbols(&format!("{}_ptr", domain.arch()), node.split)
            .into_iter()
            .map(|ptr| format!("{ptr}(args_offset);"))
            .collect()
    };

    let mut opened = false;
    for affinity in [DomainAffinity::Mixed, DomainAffinity::VectorOnly, DomainAffinity::CubeOnly] {
        let codes: Vec<u32> = KernelType::ALL
            .iter()
            .filter(|kt| kt.affinity() == affinity)
            .map(|kt| kt.code())
            .collect();
        if !node.tiling().iter().any(|e| e.kernel_type.affinity() == affinity) {
            continue;
        }
        let test = codes
            .iter()
            .map(|code| format!("kernelType == {code}"))
            .collect::<Vec<_>>()
            .join(" || ");
        if opened {
            w.reopen(format!("else if ({test})"));
        } else {
            w.open(format!("if ({test})"));
            opened = true;
        }

        let gate = match affinity {
            DomainAffinity::VectorOnly => "AscendC::GetBlockIdx",
            DomainAffinity::CubeOnly | DomainAffinity::Mixed => "get_block_idx",
        };
        w.open(format!("if ({gate}() < numBlocks)"));
        match affinity {
            DomainAffinity::Mixed => {
                w.open(format!("if {}", Domain::Cube.guard()));
                render_variant_chain(&mut w, &calls(Domain::Cube), None);
                w.reopen("else");
                render_variant_chain(&mut w, &calls(Domain::Vector), None);
                w.close();
            }
            single => {
                let domain = single.primary();
                w.open(format!("if {}", domain.guard()));
                render_variant_chain(&mut w, &calls(domain), None);
                w.close();
            }
        }
        w.close();
    }
    if opened {
        w.close();
    }
    w.close();
    w.blank();
    w.finish()
}

/// Call of the switch function from the entry point
pub fn render_resolve(w: &mut CodeWriter, node: &OperatorNode, slots: DynamicSlots) {
    w.line(format!(
        "switch_func_of_{}(param_base[{}], param_base[{}], param_base[{}], {}, dy_blockNum);",
        node.name,
        slots.tiling_key,
        slots.block_count,
        slots.ready_lock,
        address_args(node.split)
    ));
}

/// Call of the call function from the entry point
pub fn render_invoke(w: &mut CodeWriter, node: &OperatorNode, args_offset: u32, before: &[String], after: &[String]) {
    w.lines(before);
    w.line(format!(
        "call_func_of_{}({args_offset}, {}, dy_blockNum);",
        node.name,
        address_args(node.split)
    ));
    w.lines(after);
}

/// Block 0 of the primary domain returns the ready lock to NotReady
pub fn render_lock_reset(w: &mut CodeWriter, node: &OperatorNode, slots: DynamicSlots) {
    let domain = node.affinity().primary();
    w.open(format!("if {}", domain.guard()));
    w.open(format!("if ({}() == 0)", node.kernel_type.block_index_fn(domain)));
    w.line(lock_cell("lockAddr", &format!("param_base[{}]", slots.ready_lock), true));
    w.lines(store_and_flush("lockAddr", LockState::NotReady.value()));
    w.close();
    w.close();
}

/// Prefetch the resolved addresses before the call
pub fn render_preload(w: &mut CodeWriter, node: &OperatorNode, arch: Option<Domain>) {
    for &domain in node.affinity().domains() {
        let units = match domain {
            Domain::Vector => DYNAMIC_VECTOR_PRELOAD_UNITS,
            Domain::Cube => DYNAMIC_CUBE_PRELOAD_UNITS,
        };
        let variants = address_vars(domain, node.split)
            .iter()
            .map(|var| preload(var, u64::from(units)))
            .collect();
        let call = GuardedCall::new(
            domain,
            node.kernel_type.block_index_fn(domain),
            node.block_count,
            variants,
        );
        render_guarded(w, &call, arch);
    }
}

/// Prove every dynamic operator's ready lock has one writer and is reset only after its readers
///
/// Per operator the schedule must hold exactly one resolve, one invoke and one reset, in that
/// order, with a full barrier between the invoke and the reset, and the lock must sit in a slot
/// no other cell uses.
pub fn prove_single_writer(graph: &OperatorGraph, layout: &AbiLayout, steps: &[Step]) -> Result<()> {
    let mut seen_slots = BTreeSet::new();

    for (index, node) in graph.nodes().iter().enumerate() {
        if !node.is_dynamic() {
            continue;
        }
        let op = OperatorId(index);
        let fail = |reason: String| CodegenError::UnresolvedDynamicDependency {
            operator: node.name.clone(),
            reason,
        };

        let slots = layout
            .operator(op)
            .dynamic
            .ok_or_else(|| fail("no runtime cells were assigned".to_string()))?;
        if !seen_slots.insert(slots.ready_lock) {
            return Err(fail(format!("ready lock slot {} is shared", slots.ready_lock)));
        }
        match layout.slots().get(slots.ready_lock as usize) {
            Some(SlotKind::DynamicReadyLock { operator }) if *operator == node.name => {}
            _ => return Err(fail(format!("slot {} is not this operator's ready lock", slots.ready_lock))),
        }

        let find = |label: &str, pred: &dyn Fn(&Step) -> bool| -> Result<usize> {
            let hits: Vec<usize> = steps
                .iter()
                .enumerate()
                .filter(|(_, s)| pred(s))
                .map(|(i, _)| i)
                .collect();
            match hits.as_slice() {
                [at] => Ok(*at),
                [] => Err(fail(format!("no {label} step"))),
                _ => Err(fail(format!("{} {label} steps", hits.len()))),
            }
        };
        let resolve = find("resolve", &|s| matches!(s, Step::DynamicResolve { op: o } if *o == op))?;
        let invoke = find("invoke", &|s| matches!(s, Step::Invoke { op: o } if *o == op))?;
        let reset = find("lock reset", &|s| matches!(s, Step::LockReset { op: o } if *o == op))?;

        if !(resolve < invoke && invoke < reset) {
            return Err(fail("resolve, invoke and lock reset are out of order".to_string()));
        }
        if !steps[invoke..reset].iter().any(Step::is_full_barrier) {
            return Err(fail("the lock is reset before every reader has passed the spin".to_string()));
        }
    }
    Ok(())
}
