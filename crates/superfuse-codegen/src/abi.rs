//! Parameter-table layout of one fused launch
//!
//! Assigns every slot of the table in the order fixed by `superfuse_core::abi` and records, per
//! operator, where its argument block, lock cells and dynamic triple live. The layout is part of
//! the generator output so the host-side packer can fill the table without re-deriving it.

use crate::events::EventPlan;
use crate::graph::{OperatorGraph, OperatorId};
use serde::Serialize;
use superfuse_core::{CoreMixMetadata, KernelType, SlotKind, SYNC_CONTROLLER_SLOT};

/// Slots of a dynamic operator's runtime cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DynamicSlots {
    pub tiling_key: u32,
    pub block_count: u32,
    pub ready_lock: u32,
}

/// Slots owned by one operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperatorSlots {
    /// First argument slot; passed to every sub-kernel as `args_offset`
    pub args_offset: u32,
    /// `(event, slot)` per external send
    pub notify: Vec<(u32, u32)>,
    /// `(event, slot)` per external recv
    pub wait: Vec<(u32, u32)>,
    pub dynamic: Option<DynamicSlots>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbiLayout {
    slots: Vec<SlotKind>,
    operators: Vec<OperatorSlots>,
    workspace: Option<u32>,
    profiling: Option<u32>,
    task_id: Option<u32>,
}

impl AbiLayout {
    pub fn assign(graph: &OperatorGraph, events: &EventPlan, workspace: bool, profiling: bool) -> Self {
        let mut slots = vec![SlotKind::SyncController];
        let mut operators: Vec<OperatorSlots> = Vec::with_capacity(graph.len());

        for node in graph.nodes() {
            operators.push(OperatorSlots {
                args_offset: slots.len() as u32,
                ..OperatorSlots::default()
            });
            slots.extend(node.params.iter().map(|name| SlotKind::OperatorArgument {
                operator: node.name.clone(),
                name: name.clone(),
            }));
        }

        for (index, node) in graph.nodes().iter().enumerate() {
            let id = OperatorId(index);
            for &event in events.external_sends(id) {
                operators[index].notify.push((event, slots.len() as u32));
                slots.push(SlotKind::NotifyLock {
                    operator: node.name.clone(),
                    event,
                });
            }
            for &event in events.external_recvs(id) {
                operators[index].wait.push((event, slots.len() as u32));
                slots.push(SlotKind::WaitLock {
                    operator: node.name.clone(),
                    event,
                });
            }
        }

        for (index, node) in graph.nodes().iter().enumerate() {
            if !node.is_dynamic() {
                continue;
            }
            let base = slots.len() as u32;
            operators[index].dynamic = Some(DynamicSlots {
                tiling_key: base,
                block_count: base + 1,
                ready_lock: base + 2,
            });
            slots.push(SlotKind::DynamicTilingKey {
                operator: node.name.clone(),
            });
            slots.push(SlotKind::DynamicBlockCount {
                operator: node.name.clone(),
            });
            slots.push(SlotKind::DynamicReadyLock {
                operator: node.name.clone(),
            });
        }

        let mut reserve = |kind: SlotKind| {
            slots.push(kind);
            (slots.len() - 1) as u32
        };
        let workspace = workspace.then(|| reserve(SlotKind::Workspace));
        let (profiling, task_id) = if profiling {
            (Some(reserve(SlotKind::ProfilingRegion)), Some(reserve(SlotKind::TaskId)))
        } else {
            (None, None)
        };

        Self {
            slots,
            operators,
            workspace,
            profiling,
            task_id,
        }
    }

    pub fn slots(&self) -> &[SlotKind] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn sync_controller(&self) -> u32 {
        SYNC_CONTROLLER_SLOT
    }

    pub fn operator(&self, id: OperatorId) -> &OperatorSlots {
        &self.operators[id.0]
    }

    pub fn workspace(&self) -> Option<u32> {
        self.workspace
    }

    pub fn profiling(&self) -> Option<(u32, u32)> {
        self.profiling.zip(self.task_id)
    }

    /// Slots holding one-shot lock cells, each with its index
    pub fn lock_slots(&self) -> impl Iterator<Item = (u32, &SlotKind)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, kind)| kind.is_lock())
            .map(|(i, kind)| (i as u32, kind))
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Core-mix metadata section read by the launcher
pub fn metadata_section(meta: &CoreMixMetadata, kernel_type: KernelType) -> String {
    let record = |suffix: &str| {
        format!(
            "static const struct FunLevelMixCoreType {name}_{suffix}_section __attribute__ ((used, section \
             (\".ascend.meta.{name}_{suffix}\"))) = {{ {{{{F_TYPE_KTYPE, sizeof(unsigned int)}}, {symbol}}},    \
             {{{{F_TYPE_MIX_TASK_RATION, sizeof(unsigned int)}}, {aic}, {aiv}}} }};\n",
            name = meta.kernel_name,
            symbol = meta.main.symbol(),
            aic = meta.aic_ratio,
            aiv = meta.aiv_ratio,
        )
    };

    let mut code = String::new();
    code.push_str("#if TILING_KEY_VAR == 0UL\n");
    if kernel_type == KernelType::MixAic1_2 {
        code.push_str("#if defined(__DAV_C220_CUBE__)\n");
        code.push_str(&record("mix_aic"));
        code.push_str("#endif\n");
        code.push_str("#if defined(__DAV_C220_VEC__)\n");
        code.push_str(&record("mix_aiv"));
        code.push_str("#endif\n");
    } else {
        code.push_str(&record(meta.main.section_suffix()));
    }
    code.push_str("#endif\n");
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HardwareProfile;
    use crate::graph::tests::node;
    use crate::graph::{DispatchKind, TilingEntry};

    fn layout_for(nodes: Vec<crate::graph::OperatorNode>, workspace: bool, profiling: bool) -> AbiLayout {
        let events = EventPlan::analyze(&nodes, false).unwrap();
        let mut graph = OperatorGraph::new(HardwareProfile::default());
        for n in nodes {
            graph.add_operator(n).unwrap();
        }
        events.connect(&mut graph).unwrap();
        AbiLayout::assign(&graph, &events, workspace, profiling)
    }

    #[test]
    fn test_argument_blocks_follow_controller() {
        let mut a = node("a", KernelType::AivOnly, 8);
        a.params = vec!["x_0".into(), "y_0".into(), "z_0".into()];
        let b = node("b", KernelType::AivOnly, 8);
        let layout = layout_for(vec![a, b], false, false);
        assert_eq!(layout.operator(OperatorId(0)).args_offset, 1);
        assert_eq!(layout.operator(OperatorId(1)).args_offset, 4);
        assert_eq!(layout.slots()[0], SlotKind::SyncController);
        assert_eq!(layout.len(), 5);
    }

    #[test]
    fn test_class_order_with_every_slot_kind() {
        let mut a = node("a", KernelType::AivOnly, 8);
        a.send_events = vec![100];
        let mut b = node("b", KernelType::AicOnly, 8);
        b.recv_events = vec![200];
        b.dispatch = DispatchKind::Dynamic(vec![TilingEntry {
            tiling_key: 1,
            kernel_type: KernelType::AicOnly,
            functions: b.functions.clone(),
        }]);
        let layout = layout_for(vec![a, b], true, true);

        let ranks: Vec<u8> = layout.slots().iter().map(SlotKind::class_rank).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{ranks:?}");
        let b_slots = layout.operator(OperatorId(1));
        assert_eq!(layout.operator(OperatorId(0)).notify, vec![(100, 3)]);
        assert_eq!(b_slots.wait, vec![(200, 4)]);
        assert_eq!(b_slots.dynamic.map(|d| d.ready_lock), Some(7));
        assert_eq!(layout.workspace(), Some(8));
        assert_eq!(layout.profiling(), Some((9, 10)));
        assert_eq!(layout.lock_slots().count(), 3);
    }

    #[test]
    fn test_metadata_section_text() {
        let meta = CoreMixMetadata::for_kernel("fused", KernelType::MixAiv1_0);
        let text = metadata_section(&meta, KernelType::MixAiv1_0);
        assert!(text.contains("fused_mix_aiv_section"));
        assert!(text.contains("K_TYPE_MIX_AIV_MAIN},    {{F_TYPE_MIX_TASK_RATION, sizeof(unsigned int)}, 0, 1} };"));

        let meta = CoreMixMetadata::for_kernel("fused", KernelType::MixAic1_2);
        let text = metadata_section(&meta, KernelType::MixAic1_2);
        assert_eq!(text.matches("K_TYPE_MIX_AIC_MAIN").count(), 2);
        assert!(text.contains("__DAV_C220_VEC__"));
    }
}
