//! Profiling instrumentation
//!
//! With `profiling=1` every unit appends start/stop records to its own slice of a profiling
//! region. The helper functions below are emitted once per kernel; the generator brackets the
//! whole kernel (event 0), each operator (event `index + 1`), and each external notify/wait
//! (event id of the event) with [`record_call`]. The helpers stop recording, without reporting
//! an error, once the magic number is wrong or the region fills up.

use superfuse_core::{
    ProfilingEventKind, CUBE_PROFILING_UNIT_OFFSET, PROFILING_MAGIC, PROFILING_PER_UNIT_SIZE_OFFSET,
    PROFILING_RECORD_BYTES, PROFILING_REGION_HEADER_BYTES,
};

/// `RecordProfiling` call for one start or stop record
pub fn record_call(event_id: u32, kind: ProfilingEventKind, start: bool) -> String {
    let kind = match kind {
        ProfilingEventKind::Kernel => "0".to_string(),
        other => format!("{:#x}", other.code()),
    };
    format!("RecordProfiling({event_id}, {kind}, {start});")
}

/// Entry prologue lines binding the region pointer and task id
pub fn init_lines(region_slot: u32, task_slot: u32) -> [String; 3] {
    [
        format!("GM_ADDR profilingPtr = param_base[{region_slot}];"),
        format!("uint32_t taskId = *((__gm__ uint32_t*)(get_para_base() + 8 * {task_slot}));"),
        "InitProfiling(taskId, profilingPtr);".to_string(),
    ]
}

/// Device helpers: region validation, unit index, record writers and init
pub fn device_helpers() -> String {
    let mut code = String::new();
    code.push_str("\n__BLOCK_LOCAL__ __inline__ uint32_t g_profiling_task_id;\n");
    code.push_str("__BLOCK_LOCAL__ __inline__ __gm__ uint8_t* g_profiling_base_addr;\n");
    code.push_str("__BLOCK_LOCAL__ __inline__ __gm__ uint8_t* g_profiling_working_addr;\n");
    code.push_str("__BLOCK_LOCAL__ __inline__ __gm__ uint8_t* g_profiling_max_addr;\n");
    code.push_str("__BLOCK_LOCAL__ __inline__ bool g_profiling_off;\n");
    code.push_str("__BLOCK_LOCAL__ __inline__ uint32_t g_percore_size;\n");
    code.push_str(&format!("constexpr uint64_t PROFILING_MAGIC_NUMBER = {PROFILING_MAGIC:#x};\n"));
    code.push_str("constexpr uint32_t PROFILING_WORKINF_PTR_OFFSET = 8;\n");
    code.push_str("constexpr uint32_t PROFILING_MAX_PTR_OFFSET = 16;\n");
    code.push_str(&format!("constexpr uint32_t ONE_PROFILING_HEAD_SIZE = {PROFILING_RECORD_BYTES};\n"));
    code.push_str(&format!("constexpr uint32_t ONE_PROFILING_DATA_SIZE = {PROFILING_RECORD_BYTES};\n"));

    code.push_str("__aicore__ inline bool ProfilingAreaIsValid()\n{\n");
    code.push_str("    return (*((__gm__ uint64_t*)g_profiling_base_addr) == PROFILING_MAGIC_NUMBER) &&\n");
    code.push_str(
        "        ((*((__gm__ uint64_t*)g_profiling_working_addr)) < (*((__gm__ uint64_t*)g_profiling_max_addr)));\n",
    );
    code.push_str("}\n\n");

    code.push_str("__aicore__ inline uint8_t GetProfilingBlockIdx()\n{\n");
    code.push_str("    if ASCEND_IS_AIV {\n");
    code.push_str("        return get_block_idx() * get_subblockdim() + get_subblockid();\n");
    code.push_str("    } else {\n");
    code.push_str(&format!("        return get_block_idx() + {CUBE_PROFILING_UNIT_OFFSET};\n"));
    code.push_str("    }\n}\n\n");

    code.push_str("__aicore__ inline void RecordProfiling()\n{\n");
    code.push_str("    if (g_profiling_off) {\n        return;\n    }\n");
    code.push_str("    uint8_t blockIdx = GetProfilingBlockIdx();\n");
    code.push_str("    uint64_t workAddr = *((__gm__ uint64_t*)g_profiling_working_addr);\n");
    code.push_str(
        "    *((__gm__ uint64_t*)workAddr) = ((uint64_t)g_profiling_task_id << 32) | (((uint64_t)blockIdx) << 8) | 0xff;\n",
    );
    code.push_str(&advance_cursor());
    code.push_str("}\n\n");

    code.push_str("__aicore__ inline void RecordProfiling(uint32_t index, uint8_t profilingType, bool startFlag)\n{\n");
    code.push_str("    if (g_profiling_off) {\n        return;\n    }\n");
    code.push_str("    uint64_t workAddr = *((__gm__ uint64_t*)g_profiling_working_addr);\n");
    code.push_str("    if (startFlag) {\n");
    code.push_str(
        "        *((__gm__ uint64_t*)workAddr) = ((uint64_t)index << 32) | (((uint64_t)profilingType & 0xf) << 8) | 0x0;\n",
    );
    code.push_str("    } else {\n");
    code.push_str("        *((__gm__ uint64_t*)workAddr) =\n");
    code.push_str("            ((uint64_t)index << 32) | (1 << 12) | (((uint64_t)profilingType & 0xf) << 8) | 0x0;\n");
    code.push_str("    }\n");
    code.push_str(&advance_cursor());
    code.push_str("}\n\n");

    code.push_str("__aicore__ inline void InitProfiling(uint32_t taskId, GM_ADDR profilingPtr)\n{\n");
    code.push_str("    g_profiling_off = false;\n");
    code.push_str("    uint8_t blockIdx = GetProfilingBlockIdx();\n");
    code.push_str(&format!(
        "    g_percore_size = *((__gm__ uint32_t*)(profilingPtr + {PROFILING_PER_UNIT_SIZE_OFFSET}));\n"
    ));
    code.push_str(&format!(
        "    g_profiling_base_addr = profilingPtr + {PROFILING_REGION_HEADER_BYTES} + blockIdx * g_percore_size;\n"
    ));
    code.push_str("    g_profiling_working_addr = g_profiling_base_addr + PROFILING_WORKINF_PTR_OFFSET;\n");
    code.push_str("    g_profiling_max_addr = g_profiling_base_addr + PROFILING_MAX_PTR_OFFSET;\n");
    code.push_str("    if (!ProfilingAreaIsValid()) {\n        g_profiling_off = true;\n        return;\n    }\n");
    code.push_str("    g_profiling_task_id = taskId;\n");
    code.push_str("    RecordProfiling();\n");
    code.push_str("}\n");
    code
}

fn advance_cursor() -> String {
    let mut code = String::new();
    code.push_str("    *((__gm__ uint64_t*)workAddr + 1) = static_cast<uint64_t>(AscendC::GetSystemCycle());\n");
    code.push_str("    dcci((__gm__ uint64_t*)workAddr, 0, 2);\n");
    code.push_str("    *((__gm__ uint64_t*)g_profiling_working_addr) += ONE_PROFILING_DATA_SIZE;\n");
    code.push_str("    if (!ProfilingAreaIsValid()) {\n        g_profiling_off = true;\n    }\n");
    code.push_str("    dcci((__gm__ uint64_t*)g_profiling_working_addr, 0, 2);\n");
    code
}
