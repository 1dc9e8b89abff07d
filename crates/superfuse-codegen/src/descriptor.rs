//! Fusion request descriptor
//!
//! The JSON document handed to the generator by the host-side planning pipeline. It names the
//! fused kernel, carries the option string and hardware profile, and lists the sub-operators in
//! the order they must run.
//!
//! ```json
//! {
//!   "kernel_name": "fused_attention",
//!   "options": "early-start=0:split-mode=2",
//!   "operators": [
//!     { "name": "add", "kernel_type": "KERNEL_TYPE_AIV_ONLY", "block_dim": 32,
//!       "params": ["x", "y"], "functions": { "vector": "add_kernel" } }
//!   ]
//! }
//! ```

use crate::error::{CodegenError, Result};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use superfuse_core::{Domain, KernelType, DEFAULT_CUBE_UNITS, DEFAULT_VECTOR_UNITS};

/// Top-level fusion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionRequest {
    /// Name of the fused kernel; becomes part of every emitted symbol
    pub kernel_name: String,
    /// Colon-separated option string
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub hardware: HardwareProfile,
    /// Sub-operators in execution order
    pub operators: Vec<OperatorDescriptor>,
}

/// Physical unit counts of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    #[serde(default = "default_cube_units")]
    pub cube_units: u32,
    #[serde(default = "default_vector_units")]
    pub vector_units: u32,
}

fn default_cube_units() -> u32 {
    DEFAULT_CUBE_UNITS
}

fn default_vector_units() -> u32 {
    DEFAULT_VECTOR_UNITS
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            cube_units: DEFAULT_CUBE_UNITS,
            vector_units: DEFAULT_VECTOR_UNITS,
        }
    }
}

impl HardwareProfile {
    pub fn units(&self, domain: Domain) -> u32 {
        match domain {
            Domain::Cube => self.cube_units,
            Domain::Vector => self.vector_units,
        }
    }

    /// Block count a runtime-resolved operator is gated on before resolution
    pub fn dynamic_block_count(&self, kernel_type: KernelType) -> u32 {
        self.units(kernel_type.affinity().primary())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Normal,
    Dynamic,
}

/// Device function names per domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNames {
    #[serde(default)]
    pub vector: Option<String>,
    #[serde(default)]
    pub cube: Option<String>,
}

impl FunctionNames {
    pub fn get(&self, domain: Domain) -> Option<&str> {
        match domain {
            Domain::Cube => self.cube.as_deref(),
            Domain::Vector => self.vector.as_deref(),
        }
    }
}

/// Instruction text size per domain, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSize {
    #[serde(default)]
    pub vector: u64,
    #[serde(default)]
    pub cube: u64,
}

impl TextSize {
    pub fn get(&self, domain: Domain) -> u64 {
        match domain {
            Domain::Cube => self.cube,
            Domain::Vector => self.vector,
        }
    }
}

/// Early-start flags compiled into a sub-kernel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyStartFlags {
    /// The sub-kernel signals "next task may start" itself
    #[serde(default)]
    pub set: bool,
    /// The sub-kernel waits for the previous task itself
    #[serde(default)]
    pub wait: bool,
}

/// One entry of a dynamic operator's tiling table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingCase {
    pub tiling_key: u64,
    pub kernel_type: String,
    #[serde(default)]
    pub functions: FunctionNames,
}

/// One sub-operator of the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorDescriptor {
    pub name: String,
    pub kernel_type: String,
    #[serde(default)]
    pub block_dim: u32,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub stream_id: u32,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub functions: FunctionNames,
    #[serde(default)]
    pub text_size: TextSize,
    #[serde(default)]
    pub send_events: Vec<u32>,
    #[serde(default)]
    pub recv_events: Vec<u32>,
    #[serde(default)]
    pub early_start: EarlyStartFlags,
    #[serde(default)]
    pub dcci_before_kernel_start: bool,
    #[serde(default)]
    pub dcci_after_kernel_end: bool,
    #[serde(default)]
    pub dcci_disable_on_kernel: bool,
    #[serde(default)]
    pub with_sync_all: bool,
    /// Split mode the sub-kernel was compiled with; must match the fused split mode
    #[serde(default)]
    pub split_mode: Option<u32>,
    #[serde(default)]
    pub debug_options: String,
    #[serde(default)]
    pub debug_buf_size: u64,
    /// The sequence edge from the previous operator stays on one unit in program order
    #[serde(default)]
    pub unit_local: bool,
    #[serde(default)]
    pub tiling: Vec<TilingCase>,
}

impl OperatorDescriptor {
    pub fn kernel_type(&self) -> Result<KernelType> {
        KernelType::from_name(&self.kernel_type)
            .map_err(|e| CodegenError::operator(&self.name, e.to_string()))
    }

    pub fn is_dynamic(&self) -> bool {
        self.task_type == TaskType::Dynamic
    }

    /// Debug options that need the dump workspace
    pub fn needs_dump(&self) -> bool {
        ["timestamp", "printf", "assert"]
            .iter()
            .any(|opt| self.debug_options.contains(opt))
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(CodegenError::operator(&self.name, "name is not a valid identifier"));
        }
        let kernel_type = self.kernel_type()?;

        if self.is_dynamic() {
            if self.tiling.is_empty() {
                return Err(CodegenError::UnresolvedDynamicDependency {
                    operator: self.name.clone(),
                    reason: "dynamic operator has an empty tiling table".to_string(),
                });
            }
            let mut keys = BTreeSet::new();
            for case in &self.tiling {
                if !keys.insert(case.tiling_key) {
                    return Err(CodegenError::operator(
                        &self.name,
                        format!("tiling key {} appears twice", case.tiling_key),
                    ));
                }
                let case_type = KernelType::from_name(&case.kernel_type)
                    .map_err(|e| CodegenError::operator(&self.name, e.to_string()))?;
                check_functions(&self.name, case_type, &case.functions)?;
            }
        } else {
            if self.block_dim == 0 {
                return Err(CodegenError::operator(&self.name, "block_dim must be positive"));
            }
            if !self.tiling.is_empty() {
                return Err(CodegenError::operator(&self.name, "only dynamic operators carry a tiling table"));
            }
            check_functions(&self.name, kernel_type, &self.functions)?;
        }

        for (list, label) in [(&self.send_events, "send"), (&self.recv_events, "recv")] {
            let unique: BTreeSet<_> = list.iter().collect();
            if unique.len() != list.len() {
                return Err(CodegenError::InvalidEvent {
                    operator: self.name.clone(),
                    reason: format!("duplicate id in {label} event list"),
                });
            }
        }
        Ok(())
    }

    /// Tiling table in key order
    fn sorted_tiling(&self) -> Vec<&TilingCase> {
        let mut cases: Vec<&TilingCase> = self.tiling.iter().collect();
        cases.sort_by_key(|case| case.tiling_key);
        cases
    }
}

fn check_functions(operator: &str, kernel_type: KernelType, functions: &FunctionNames) -> Result<()> {
    for &domain in kernel_type.affinity().domains() {
        match functions.get(domain) {
            Some(name) if is_identifier(name) => {}
            Some(name) => {
                return Err(CodegenError::operator(
                    operator,
                    format!("function name `{name}` is not a valid identifier"),
                ))
            }
            None => {
                return Err(CodegenError::operator(
                    operator,
                    format!("{} requires a {domain} function", kernel_type.name()),
                ))
            }
        }
    }
    Ok(())
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FusionRequest {
    /// Parse a request from JSON
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate structural constraints that do not depend on the options
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.kernel_name) {
            return Err(CodegenError::operator(&self.kernel_name, "kernel name is not a valid identifier"));
        }
        if self.operators.is_empty() {
            return Err(CodegenError::malformed("fusion request has no operators"));
        }
        if self.hardware.cube_units == 0 || self.hardware.vector_units == 0 {
            return Err(CodegenError::malformed("hardware profile must have units in both domains"));
        }
        self.operators.iter().try_for_each(OperatorDescriptor::validate)?;

        // Resolver functions are emitted once per dynamic name.
        let mut dynamic: BTreeMap<&str, &OperatorDescriptor> = BTreeMap::new();
        for op in self.operators.iter().filter(|op| op.is_dynamic()) {
            match dynamic.entry(op.name.as_str()) {
                Entry::Vacant(slot) => {
                    slot.insert(op);
                }
                Entry::Occupied(first) => {
                    let first = *first.get();
                    if first.kernel_type != op.kernel_type || first.sorted_tiling() != op.sorted_tiling() {
                        return Err(CodegenError::operator(
                            &op.name,
                            "dynamic operator reuses a name with a different tiling table",
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
