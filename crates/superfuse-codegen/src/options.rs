//! Fusion option string
//!
//! Options arrive as one colon-separated `key=value` list, e.g.
//! `early-start=0:split-mode=2:preload-code=max`. Every key has its own value parser; unknown
//! keys, duplicates and empty values are rejected with [`CodegenError::InvalidOption`].

use crate::error::{CodegenError, Result};
use std::collections::BTreeSet;
use std::str::FromStr;
use superfuse_core::{DEFAULT_FUNC_ALIGN, DEFAULT_SPLIT_MODE, MAX_SPLIT_MODE};
use tracing::warn;

/// How instruction preloading is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreloadMode {
    /// One `PreLoad` of the whole fused kernel at entry
    Whole,
    /// No preloading
    None,
    /// Preload the first operator at entry, then each following operator one step ahead
    #[default]
    PerFunc,
}

/// Inter-operator early-start handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyStartMode {
    Disabled,
    #[default]
    Enabled,
    /// Handshake enabled, but the sub-kernels' own start/wait flags are ignored
    EnabledNoSubKernel,
}

impl EarlyStartMode {
    pub fn is_enabled(self) -> bool {
        self != EarlyStartMode::Disabled
    }

    /// Whether per-operator start/wait flags are honored
    pub fn honors_sub_kernel_flags(self) -> bool {
        self == EarlyStartMode::Enabled
    }
}

/// Parsed fusion options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionOptions {
    /// Entry point alignment in bytes; 0 disables the attribute
    pub func_align: u32,
    pub preload: PreloadMode,
    pub early_start: EarlyStartMode,
    pub stream_fusion: bool,
    pub debug_dcci_all: bool,
    pub debug_sync_all: bool,
    pub feed_sync_all: bool,
    pub profiling: bool,
    /// Number of interchangeable code variants per operator
    pub split_mode: u32,
    pub debug_aic_num: Option<u32>,
    pub debug_aiv_num: Option<u32>,
    pub compile_options: Vec<String>,
    pub dcci_before_kernel_start: BTreeSet<String>,
    pub dcci_after_kernel_end: BTreeSet<String>,
    pub dcci_disable_on_kernel: BTreeSet<String>,
    pub strict_scope_check: Option<String>,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            func_align: DEFAULT_FUNC_ALIGN,
            preload: PreloadMode::default(),
            early_start: EarlyStartMode::default(),
            stream_fusion: false,
            debug_dcci_all: false,
            debug_sync_all: false,
            feed_sync_all: false,
            profiling: false,
            split_mode: DEFAULT_SPLIT_MODE,
            debug_aic_num: None,
            debug_aiv_num: None,
            compile_options: Vec::new(),
            dcci_before_kernel_start: BTreeSet::new(),
            dcci_after_kernel_end: BTreeSet::new(),
            dcci_disable_on_kernel: BTreeSet::new(),
            strict_scope_check: None,
        }
    }
}

impl FusionOptions {
    /// Parse an option string; an empty string yields the defaults
    pub fn parse(input: &str) -> Result<Self> {
        let mut options = Self::default();
        let mut seen = BTreeSet::new();

        for pair in input.split(':').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                warn!(option = pair, "ignoring fusion option without `=`");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(CodegenError::option(pair, "the key-value pair is incomplete"));
            }
            if !seen.insert(key.to_string()) {
                return Err(CodegenError::option(key, "option has already been set"));
            }
            options.apply(key, value)?;
        }

        Ok(options)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "func-align" => self.func_align = parse_alignment(key, value)?,
            "preload-code" => {
                self.preload = match value {
                    "max" => PreloadMode::Whole,
                    "none" => PreloadMode::None,
                    "per-func" => PreloadMode::PerFunc,
                    _ => return Err(one_of(key, value, "max, none, per-func")),
                }
            }
            "early-start" => {
                self.early_start = match value {
                    "0" => EarlyStartMode::Disabled,
                    "1" => EarlyStartMode::Enabled,
                    "2" => EarlyStartMode::EnabledNoSubKernel,
                    _ => return Err(one_of(key, value, "0, 1, 2")),
                }
            }
            "stream-fusion" => self.stream_fusion = parse_switch(key, value)?,
            "debug-dcci-all" => self.debug_dcci_all = parse_switch(key, value)?,
            "debug-sync-all" => self.debug_sync_all = parse_switch(key, value)?,
            "feed-sync-all" => self.feed_sync_all = parse_switch(key, value)?,
            "profiling" => self.profiling = parse_switch(key, value)?,
            "split-mode" => {
                let split = parse_number(key, value)?;
                if split == 0 || split > MAX_SPLIT_MODE {
                    return Err(CodegenError::option(
                        key,
                        format!("should be in (0, {MAX_SPLIT_MODE}], {split} is invalid"),
                    ));
                }
                self.split_mode = split;
            }
            "debug-aic-num" => self.debug_aic_num = Some(parse_positive(key, value)?),
            "debug-aiv-num" => self.debug_aiv_num = Some(parse_positive(key, value)?),
            "compile-options" => {
                self.compile_options = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "dcci-before-kernel-start" => self.dcci_before_kernel_start = name_list(value),
            "dcci-after-kernel-end" => self.dcci_after_kernel_end = name_list(value),
            "dcci-disable-on-kernel" => self.dcci_disable_on_kernel = name_list(value),
            "strict-scope-check" => self.strict_scope_check = Some(value.to_string()),
            _ => return Err(CodegenError::option(key, "option is not supported")),
        }
        Ok(())
    }
}

impl FromStr for FusionOptions {
    type Err = CodegenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn one_of(key: &str, value: &str, allowed: &str) -> CodegenError {
    CodegenError::option(key, format!("should be one of [{allowed}], {value} is invalid"))
}

fn parse_number(key: &str, value: &str) -> Result<u32> {
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodegenError::option(key, format!("should be a digit, {value} is invalid")));
    }
    value
        .parse()
        .map_err(|_| CodegenError::option(key, format!("{value} is out of range")))
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    let number = parse_number(key, value)?;
    if number == 0 {
        return Err(CodegenError::option(key, "should be a positive integer, 0 is invalid"));
    }
    Ok(number)
}

fn parse_alignment(key: &str, value: &str) -> Result<u32> {
    let number = parse_number(key, value)?;
    if number == 1 || (number != 0 && !number.is_power_of_two()) {
        return Err(CodegenError::option(
            key,
            format!("should be one of [0, 2, 4, 8, ...], {number} is invalid"),
        ));
    }
    Ok(number)
}

fn parse_switch(key: &str, value: &str) -> Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(one_of(key, value, "0, 1")),
    }
}

fn name_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_gives_defaults() {
        let options = FusionOptions::parse("   ").unwrap();
        assert_eq!(options, FusionOptions::default());
        assert_eq!(options.split_mode, 4);
        assert_eq!(options.preload, PreloadMode::PerFunc);
        assert!(options.early_start.is_enabled());
    }

    #[test]
    fn test_parses_every_key() {
        let options: FusionOptions = "func-align=0:preload-code=max:early-start=2:stream-fusion=1:\
            debug-dcci-all=1:debug-sync-all=1:feed-sync-all=1:profiling=1:split-mode=2:\
            debug-aic-num=20:debug-aiv-num=40:compile-options=-O2, -g:\
            dcci-before-kernel-start=a,b:dcci-after-kernel-end=c:dcci-disable-on-kernel=b:\
            strict-scope-check=on"
            .parse()
            .unwrap();
        assert_eq!(options.func_align, 0);
        assert_eq!(options.preload, PreloadMode::Whole);
        assert_eq!(options.early_start, EarlyStartMode::EnabledNoSubKernel);
        assert!(!options.early_start.honors_sub_kernel_flags());
        assert!(options.stream_fusion && options.debug_dcci_all && options.debug_sync_all);
        assert!(options.feed_sync_all && options.profiling);
        assert_eq!(options.split_mode, 2);
        assert_eq!((options.debug_aic_num, options.debug_aiv_num), (Some(20), Some(40)));
        assert_eq!(options.compile_options, vec!["-O2", "-g"]);
        assert!(options.dcci_before_kernel_start.contains("b"));
        assert_eq!(options.strict_scope_check.as_deref(), Some("on"));
    }

    #[test]
    fn test_pair_without_equals_is_skipped() {
        let options = FusionOptions::parse("garbage:split-mode=8").unwrap();
        assert_eq!(options.split_mode, 8);
    }

    #[test]
    fn test_rejections() {
        for bad in [
            "split-mode=0",
            "split-mode=65",
            "split-mode=x",
            "func-align=1",
            "func-align=24",
            "preload-code=all",
            "early-start=3",
            "profiling=yes",
            "debug-aic-num=0",
            "no-such-key=1",
            "split-mode=",
            "=1",
            "split-mode=2:split-mode=4",
        ] {
            let err = FusionOptions::parse(bad).unwrap_err();
            assert!(matches!(err, CodegenError::InvalidOption { .. }), "{bad}: {err}");
        }
    }
}
