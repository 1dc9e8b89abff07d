//! Target synchronization primitives
//!
//! Every statement that touches the hardware sync fabric, the cache, or the instruction
//! prefetcher is spelled here, so the rule engine and the schedulers never format intrinsics
//! themselves. Operands use the target's own names:
//!
//! | Primitive | Emitted form |
//! |---|---|
//! | domain barrier | `ffts_cross_core_sync(PIPE, GetffstMsg(0x0, TAG))` + `wait_flag_dev(TAG)` |
//! | full barrier | `AscendC::SyncAll<false>()` |
//! | cross signal | `ffts_cross_core_sync(PIPE, GetffstMsg(0x02, FLAG))` |
//! | cross wait | `wait_flag_dev(FLAG)` |

use std::fmt;
use superfuse_core::Domain;

/// Pipeline a cross-core message is issued from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    Fix,
    Mte3,
    All,
}

impl Pipe {
    /// Last pipeline a producer in `domain` writes results through
    pub fn draining(domain: Domain) -> Self {
        match domain {
            Domain::Cube => Pipe::Fix,
            Domain::Vector => Pipe::Mte3,
        }
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pipe::Fix => "PIPE_FIX",
            Pipe::Mte3 => "PIPE_MTE3",
            Pipe::All => "PIPE_ALL",
        })
    }
}

/// Hardware flag carrying one cross-domain signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CrossFlag {
    /// Allocated channel id
    Channel(u8),
    /// Fixed vector → cube flag used by two-stream schedules
    AivToAic,
    /// Fixed cube → vector flag used by two-stream schedules
    AicToAiv,
}

impl CrossFlag {
    /// Fixed flag for signals raised by `producer` in two-stream schedules
    pub fn stream_flag(producer: Domain) -> Self {
        match producer {
            Domain::Vector => CrossFlag::AivToAic,
            Domain::Cube => CrossFlag::AicToAiv,
        }
    }
}

impl fmt::Display for CrossFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossFlag::Channel(id) => write!(f, "{id}"),
            CrossFlag::AivToAic => f.write_str("AscendC::SYNC_AIV_FLAG"),
            CrossFlag::AicToAiv => f.write_str("AscendC::SYNC_AIC_AIV_FLAG"),
        }
    }
}

pub const FULL_BARRIER: &str = "AscendC::SyncAll<false>();";
pub const PIPE_ALL_BARRIER: &str = "pipe_barrier(PIPE_ALL);";
pub const DCCI_ALL: &str = "dcci((__gm__ uint64_t*)0, cache_line_t::ENTIRE_DATA_CACHE, dcci_dst_t::CACHELINE_OUT);";

/// Rendezvous of every unit of one domain
pub fn domain_barrier(domain: Domain) -> [String; 2] {
    let tag = match domain {
        Domain::Cube => "AscendC::SYNC_AIC_FLAG",
        Domain::Vector => "AscendC::SYNC_AIV_ONLY_ALL",
    };
    [
        format!("ffts_cross_core_sync({}, AscendC::GetffstMsg(0x0, {tag}));", Pipe::draining(domain)),
        format!("wait_flag_dev({tag});"),
    ]
}

/// Rendezvous of every unit of both domains, with a trailing reason comment
pub fn full_barrier(reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("{FULL_BARRIER} // {reason}"),
        None => FULL_BARRIER.to_string(),
    }
}

pub fn cross_signal(pipe: Pipe, flag: CrossFlag) -> String {
    format!("ffts_cross_core_sync({pipe}, AscendC::GetffstMsg(0x02, {flag}));")
}

pub fn cross_wait(flag: CrossFlag) -> String {
    format!("wait_flag_dev({flag});")
}

/// Store `value` to a lock cell and flush the line so other units observe it
pub fn store_and_flush(cell: &str, value: u64) -> [String; 2] {
    [format!("*{cell} = {value};"), format!("dcci({cell}, 0, 2);")]
}

/// Invalidate-then-read spin until a lock cell reaches `ready`
pub fn spin_until(cell: &str, ready: u64) -> [String; 4] {
    [
        format!("dcci({cell}, 0, 2);"),
        format!("while(*{cell} != {ready}) {{"),
        format!("    dcci({cell}, 0, 2);"),
        "}".to_string(),
    ]
}

/// Reinterpret a parameter slot as a 64-bit lock cell
pub fn lock_cell(binding: &str, slot_expr: &str, volatile: bool) -> String {
    let qualifier = if volatile { "volatile " } else { "" };
    format!("__gm__ {qualifier}uint64_t* {binding} = reinterpret_cast<__gm__ uint64_t*>({slot_expr});")
}

/// Instruction prefetch hint for one function address
pub fn preload(target: &str, units: u64) -> String {
    format!("preload((const void *){target}, {units});")
}

pub fn preload_whole(units: u32) -> String {
    format!("AscendC::PreLoad({units});")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_barriers() {
        assert_eq!(
            domain_barrier(Domain::Cube),
            [
                "ffts_cross_core_sync(PIPE_FIX, AscendC::GetffstMsg(0x0, AscendC::SYNC_AIC_FLAG));".to_string(),
                "wait_flag_dev(AscendC::SYNC_AIC_FLAG);".to_string(),
            ]
        );
        assert!(domain_barrier(Domain::Vector)[0].starts_with("ffts_cross_core_sync(PIPE_MTE3"));
    }

    #[test]
    fn test_cross_signal_and_wait() {
        let flag = CrossFlag::Channel(3);
        assert_eq!(
            cross_signal(Pipe::draining(Domain::Cube), flag),
            "ffts_cross_core_sync(PIPE_FIX, AscendC::GetffstMsg(0x02, 3));"
        );
        assert_eq!(cross_wait(flag), "wait_flag_dev(3);");
        assert_eq!(
            cross_wait(CrossFlag::stream_flag(Domain::Vector)),
            "wait_flag_dev(AscendC::SYNC_AIV_FLAG);"
        );
    }

    #[test]
    fn test_full_barrier_reason() {
        assert_eq!(
            full_barrier(Some("reason2: inter op barrier when EarlyStartDisable")),
            "AscendC::SyncAll<false>(); // reason2: inter op barrier when EarlyStartDisable"
        );
        assert_eq!(full_barrier(None), FULL_BARRIER);
    }

    #[test]
    fn test_lock_protocol_lines() {
        assert_eq!(store_and_flush("lockAddr", 0), ["*lockAddr = 0;", "dcci(lockAddr, 0, 2);"]);
        let spin = spin_until("lockAddr", 1);
        assert_eq!(spin[1], "while(*lockAddr != 1) {");
        assert_eq!(preload("add_kernel", 2), "preload((const void *)add_kernel, 2);");
    }
}
