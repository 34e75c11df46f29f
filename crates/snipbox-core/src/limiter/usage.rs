//! Process-group resource sampling from /proc

use std::fs;

/// Snapshot of a process group's footprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupUsage {
    /// Processes in the group, the interpreter included
    pub processes: usize,
    /// Sum of resident set sizes
    pub rss_bytes: u64,
}

impl GroupUsage {
    /// Processes beyond the interpreter itself
    #[must_use]
    pub const fn extra_processes(&self) -> usize {
        self.processes.saturating_sub(1)
    }
}

/// The fields of /proc/<pid>/stat the sampler needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatFields {
    pgrp: i32,
    rss_pages: u64,
}

/// Walk /proc and total up every process whose group is `pgid`
///
/// Processes that exit mid-scan are skipped.
#[must_use]
pub fn sample_process_group(pgid: i32) -> GroupUsage {
    let Ok(entries) = fs::read_dir("/proc") else {
        return GroupUsage::default();
    };

    let page_size = page_size();
    let mut usage = GroupUsage::default();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if let Some(fields) = parse_stat(&stat) {
            if fields.pgrp == pgid {
                usage.processes += 1;
                usage.rss_bytes += fields.rss_pages * page_size;
            }
        }
    }
    usage
}

/// Resident memory of the given pids
#[must_use]
pub fn sample_pids(pids: &[i32]) -> GroupUsage {
    let page_size = page_size();
    let rss_bytes = pids
        .iter()
        .filter_map(|pid| fs::read_to_string(format!("/proc/{pid}/stat")).ok())
        .filter_map(|stat| parse_stat(&stat))
        .map(|fields| fields.rss_pages * page_size)
        .sum();
    GroupUsage {
        processes: pids.len(),
        rss_bytes,
    }
}

/// Parse /proc/<pid>/stat
///
/// The command name is parenthesised and may itself contain spaces and
/// parentheses, so fields are counted from the last `)`.
fn parse_stat(stat: &str) -> Option<StatFields> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_ascii_whitespace();
    // state(3) ppid(4) pgrp(5)
    let pgrp = fields.nth(2)?.parse().ok()?;
    // rss is field 24; 19 more after pgrp
    let rss_pages = fields.nth(18)?.parse().ok()?;
    Some(StatFields { pgrp, rss_pages })
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
}
