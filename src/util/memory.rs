//! Reports how much memory is still available to the process.

use std::fs;
use tracing::debug;

/// A source for the amount of memory that can still be allocated.
pub trait MemoryProbe: Send + Sync {
    /// Available memory in bytes, or `None` if it cannot be determined.
    fn available_bytes(&self) -> Option<u64>;
}

/// Reads `MemAvailable` from `/proc/meminfo`.
///
/// On systems without procfs this always reports `None`, which disables the memory pressure
/// heuristics of the write-behind backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMeminfo;

impl MemoryProbe for ProcMeminfo {
    fn available_bytes(&self) -> Option<u64> {
        match fs::read_to_string("/proc/meminfo") {
            Ok(meminfo) => parse_mem_available(&meminfo),
            Err(err) => {
                debug!(error = %err, "cannot read /proc/meminfo");
                None
            }
        }
    }
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let mut fields = line["MemAvailable:".len()..].split_whitespace();
    let amount: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") => amount.checked_mul(1024),
        None => Some(amount),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_mem_available_in_kilobytes() {
        let meminfo = "MemTotal:       16318512 kB\nMemFree:          283468 kB\nMemAvailable:    8027312 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(8027312 * 1024));
    }

    #[test]
    fn test_missing_field_yields_none() {
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }
}
