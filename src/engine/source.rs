//! Raw cumulative counter sources.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use crate::stats::snapshot::{EntryKey, Snapshot};
use crate::stats::Counters;

/// Supplier of cumulative counters since boot.
///
/// Implementations only read; the engine turns readings into deltas.
pub trait CounterSource: Send + Sync {
    /// Per-uid counters, one row per interface, uid, set and tag.
    fn read_uid_stats(&self, now: i64) -> Result<Snapshot>;

    /// Interface-level counters.
    fn read_dev_stats(&self, now: i64) -> Result<Snapshot>;

    /// Counters of tethered clients per upstream interface. The engine files
    /// them under the tethering uid.
    fn read_tether_stats(&self, now: i64) -> Result<Snapshot> {
        Ok(Snapshot::new(now))
    }

    /// Arms the global data alert. Sources without alert support ignore it.
    fn set_global_alert(&self, _bytes: i64) -> Result<()> {
        Ok(())
    }
}

/// Interface counters from the Linux `/proc/net/dev` table.
///
/// Procfs has no per-uid accounting, so uid readings are always empty and
/// only the `dev` recorder sees traffic from this source.
#[derive(Debug, Clone)]
pub struct ProcNetDevSource {
    path: PathBuf,
}

impl ProcNetDevSource {
    pub fn new() -> Self {
        Self::with_path("/proc/net/dev")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcNetDevSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for ProcNetDevSource {
    fn read_uid_stats(&self, now: i64) -> Result<Snapshot> {
        Ok(Snapshot::new(now))
    }

    fn read_dev_stats(&self, now: i64) -> Result<Snapshot> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        parse_proc_net_dev(&content, now)
            .with_context(|| format!("parsing {}", self.path.display()))
    }
}

/// Parses the `/proc/net/dev` format. The loopback interface is skipped.
pub fn parse_proc_net_dev(content: &str, now: i64) -> Result<Snapshot> {
    let mut snap = Snapshot::new(now);

    // Two header lines precede the per-interface rows.
    for line in content.lines().skip(2) {
        let Some((iface, fields)) = line.split_once(':') else {
            continue;
        };
        let iface = iface.trim();
        if iface.is_empty() || iface == "lo" {
            continue;
        }

        let fields: Vec<i64> = fields
            .split_whitespace()
            .map(str::parse)
            .collect::<Result<_, _>>()
            .with_context(|| format!("non-numeric counter for {iface}"))?;
        if fields.len() < 16 {
            anyhow::bail!("expected 16 counters for {iface}, found {}", fields.len());
        }

        let counters = Counters::new(fields[0], fields[1], fields[8], fields[9], 0);
        debug!(iface, rx_bytes = counters.rx_bytes, tx_bytes = counters.tx_bytes, "read iface counters");
        snap.add(EntryKey::iface(iface), counters);
    }

    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 4242      42    0    0    0     0          0         0     4242      42    0    0    0     0       0          0
 wlan0: 1000      10    0    0    0     0          0         0     1200      12    0    0    0     0       0          0
rmnet0: 77        1     0    0    0     0          0         0     88        2     0    0    0     0       0          0
";

    #[test]
    fn test_parse_proc_net_dev() {
        let snap = parse_proc_net_dev(SAMPLE, 5).expect("parse");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.taken_at(), 5);
        assert_eq!(
            snap.get(&EntryKey::iface("wlan0")),
            Some(&Counters::new(1000, 10, 1200, 12, 0))
        );
        assert!(snap.get(&EntryKey::iface("lo")).is_none());
    }

    #[test]
    fn test_parse_rejects_short_rows() {
        let bad = "h1\nh2\n eth0: 1 2 3\n";
        let err = parse_proc_net_dev(bad, 0).expect_err("short row");
        assert!(err.to_string().contains("eth0"));
    }

    #[test]
    fn test_source_reads_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dev");
        std::fs::write(&path, SAMPLE).expect("write");

        let source = ProcNetDevSource::with_path(&path);
        assert_eq!(source.read_dev_stats(0).expect("read").len(), 2);
        assert!(source.read_uid_stats(0).expect("uid").is_empty());

        let missing = ProcNetDevSource::with_path(dir.path().join("missing"));
        assert!(missing.read_dev_stats(0).is_err());
    }
}
