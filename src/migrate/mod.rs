//! One-time import of the legacy stats store.
//!
//! All four dimensions are read before anything is written. The cutover for
//! each recorder drops everything at or after the earliest imported bucket,
//! which covers what an earlier aborted attempt may have left behind, and
//! imports the legacy collection as a closed shard. Bookkeeping lives in
//! three counters next to the shards.

pub mod counter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::engine::RecorderKind;
use crate::export::health::HealthMetrics;
use crate::recorder::rotator::FileRotator;
use crate::recorder::{Recorder, RecorderSettings};
use crate::stats::collection::Collection;

use self::counter::PersistentInt;

pub const ATTEMPTS_FILE: &str = "import.attempts";
pub const SUCCESSES_FILE: &str = "import.successes";
pub const FALLBACKS_FILE: &str = "import.fallbacks";

/// Reads one dimension of the legacy store.
pub trait LegacyStatsReader: Send + Sync {
    fn read(&self, prefix: &str, bucket_duration: i64) -> Result<Collection>;
}

/// Reads legacy shards straight from a directory without modifying it.
#[derive(Debug, Clone)]
pub struct DirLegacyReader {
    dir: PathBuf,
}

impl DirLegacyReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LegacyStatsReader for DirLegacyReader {
    fn read(&self, prefix: &str, bucket_duration: i64) -> Result<Collection> {
        let rotator = FileRotator::read_only(&self.dir, prefix, i64::MAX, i64::MAX);
        Ok(rotator.read_all(bucket_duration)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Target attempts already reached and verification is off.
    Skipped,
    /// Read and compared only; the target was already reached.
    DryRun,
    Imported,
    Failed,
}

impl MigrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::DryRun => "dry_run",
            Self::Imported => "success",
            Self::Failed => "failure",
        }
    }
}

pub struct Migrator {
    legacy_dir: PathBuf,
    attempts: PersistentInt,
    successes: PersistentInt,
    fallbacks: PersistentInt,
    reader: Box<dyn LegacyStatsReader>,
    target_attempts: u32,
    verify: bool,
    health: Arc<HealthMetrics>,
}

impl Migrator {
    /// `counters_dir` holds the `import.*` bookkeeping files.
    pub fn new(
        legacy_dir: impl Into<PathBuf>,
        counters_dir: &Path,
        reader: Box<dyn LegacyStatsReader>,
        target_attempts: u32,
        verify: bool,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            legacy_dir: legacy_dir.into(),
            attempts: PersistentInt::new(counters_dir.join(ATTEMPTS_FILE)),
            successes: PersistentInt::new(counters_dir.join(SUCCESSES_FILE)),
            fallbacks: PersistentInt::new(counters_dir.join(FALLBACKS_FILE)),
            reader,
            target_attempts,
            verify,
            health,
        }
    }

    /// Returns `None` when no legacy directory is configured or it does not
    /// exist.
    pub fn from_config(cfg: &Config, health: Arc<HealthMetrics>) -> Option<Self> {
        let legacy_dir = cfg.migration.legacy_dir.as_ref()?;
        if !legacy_dir.is_dir() {
            debug!(dir = %legacy_dir.display(), "no legacy stats directory");
            return None;
        }
        Some(Self::new(
            legacy_dir.clone(),
            &cfg.stats_dir(),
            Box::new(DirLegacyReader::new(legacy_dir)),
            cfg.migration.target_attempts,
            cfg.migration.verify,
            health,
        ))
    }

    pub fn attempts(&self) -> &PersistentInt {
        &self.attempts
    }

    pub fn successes(&self) -> &PersistentInt {
        &self.successes
    }

    pub fn fallbacks(&self) -> &PersistentInt {
        &self.fallbacks
    }

    /// Runs the import against `recorders`. Failures are logged, counted
    /// and reported as [`MigrationOutcome::Failed`]; they never propagate.
    pub fn run(
        &self,
        recorders: &mut [(RecorderKind, &mut Recorder)],
        clock: &dyn Clock,
    ) -> MigrationOutcome {
        let bounds = TimeBounds {
            now: clock.now_millis(),
            boot_time: clock.boot_time_millis(),
        };
        let outcome = match self.try_run(recorders, bounds) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = ?e, "legacy stats migration failed");
                MigrationOutcome::Failed
            }
        };
        self.health
            .migration_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        outcome
    }

    fn try_run(
        &self,
        recorders: &mut [(RecorderKind, &mut Recorder)],
        bounds: TimeBounds,
    ) -> Result<MigrationOutcome> {
        let attempts = self.attempts.get()?;
        let dry_run = attempts >= self.target_attempts;
        if dry_run && !self.verify {
            debug!(attempts, "legacy stats already migrated");
            return Ok(MigrationOutcome::Skipped);
        }
        info!(
            dir = %self.legacy_dir.display(),
            attempts,
            dry_run,
            verify = self.verify,
            "migrating legacy stats"
        );

        let mut imports = Vec::with_capacity(recorders.len());
        for (kind, recorder) in recorders.iter() {
            match self.read_one(*kind, recorder.settings(), bounds) {
                Ok(collection) => imports.push(collection),
                Err(e) => {
                    error!(recorder = kind.as_str(), error = ?e, "failed to read legacy stats");
                    self.record_fallback()?;
                    if !dry_run {
                        self.attempts.increment()?;
                    }
                    return Ok(MigrationOutcome::Failed);
                }
            }
        }

        if dry_run {
            info!("legacy stats verified, cutover already done");
            return Ok(MigrationOutcome::DryRun);
        }

        for idx in 0..imports.len() {
            let (kind, recorder) = &mut recorders[idx];
            if let Err(e) = cut_over(recorder, &imports[idx]) {
                error!(recorder = kind.as_str(), error = %e, "legacy import failed, rolling back");
                for ((kind, recorder), collection) in recorders[..=idx].iter_mut().zip(&imports) {
                    roll_back(*kind, recorder, collection);
                }
                self.attempts.increment()?;
                return Ok(MigrationOutcome::Failed);
            }
        }

        self.attempts.set(self.target_attempts)?;
        self.successes.increment()?;
        info!(
            bytes = imports.iter().map(Collection::total_bytes).sum::<i64>(),
            "imported legacy stats"
        );
        Ok(MigrationOutcome::Imported)
    }

    /// Reads one dimension, cross-checking it against a legacy recorder when
    /// verification is on. The recorder's copy wins when the two disagree.
    fn read_one(
        &self,
        kind: RecorderKind,
        settings: RecorderSettings,
        bounds: TimeBounds,
    ) -> Result<Collection> {
        let prefix = kind.as_str();
        let imported = self
            .reader
            .read(prefix, settings.bucket_duration)
            .with_context(|| format!("reading legacy {prefix} stats"))
            .and_then(|c| {
                bounds.validate(&c, settings.delete_age)?;
                Ok(c.normalized_for_import())
            });
        if !self.verify {
            return imported;
        }

        let legacy = self
            .read_with_recorder(kind, settings, bounds.now)
            .and_then(|c| {
                bounds.validate(&c, settings.delete_age)?;
                Ok(c)
            });

        match (imported, legacy) {
            (Ok(imported), Ok(legacy)) => match imported.compare(&legacy, true) {
                Ok(()) => Ok(imported),
                Err(mismatch) => {
                    warn!(recorder = prefix, %mismatch, "imported stats differ from legacy recorder, using legacy");
                    self.record_fallback()?;
                    Ok(legacy.normalized_for_import())
                }
            },
            (Err(e), Ok(legacy)) => {
                warn!(recorder = prefix, error = ?e, "legacy reader failed, using legacy recorder");
                self.record_fallback()?;
                Ok(legacy.normalized_for_import())
            }
            (Ok(imported), Err(e)) => {
                warn!(recorder = prefix, error = ?e, "could not verify imported stats");
                Ok(imported)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn read_with_recorder(
        &self,
        kind: RecorderKind,
        settings: RecorderSettings,
        now: i64,
    ) -> Result<Collection> {
        // No rotation or retention on the legacy side: read everything as is.
        let settings = RecorderSettings {
            rotate_age: i64::MAX,
            delete_age: i64::MAX,
            ..settings
        };
        let mut recorder = Recorder::open_read_only(&self.legacy_dir, kind.as_str(), settings);
        let complete = recorder
            .get_or_load_complete(now)
            .with_context(|| format!("loading legacy {} recorder", kind.as_str()))?;
        Ok(Collection::clone(&complete))
    }

    fn record_fallback(&self) -> Result<()> {
        self.fallbacks.increment()?;
        self.health
            .migration_total
            .with_label_values(&["fallback"])
            .inc();
        Ok(())
    }
}

/// Wall clock reference points for validating legacy data.
#[derive(Debug, Clone, Copy)]
struct TimeBounds {
    now: i64,
    boot_time: i64,
}

impl TimeBounds {
    /// Rejects data that cannot have been recorded on this device. The
    /// legacy store kept at most `retention` of history when it was last
    /// written, before the current boot, so nothing older than
    /// `boot_time - retention` is plausible.
    fn validate(&self, collection: &Collection, retention: i64) -> Result<()> {
        if let Some(start) = collection.start_millis() {
            let earliest = self.boot_time.saturating_sub(retention).max(0);
            if start < earliest {
                bail!("legacy stats start at {start}, before the earliest plausible time {earliest}");
            }
        }
        if let Some(end) = collection.end_millis() {
            let now = self.now;
            // The newest bucket may still be open.
            if end > now.saturating_add(collection.bucket_duration()) {
                bail!("legacy stats end at {end}, after now ({now})");
            }
        }
        Ok(())
    }
}

fn cut_over(recorder: &mut Recorder, collection: &Collection) -> Result<(), crate::error::StatsError> {
    let Some(start) = collection.start_millis() else {
        return Ok(());
    };
    recorder.remove_data_from(start)?;
    recorder.import_collection(collection)
}

fn roll_back(kind: RecorderKind, recorder: &mut Recorder, collection: &Collection) {
    let Some(end) = collection.end_millis() else {
        return;
    };
    if let Err(e) = recorder.remove_data_before(end) {
        error!(recorder = kind.as_str(), error = %e, "rollback failed, resetting recorder");
        if let Err(e) = recorder.reset() {
            error!(recorder = kind.as_str(), error = %e, "failed to reset recorder");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::recorder::TagFilter;
    use crate::stats::collection::HistoryKey;
    use crate::stats::identity::{IdentitySet, NetworkIdentity};
    use crate::stats::{Counters, TrafficSet, UID_ALL};
    use std::fs;

    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;
    const NOW: i64 = 100 * HOUR;

    fn settings() -> RecorderSettings {
        RecorderSettings {
            bucket_duration: HOUR,
            rotate_age: 15 * DAY,
            delete_age: 90 * DAY,
        }
    }

    fn legacy_collection(kind: RecorderKind) -> Collection {
        let ident: IdentitySet = [NetworkIdentity::wifi("\"home\"")].into_iter().collect();
        let (uid, tag) = match kind {
            RecorderKind::Dev | RecorderKind::Xt => (UID_ALL, 0),
            RecorderKind::Uid => (10_001, 0),
            RecorderKind::UidTag => (10_001, 5),
        };
        let mut c = Collection::new(HOUR);
        let key = HistoryKey::new(ident, uid, TrafficSet::Default, tag);
        c.record_at(key.clone(), 10 * HOUR, Counters::bytes(100, 50));
        c.record_at(key, 20 * HOUR, Counters::bytes(7, 3));
        c
    }

    fn write_legacy(dir: &Path) {
        for kind in RecorderKind::ALL {
            FileRotator::new(dir, kind.as_str(), i64::MAX, i64::MAX)
                .expect("rotator")
                .write_closed(&legacy_collection(kind))
                .expect("write legacy");
        }
    }

    fn open_recorders(dir: &Path) -> Vec<(RecorderKind, Recorder)> {
        RecorderKind::ALL
            .into_iter()
            .map(|kind| {
                let recorder =
                    Recorder::open(dir, kind.as_str(), settings(), 1 << 20, TagFilter::Any, true)
                        .expect("recorder");
                (kind, recorder)
            })
            .collect()
    }

    fn run(migrator: &Migrator, recorders: &mut [(RecorderKind, Recorder)]) -> MigrationOutcome {
        let mut refs: Vec<(RecorderKind, &mut Recorder)> =
            recorders.iter_mut().map(|(k, r)| (*k, r)).collect();
        migrator.run(&mut refs, &ManualClock::new(NOW))
    }

    fn migrator(legacy: &Path, store: &Path, reader: Box<dyn LegacyStatsReader>, verify: bool) -> Migrator {
        Migrator::new(
            legacy,
            store,
            reader,
            1,
            verify,
            Arc::new(HealthMetrics::detached().expect("metrics")),
        )
    }

    fn totals(recorders: &mut [(RecorderKind, Recorder)]) -> Vec<i64> {
        recorders
            .iter_mut()
            .map(|(_, r)| r.get_or_load_complete(NOW).expect("load").total_bytes())
            .collect()
    }

    struct FailingReader {
        inner: DirLegacyReader,
        fail_prefix: &'static str,
    }

    impl LegacyStatsReader for FailingReader {
        fn read(&self, prefix: &str, bucket_duration: i64) -> Result<Collection> {
            if prefix == self.fail_prefix {
                bail!("legacy {prefix} unreadable");
            }
            self.inner.read(prefix, bucket_duration)
        }
    }

    struct InflatingReader(DirLegacyReader);

    impl LegacyStatsReader for InflatingReader {
        fn read(&self, prefix: &str, bucket_duration: i64) -> Result<Collection> {
            let mut c = self.0.read(prefix, bucket_duration)?;
            let extra: Vec<HistoryKey> = c.iter().map(|(k, _)| k.clone()).collect();
            for key in extra {
                c.record_at(key, 10 * HOUR, Counters::bytes(1, 0));
            }
            Ok(c)
        }
    }

    #[test]
    fn test_import_all_recorders() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let mut recorders = open_recorders(store.path());
        let m = migrator(legacy.path(), store.path(), Box::new(DirLegacyReader::new(legacy.path())), false);

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Imported);
        assert_eq!(totals(&mut recorders), vec![160; 4]);
        assert_eq!(m.attempts().get().expect("attempts"), 1);
        assert_eq!(m.successes().get().expect("successes"), 1);
        assert_eq!(m.fallbacks().get().expect("fallbacks"), 0);

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Skipped);
        assert_eq!(m.successes().get().expect("successes"), 1);
    }

    #[test]
    fn test_repeated_cutover_is_idempotent() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let mut recorders = open_recorders(store.path());
        let m = migrator(legacy.path(), store.path(), Box::new(DirLegacyReader::new(legacy.path())), false);

        run(&m, &mut recorders);
        let first: Vec<Collection> = recorders
            .iter_mut()
            .map(|(_, r)| Collection::clone(&r.get_or_load_complete(NOW).expect("load")))
            .collect();

        // Forget that the import happened and run it again.
        fs::remove_file(m.attempts().path()).expect("reset attempts");
        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Imported);
        for ((_, r), before) in recorders.iter_mut().zip(&first) {
            assert!(r.get_or_load_complete(NOW).expect("load").is_same_as(before));
        }
        assert!(m.attempts().get().expect("attempts") <= 1);
    }

    #[test]
    fn test_read_failure_leaves_store_untouched() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let mut recorders = open_recorders(store.path());
        let reader = FailingReader {
            inner: DirLegacyReader::new(legacy.path()),
            fail_prefix: "uid_tag",
        };
        let m = migrator(legacy.path(), store.path(), Box::new(reader), false);

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Failed);
        assert_eq!(totals(&mut recorders), vec![0; 4]);
        assert_eq!(m.attempts().get().expect("attempts"), 1);
        assert_eq!(m.successes().get().expect("successes"), 0);
        assert_eq!(m.fallbacks().get().expect("fallbacks"), 1);

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Skipped);
        assert_eq!(m.fallbacks().get().expect("fallbacks"), 1);
    }

    #[test]
    fn test_verify_falls_back_to_legacy_recorder() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let mut recorders = open_recorders(store.path());
        let reader = InflatingReader(DirLegacyReader::new(legacy.path()));
        let m = migrator(legacy.path(), store.path(), Box::new(reader), true);

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Imported);
        assert_eq!(totals(&mut recorders), vec![160; 4]);
        assert_eq!(m.fallbacks().get().expect("fallbacks"), 4);
    }

    #[test]
    fn test_verify_leaves_legacy_dir_untouched() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let stray = legacy.path().join(".tmp-uid");
        fs::write(&stray, b"partial").expect("stray temp file");

        let mut recorders = open_recorders(store.path());
        let m = migrator(legacy.path(), store.path(), Box::new(DirLegacyReader::new(legacy.path())), true);

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Imported);
        assert_eq!(m.fallbacks().get().expect("fallbacks"), 0);
        assert!(stray.exists());
    }

    #[test]
    fn test_cutover_replaces_data_from_import_start() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let mut recorders = open_recorders(store.path());

        let ident: IdentitySet = [NetworkIdentity::wifi("\"home\"")].into_iter().collect();
        let key = HistoryKey::new(ident, 10_001, TrafficSet::Default, 0);
        let (_, uid) = &mut recorders[2];
        for (at, rx) in [(5 * HOUR, 40), (10 * HOUR, 100), (30 * HOUR, 9)] {
            // Older live data, a leftover partial import and newer data.
            let mut c = Collection::new(HOUR);
            c.record_at(key.clone(), at, Counters::bytes(rx, 0));
            uid.import_collection(&c).expect("seed store");
        }

        let m = migrator(legacy.path(), store.path(), Box::new(DirLegacyReader::new(legacy.path())), false);
        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Imported);

        let (_, uid) = &mut recorders[2];
        let complete = uid.get_or_load_complete(NOW).expect("load");
        assert_eq!(complete.total_bytes(), 40 + 160);
        let bytes_in = |start: i64, end: i64| -> i64 {
            complete
                .iter()
                .map(|(_, h)| h.get_values(start, end).total_bytes())
                .sum()
        };
        assert_eq!(bytes_in(0, 10 * HOUR), 40);
        assert_eq!(bytes_in(10 * HOUR, 11 * HOUR), 150);
        assert_eq!(bytes_in(22 * HOUR, NOW), 0);
    }

    #[test]
    fn test_verify_after_target_is_dry_run() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let mut recorders = open_recorders(store.path());
        let m = migrator(legacy.path(), store.path(), Box::new(DirLegacyReader::new(legacy.path())), true);
        m.attempts().set(1).expect("preset attempts");

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::DryRun);
        assert_eq!(totals(&mut recorders), vec![0; 4]);
        assert_eq!(m.attempts().get().expect("attempts"), 1);
    }

    #[test]
    fn test_failed_cutover_rolls_back() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());

        // A directory where the uid_tag shard should go makes its import fail.
        let blocker = legacy_collection(RecorderKind::UidTag);
        let name = format!(
            "uid_tag.{}-{}",
            blocker.start_millis().expect("start"),
            blocker.end_millis().expect("end")
        );
        fs::create_dir(store.path().join(name)).expect("blocker");

        let mut recorders = open_recorders(store.path());
        let m = migrator(legacy.path(), store.path(), Box::new(DirLegacyReader::new(legacy.path())), false);

        assert_eq!(run(&m, &mut recorders), MigrationOutcome::Failed);
        assert_eq!(m.attempts().get().expect("attempts"), 1);
        for (kind, recorder) in recorders.iter_mut().take(3) {
            let complete = recorder.get_or_load_complete(NOW).expect("load");
            assert!(complete.is_empty(), "{} not rolled back", kind.as_str());
        }
    }

    #[test]
    fn test_impossible_timestamps_are_rejected() {
        let ident: IdentitySet = [NetworkIdentity::wifi("\"x\"")].into_iter().collect();
        let at = |t: i64| {
            let mut c = Collection::new(HOUR);
            c.record_at(HistoryKey::new(ident.clone(), 1, TrafficSet::Default, 0), t, Counters::bytes(1, 1));
            c
        };
        let bounds = TimeBounds {
            now: NOW,
            boot_time: NOW - 10 * HOUR,
        };

        assert!(bounds.validate(&at(NOW + 5 * HOUR), DAY).is_err());
        assert!(bounds.validate(&at(NOW), DAY).is_ok());
        assert!(bounds.validate(&Collection::new(HOUR), DAY).is_ok());

        // Older than the retention window before boot.
        assert!(bounds.validate(&at(NOW - 10 * HOUR - DAY - HOUR), DAY).is_err());
        assert!(bounds.validate(&at(NOW - 10 * HOUR - DAY), DAY).is_ok());
    }

    #[test]
    fn test_data_predating_boot_window_fails_import() {
        let legacy = tempfile::tempdir().expect("legacy");
        let store = tempfile::tempdir().expect("store");
        write_legacy(legacy.path());
        let mut recorders = open_recorders(store.path());
        let m = migrator(legacy.path(), store.path(), Box::new(DirLegacyReader::new(legacy.path())), false);

        // Legacy data starts at 10h; a clock booted 91 days later rules it out.
        let clock = ManualClock::new(10 * HOUR + 91 * DAY);
        let mut refs: Vec<(RecorderKind, &mut Recorder)> =
            recorders.iter_mut().map(|(k, r)| (*k, r)).collect();
        assert_eq!(m.run(&mut refs, &clock), MigrationOutcome::Failed);
        assert_eq!(m.fallbacks().get().expect("fallbacks"), 1);
        assert_eq!(totals(&mut recorders), vec![0; 4]);
    }
}
