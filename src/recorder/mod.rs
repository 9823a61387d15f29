//! Durable owner of one accounting dimension.
//!
//! A [`Recorder`] turns cumulative snapshots into deltas, buffers them in a
//! pending [`Collection`] and persists them through a [`FileRotator`]. The
//! complete history is loaded lazily on the first query and kept in sync
//! with every later write.

pub mod codec;
pub mod rotator;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::StatsError;
use crate::stats::collection::{Collection, HistoryKey};
use crate::stats::identity::IdentitySet;
use crate::stats::snapshot::Snapshot;
use crate::stats::TAG_NONE;

use self::rotator::FileRotator;

/// Which tags a recorder keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFilter {
    Any,
    UntaggedOnly,
    TaggedOnly,
}

impl TagFilter {
    fn accepts(self, tag: i32) -> bool {
        match self {
            Self::Any => true,
            Self::UntaggedOnly => tag == TAG_NONE,
            Self::TaggedOnly => tag != TAG_NONE,
        }
    }
}

/// Bucket and retention settings of one recorder, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderSettings {
    pub bucket_duration: i64,
    pub rotate_age: i64,
    pub delete_age: i64,
}

/// Result of feeding one snapshot to a recorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Rows whose counters went backwards.
    pub anomalies: u64,
    /// Bytes added to the pending collection.
    pub bytes: i64,
}

#[derive(Debug)]
pub struct Recorder {
    name: String,
    rotator: FileRotator,
    settings: RecorderSettings,
    persist_threshold: i64,
    tags: TagFilter,
    wipe_on_error: bool,
    last_snapshot: Option<Snapshot>,
    pending: Collection,
    complete: Option<Arc<Collection>>,
}

impl Recorder {
    pub fn open(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        settings: RecorderSettings,
        persist_threshold: i64,
        tags: TagFilter,
        wipe_on_error: bool,
    ) -> Result<Self, StatsError> {
        let name = name.into();
        let rotator = FileRotator::new(dir, name.clone(), settings.rotate_age, settings.delete_age)?;
        Ok(Self::with_rotator(
            name,
            rotator,
            settings,
            persist_threshold,
            tags,
            wipe_on_error,
        ))
    }

    /// Opens shards in `dir` for reading only. Nothing in the directory is
    /// created or cleaned up, and corrupt shards are reported rather than
    /// wiped.
    pub fn open_read_only(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        settings: RecorderSettings,
    ) -> Self {
        let name = name.into();
        let rotator =
            FileRotator::read_only(dir, name.clone(), settings.rotate_age, settings.delete_age);
        Self::with_rotator(name, rotator, settings, i64::MAX, TagFilter::Any, false)
    }

    fn with_rotator(
        name: String,
        rotator: FileRotator,
        settings: RecorderSettings,
        persist_threshold: i64,
        tags: TagFilter,
        wipe_on_error: bool,
    ) -> Self {
        Self {
            name,
            rotator,
            settings,
            persist_threshold,
            tags,
            wipe_on_error,
            last_snapshot: None,
            pending: Collection::new(settings.bucket_duration),
            complete: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> RecorderSettings {
        self.settings
    }

    pub fn pending_bytes(&self) -> i64 {
        self.pending.total_bytes()
    }

    /// Diffs `snapshot` against the previous one and records the delta at
    /// `now` under the identity set of each row's interface.
    ///
    /// The first snapshot only establishes the baseline.
    pub fn record_snapshot(
        &mut self,
        snapshot: Snapshot,
        ifaces: &HashMap<String, IdentitySet>,
        now: i64,
    ) -> RecordOutcome {
        let mut outcome = RecordOutcome::default();
        let Some(previous) = self.last_snapshot.replace(snapshot) else {
            debug!(recorder = %self.name, "recorded baseline snapshot");
            return outcome;
        };
        let Some(current) = self.last_snapshot.as_ref() else {
            return outcome;
        };

        let name = self.name.as_str();
        let delta = current.subtract(&previous, |key, prev, cur| {
            warn!(
                recorder = %name,
                iface = %key.iface,
                uid = key.uid,
                tag = key.tag,
                previous = ?prev,
                current = ?cur,
                "counter went backwards, using current reading as delta"
            );
            outcome.anomalies += 1;
        });

        let mut complete = self.complete.as_mut().map(Arc::make_mut);
        for (key, counters) in delta.iter() {
            if !self.tags.accepts(key.tag) {
                continue;
            }
            let Some(ident) = ifaces.get(&key.iface) else {
                debug!(recorder = %name, iface = %key.iface, "no identity for interface, skipping");
                continue;
            };
            let history_key = HistoryKey::new(ident.clone(), key.uid, key.set, key.tag);
            if let Some(complete) = complete.as_deref_mut() {
                complete.record_at(history_key.clone(), now, *counters);
            }
            self.pending.record_at(history_key, now, *counters);
            outcome.bytes = outcome.bytes.saturating_add(counters.total_bytes());
        }
        outcome
    }

    /// Persists when enough bytes are pending, otherwise only rotates.
    /// Returns true if pending data was written.
    pub fn maybe_persist(&mut self, now: i64) -> Result<bool, StatsError> {
        if self.pending.total_bytes() >= self.persist_threshold {
            self.force_persist(now)?;
            Ok(true)
        } else {
            self.rotator.maybe_rotate(now)?;
            Ok(false)
        }
    }

    /// Writes pending data into the active shard, then applies rotation and
    /// retention. Pending data is kept only if the shard write fails; once
    /// written it is cleared even if rotation fails afterwards.
    pub fn force_persist(&mut self, now: i64) -> Result<(), StatsError> {
        if self.pending.is_dirty() && !self.pending.is_empty() {
            self.rotator.combine_active(now, &self.pending)?;
            info!(
                recorder = %self.name,
                bytes = self.pending.total_bytes(),
                "persisted pending stats"
            );
        }
        self.pending = Collection::new(self.settings.bucket_duration);

        let cutoff = now.saturating_sub(self.settings.delete_age);
        if let Some(complete) = self.complete.as_mut() {
            if complete.start_millis().is_some_and(|start| start < cutoff) {
                Arc::make_mut(complete).trim_before(cutoff);
            }
        }
        self.rotator.maybe_rotate(now)
    }

    /// Returns the full history, loading it from disk on first use.
    ///
    /// A corrupt shard wipes this recorder's files when `wipe_on_error` is
    /// set; otherwise the error is returned and the files are left alone.
    pub fn get_or_load_complete(&mut self, now: i64) -> Result<Arc<Collection>, StatsError> {
        if let Some(complete) = &self.complete {
            return Ok(Arc::clone(complete));
        }

        let mut loaded = match self.rotator.read_all(self.settings.bucket_duration) {
            Ok(loaded) => loaded,
            Err(e) if self.wipe_on_error => {
                error!(recorder = %self.name, error = %e, "failed to load stats, wiping recorder");
                self.rotator.delete_all()?;
                Collection::new(self.settings.bucket_duration)
            }
            Err(e) => return Err(e),
        };
        loaded.record_collection(&self.pending);
        loaded.trim_before(now.saturating_sub(self.settings.delete_age));
        loaded.mark_clean();

        let complete = Arc::new(loaded);
        self.complete = Some(Arc::clone(&complete));
        Ok(complete)
    }

    /// Folds the untagged history of `uids` into the removed-uid bucket and
    /// drops their tagged history, on disk and in memory.
    pub fn remove_uids(&mut self, uids: &[i32]) -> Result<(), StatsError> {
        self.rotator.rewrite_all(|c| c.remove_uids(uids))?;
        self.pending.remove_uids(uids);
        if let Some(complete) = self.complete.as_mut() {
            Arc::make_mut(complete).remove_uids(uids);
        }
        Ok(())
    }

    /// Drops every bucket starting before `cutoff`, on disk and in memory.
    pub fn remove_data_before(&mut self, cutoff: i64) -> Result<(), StatsError> {
        self.rotator
            .rewrite_all(|c| c.remove_history_before(cutoff))?;
        self.pending.remove_history_before(cutoff);
        if let Some(complete) = self.complete.as_mut() {
            Arc::make_mut(complete).remove_history_before(cutoff);
        }
        Ok(())
    }

    /// Drops every bucket starting at or after `cutoff`, on disk and in
    /// memory.
    pub fn remove_data_from(&mut self, cutoff: i64) -> Result<(), StatsError> {
        self.rotator
            .rewrite_all(|c| c.remove_history_from(cutoff))?;
        self.pending.remove_history_from(cutoff);
        if let Some(complete) = self.complete.as_mut() {
            Arc::make_mut(complete).remove_history_from(cutoff);
        }
        Ok(())
    }

    /// Stores `collection` as a closed shard and merges it into the loaded
    /// complete history, if any.
    pub fn import_collection(&mut self, collection: &Collection) -> Result<(), StatsError> {
        self.rotator.write_closed(collection)?;
        if let Some(complete) = self.complete.as_mut() {
            let merged = Arc::make_mut(complete);
            merged.record_collection(collection);
            merged.mark_clean();
        }
        Ok(())
    }

    /// Deletes all persisted and pending data. The last snapshot survives so
    /// the next poll does not count everything since boot again.
    pub fn reset(&mut self) -> Result<(), StatsError> {
        self.pending = Collection::new(self.settings.bucket_duration);
        self.complete = None;
        self.rotator.delete_all()
    }
}
