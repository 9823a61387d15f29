//! Age-bounded shard files for one recorder prefix.
//!
//! Shards are named `<prefix>.<start>-` while active and
//! `<prefix>.<start>-<end>` once closed. Every write goes through a temp
//! file in the same directory and an atomic rename, so readers only ever see
//! complete shards.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::codec;
use crate::error::StatsError;
use crate::stats::collection::Collection;

const TEMP_PREFIX: &str = ".tmp-";

/// One shard file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub path: PathBuf,
    pub start: i64,
    /// `None` while the shard is still accepting writes.
    pub end: Option<i64>,
}

impl Shard {
    pub fn is_active(&self) -> bool {
        self.end.is_none()
    }
}

#[derive(Debug)]
pub struct FileRotator {
    dir: PathBuf,
    prefix: String,
    rotate_age: i64,
    delete_age: i64,
}

impl FileRotator {
    /// Opens the shard directory, creating it if needed and removing temp
    /// files left behind by an interrupted write.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        rotate_age: i64,
        delete_age: i64,
    ) -> Result<Self, StatsError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| StatsError::io(format!("creating {}", dir.display()), e))?;

        let rotator = Self {
            dir,
            prefix: prefix.into(),
            rotate_age,
            delete_age,
        };
        rotator.remove_temp_files()?;
        Ok(rotator)
    }

    /// Opens the shard directory without touching it. Used for stores that
    /// are only read, where leftover temp files belong to another writer.
    pub fn read_only(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        rotate_age: i64,
        delete_age: i64,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            rotate_age,
            delete_age,
        }
    }

    fn remove_temp_files(&self) -> Result<(), StatsError> {
        for entry in self.read_dir()? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                debug!(path = %entry.path().display(), "removing leftover temp file");
                fs::remove_file(entry.path()).map_err(|e| {
                    StatsError::io(format!("removing {}", entry.path().display()), e)
                })?;
            }
        }
        Ok(())
    }

    fn read_dir(&self) -> Result<Vec<fs::DirEntry>, StatsError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StatsError::io(format!("listing {}", self.dir.display()), e))?;
        entries
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StatsError::io(format!("listing {}", self.dir.display()), e))
    }

    fn parse_name(&self, name: &str) -> Option<(i64, Option<i64>)> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('.')?;
        let (start, end) = rest.split_once('-')?;
        let start = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        };
        Some((start, end))
    }

    fn shard_path(&self, start: i64, end: Option<i64>) -> PathBuf {
        let name = match end {
            Some(end) => format!("{}.{}-{}", self.prefix, start, end),
            None => format!("{}.{}-", self.prefix, start),
        };
        self.dir.join(name)
    }

    /// Shards of this prefix ordered by start time.
    pub fn shards(&self) -> Result<Vec<Shard>, StatsError> {
        let mut shards: Vec<Shard> = self
            .read_dir()?
            .into_iter()
            .filter_map(|entry| {
                let name = entry.file_name();
                let (start, end) = self.parse_name(name.to_str()?)?;
                Some(Shard {
                    path: entry.path(),
                    start,
                    end,
                })
            })
            .collect();
        shards.sort_by_key(|s| (s.start, s.end.unwrap_or(i64::MAX)));
        Ok(shards)
    }

    pub fn read(&self, shard: &Shard) -> Result<Collection, StatsError> {
        let data = fs::read(&shard.path)
            .map_err(|e| StatsError::io(format!("reading {}", shard.path.display()), e))?;
        codec::decode(&data).map_err(|source| StatsError::Corrupt {
            path: shard.path.clone(),
            source,
        })
    }

    /// Decodes every shard into one collection.
    pub fn read_all(&self, bucket_duration: i64) -> Result<Collection, StatsError> {
        let mut out = Collection::new(bucket_duration);
        for shard in self.shards()? {
            out.record_collection(&self.read(&shard)?);
        }
        out.mark_clean();
        Ok(out)
    }

    fn write_path(&self, path: &Path, collection: &Collection) -> Result<(), StatsError> {
        let bytes = codec::encode(collection).map_err(StatsError::Encode)?;
        atomic_write(&self.dir, path, &bytes)
    }

    /// Merges `pending` into the active shard, opening one at `now` if none
    /// exists.
    pub fn combine_active(&self, now: i64, pending: &Collection) -> Result<(), StatsError> {
        let active = self.shards()?.into_iter().find(Shard::is_active);
        let (path, mut combined) = match active {
            Some(shard) => {
                let existing = self.read(&shard)?;
                (shard.path, existing)
            }
            None => (
                self.shard_path(now, None),
                Collection::new(pending.bucket_duration()),
            ),
        };
        combined.record_collection(pending);
        self.write_path(&path, &combined)
    }

    /// Writes `collection` as a closed shard spanning its own time range,
    /// merging with a shard that already has that name.
    pub fn write_closed(&self, collection: &Collection) -> Result<(), StatsError> {
        let (Some(start), Some(end)) = (collection.start_millis(), collection.end_millis()) else {
            return Ok(());
        };
        let shard = Shard {
            path: self.shard_path(start, Some(end)),
            start,
            end: Some(end),
        };
        let mut combined = if shard.path.exists() {
            self.read(&shard)?
        } else {
            Collection::new(collection.bucket_duration())
        };
        combined.record_collection(collection);
        self.write_path(&shard.path, &combined)
    }

    /// Closes the active shard once it is `rotate_age` old and deletes closed
    /// shards that ended `delete_age` ago or earlier.
    pub fn maybe_rotate(&self, now: i64) -> Result<(), StatsError> {
        let rotate_before = now.saturating_sub(self.rotate_age);
        let delete_before = now.saturating_sub(self.delete_age);

        for shard in self.shards()? {
            match shard.end {
                None if shard.start <= rotate_before => {
                    let closed = self.shard_path(shard.start, Some(now));
                    info!(prefix = %self.prefix, start = shard.start, end = now, "rotating shard");
                    fs::rename(&shard.path, &closed).map_err(|e| {
                        StatsError::io(format!("rotating {}", shard.path.display()), e)
                    })?;
                }
                Some(end) if end <= delete_before => {
                    info!(prefix = %self.prefix, start = shard.start, end, "deleting expired shard");
                    fs::remove_file(&shard.path).map_err(|e| {
                        StatsError::io(format!("deleting {}", shard.path.display()), e)
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Applies `rewrite` to every shard, deleting shards left empty.
    pub fn rewrite_all<F>(&self, mut rewrite: F) -> Result<(), StatsError>
    where
        F: FnMut(&mut Collection),
    {
        for shard in self.shards()? {
            let mut collection = self.read(&shard)?;
            rewrite(&mut collection);
            if collection.is_empty() {
                fs::remove_file(&shard.path).map_err(|e| {
                    StatsError::io(format!("deleting {}", shard.path.display()), e)
                })?;
            } else if collection.is_dirty() {
                self.write_path(&shard.path, &collection)?;
            }
        }
        Ok(())
    }

    /// Removes every shard of this prefix.
    pub fn delete_all(&self) -> Result<(), StatsError> {
        for shard in self.shards()? {
            warn!(path = %shard.path.display(), "deleting shard");
            fs::remove_file(&shard.path)
                .map_err(|e| StatsError::io(format!("deleting {}", shard.path.display()), e))?;
        }
        Ok(())
    }
}

/// Replaces `path` with `bytes` through a synced temp file in `dir`, so a
/// crash leaves either the old or the new content.
pub(crate) fn atomic_write(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StatsError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| StatsError::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.as_file_mut()
        .write_all(bytes)
        .map_err(|e| StatsError::io("writing temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StatsError::io("syncing temp file", e))?;
    tmp.persist(path)
        .map_err(|e| StatsError::io(format!("renaming into {}", path.display()), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::collection::HistoryKey;
    use crate::stats::identity::{IdentitySet, NetworkIdentity};
    use crate::stats::{Counters, TrafficSet};

    const HOUR: i64 = 3_600_000;

    fn collection_at(t: i64, rx: i64) -> Collection {
        let ident: IdentitySet = [NetworkIdentity::wifi("\"home\"")].into_iter().collect();
        let mut c = Collection::new(HOUR);
        c.record_at(
            HistoryKey::new(ident, 10_001, TrafficSet::Default, 0),
            t,
            Counters::bytes(rx, 0),
        );
        c
    }

    #[test]
    fn test_combine_active_creates_then_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rotator = FileRotator::new(dir.path(), "uid", 10 * HOUR, 100 * HOUR).expect("open");

        rotator
            .combine_active(HOUR, &collection_at(HOUR, 10))
            .expect("first write");
        rotator
            .combine_active(2 * HOUR, &collection_at(2 * HOUR, 5))
            .expect("second write");

        let shards = rotator.shards().expect("list");
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].start, HOUR);
        assert!(shards[0].is_active());
        assert_eq!(rotator.read_all(HOUR).expect("read").total_bytes(), 15);
    }

    #[test]
    fn test_rotate_and_delete_by_age() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rotator = FileRotator::new(dir.path(), "dev", 2 * HOUR, 5 * HOUR).expect("open");

        rotator.combine_active(0, &collection_at(0, 1)).expect("write");
        rotator.maybe_rotate(HOUR).expect("too young");
        assert!(rotator.shards().expect("list")[0].is_active());

        rotator.maybe_rotate(2 * HOUR).expect("rotate");
        let shards = rotator.shards().expect("list");
        assert_eq!(shards[0].end, Some(2 * HOUR));
        assert!(dir.path().join("dev.0-7200000").exists());

        rotator.maybe_rotate(6 * HOUR).expect("not expired");
        assert_eq!(rotator.shards().expect("list").len(), 1);
        rotator.maybe_rotate(7 * HOUR).expect("expire");
        assert!(rotator.shards().expect("list").is_empty());
    }

    #[test]
    fn test_prefixes_do_not_collide() {
        let dir = tempfile::tempdir().expect("tempdir");
        let uid = FileRotator::new(dir.path(), "uid", HOUR, HOUR).expect("open");
        let uid_tag = FileRotator::new(dir.path(), "uid_tag", HOUR, HOUR).expect("open");
        fs::write(dir.path().join("import.attempts"), b"1").expect("write counter");

        uid.combine_active(0, &collection_at(0, 1)).expect("write");
        uid_tag.combine_active(0, &collection_at(0, 1)).expect("write");

        assert_eq!(uid.shards().expect("list").len(), 1);
        assert_eq!(uid_tag.shards().expect("list").len(), 1);
    }

    #[test]
    fn test_open_removes_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stray = dir.path().join(".tmp-abc123");
        fs::write(&stray, b"partial").expect("write");

        FileRotator::new(dir.path(), "xt", HOUR, HOUR).expect("open");
        assert!(!stray.exists());
    }

    #[test]
    fn test_rewrite_all_deletes_emptied_shards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rotator = FileRotator::new(dir.path(), "uid", HOUR, 100 * HOUR).expect("open");
        rotator.write_closed(&collection_at(0, 3)).expect("closed");
        rotator
            .combine_active(5 * HOUR, &collection_at(5 * HOUR, 4))
            .expect("active");

        rotator
            .rewrite_all(|c| c.remove_history_before(2 * HOUR))
            .expect("rewrite");

        let shards = rotator.shards().expect("list");
        assert_eq!(shards.len(), 1);
        assert!(shards[0].is_active());
        assert_eq!(rotator.read_all(HOUR).expect("read").total_bytes(), 4);
    }

    #[test]
    fn test_corrupt_shard_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rotator = FileRotator::new(dir.path(), "uid", HOUR, HOUR).expect("open");
        fs::write(dir.path().join("uid.0-"), b"garbage that is not a shard at all, not even close")
            .expect("write");

        let err = rotator.read_all(HOUR).expect_err("corrupt");
        assert!(err.is_corrupt());
    }
}
