//! All histories of one accounting dimension, keyed by identity set, uid,
//! traffic set and tag.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::history::{History, SubscriptionPlan, FIELD_ALL};
use super::identity::IdentitySet;
use super::snapshot::{EntryKey, Snapshot, IFACE_ALL};
use super::template::Template;
use super::{
    user_id_for_uid, Counters, TrafficSet, SYSTEM_UID, TAG_NONE, UID_ALL, UID_REMOVED,
    UID_TETHERING,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryKey {
    pub ident: IdentitySet,
    pub uid: i32,
    pub set: TrafficSet,
    pub tag: i32,
}

impl HistoryKey {
    pub fn new(ident: IdentitySet, uid: i32, set: TrafficSet, tag: i32) -> Self {
        Self {
            ident,
            uid,
            set,
            tag,
        }
    }

    pub fn could_change_on_import(&self) -> bool {
        self.ident.could_change_on_import()
    }
}

/// How much of other apps' usage a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Own uid only.
    Default,
    /// Apps of the caller's user plus the system and aggregate uids.
    User,
    /// As `User`, plus interface totals.
    DeviceSummary,
    /// Every uid.
    Device,
}

pub fn is_accessible_to_user(uid: i32, caller_uid: i32, level: AccessLevel) -> bool {
    let user = user_id_for_uid(uid);
    let same_user = user.is_some() && user == user_id_for_uid(caller_uid);
    match level {
        AccessLevel::Device => true,
        AccessLevel::DeviceSummary => {
            uid == SYSTEM_UID
                || uid == UID_REMOVED
                || uid == UID_TETHERING
                || uid == UID_ALL
                || same_user
        }
        AccessLevel::User => {
            uid == SYSTEM_UID || uid == UID_REMOVED || uid == UID_TETHERING || same_user
        }
        AccessLevel::Default => uid == caller_uid,
    }
}

/// Parameters of [`Collection::get_history`]. `None` filters match anything.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub template: Template,
    pub plan: Option<SubscriptionPlan>,
    pub uid: Option<i32>,
    pub set: Option<TrafficSet>,
    pub tag: Option<i32>,
    pub fields: u32,
    pub start: i64,
    pub end: i64,
    pub access_level: AccessLevel,
    pub caller_uid: i32,
}

impl HistoryQuery {
    pub fn new(template: Template, start: i64, end: i64) -> Self {
        Self {
            template,
            plan: None,
            uid: None,
            set: None,
            tag: None,
            fields: FIELD_ALL,
            start,
            end,
            access_level: AccessLevel::Device,
            caller_uid: SYSTEM_UID,
        }
    }

    pub fn for_uid(mut self, uid: i32, set: Option<TrafficSet>, tag: i32) -> Self {
        self.uid = Some(uid);
        self.set = set;
        self.tag = Some(tag);
        self
    }

    pub fn with_fields(mut self, fields: u32) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_plan(mut self, plan: SubscriptionPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_caller(mut self, caller_uid: i32, access_level: AccessLevel) -> Self {
        self.caller_uid = caller_uid;
        self.access_level = access_level;
        self
    }

    fn selects(&self, key: &HistoryKey) -> bool {
        self.uid.map_or(true, |uid| uid == key.uid)
            && self.set.map_or(true, |set| set == key.set)
            && self.tag.map_or(true, |tag| tag == key.tag)
            && is_accessible_to_user(key.uid, self.caller_uid, self.access_level)
            && self.template.matches_set(&key.ident)
    }
}

/// First difference found by [`Collection::compare`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionMismatch {
    #[error("bucket duration differs: {ours} vs {theirs}")]
    BucketDuration { ours: i64, theirs: i64 },

    #[error("entry count differs: {ours} vs {theirs}")]
    EntryCount { ours: usize, theirs: usize },

    #[error("missing history for uid {uid} tag {tag}")]
    MissingKey { uid: i32, tag: i32 },

    #[error("history differs for uid {uid} tag {tag}")]
    History { uid: i32, tag: i32 },

    #[error("start differs: {ours:?} vs {theirs:?}")]
    Start { ours: Option<i64>, theirs: Option<i64> },

    #[error("end differs: {ours:?} vs {theirs:?}")]
    End { ours: Option<i64>, theirs: Option<i64> },

    #[error("total bytes differ: {ours} vs {theirs}")]
    TotalBytes { ours: i64, theirs: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    bucket_duration: i64,
    #[serde(with = "entries_as_vec")]
    entries: BTreeMap<HistoryKey, History>,
    #[serde(skip)]
    dirty: bool,
}

impl Collection {
    pub fn new(bucket_duration: i64) -> Self {
        Self {
            bucket_duration: bucket_duration.max(1),
            entries: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn bucket_duration(&self) -> i64 {
        self.bucket_duration
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once mutated since creation, load or the last [`Collection::mark_clean`].
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HistoryKey, &History)> {
        self.entries.iter()
    }

    pub fn get(&self, key: &HistoryKey) -> Option<&History> {
        self.entries.get(key)
    }

    pub fn start_millis(&self) -> Option<i64> {
        self.entries.values().filter_map(History::start).min()
    }

    pub fn end_millis(&self) -> Option<i64> {
        self.entries.values().filter_map(History::end).max()
    }

    pub fn total_bytes(&self) -> i64 {
        self.entries
            .values()
            .fold(0i64, |acc, h| acc.saturating_add(h.total_bytes()))
    }

    pub fn uids(&self) -> BTreeSet<i32> {
        self.entries.keys().map(|k| k.uid).collect()
    }

    fn history_mut(&mut self, key: HistoryKey) -> &mut History {
        let duration = self.bucket_duration;
        self.dirty = true;
        self.entries
            .entry(key)
            .or_insert_with(|| History::new(duration))
    }

    pub fn record_at(&mut self, key: HistoryKey, t: i64, counters: Counters) {
        if counters.is_zero() {
            return;
        }
        self.history_mut(key).record_at(t, counters);
    }

    pub fn record_data(&mut self, key: HistoryKey, start: i64, end: i64, counters: Counters) {
        if counters.is_zero() {
            return;
        }
        self.history_mut(key).record_data(start, end, counters);
    }

    pub fn record_history(&mut self, key: HistoryKey, history: &History) {
        if history.is_empty() {
            return;
        }
        self.history_mut(key).record_history(history);
    }

    /// Merges every history of `other` into this collection.
    pub fn record_collection(&mut self, other: &Collection) {
        for (key, history) in &other.entries {
            self.record_history(key.clone(), history);
        }
    }

    /// Combined history of all entries selected by `query`, clipped to its
    /// range and masked to its fields.
    pub fn get_history(&self, query: &HistoryQuery) -> History {
        let mut out = History::new(self.bucket_duration);
        for (key, history) in &self.entries {
            if query.selects(key) {
                out.record_history_within(history, query.start, query.end);
            }
        }
        if let Some(plan) = &query.plan {
            out.augment_with_plan(plan);
        }
        out.masked(query.fields)
    }

    /// One row per selected key with its usage inside `[start, end)`.
    /// Rows carry the interface wildcard and the flags of their identity set.
    pub fn get_summary(
        &self,
        template: &Template,
        start: i64,
        end: i64,
        access_level: AccessLevel,
        caller_uid: i32,
    ) -> Snapshot {
        let mut out = Snapshot::new(end);
        for (key, history) in &self.entries {
            if !is_accessible_to_user(key.uid, caller_uid, access_level)
                || !template.matches_set(&key.ident)
            {
                continue;
            }
            let values = history.get_values(start, end);
            if values.is_zero() {
                continue;
            }
            let entry = EntryKey {
                iface: IFACE_ALL.to_string(),
                uid: key.uid,
                set: key.set,
                tag: key.tag,
                metered: key.ident.is_any_member_metered(),
                roaming: key.ident.is_any_member_roaming(),
                default_network: key.ident.are_all_members_on_default_network(),
            };
            out.add(entry, values);
        }
        out
    }

    /// Deletes the histories of `uids`. Untagged history is folded into
    /// [`UID_REMOVED`] first so interface totals are unaffected.
    pub fn remove_uids(&mut self, uids: &[i32]) {
        let doomed: Vec<HistoryKey> = self
            .entries
            .keys()
            .filter(|k| uids.contains(&k.uid))
            .cloned()
            .collect();
        for key in doomed {
            let Some(history) = self.entries.remove(&key) else {
                continue;
            };
            self.dirty = true;
            if key.tag == TAG_NONE {
                let removed = HistoryKey {
                    uid: UID_REMOVED,
                    ..key
                };
                self.record_history(removed, &history);
            }
        }
    }

    /// Drops buckets starting before `cutoff`, then empty histories.
    pub fn remove_history_before(&mut self, cutoff: i64) {
        for history in self.entries.values_mut() {
            let before = history.len();
            history.remove_buckets_starting_before(cutoff);
            if history.len() != before {
                self.dirty = true;
            }
        }
        self.entries.retain(|_, h| !h.is_empty());
    }

    /// Drops buckets starting at or after `cutoff`, then empty histories.
    pub fn remove_history_from(&mut self, cutoff: i64) {
        for history in self.entries.values_mut() {
            let before = history.len();
            history.remove_buckets_from(cutoff);
            if history.len() != before {
                self.dirty = true;
            }
        }
        self.entries.retain(|_, h| !h.is_empty());
    }

    /// Drops buckets ending at or before `cutoff`, then empty histories.
    pub fn trim_before(&mut self, cutoff: i64) {
        for history in self.entries.values_mut() {
            let before = history.len();
            history.remove_buckets_before(cutoff);
            if history.len() != before {
                self.dirty = true;
            }
        }
        self.entries.retain(|_, h| !h.is_empty());
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.dirty = true;
        }
        self.entries.clear();
    }

    /// Copy with identities rewritten the way the importer stores them.
    pub fn normalized_for_import(&self) -> Collection {
        let mut out = Collection::new(self.bucket_duration);
        for (key, history) in &self.entries {
            let key = HistoryKey {
                ident: key.ident.normalized_for_import(),
                ..key.clone()
            };
            out.record_history(key, history);
        }
        out.dirty = false;
        out
    }

    pub fn is_same_as(&self, other: &Collection) -> bool {
        self.bucket_duration == other.bucket_duration && self.entries == other.entries
    }

    /// Checks that `self` holds the same data as `legacy`.
    ///
    /// With `allow_key_change`, entries whose key is rewritten on import are
    /// left out of the per-entry comparison.
    pub fn compare(
        &self,
        legacy: &Collection,
        allow_key_change: bool,
    ) -> Result<(), CollectionMismatch> {
        if self.bucket_duration != legacy.bucket_duration {
            return Err(CollectionMismatch::BucketDuration {
                ours: self.bucket_duration,
                theirs: legacy.bucket_duration,
            });
        }

        // Keys rewritten on import, in their rewritten form.
        let changed: BTreeSet<HistoryKey> = if allow_key_change {
            legacy
                .entries
                .keys()
                .filter(|k| k.could_change_on_import())
                .map(|k| HistoryKey {
                    ident: k.ident.normalized_for_import(),
                    ..k.clone()
                })
                .collect()
        } else {
            BTreeSet::new()
        };
        let ours: BTreeMap<&HistoryKey, &History> = self
            .entries
            .iter()
            .filter(|(k, _)| !changed.contains(*k))
            .collect();
        let theirs: BTreeMap<&HistoryKey, &History> = legacy
            .entries
            .iter()
            .filter(|(k, _)| !allow_key_change || !k.could_change_on_import())
            .collect();

        if ours.len() != theirs.len() {
            return Err(CollectionMismatch::EntryCount {
                ours: ours.len(),
                theirs: theirs.len(),
            });
        }
        for (key, legacy_history) in &theirs {
            match ours.get(key) {
                None => {
                    return Err(CollectionMismatch::MissingKey {
                        uid: key.uid,
                        tag: key.tag,
                    })
                }
                Some(history) if !history.is_same_as(legacy_history) => {
                    return Err(CollectionMismatch::History {
                        uid: key.uid,
                        tag: key.tag,
                    })
                }
                Some(_) => {}
            }
        }

        if self.start_millis() != legacy.start_millis() {
            return Err(CollectionMismatch::Start {
                ours: self.start_millis(),
                theirs: legacy.start_millis(),
            });
        }
        if self.end_millis() != legacy.end_millis() {
            return Err(CollectionMismatch::End {
                ours: self.end_millis(),
                theirs: legacy.end_millis(),
            });
        }
        if self.total_bytes() != legacy.total_bytes() {
            return Err(CollectionMismatch::TotalBytes {
                ours: self.total_bytes(),
                theirs: legacy.total_bytes(),
            });
        }
        Ok(())
    }
}

/// JSON object keys must be strings, so the map is stored as a list of pairs.
mod entries_as_vec {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{History, HistoryKey};

    pub fn serialize<S>(map: &BTreeMap<HistoryKey, History>, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<BTreeMap<HistoryKey, History>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs = Vec::<(HistoryKey, History)>::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}
