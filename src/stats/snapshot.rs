//! Point-in-time counter readings from one raw source.

use std::collections::BTreeMap;

use super::{Counters, TrafficSet, TAG_NONE, UID_ALL};

/// Interface name used when a reading is not tied to a single interface.
pub const IFACE_ALL: &str = "*";

/// Identity of one counter row inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub iface: String,
    pub uid: i32,
    pub set: TrafficSet,
    pub tag: i32,
    pub metered: bool,
    pub roaming: bool,
    pub default_network: bool,
}

impl EntryKey {
    /// Key for an interface-level reading.
    pub fn iface(iface: impl Into<String>) -> Self {
        Self::uid(iface, UID_ALL, TAG_NONE)
    }

    /// Key for a per-uid reading in the default set.
    pub fn uid(iface: impl Into<String>, uid: i32, tag: i32) -> Self {
        Self {
            iface: iface.into(),
            uid,
            set: TrafficSet::Default,
            tag,
            metered: false,
            roaming: false,
            default_network: false,
        }
    }

    pub fn with_metered(mut self, metered: bool) -> Self {
        self.metered = metered;
        self
    }
}

/// Multiset of counter readings keyed by [`EntryKey`].
///
/// Readings added under an existing key are combined additively, so a
/// snapshot assembled from several sources holds their sum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    taken_at: i64,
    entries: BTreeMap<EntryKey, Counters>,
}

impl Snapshot {
    /// Creates an empty snapshot taken at `taken_at` (wall clock millis).
    pub fn new(taken_at: i64) -> Self {
        Self {
            taken_at,
            entries: BTreeMap::new(),
        }
    }

    pub fn taken_at(&self) -> i64 {
        self.taken_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a reading, combining it with any existing reading for the key.
    pub fn add(&mut self, key: EntryKey, counters: Counters) {
        *self.entries.entry(key).or_default() += counters;
    }

    /// Builder form of [`Snapshot::add`].
    pub fn with(mut self, key: EntryKey, counters: Counters) -> Self {
        self.add(key, counters);
        self
    }

    pub fn get(&self, key: &EntryKey) -> Option<&Counters> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntryKey, &Counters)> {
        self.entries.iter()
    }

    /// Adds every reading of `other` into this snapshot.
    pub fn combine(&mut self, other: &Snapshot) {
        for (key, counters) in &other.entries {
            self.add(key.clone(), *counters);
        }
    }

    /// Sum of all readings.
    pub fn total(&self) -> Counters {
        self.entries
            .values()
            .fold(Counters::ZERO, |acc, c| acc + *c)
    }

    /// Returns the readings matching `pred`.
    pub fn filtered(&self, pred: impl Fn(&EntryKey) -> bool) -> Snapshot {
        Snapshot {
            taken_at: self.taken_at,
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| pred(k))
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// Collapses uid, set, tag and network flags, keeping one row per interface.
    pub fn grouped_by_iface(&self) -> Snapshot {
        let mut out = Snapshot::new(self.taken_at);
        for (key, counters) in &self.entries {
            out.add(EntryKey::iface(key.iface.clone()), *counters);
        }
        out
    }

    /// Computes `self - previous` per key.
    ///
    /// Keys missing from `previous` contribute their full value. When any
    /// field of a row would go negative the source counter was reset, so the
    /// whole current reading is used as the delta and `on_non_monotonic` is
    /// told about both readings. Rows that only exist in `previous` are
    /// ignored.
    pub fn subtract<F>(&self, previous: &Snapshot, mut on_non_monotonic: F) -> Snapshot
    where
        F: FnMut(&EntryKey, &Counters, &Counters),
    {
        let mut delta = Snapshot::new(self.taken_at);
        for (key, current) in &self.entries {
            let value = match previous.entries.get(key) {
                Some(prev) => {
                    let d = *current - *prev;
                    if d.is_negative() {
                        on_non_monotonic(key, prev, current);
                        *current
                    } else {
                        d
                    }
                }
                None => *current,
            };
            if !value.is_zero() {
                delta.entries.insert(key.clone(), value);
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_combines_same_key() {
        let mut snap = Snapshot::new(0);
        snap.add(EntryKey::iface("wlan0"), Counters::bytes(100, 10));
        snap.add(EntryKey::iface("wlan0"), Counters::bytes(5, 5));
        snap.add(EntryKey::iface("rmnet0"), Counters::bytes(1, 1));

        assert_eq!(snap.len(), 2);
        assert_eq!(
            snap.get(&EntryKey::iface("wlan0")),
            Some(&Counters::bytes(105, 15))
        );
        assert_eq!(snap.total(), Counters::bytes(106, 16));
    }

    #[test]
    fn test_subtract_monotonic() {
        let old = Snapshot::new(0).with(EntryKey::iface("wlan0"), Counters::bytes(1000, 1200));
        let new = Snapshot::new(60_000).with(EntryKey::iface("wlan0"), Counters::bytes(2500, 1800));

        let mut anomalies = 0;
        let delta = new.subtract(&old, |_, _, _| anomalies += 1);

        assert_eq!(anomalies, 0);
        assert_eq!(delta.taken_at(), 60_000);
        assert_eq!(
            delta.get(&EntryKey::iface("wlan0")),
            Some(&Counters::bytes(1500, 600))
        );
    }

    #[test]
    fn test_subtract_non_monotonic_uses_full_value() {
        let old = Snapshot::new(0).with(EntryKey::iface("wlan0"), Counters::bytes(2500, 1800));
        let new = Snapshot::new(1).with(EntryKey::iface("wlan0"), Counters::bytes(2000, 1800));

        let mut seen = Vec::new();
        let delta = new.subtract(&old, |key, prev, cur| {
            seen.push((key.iface.clone(), *prev, *cur));
        });

        assert_eq!(
            seen,
            vec![(
                "wlan0".to_string(),
                Counters::bytes(2500, 1800),
                Counters::bytes(2000, 1800)
            )]
        );
        assert_eq!(
            delta.get(&EntryKey::iface("wlan0")),
            Some(&Counters::bytes(2000, 1800))
        );
    }

    #[test]
    fn test_subtract_new_key_and_vanished_key() {
        let old = Snapshot::new(0).with(EntryKey::iface("eth0"), Counters::bytes(10, 10));
        let new = Snapshot::new(1).with(EntryKey::uid("wlan0", 10_001, 0), Counters::bytes(7, 3));

        let delta = new.subtract(&old, |_, _, _| panic!("no anomaly expected"));

        assert_eq!(delta.len(), 1);
        assert_eq!(
            delta.get(&EntryKey::uid("wlan0", 10_001, 0)),
            Some(&Counters::bytes(7, 3))
        );
    }

    #[test]
    fn test_subtract_drops_zero_rows() {
        let snap = Snapshot::new(0).with(EntryKey::iface("wlan0"), Counters::bytes(5, 5));
        let delta = snap.subtract(&snap, |_, _, _| {});
        assert!(delta.is_empty());
    }

    #[test]
    fn test_grouped_by_iface() {
        let snap = Snapshot::new(0)
            .with(EntryKey::uid("wlan0", 10_001, 0), Counters::bytes(1, 2))
            .with(EntryKey::uid("wlan0", 10_002, 0), Counters::bytes(3, 4))
            .with(EntryKey::uid("rmnet0", 10_001, 0), Counters::bytes(5, 6));

        let grouped = snap.grouped_by_iface();
        assert_eq!(grouped.len(), 2);
        assert_eq!(
            grouped.get(&EntryKey::iface("wlan0")),
            Some(&Counters::bytes(4, 6))
        );
    }
}
