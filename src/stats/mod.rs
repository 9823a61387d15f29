//! Counter data model: snapshots, network identities, bucketed histories and
//! the per-dimension collections built from them.

pub mod collection;
pub mod history;
pub mod identity;
pub mod snapshot;
pub mod template;

use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// Uid used for interface-level totals that are not attributed to an app.
pub const UID_ALL: i32 = -1;
/// Uid that absorbs the history of removed apps so device totals survive.
pub const UID_REMOVED: i32 = -4;
/// Uid used for traffic of tethered clients.
pub const UID_TETHERING: i32 = -5;
/// Uid of the system server; never rate limited.
pub const SYSTEM_UID: i32 = 1000;
/// Tag of untagged traffic.
pub const TAG_NONE: i32 = 0;
/// Size of the uid range reserved for each user.
pub const PER_USER_RANGE: i32 = 100_000;

/// Returns the user that owns `uid`, or `None` for the special negative uids.
pub fn user_id_for_uid(uid: i32) -> Option<i32> {
    if uid < 0 {
        None
    } else {
        Some(uid / PER_USER_RANGE)
    }
}

/// Traffic set a socket was counted under.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TrafficSet {
    #[default]
    Default,
    Foreground,
}

impl TrafficSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Foreground => "foreground",
        }
    }
}

/// One set of byte/packet counters. Signed so that deltas can be checked for
/// going backwards before they are corrected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Counters {
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
    pub operations: i64,
}

impl Counters {
    pub const ZERO: Counters = Counters {
        rx_bytes: 0,
        rx_packets: 0,
        tx_bytes: 0,
        tx_packets: 0,
        operations: 0,
    };

    pub const fn new(
        rx_bytes: i64,
        rx_packets: i64,
        tx_bytes: i64,
        tx_packets: i64,
        operations: i64,
    ) -> Self {
        Self {
            rx_bytes,
            rx_packets,
            tx_bytes,
            tx_packets,
            operations,
        }
    }

    /// Counters with only byte fields set.
    pub const fn bytes(rx_bytes: i64, tx_bytes: i64) -> Self {
        Self::new(rx_bytes, 0, tx_bytes, 0, 0)
    }

    pub fn total_bytes(&self) -> i64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// True if any field is below zero.
    pub fn is_negative(&self) -> bool {
        self.rx_bytes < 0
            || self.rx_packets < 0
            || self.tx_bytes < 0
            || self.tx_packets < 0
            || self.operations < 0
    }

    /// Returns `self * num / den` per field, rounding toward zero.
    pub fn scaled(&self, num: i64, den: i64) -> Self {
        if den == 0 {
            return Self::ZERO;
        }
        let scale = |v: i64| -> i64 {
            let r = i128::from(v) * i128::from(num) / i128::from(den);
            i64::try_from(r).unwrap_or(if r < 0 { i64::MIN } else { i64::MAX })
        };
        Self {
            rx_bytes: scale(self.rx_bytes),
            rx_packets: scale(self.rx_packets),
            tx_bytes: scale(self.tx_bytes),
            tx_packets: scale(self.tx_packets),
            operations: scale(self.operations),
        }
    }
}

impl Add for Counters {
    type Output = Counters;

    fn add(mut self, rhs: Counters) -> Counters {
        self += rhs;
        self
    }
}

impl AddAssign for Counters {
    fn add_assign(&mut self, rhs: Counters) {
        self.rx_bytes = self.rx_bytes.saturating_add(rhs.rx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(rhs.rx_packets);
        self.tx_bytes = self.tx_bytes.saturating_add(rhs.tx_bytes);
        self.tx_packets = self.tx_packets.saturating_add(rhs.tx_packets);
        self.operations = self.operations.saturating_add(rhs.operations);
    }
}

impl Sub for Counters {
    type Output = Counters;

    fn sub(self, rhs: Counters) -> Counters {
        Counters {
            rx_bytes: self.rx_bytes.saturating_sub(rhs.rx_bytes),
            rx_packets: self.rx_packets.saturating_sub(rhs.rx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(rhs.tx_bytes),
            tx_packets: self.tx_packets.saturating_sub(rhs.tx_packets),
            operations: self.operations.saturating_sub(rhs.operations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_for_uid() {
        assert_eq!(user_id_for_uid(10_123), Some(0));
        assert_eq!(user_id_for_uid(1_010_123), Some(10));
        assert_eq!(user_id_for_uid(UID_REMOVED), None);
    }

    #[test]
    fn test_counters_sub_detects_negative() {
        let old = Counters::bytes(2500, 1800);
        let new = Counters::bytes(2000, 1800);
        let delta = new - old;
        assert!(delta.is_negative());
        assert_eq!(delta.rx_bytes, -500);
        assert_eq!(delta.tx_bytes, 0);
    }

    #[test]
    fn test_counters_scaled_rounds_toward_zero() {
        let c = Counters::new(100, 10, 50, 5, 1);
        let half = c.scaled(1, 3);
        assert_eq!(half, Counters::new(33, 3, 16, 1, 0));
        assert_eq!(c.scaled(5, 0), Counters::ZERO);
    }

    #[test]
    fn test_counters_add_saturates() {
        let mut c = Counters::bytes(i64::MAX - 1, 0);
        c += Counters::bytes(10, 3);
        assert_eq!(c.rx_bytes, i64::MAX);
        assert_eq!(c.tx_bytes, 3);
        assert_eq!(c.total_bytes(), i64::MAX);
    }
}
