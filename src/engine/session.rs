//! Caller-facing query sessions and access levels.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StatsError;
use crate::stats::collection::{is_accessible_to_user, AccessLevel, HistoryQuery};
use crate::stats::history::{History, SubscriptionPlan};
use crate::stats::snapshot::Snapshot;
use crate::stats::template::Template;
use crate::stats::{Counters, TrafficSet, SYSTEM_UID, TAG_NONE, UID_ALL};

use super::{AccountingEngine, RecorderKind};

/// Decides how much a caller may see.
pub trait AccessChecker: Send + Sync {
    fn access_level(&self, caller_uid: i32) -> AccessLevel;
}

/// Fixed access levels per uid. The system uid always has device access.
#[derive(Debug, Clone)]
pub struct StaticAccessChecker {
    default: AccessLevel,
    overrides: HashMap<i32, AccessLevel>,
}

impl StaticAccessChecker {
    pub fn new(default: AccessLevel) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_uid(mut self, uid: i32, level: AccessLevel) -> Self {
        self.overrides.insert(uid, level);
        self
    }
}

impl AccessChecker for StaticAccessChecker {
    fn access_level(&self, caller_uid: i32) -> AccessLevel {
        if caller_uid == SYSTEM_UID {
            return AccessLevel::Device;
        }
        self.overrides
            .get(&caller_uid)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Query handle bound to one caller and its access level.
pub struct StatsSession {
    engine: Arc<AccountingEngine>,
    caller_uid: i32,
    access_level: AccessLevel,
}

impl StatsSession {
    pub(super) fn new(engine: Arc<AccountingEngine>, caller_uid: i32, access_level: AccessLevel) -> Self {
        Self {
            engine,
            caller_uid,
            access_level,
        }
    }

    pub fn caller_uid(&self) -> i32 {
        self.caller_uid
    }

    pub fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    fn check_query(template: &Template, start: i64, end: i64) -> Result<(), StatsError> {
        template.validate()?;
        if start > end {
            return Err(StatsError::InvalidRange { start, end });
        }
        Ok(())
    }

    /// Interface totals are visible from [`AccessLevel::DeviceSummary`] up.
    fn require_network_access(&self) -> Result<(), StatsError> {
        if self.access_level < AccessLevel::DeviceSummary {
            return Err(StatsError::AccessDenied {
                caller_uid: self.caller_uid,
                uid: UID_ALL,
                tag: TAG_NONE,
            });
        }
        Ok(())
    }

    fn network_query(&self, template: &Template, start: i64, end: i64) -> HistoryQuery {
        HistoryQuery::new(template.clone(), start, end)
            .with_caller(self.caller_uid, self.access_level)
    }

    /// Total usage of the networks matching `template` in `[start, end)`.
    pub fn get_device_summary(
        &self,
        template: &Template,
        start: i64,
        end: i64,
    ) -> Result<Counters, StatsError> {
        Self::check_query(template, start, end)?;
        self.require_network_access()?;
        let xt = self.engine.collection(RecorderKind::Xt)?;
        Ok(xt.get_history(&self.network_query(template, start, end)).total())
    }

    /// Per identity-set usage of the matching networks.
    pub fn get_summary_for_network(
        &self,
        template: &Template,
        start: i64,
        end: i64,
    ) -> Result<Snapshot, StatsError> {
        Self::check_query(template, start, end)?;
        self.require_network_access()?;
        let xt = self.engine.collection(RecorderKind::Xt)?;
        Ok(xt.get_summary(template, start, end, self.access_level, self.caller_uid))
    }

    pub fn get_history_for_network(
        &self,
        template: &Template,
        fields: u32,
        start: i64,
        end: i64,
    ) -> Result<History, StatsError> {
        Self::check_query(template, start, end)?;
        self.require_network_access()?;
        let xt = self.engine.collection(RecorderKind::Xt)?;
        Ok(xt.get_history(&self.network_query(template, start, end).with_fields(fields)))
    }

    /// As [`Self::get_history_for_network`], rescaled to the usage a carrier
    /// plan reports.
    pub fn get_history_for_plan(
        &self,
        template: &Template,
        plan: SubscriptionPlan,
        fields: u32,
        start: i64,
        end: i64,
    ) -> Result<History, StatsError> {
        Self::check_query(template, start, end)?;
        self.require_network_access()?;
        let xt = self.engine.collection(RecorderKind::Xt)?;
        let query = self
            .network_query(template, start, end)
            .with_plan(plan)
            .with_fields(fields);
        Ok(xt.get_history(&query))
    }

    /// Usage of every uid the caller may see. Rows of other uids are left
    /// out rather than rejected.
    pub fn get_summary_for_all_uid(
        &self,
        template: &Template,
        start: i64,
        end: i64,
        include_tags: bool,
    ) -> Result<Snapshot, StatsError> {
        Self::check_query(template, start, end)?;
        let uid = self.engine.collection(RecorderKind::Uid)?;
        let mut summary = uid.get_summary(template, start, end, self.access_level, self.caller_uid);
        if include_tags {
            let tagged = self.engine.collection(RecorderKind::UidTag)?;
            summary.combine(&tagged.get_summary(
                template,
                start,
                end,
                self.access_level,
                self.caller_uid,
            ));
        }
        Ok(summary)
    }

    /// History of one uid, optionally narrowed to a set and a tag.
    ///
    /// Fails with [`StatsError::AccessDenied`] when `uid` is outside the
    /// caller's reach, and for tagged queries on another uid unless the
    /// caller has device access.
    #[allow(clippy::too_many_arguments)]
    pub fn get_history_for_uid(
        &self,
        template: &Template,
        uid: i32,
        set: Option<TrafficSet>,
        tag: i32,
        fields: u32,
        start: i64,
        end: i64,
    ) -> Result<History, StatsError> {
        Self::check_query(template, start, end)?;

        let denied = || StatsError::AccessDenied {
            caller_uid: self.caller_uid,
            uid,
            tag,
        };
        if !is_accessible_to_user(uid, self.caller_uid, self.access_level) {
            return Err(denied());
        }
        if tag != TAG_NONE && uid != self.caller_uid && self.access_level < AccessLevel::Device {
            return Err(denied());
        }

        let kind = if tag == TAG_NONE {
            RecorderKind::Uid
        } else {
            RecorderKind::UidTag
        };
        let collection = self.engine.collection(kind)?;
        let query = HistoryQuery::new(template.clone(), start, end)
            .for_uid(uid, set, tag)
            .with_fields(fields)
            .with_caller(self.caller_uid, self.access_level);
        Ok(collection.get_history(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::ifaces::NetworkState;
    use crate::engine::source::CounterSource;
    use crate::engine::EngineOptions;
    use crate::export::health::HealthMetrics;
    use crate::recorder::RecorderSettings;
    use crate::stats::history::FIELD_RX_BYTES;
    use crate::stats::identity::NetworkIdentity;
    use crate::stats::snapshot::EntryKey;
    use crate::stats::template::MatchRule;
    use parking_lot::Mutex;
    use std::time::Duration;

    const HOUR: i64 = 3_600_000;
    const APP: i32 = 10_050;
    const OTHER_USER_APP: i32 = 110_050;

    #[derive(Default)]
    struct SteppedSource {
        uid: Mutex<Snapshot>,
    }

    impl CounterSource for SteppedSource {
        fn read_uid_stats(&self, now: i64) -> anyhow::Result<Snapshot> {
            let mut snap = Snapshot::new(now);
            snap.combine(&self.uid.lock());
            Ok(snap)
        }

        fn read_dev_stats(&self, now: i64) -> anyhow::Result<Snapshot> {
            Ok(Snapshot::new(now))
        }
    }

    fn uid_rows(scale: i64) -> Snapshot {
        Snapshot::new(0)
            .with(EntryKey::uid("wlan0", APP, TAG_NONE), Counters::bytes(10 * scale, 0))
            .with(EntryKey::uid("wlan0", APP, 3), Counters::bytes(scale, 0))
            .with(EntryKey::uid("wlan0", OTHER_USER_APP, TAG_NONE), Counters::bytes(20 * scale, 0))
    }

    async fn populated(dir: &std::path::Path, access: StaticAccessChecker) -> Arc<AccountingEngine> {
        let settings = RecorderSettings {
            bucket_duration: HOUR,
            rotate_age: 24 * HOUR,
            delete_age: 48 * HOUR,
        };
        let options = EngineOptions {
            stats_dir: dir.to_path_buf(),
            dev: settings,
            xt: settings,
            uid: settings,
            uid_tag: settings,
            persist_threshold: 1 << 20,
            provider_poll_timeout: Duration::from_millis(10),
            session_poll_rate_limit: Duration::from_secs(15),
        };
        let source = Arc::new(SteppedSource::default());
        let clock = Arc::new(ManualClock::new(HOUR));
        let engine = AccountingEngine::new(
            options,
            source.clone(),
            clock.clone(),
            Arc::new(access),
            Arc::new(HealthMetrics::detached().expect("metrics")),
        )
        .expect("engine");

        *source.uid.lock() = uid_rows(1);
        let networks = [NetworkState::new(NetworkIdentity::wifi("\"home\""), "wlan0")];
        engine.notify_network_status(&networks).await.expect("networks");
        *source.uid.lock() = uid_rows(2);
        clock.set(HOUR + 60_000);
        engine.force_update().await.expect("poll");
        engine
    }

    fn wifi() -> Template {
        Template::new(MatchRule::Wifi)
    }

    #[tokio::test]
    async fn test_device_access_sees_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = populated(dir.path(), StaticAccessChecker::new(AccessLevel::Default)).await;
        let session = engine.open_session(SYSTEM_UID, false).await.expect("session");

        let total = session.get_device_summary(&wifi(), 0, 2 * HOUR).expect("summary");
        assert_eq!(total.rx_bytes, 30);

        let all = session
            .get_summary_for_all_uid(&wifi(), 0, 2 * HOUR, true)
            .expect("all uids");
        assert_eq!(all.total().rx_bytes, 31);

        let tagged = session
            .get_history_for_uid(&wifi(), APP, None, 3, FIELD_RX_BYTES, 0, 2 * HOUR)
            .expect("tagged");
        assert_eq!(tagged.total_bytes(), 1);
    }

    #[tokio::test]
    async fn test_device_summary_access_is_redacted_per_uid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let access = StaticAccessChecker::new(AccessLevel::Default).with_uid(APP, AccessLevel::DeviceSummary);
        let engine = populated(dir.path(), access).await;
        let session = engine.open_session(APP, false).await.expect("session");

        assert_eq!(
            session.get_device_summary(&wifi(), 0, 2 * HOUR).expect("summary").rx_bytes,
            30
        );

        let err = session
            .get_history_for_uid(&wifi(), OTHER_USER_APP, None, TAG_NONE, u32::MAX, 0, 2 * HOUR)
            .expect_err("other user");
        assert!(matches!(err, StatsError::AccessDenied { uid: OTHER_USER_APP, .. }));

        let all = session
            .get_summary_for_all_uid(&wifi(), 0, 2 * HOUR, false)
            .expect("redacted");
        assert_eq!(all.total().rx_bytes, 10);
    }

    #[tokio::test]
    async fn test_default_access_is_limited_to_own_uid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = populated(dir.path(), StaticAccessChecker::new(AccessLevel::Default)).await;
        let session = engine.open_session(APP, false).await.expect("session");

        assert!(matches!(
            session.get_device_summary(&wifi(), 0, 2 * HOUR),
            Err(StatsError::AccessDenied { uid: UID_ALL, .. })
        ));
        let own = session
            .get_history_for_uid(&wifi(), APP, None, 3, u32::MAX, 0, 2 * HOUR)
            .expect("own tag");
        assert_eq!(own.total_bytes(), 1);
    }

    #[tokio::test]
    async fn test_cross_uid_tag_query_needs_device_access() {
        let dir = tempfile::tempdir().expect("tempdir");
        let access = StaticAccessChecker::new(AccessLevel::Default).with_uid(10_051, AccessLevel::User);
        let engine = populated(dir.path(), access).await;
        let session = engine.open_session(10_051, false).await.expect("session");

        let untagged = session
            .get_history_for_uid(&wifi(), APP, None, TAG_NONE, u32::MAX, 0, 2 * HOUR)
            .expect("same user");
        assert_eq!(untagged.total_bytes(), 10);
        assert!(session
            .get_history_for_uid(&wifi(), APP, None, 3, u32::MAX, 0, 2 * HOUR)
            .is_err());
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = populated(dir.path(), StaticAccessChecker::new(AccessLevel::Default)).await;
        let session = engine.open_session(SYSTEM_UID, false).await.expect("session");

        let bad = Template::new(MatchRule::Carrier);
        assert!(matches!(
            session.get_device_summary(&bad, 0, HOUR),
            Err(StatsError::InvalidTemplate(_))
        ));
        assert!(matches!(
            session.get_history_for_network(&wifi(), u32::MAX, 10, 5),
            Err(StatsError::InvalidRange { start: 10, end: 5 })
        ));
    }

    #[tokio::test]
    async fn test_plan_rescales_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = populated(dir.path(), StaticAccessChecker::new(AccessLevel::Default)).await;
        let session = engine.open_session(SYSTEM_UID, false).await.expect("session");

        let plan = SubscriptionPlan {
            cycle_start: 0,
            data_usage_bytes: 300,
            data_usage_time: 3 * HOUR,
        };
        let history = session
            .get_history_for_plan(&wifi(), plan, u32::MAX, 0, 3 * HOUR)
            .expect("plan");
        // Integer rescaling may lose a few bytes.
        assert!((290..=300).contains(&history.total_bytes()));
        assert!(history.total_bytes() > 30);
    }
}
