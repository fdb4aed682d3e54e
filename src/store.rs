use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    AttendanceEvent, Caregroup, CloseReason, EscalationRecord, FinalizedGathering, Gathering,
    Member, RecordAttendance, StandingSnapshot,
};
use crate::standing::Tier;

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn add_caregroup(&self, group: Caregroup) -> Result<()>;
    async fn caregroup(&self, group_id: Uuid) -> Result<Option<Caregroup>>;

    /// Insert a member, or refresh name and email of an existing one.
    /// Group, active flag and enrollment date are left untouched on re-add.
    async fn add_member(&self, member: Member) -> Result<()>;
    async fn member(&self, member_id: Uuid) -> Result<Option<Member>>;
    async fn member_by_email(&self, email: &str) -> Result<Option<Member>>;
    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Member>>;
    async fn assign_group(&self, member_id: Uuid, group_id: Option<Uuid>) -> Result<()>;
    async fn deactivate_member(&self, member_id: Uuid) -> Result<()>;

    /// Insert a gathering. Re-adding an existing id or `(title, starts_at)`
    /// is a no-op, so a finalized gathering stays finalized.
    async fn add_gathering(&self, gathering: Gathering) -> Result<()>;
    async fn gathering_on(&self, title: &str, starts_at: DateTime<Utc>)
        -> Result<Option<Gathering>>;

    /// Upsert the outcome for `(member, gathering)`. The newer `recorded_at`
    /// wins; on a tie the later call wins. Finalized gatherings reject writes.
    async fn record_event(&self, command: RecordAttendance) -> Result<()>;

    /// Mark every active, already-enrolled member without an event as absent
    /// and close the gathering to further edits.
    async fn finalize_gathering(
        &self,
        gathering_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<FinalizedGathering>;

    /// Events of gatherings starting at or before `up_to`.
    async fn list_events(
        &self,
        member_id: Uuid,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<EventHistory>;

    async fn standing(&self, member_id: Uuid) -> Result<Option<StandingSnapshot>>;

    /// Store the evaluated tier if the snapshot is still at `expected_version`
    /// (`None` meaning no snapshot yet). Returns the new version or
    /// `EngineError::Conflict`.
    async fn save_standing(
        &self,
        member_id: Uuid,
        tier: Tier,
        expected_version: Option<i64>,
    ) -> Result<i64>;

    /// Insert `record` unless the member already has an open escalation.
    async fn insert_escalation(&self, record: EscalationRecord) -> Result<bool>;
    async fn open_escalation(&self, member_id: Uuid) -> Result<Option<EscalationRecord>>;
    async fn latest_escalation(&self, member_id: Uuid) -> Result<Option<EscalationRecord>>;
    async fn close_escalation(
        &self,
        member_id: Uuid,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Result<Option<EscalationRecord>>;
    async fn mark_notified(&self, escalation_id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn pending_notifications(&self) -> Result<Vec<EscalationRecord>>;
}

/// A member's events in ascending gathering order. Iteration can be
/// restarted from either end as often as needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventHistory {
    events: Vec<AttendanceEvent>,
}

impl EventHistory {
    pub fn new(mut events: Vec<AttendanceEvent>) -> Self {
        // Same-day gatherings order by start time; the id only breaks exact ties.
        events.sort_by(|a, b| {
            a.starts_at
                .cmp(&b.starts_at)
                .then_with(|| a.gathering_id.cmp(&b.gathering_id))
        });
        Self { events }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &AttendanceEvent> + '_ {
        self.events.iter()
    }

    pub fn iter_latest_first(&self) -> impl Iterator<Item = &AttendanceEvent> + '_ {
        self.iter().rev()
    }
}

/// Fail a store call that does not finish within `limit`.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        EngineError::Storage(format!("{operation} timed out after {limit:?}"))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Outcome;
    use chrono::{Datelike, TimeZone, Timelike};

    fn event_at(day: u32, hour: u32, gathering_id: Uuid, outcome: Outcome) -> AttendanceEvent {
        AttendanceEvent {
            member_id: Uuid::nil(),
            gathering_id,
            starts_at: Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap(),
            outcome,
            recorded_at: Utc::now(),
        }
    }

    fn event(day: u32, outcome: Outcome) -> AttendanceEvent {
        event_at(day, 10, Uuid::new_v4(), outcome)
    }

    #[test]
    fn history_orders_by_gathering_date() {
        let history = EventHistory::new(vec![
            event(15, Outcome::Absent),
            event(1, Outcome::Present),
            event(8, Outcome::Excused),
        ]);
        let days: Vec<u32> = history
            .iter()
            .map(|e| e.starts_at.day())
            .collect();
        assert_eq!(days, vec![1, 8, 15]);

        let latest = history.iter_latest_first().next().unwrap();
        assert_eq!(latest.outcome, Outcome::Absent);
        // restartable
        assert_eq!(history.iter().count(), 3);
        assert_eq!(history.iter().count(), 3);
    }

    #[test]
    fn same_day_gatherings_order_by_start_time() {
        // Evening id sorts before morning id; start time must still win.
        let evening_id = Uuid::from_u128(1);
        let morning_id = Uuid::from_u128(2);
        let history = EventHistory::new(vec![
            event_at(1, 19, evening_id, Outcome::Absent),
            event_at(1, 9, morning_id, Outcome::Present),
        ]);
        let hours: Vec<u32> = history.iter().map(|e| e.starts_at.hour()).collect();
        assert_eq!(hours, vec![9, 19]);
        assert_eq!(history.iter_latest_first().next().unwrap().gathering_id, evening_id);
    }

    #[tokio::test]
    async fn bounded_reports_timeouts_as_storage_errors() {
        let result: Result<()> = bounded(Duration::from_millis(10), "slow write", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Storage(msg)) if msg.contains("slow write")));
    }
}
