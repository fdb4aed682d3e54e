use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    AttendanceEvent, Caregroup, CloseReason, EscalationRecord, FinalizedGathering, Gathering,
    Member, Outcome, RecordAttendance, StandingSnapshot,
};
use crate::standing::Tier;
use crate::store::{AttendanceStore, EventHistory};

#[derive(Default)]
pub struct InMemoryStore {
    caregroups: DashMap<Uuid, Caregroup>,
    members: DashMap<Uuid, Member>,
    gatherings: DashMap<Uuid, Gathering>,
    events: DashMap<(Uuid, Uuid), AttendanceEvent>,
    standings: DashMap<Uuid, StandingSnapshot>,
    escalations: DashMap<Uuid, Vec<EscalationRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttendanceStore for InMemoryStore {
    async fn add_caregroup(&self, group: Caregroup) -> Result<()> {
        self.caregroups.insert(group.id, group);
        Ok(())
    }

    async fn caregroup(&self, group_id: Uuid) -> Result<Option<Caregroup>> {
        Ok(self.caregroups.get(&group_id).map(|g| g.clone()))
    }

    async fn add_member(&self, member: Member) -> Result<()> {
        if self
            .members
            .iter()
            .any(|m| m.email == member.email && m.id != member.id)
        {
            return Err(EngineError::Validation(format!(
                "email {} is already enrolled",
                member.email
            )));
        }
        if let Some(group_id) = member.group_id {
            if !self.caregroups.contains_key(&group_id) {
                return Err(EngineError::not_found("caregroup", group_id));
            }
        }
        match self.members.entry(member.id) {
            Entry::Occupied(mut existing) => {
                let existing = existing.get_mut();
                existing.full_name = member.full_name;
                existing.email = member.email;
            }
            Entry::Vacant(slot) => {
                slot.insert(member);
            }
        }
        Ok(())
    }

    async fn member(&self, member_id: Uuid) -> Result<Option<Member>> {
        Ok(self.members.get(&member_id).map(|m| m.clone()))
    }

    async fn member_by_email(&self, email: &str) -> Result<Option<Member>> {
        Ok(self
            .members
            .iter()
            .find(|m| m.email == email)
            .map(|m| m.value().clone()))
    }

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Member>> {
        let mut members: Vec<Member> = self
            .members
            .iter()
            .filter(|m| m.group_id == Some(group_id))
            .map(|m| m.value().clone())
            .collect();
        members.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(members)
    }

    async fn assign_group(&self, member_id: Uuid, group_id: Option<Uuid>) -> Result<()> {
        if let Some(group_id) = group_id {
            if !self.caregroups.contains_key(&group_id) {
                return Err(EngineError::not_found("caregroup", group_id));
            }
        }
        let mut member = self
            .members
            .get_mut(&member_id)
            .ok_or_else(|| EngineError::not_found("member", member_id))?;
        member.group_id = group_id;
        Ok(())
    }

    async fn deactivate_member(&self, member_id: Uuid) -> Result<()> {
        let mut member = self
            .members
            .get_mut(&member_id)
            .ok_or_else(|| EngineError::not_found("member", member_id))?;
        member.active = false;
        Ok(())
    }

    async fn add_gathering(&self, gathering: Gathering) -> Result<()> {
        if self
            .gatherings
            .iter()
            .any(|g| g.title == gathering.title && g.starts_at == gathering.starts_at)
        {
            return Ok(());
        }
        self.gatherings.entry(gathering.id).or_insert(gathering);
        Ok(())
    }

    async fn gathering_on(
        &self,
        title: &str,
        starts_at: DateTime<Utc>,
    ) -> Result<Option<Gathering>> {
        Ok(self
            .gatherings
            .iter()
            .find(|g| g.title == title && g.starts_at == starts_at)
            .map(|g| g.value().clone()))
    }

    async fn record_event(&self, command: RecordAttendance) -> Result<()> {
        if !self.members.contains_key(&command.member_id) {
            return Err(EngineError::not_found("member", command.member_id));
        }
        // Held for the duration of the write so finalization cannot interleave.
        let gathering = self
            .gatherings
            .get(&command.gathering_id)
            .ok_or_else(|| EngineError::not_found("gathering", command.gathering_id))?;
        if gathering.finalized {
            return Err(EngineError::Validation(format!(
                "gathering {} is finalized",
                gathering.id
            )));
        }

        let event = AttendanceEvent {
            member_id: command.member_id,
            gathering_id: command.gathering_id,
            starts_at: gathering.starts_at,
            outcome: command.outcome,
            recorded_at: command.recorded_at,
        };
        match self.events.entry((event.member_id, event.gathering_id)) {
            Entry::Occupied(mut existing) => {
                if existing.get().recorded_at <= event.recorded_at {
                    existing.insert(event);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
        }
        Ok(())
    }

    async fn finalize_gathering(
        &self,
        gathering_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<FinalizedGathering> {
        let mut gathering = self
            .gatherings
            .get_mut(&gathering_id)
            .ok_or_else(|| EngineError::not_found("gathering", gathering_id))?;
        if gathering.finalized {
            return Err(EngineError::Validation(format!(
                "gathering {gathering_id} is already finalized"
            )));
        }

        let expected: Vec<Uuid> = self
            .members
            .iter()
            .filter(|m| m.active && m.enrolled_at.date_naive() <= gathering.held_on())
            .map(|m| m.id)
            .collect();

        let mut marked_absent = Vec::new();
        for member_id in expected {
            if let Entry::Vacant(slot) = self.events.entry((member_id, gathering_id)) {
                slot.insert(AttendanceEvent {
                    member_id,
                    gathering_id,
                    starts_at: gathering.starts_at,
                    outcome: Outcome::Absent,
                    recorded_at: at,
                });
                marked_absent.push(member_id);
            }
        }
        gathering.finalized = true;

        let mut attendees: Vec<Uuid> = self
            .events
            .iter()
            .filter(|e| e.gathering_id == gathering_id)
            .map(|e| e.member_id)
            .collect();
        attendees.sort();
        marked_absent.sort();

        Ok(FinalizedGathering {
            gathering_id,
            marked_absent,
            attendees,
        })
    }

    async fn list_events(
        &self,
        member_id: Uuid,
        up_to: Option<DateTime<Utc>>,
    ) -> Result<EventHistory> {
        let events = self
            .events
            .iter()
            .filter(|e| e.member_id == member_id)
            .filter(|e| up_to.map_or(true, |limit| e.starts_at <= limit))
            .map(|e| e.value().clone())
            .collect();
        Ok(EventHistory::new(events))
    }

    async fn standing(&self, member_id: Uuid) -> Result<Option<StandingSnapshot>> {
        Ok(self.standings.get(&member_id).map(|s| *s))
    }

    async fn save_standing(
        &self,
        member_id: Uuid,
        tier: Tier,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        match (self.standings.entry(member_id), expected_version) {
            (Entry::Vacant(slot), None) => {
                slot.insert(StandingSnapshot {
                    member_id,
                    tier,
                    version: 1,
                });
                Ok(1)
            }
            (Entry::Occupied(mut current), Some(expected))
                if current.get().version == expected =>
            {
                let snapshot = current.get_mut();
                snapshot.tier = tier;
                snapshot.version += 1;
                Ok(snapshot.version)
            }
            _ => Err(EngineError::Conflict(member_id)),
        }
    }

    async fn insert_escalation(&self, record: EscalationRecord) -> Result<bool> {
        let mut history = self.escalations.entry(record.member_id).or_default();
        if history.iter().any(EscalationRecord::is_open) {
            return Ok(false);
        }
        history.push(record);
        Ok(true)
    }

    async fn open_escalation(&self, member_id: Uuid) -> Result<Option<EscalationRecord>> {
        Ok(self
            .escalations
            .get(&member_id)
            .and_then(|h| h.iter().find(|r| r.is_open()).cloned()))
    }

    async fn latest_escalation(&self, member_id: Uuid) -> Result<Option<EscalationRecord>> {
        Ok(self
            .escalations
            .get(&member_id)
            .and_then(|h| h.last().cloned()))
    }

    async fn close_escalation(
        &self,
        member_id: Uuid,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Result<Option<EscalationRecord>> {
        let Some(mut history) = self.escalations.get_mut(&member_id) else {
            return Ok(None);
        };
        let Some(record) = history.iter_mut().find(|r| r.is_open()) else {
            return Ok(None);
        };
        record.closed_at = Some(at);
        record.close_reason = Some(reason);
        record.acknowledged = reason == CloseReason::Acknowledged;
        Ok(Some(record.clone()))
    }

    async fn mark_notified(&self, escalation_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        for mut history in self.escalations.iter_mut() {
            if let Some(record) = history.iter_mut().find(|r| r.id == escalation_id) {
                record.notified_at.get_or_insert(at);
                return Ok(());
            }
        }
        Err(EngineError::not_found("escalation", escalation_id))
    }

    async fn pending_notifications(&self) -> Result<Vec<EscalationRecord>> {
        let mut pending: Vec<EscalationRecord> = self
            .escalations
            .iter()
            .flat_map(|h| {
                h.iter()
                    .filter(|r| r.is_open() && r.notified_at.is_none())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    fn member(email: &str) -> Member {
        Member {
            id: Uuid::new_v4(),
            full_name: "Jane Member".to_string(),
            email: email.to_string(),
            group_id: None,
            active: true,
            enrolled_at: at(0) - Duration::days(30),
        }
    }

    fn gathering(day: u32) -> Gathering {
        Gathering {
            id: Uuid::new_v4(),
            title: "Sunday Service".to_string(),
            starts_at: Utc.with_ymd_and_hms(2026, 3, day, 10, 0, 0).unwrap(),
            finalized: false,
        }
    }

    fn event(m: &Member, g: &Gathering, outcome: Outcome, recorded_at: DateTime<Utc>) -> RecordAttendance {
        RecordAttendance {
            member_id: m.id,
            gathering_id: g.id,
            outcome,
            recorded_at,
        }
    }

    #[tokio::test]
    async fn later_event_supersedes_earlier_one() {
        let store = InMemoryStore::new();
        let m = member("jane@church.com");
        let g = gathering(1);
        store.add_member(m.clone()).await.unwrap();
        store.add_gathering(g.clone()).await.unwrap();

        store.record_event(event(&m, &g, Outcome::Absent, at(9))).await.unwrap();
        store.record_event(event(&m, &g, Outcome::Present, at(10))).await.unwrap();
        // stale write loses
        store.record_event(event(&m, &g, Outcome::Excused, at(8))).await.unwrap();

        let history = store.list_events(m.id, None).await.unwrap();
        assert_eq!(history.iter().count(), 1);
        assert_eq!(history.iter().next().unwrap().outcome, Outcome::Present);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_the_later_call() {
        let store = InMemoryStore::new();
        let m = member("jane@church.com");
        let g = gathering(1);
        store.add_member(m.clone()).await.unwrap();
        store.add_gathering(g.clone()).await.unwrap();

        store.record_event(event(&m, &g, Outcome::Absent, at(9))).await.unwrap();
        store.record_event(event(&m, &g, Outcome::Excused, at(9))).await.unwrap();

        let history = store.list_events(m.id, None).await.unwrap();
        assert_eq!(history.iter().next().unwrap().outcome, Outcome::Excused);
    }

    #[tokio::test]
    async fn finalized_gathering_rejects_events() {
        let store = InMemoryStore::new();
        let m = member("jane@church.com");
        let g = gathering(1);
        store.add_member(m.clone()).await.unwrap();
        store.add_gathering(g.clone()).await.unwrap();
        store.finalize_gathering(g.id, at(12)).await.unwrap();

        let err = store
            .record_event(event(&m, &g, Outcome::Present, at(13)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = store.finalize_gathering(g.id, at(14)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_member_or_gathering_is_not_found() {
        let store = InMemoryStore::new();
        let m = member("jane@church.com");
        let g = gathering(1);
        store.add_gathering(g.clone()).await.unwrap();

        let err = store
            .record_event(event(&m, &g, Outcome::Present, at(9)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "member", .. }));

        store.add_member(m.clone()).await.unwrap();
        let other = gathering(2);
        let err = store
            .record_event(event(&m, &other, Outcome::Present, at(9)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "gathering", .. }));
    }

    #[tokio::test]
    async fn finalize_marks_missing_active_members_absent() {
        let store = InMemoryStore::new();
        let present = member("present@church.com");
        let missing = member("missing@church.com");
        let mut inactive = member("inactive@church.com");
        inactive.active = false;
        let mut late = member("late@church.com");
        late.enrolled_at = at(0) + Duration::days(60);
        for m in [&present, &missing, &inactive, &late] {
            store.add_member(m.clone()).await.unwrap();
        }
        let g = gathering(1);
        store.add_gathering(g.clone()).await.unwrap();
        store
            .record_event(event(&present, &g, Outcome::Present, at(9)))
            .await
            .unwrap();

        let report = store.finalize_gathering(g.id, at(12)).await.unwrap();
        assert_eq!(report.marked_absent, vec![missing.id]);
        assert_eq!(report.attendees.len(), 2);
        assert!(store.gathering_on(&g.title, g.starts_at).await.unwrap().unwrap().finalized);

        let history = store.list_events(missing.id, None).await.unwrap();
        let absent = history.iter().next().unwrap();
        assert_eq!(absent.outcome, Outcome::Absent);
        assert_eq!(absent.starts_at, g.starts_at);
        assert_eq!(store.list_events(inactive.id, None).await.unwrap().iter().count(), 0);
    }

    #[tokio::test]
    async fn list_events_honours_upper_date_bound() {
        let store = InMemoryStore::new();
        let m = member("jane@church.com");
        store.add_member(m.clone()).await.unwrap();
        for day in [1, 8, 15] {
            let g = gathering(day);
            store.add_gathering(g.clone()).await.unwrap();
            store.record_event(event(&m, &g, Outcome::Absent, at(9))).await.unwrap();
        }
        let bounded = store
            .list_events(m.id, Some(Utc.with_ymd_and_hms(2026, 3, 8, 10, 0, 0).unwrap()))
            .await
            .unwrap();
        assert_eq!(bounded.iter().count(), 2);
    }

    #[tokio::test]
    async fn re_adding_a_finalized_gathering_keeps_it_closed() {
        let store = InMemoryStore::new();
        let m = member("jane@church.com");
        let g = gathering(1);
        store.add_member(m.clone()).await.unwrap();
        store.add_gathering(g.clone()).await.unwrap();
        store.finalize_gathering(g.id, at(12)).await.unwrap();

        store.add_gathering(g.clone()).await.unwrap();
        // same slot under a fresh id resolves to the stored row
        store
            .add_gathering(Gathering { id: Uuid::new_v4(), ..g.clone() })
            .await
            .unwrap();

        let stored = store.gathering_on(&g.title, g.starts_at).await.unwrap().unwrap();
        assert_eq!(stored.id, g.id);
        assert!(stored.finalized);
        let err = store
            .record_event(event(&m, &g, Outcome::Present, at(13)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn re_adding_a_member_keeps_group_and_active_flag() {
        let store = InMemoryStore::new();
        let group = Caregroup {
            id: Uuid::new_v4(),
            name: "North".to_string(),
            leader_id: None,
        };
        store.add_caregroup(group.clone()).await.unwrap();
        let m = member("jane@church.com");
        store.add_member(m.clone()).await.unwrap();
        store.assign_group(m.id, Some(group.id)).await.unwrap();
        store.deactivate_member(m.id).await.unwrap();

        store
            .add_member(Member {
                full_name: "Jane Doe".to_string(),
                ..m.clone()
            })
            .await
            .unwrap();

        let stored = store.member(m.id).await.unwrap().unwrap();
        assert_eq!(stored.full_name, "Jane Doe");
        assert_eq!(stored.group_id, Some(group.id));
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn member_with_unknown_group_is_rejected() {
        let store = InMemoryStore::new();
        let mut m = member("jane@church.com");
        m.group_id = Some(Uuid::new_v4());
        let err = store.add_member(m.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "caregroup", .. }));
        assert!(store.member(m.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn standing_versions_detect_stale_writers() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.save_standing(id, Tier::Warning, None).await.unwrap(), 1);
        assert!(matches!(
            store.save_standing(id, Tier::FollowUp, None).await,
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            store.save_standing(id, Tier::FollowUp, Some(7)).await,
            Err(EngineError::Conflict(_))
        ));
        assert_eq!(store.save_standing(id, Tier::FollowUp, Some(1)).await.unwrap(), 2);
        assert_eq!(store.standing(id).await.unwrap().unwrap().tier, Tier::FollowUp);
    }

    #[tokio::test]
    async fn only_one_escalation_may_be_open() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        assert!(store
            .insert_escalation(EscalationRecord::open(id, None, 3, at(9)))
            .await
            .unwrap());
        assert!(!store
            .insert_escalation(EscalationRecord::open(id, None, 4, at(10)))
            .await
            .unwrap());

        let closed = store
            .close_escalation(id, CloseReason::Acknowledged, at(11))
            .await
            .unwrap()
            .unwrap();
        assert!(closed.acknowledged);
        assert!(store.open_escalation(id).await.unwrap().is_none());
        assert!(store
            .close_escalation(id, CloseReason::Resolved, at(12))
            .await
            .unwrap()
            .is_none());

        assert!(store
            .insert_escalation(EscalationRecord::open(id, None, 3, at(13)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn notified_escalations_leave_the_pending_queue() {
        let store = InMemoryStore::new();
        let record = EscalationRecord::open(Uuid::new_v4(), None, 3, at(9));
        store.insert_escalation(record.clone()).await.unwrap();
        assert_eq!(store.pending_notifications().await.unwrap().len(), 1);

        store.mark_notified(record.id, at(10)).await.unwrap();
        assert!(store.pending_notifications().await.unwrap().is_empty());
        assert!(store.mark_notified(Uuid::new_v4(), at(10)).await.is_err());
    }
}
