use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineSettings;
use crate::error::{EngineError, Result};
use crate::escalation::{Dispatcher, EscalationNotifier, Evaluation, Transition};
use crate::models::{
    EscalationRecord, GroupStats, LeaderContact, Member, MemberStanding, RecordAttendance,
    StatusSummary,
};
use crate::standing::{classify, progress, Tier};
use crate::store::{bounded, AttendanceStore};
use crate::streak::StreakTracker;

/// Caller identity for status queries, supplied by the authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub member_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub gathering_id: Uuid,
    pub marked_absent: usize,
    pub escalated: usize,
    pub resolved: usize,
    /// Members whose re-evaluation failed; their events are stored and the
    /// next evaluation picks them up.
    pub failed: Vec<Uuid>,
}

pub struct StatusService {
    store: Arc<dyn AttendanceStore>,
    tracker: StreakTracker,
    notifier: EscalationNotifier,
    settings: EngineSettings,
}

impl StatusService {
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        dispatcher: Arc<dyn Dispatcher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            tracker: StreakTracker::new(Arc::clone(&store), settings.store_timeout),
            notifier: EscalationNotifier::new(
                Arc::clone(&store),
                dispatcher,
                settings.boundaries,
                settings.store_timeout,
            ),
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn AttendanceStore> {
        &self.store
    }

    pub fn notifier(&self) -> &EscalationNotifier {
        &self.notifier
    }

    /// Record one outcome and re-evaluate the member's escalation state.
    #[instrument(skip(self, command), fields(member_id = %command.member_id, gathering_id = %command.gathering_id, outcome = %command.outcome))]
    pub async fn record_attendance(&self, command: RecordAttendance) -> Result<Evaluation> {
        let member_id = command.member_id;
        bounded(
            self.settings.store_timeout,
            "record attendance",
            self.store.record_event(command),
        )
        .await?;

        self.notifier.evaluate(member_id).await
    }

    /// Close a gathering, fill in absences, and re-evaluate everyone on it.
    /// One member's failed evaluation does not stop the others.
    #[instrument(skip(self))]
    pub async fn finalize_gathering(&self, gathering_id: Uuid) -> Result<FinalizeOutcome> {
        let finalized = bounded(
            self.settings.store_timeout,
            "finalize gathering",
            self.store.finalize_gathering(gathering_id, Utc::now()),
        )
        .await?;

        let mut escalated = 0;
        let mut resolved = 0;
        let mut failed = Vec::new();
        for member_id in &finalized.attendees {
            match self.notifier.evaluate(*member_id).await {
                Ok(evaluation) => match evaluation.transition {
                    Transition::Opened(_) => escalated += 1,
                    Transition::Closed(_) => resolved += 1,
                    _ => {}
                },
                Err(err) => {
                    warn!(member_id = %member_id, error = %err, "re-evaluation after finalize failed");
                    failed.push(*member_id);
                }
            }
        }
        info!(
            marked_absent = finalized.marked_absent.len(),
            escalated,
            resolved,
            failed = failed.len(),
            "gathering finalized"
        );

        Ok(FinalizeOutcome {
            gathering_id,
            marked_absent: finalized.marked_absent.len(),
            escalated,
            resolved,
            failed,
        })
    }

    /// Current standing for the member in `ctx`, read fresh from the store.
    pub async fn get_status(&self, ctx: &RequestContext) -> Result<StatusSummary> {
        let member = bounded(
            self.settings.store_timeout,
            "load member",
            self.store.member(ctx.member_id),
        )
        .await?
        .ok_or_else(|| EngineError::not_found("member", ctx.member_id))?;
        self.summarize(&member).await
    }

    pub async fn acknowledge(&self, ctx: &RequestContext) -> Result<Option<EscalationRecord>> {
        self.notifier.acknowledge(ctx.member_id).await
    }

    /// Standings for every active member of a caregroup, with roll-up counts.
    pub async fn group_overview(&self, group_id: Uuid) -> Result<(GroupStats, Vec<MemberStanding>)> {
        let timeout = self.settings.store_timeout;
        let group = bounded(timeout, "load caregroup", self.store.caregroup(group_id))
            .await?
            .ok_or_else(|| EngineError::not_found("caregroup", group_id))?;
        let members = bounded(timeout, "load caregroup members", self.store.group_members(group_id))
            .await?;

        let mut standings = Vec::new();
        for member in members.into_iter().filter(|m| m.active) {
            let summary = self.summarize(&member).await?;
            standings.push(MemberStanding { member, summary });
        }

        let stats = crate::report::group_stats(&group.name, &standings);
        Ok((stats, standings))
    }

    async fn summarize(&self, member: &Member) -> Result<StatusSummary> {
        let timeout = self.settings.store_timeout;
        let streak = self.tracker.current(member.id).await?;
        let classification = classify(streak.absences, &self.settings.boundaries);
        let tier = classification.tier;

        let open = bounded(timeout, "load open escalation", self.store.open_escalation(member.id))
            .await?;
        let follow_up_status = match open {
            Some(_) => Some("PENDING".to_string()),
            None if tier == Tier::FollowUp => bounded(
                timeout,
                "load latest escalation",
                self.store.latest_escalation(member.id),
            )
            .await?
            .filter(|r| r.acknowledged)
            .map(|_| "ACKNOWLEDGED".to_string()),
            None => None,
        };

        let caregroup_leader = if tier == Tier::FollowUp {
            self.leader_contact(member).await?
        } else {
            None
        };

        Ok(StatusSummary {
            status_level: tier.level(),
            absences: streak.absences,
            attendance_status: tier.attendance_status().to_string(),
            follow_up_status,
            last_attendance_date: streak.last_attended_at,
            notification_message: classification.message,
            status_color: classification.color,
            progress_percentage: progress(
                streak.absences,
                &self.settings.boundaries,
                self.settings.progress,
            ),
            caregroup_leader,
        })
    }

    async fn leader_contact(&self, member: &Member) -> Result<Option<LeaderContact>> {
        let timeout = self.settings.store_timeout;
        let Some(group_id) = member.group_id else {
            return Ok(None);
        };
        let Some(group) = bounded(timeout, "load caregroup", self.store.caregroup(group_id)).await?
        else {
            return Ok(None);
        };
        let Some(leader_id) = group.leader_id else {
            return Ok(None);
        };
        let leader = bounded(timeout, "load leader", self.store.member(leader_id)).await?;
        Ok(leader.map(|leader| LeaderContact {
            name: leader.full_name,
            caregroup_name: group.name,
        }))
    }
}
