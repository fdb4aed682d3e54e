use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TierBoundaries;
use crate::error::{DeliveryError, EngineError, Result};
use crate::models::{CloseReason, EscalationRecord, Member};
use crate::standing::{tier_for, Tier};
use crate::store::{bounded, AttendanceStore};
use crate::streak::{Streak, StreakTracker};

/// Message handed to the delivery channel for one escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderNotice {
    pub escalation_id: Uuid,
    pub member_id: Uuid,
    pub member_name: String,
    pub leader_id: Uuid,
    pub leader_name: String,
    pub caregroup_name: Option<String>,
    pub streak: u32,
}

impl LeaderNotice {
    pub fn message(&self) -> String {
        let group = self
            .caregroup_name
            .as_deref()
            .map(|name| format!(" in {name}"))
            .unwrap_or_default();
        format!(
            "{} has missed {} consecutive gatherings{} and needs follow-up.",
            self.member_name, self.streak, group
        )
    }
}

/// Delivery channel for leader notices (email, push, log).
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, notice: &LeaderNotice) -> Result<(), DeliveryError>;
}

/// Writes notices to the tracing log.
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, notice: &LeaderNotice) -> Result<(), DeliveryError> {
        info!(
            escalation_id = %notice.escalation_id,
            leader_id = %notice.leader_id,
            leader = %notice.leader_name,
            "{}",
            notice.message()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Opened(EscalationRecord),
    AlreadyOpen,
    Closed(EscalationRecord),
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub member_id: Uuid,
    pub streak: Streak,
    pub tier: Tier,
    pub transition: Transition,
}

pub struct EscalationNotifier {
    store: Arc<dyn AttendanceStore>,
    dispatcher: Arc<dyn Dispatcher>,
    tracker: StreakTracker,
    boundaries: TierBoundaries,
    timeout: Duration,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl EscalationNotifier {
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        dispatcher: Arc<dyn Dispatcher>,
        boundaries: TierBoundaries,
        timeout: Duration,
    ) -> Self {
        Self {
            tracker: StreakTracker::new(Arc::clone(&store), timeout),
            store,
            dispatcher,
            boundaries,
            timeout,
            locks: DashMap::new(),
        }
    }

    fn member_lock(&self, member_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(member_id).or_default().value())
    }

    /// Recompute the member's streak and apply any escalation edge it implies.
    /// A concurrent writer is tolerated once by re-reading and re-evaluating.
    pub async fn evaluate(&self, member_id: Uuid) -> Result<Evaluation> {
        let lock = self.member_lock(member_id);
        let _guard = lock.lock().await;

        match self.evaluate_locked(member_id).await {
            Err(err) if err.is_retryable() => {
                debug!(member_id = %member_id, "standing changed underneath evaluation, retrying");
                self.evaluate_locked(member_id).await
            }
            other => other,
        }
    }

    async fn evaluate_locked(&self, member_id: Uuid) -> Result<Evaluation> {
        let member = self.load_member(member_id).await?;
        let streak = self.tracker.current(member_id).await?;
        let tier = tier_for(streak.absences, &self.boundaries);

        let previous = bounded(
            self.timeout,
            "load standing",
            self.store.standing(member_id),
        )
        .await?;
        let previous_tier = previous.map(|s| s.tier).unwrap_or(Tier::GoodStanding);

        let transition = if streak.absences == 0 {
            match self.close(member_id, CloseReason::Resolved).await? {
                Some(record) => {
                    info!(member_id = %member_id, escalation_id = %record.id, "escalation resolved by attendance");
                    Transition::Closed(record)
                }
                None => Transition::Unchanged,
            }
        } else if tier == Tier::FollowUp && previous_tier < Tier::FollowUp {
            self.open(&member, &streak).await?
        } else {
            Transition::Unchanged
        };

        if previous.map(|s| s.tier) != Some(tier) {
            bounded(
                self.timeout,
                "save standing",
                self.store
                    .save_standing(member_id, tier, previous.map(|s| s.version)),
            )
            .await?;
        }

        Ok(Evaluation {
            member_id,
            streak,
            tier,
            transition,
        })
    }

    async fn open(&self, member: &Member, streak: &Streak) -> Result<Transition> {
        let leader_id = match member.group_id {
            Some(group_id) => bounded(self.timeout, "load caregroup", self.store.caregroup(group_id))
                .await?
                .and_then(|g| g.leader_id),
            None => None,
        };
        let record = EscalationRecord::open(member.id, leader_id, streak.absences, Utc::now());

        let inserted = bounded(
            self.timeout,
            "insert escalation",
            self.store.insert_escalation(record.clone()),
        )
        .await?;
        if !inserted {
            debug!(member_id = %member.id, "escalation already open");
            return Ok(Transition::AlreadyOpen);
        }

        info!(
            member_id = %member.id,
            escalation_id = %record.id,
            streak = streak.absences,
            "member escalated to follow-up"
        );
        match self.notice_for(&record, member).await {
            Ok(Some(notice)) => self.hand_off(notice),
            Ok(None) => warn!(
                member_id = %member.id,
                escalation_id = %record.id,
                "no caregroup leader to notify; escalation left pending"
            ),
            Err(err) => warn!(
                escalation_id = %record.id,
                error = %err,
                "could not build leader notice; escalation left pending"
            ),
        }
        Ok(Transition::Opened(record))
    }

    async fn close(&self, member_id: Uuid, reason: CloseReason) -> Result<Option<EscalationRecord>> {
        bounded(
            self.timeout,
            "close escalation",
            self.store.close_escalation(member_id, reason, Utc::now()),
        )
        .await
    }

    /// Leader acknowledgment. Returns the closed record, or `None` when
    /// nothing was open.
    pub async fn acknowledge(&self, member_id: Uuid) -> Result<Option<EscalationRecord>> {
        let lock = self.member_lock(member_id);
        let _guard = lock.lock().await;

        self.load_member(member_id).await?;
        let closed = self.close(member_id, CloseReason::Acknowledged).await?;
        if let Some(record) = &closed {
            info!(member_id = %member_id, escalation_id = %record.id, "escalation acknowledged");
        }
        Ok(closed)
    }

    /// Re-send notices for open escalations that were never delivered.
    /// Never creates records. Returns how many were delivered.
    pub async fn redeliver_pending(&self) -> Result<usize> {
        let pending = bounded(
            self.timeout,
            "list pending notifications",
            self.store.pending_notifications(),
        )
        .await?;

        let mut delivered = 0usize;
        for record in pending {
            let member = self.load_member(record.member_id).await?;
            let Some(notice) = self.notice_for(&record, &member).await? else {
                warn!(escalation_id = %record.id, "still no leader to notify");
                continue;
            };
            match self.dispatcher.dispatch(&notice).await {
                Ok(()) => {
                    bounded(
                        self.timeout,
                        "mark notified",
                        self.store.mark_notified(record.id, Utc::now()),
                    )
                    .await?;
                    delivered += 1;
                }
                Err(err) => warn!(escalation_id = %record.id, error = %err, "redelivery failed"),
            }
        }
        Ok(delivered)
    }

    /// The leader recorded on the escalation, or the member's current leader
    /// if none was assigned when it opened.
    async fn notice_for(
        &self,
        record: &EscalationRecord,
        member: &Member,
    ) -> Result<Option<LeaderNotice>> {
        let group = match member.group_id {
            Some(group_id) => {
                bounded(self.timeout, "load caregroup", self.store.caregroup(group_id)).await?
            }
            None => None,
        };
        let Some(leader_id) = record
            .leader_id
            .or_else(|| group.as_ref().and_then(|g| g.leader_id))
        else {
            return Ok(None);
        };
        let Some(leader) =
            bounded(self.timeout, "load leader", self.store.member(leader_id)).await?
        else {
            return Ok(None);
        };

        Ok(Some(LeaderNotice {
            escalation_id: record.id,
            member_id: member.id,
            member_name: member.full_name.clone(),
            leader_id,
            leader_name: leader.full_name,
            caregroup_name: group.map(|g| g.name),
            streak: record.trigger_streak,
        }))
    }

    /// Fire-and-forget: the caller does not wait for delivery.
    fn hand_off(&self, notice: LeaderNotice) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let store = Arc::clone(&self.store);
        let timeout = self.timeout;
        tokio::spawn(async move {
            match dispatcher.dispatch(&notice).await {
                Ok(()) => {
                    let marked = bounded(
                        timeout,
                        "mark notified",
                        store.mark_notified(notice.escalation_id, Utc::now()),
                    )
                    .await;
                    if let Err(err) = marked {
                        warn!(escalation_id = %notice.escalation_id, error = %err, "failed to mark escalation notified");
                    }
                }
                Err(err) => warn!(
                    escalation_id = %notice.escalation_id,
                    error = %err,
                    "leader notification failed; left pending for redelivery"
                ),
            }
        });
    }

    async fn load_member(&self, member_id: Uuid) -> Result<Member> {
        bounded(self.timeout, "load member", self.store.member(member_id))
            .await?
            .ok_or_else(|| EngineError::not_found("member", member_id))
    }
}
