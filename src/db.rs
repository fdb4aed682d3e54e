use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    AttendanceEvent, Caregroup, CloseReason, EscalationRecord, FinalizedGathering, Gathering,
    Member, RecordAttendance, StandingSnapshot,
};
use crate::standing::Tier;
use crate::store::{AttendanceStore, EventHistory};

const MEMBER_COLUMNS: &str = "id, full_name, email, group_id, active, enrolled_at";
const GATHERING_COLUMNS: &str = "id, title, starts_at, finalized";
const ESCALATION_COLUMNS: &str = "id, member_id, leader_id, trigger_streak, created_at, \
     acknowledged, closed_at, close_reason, notified_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn member_from_row(row: &PgRow) -> Member {
    Member {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        group_id: row.get("group_id"),
        active: row.get("active"),
        enrolled_at: row.get("enrolled_at"),
    }
}

fn caregroup_from_row(row: &PgRow) -> Caregroup {
    Caregroup {
        id: row.get("id"),
        name: row.get("name"),
        leader_id: row.get("leader_id"),
    }
}

fn gathering_from_row(row: &PgRow) -> Gathering {
    Gathering {
        id: row.get("id"),
        title: row.get("title"),
        starts_at: row.get("starts_at"),
        finalized: row.get("finalized"),
    }
}

fn event_from_row(row: &PgRow) -> Result<AttendanceEvent> {
    let outcome: String = row.get("outcome");
    Ok(AttendanceEvent {
        member_id: row.get("member_id"),
        gathering_id: row.get("gathering_id"),
        starts_at: row.get("starts_at"),
        outcome: outcome.parse()?,
        recorded_at: row.get("recorded_at"),
    })
}

fn escalation_from_row(row: &PgRow) -> Result<EscalationRecord> {
    let trigger_streak: i32 = row.get("trigger_streak");
    let close_reason: Option<String> = row.get("close_reason");
    let close_reason = match close_reason {
        Some(value) => Some(CloseReason::parse(&value).ok_or_else(|| {
            EngineError::Storage(format!("unknown close reason '{value}'"))
        })?),
        None => None,
    };
    Ok(EscalationRecord {
        id: row.get("id"),
        member_id: row.get("member_id"),
        leader_id: row.get("leader_id"),
        trigger_streak: u32::try_from(trigger_streak).unwrap_or_default(),
        created_at: row.get("created_at"),
        acknowledged: row.get("acknowledged"),
        closed_at: row.get("closed_at"),
        close_reason,
        notified_at: row.get("notified_at"),
    })
}

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23503")
}

#[async_trait]
impl AttendanceStore for PgStore {
    async fn add_caregroup(&self, group: Caregroup) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO caregroup_attendance.caregroups (id, name, leader_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, leader_id = EXCLUDED.leader_id
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(group.leader_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn caregroup(&self, group_id: Uuid) -> Result<Option<Caregroup>> {
        let row = sqlx::query(
            "SELECT id, name, leader_id FROM caregroup_attendance.caregroups WHERE id = $1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(caregroup_from_row))
    }

    async fn add_member(&self, member: Member) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO caregroup_attendance.members
            (id, full_name, email, group_id, active, enrolled_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name, email = EXCLUDED.email
            "#,
        )
        .bind(member.id)
        .bind(&member.full_name)
        .bind(&member.email)
        .bind(member.group_id)
        .bind(member.active)
        .bind(member.enrolled_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(EngineError::Validation(format!(
                "email {} is already enrolled",
                member.email
            ))),
            Err(err) if is_foreign_key_violation(&err) => Err(EngineError::not_found(
                "caregroup",
                member.group_id.unwrap_or_default(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    async fn member(&self, member_id: Uuid) -> Result<Option<Member>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM caregroup_attendance.members WHERE id = $1"
        ))
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(member_from_row))
    }

    async fn member_by_email(&self, email: &str) -> Result<Option<Member>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM caregroup_attendance.members WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(member_from_row))
    }

    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Member>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM caregroup_attendance.members \
             WHERE group_id = $1 ORDER BY full_name"
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(member_from_row).collect())
    }

    async fn assign_group(&self, member_id: Uuid, group_id: Option<Uuid>) -> Result<()> {
        if let Some(group_id) = group_id {
            if self.caregroup(group_id).await?.is_none() {
                return Err(EngineError::not_found("caregroup", group_id));
            }
        }
        let result = sqlx::query(
            "UPDATE caregroup_attendance.members SET group_id = $2 WHERE id = $1",
        )
        .bind(member_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("member", member_id));
        }
        Ok(())
    }

    async fn deactivate_member(&self, member_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE caregroup_attendance.members SET active = FALSE WHERE id = $1",
        )
        .bind(member_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("member", member_id));
        }
        Ok(())
    }

    async fn add_gathering(&self, gathering: Gathering) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO caregroup_attendance.gatherings (id, title, starts_at, finalized)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(gathering.id)
        .bind(&gathering.title)
        .bind(gathering.starts_at)
        .bind(gathering.finalized)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn gathering_on(
        &self,
        title: &str,
        starts_at: DateTime<Utc>,
    ) -> Result<Option<Gathering>> {
        let row = sqlx::query(&format!(
            "SELECT {GATHERING_COLUMNS} FROM caregroup_attendance.gatherings \
             WHERE title = $1 AND starts_at = $2"
        ))
        .bind(title)
        .bind(starts_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(gathering_from_row))
    }

    async fn record_event(&self, event: RecordAttendance) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let member = sqlx::query("SELECT 1 FROM caregroup_attendance.members WHERE id = $1")
            .bind(event.member_id)
            .fetch_optional(&mut *tx)
            .await?;
        if member.is_none() {
            return Err(EngineError::not_found("member", event.member_id));
        }

        // FOR SHARE blocks a concurrent finalize until this write commits.
        let finalized: Option<bool> = sqlx::query(
            "SELECT finalized FROM caregroup_attendance.gatherings WHERE id = $1 FOR SHARE",
        )
        .bind(event.gathering_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("finalized"));
        match finalized {
            None => return Err(EngineError::not_found("gathering", event.gathering_id)),
            Some(true) => {
                return Err(EngineError::Validation(format!(
                    "gathering {} is finalized",
                    event.gathering_id
                )))
            }
            Some(false) => {}
        }

        sqlx::query(
            r#"
            INSERT INTO caregroup_attendance.attendance_events
            (member_id, gathering_id, outcome, recorded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (member_id, gathering_id) DO UPDATE
            SET outcome = EXCLUDED.outcome, recorded_at = EXCLUDED.recorded_at
            WHERE caregroup_attendance.attendance_events.recorded_at <= EXCLUDED.recorded_at
            "#,
        )
        .bind(event.member_id)
        .bind(event.gathering_id)
        .bind(event.outcome.as_str())
        .bind(event.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finalize_gathering(
        &self,
        gathering_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<FinalizedGathering> {
        let mut tx = self.pool.begin().await?;

        let finalized: Option<bool> = sqlx::query(
            "SELECT finalized FROM caregroup_attendance.gatherings WHERE id = $1 FOR UPDATE",
        )
        .bind(gathering_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get("finalized"));
        match finalized {
            None => return Err(EngineError::not_found("gathering", gathering_id)),
            Some(true) => {
                return Err(EngineError::Validation(format!(
                    "gathering {gathering_id} is already finalized"
                )))
            }
            Some(false) => {}
        }

        let mut marked_absent: Vec<Uuid> = sqlx::query(
            r#"
            INSERT INTO caregroup_attendance.attendance_events
            (member_id, gathering_id, outcome, recorded_at)
            SELECT m.id, g.id, 'ABSENT', $2
            FROM caregroup_attendance.members m
            JOIN caregroup_attendance.gatherings g ON g.id = $1
            WHERE m.active
              AND (m.enrolled_at AT TIME ZONE 'UTC')::date <= (g.starts_at AT TIME ZONE 'UTC')::date
            ON CONFLICT (member_id, gathering_id) DO NOTHING
            RETURNING member_id
            "#,
        )
        .bind(gathering_id)
        .bind(at)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get("member_id"))
        .collect();
        marked_absent.sort();

        sqlx::query(
            "UPDATE caregroup_attendance.gatherings SET finalized = TRUE, finalized_at = $2 WHERE id = $1",
        )
        .bind(gathering_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;

        let attendees: Vec<Uuid> = sqlx::query(
            "SELECT member_id FROM caregroup_attendance.attendance_events \
             WHERE gathering_id = $1 ORDER BY member_id",
        )
        .bind(gathering_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get("member_id"))
        .collect();

        tx.commit().await?;
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
        let rows = sqlx::query(
            r#"
            SELECT e.member_id, e.gathering_id, g.starts_at, e.outcome, e.recorded_at
            FROM caregroup_attendance.attendance_events e
            JOIN caregroup_attendance.gatherings g ON g.id = e.gathering_id
            WHERE e.member_id = $1 AND ($2::timestamptz IS NULL OR g.starts_at <= $2)
            ORDER BY g.starts_at, g.id
            "#,
        )
        .bind(member_id)
        .bind(up_to)
        .fetch_all(&self.pool)
        .await?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(EventHistory::new(events))
    }

    async fn standing(&self, member_id: Uuid) -> Result<Option<StandingSnapshot>> {
        let row = sqlx::query(
            "SELECT tier, version FROM caregroup_attendance.standings WHERE member_id = $1",
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let level: i16 = row.get("tier");
        let tier = Tier::from_level(level)
            .ok_or_else(|| EngineError::Storage(format!("unknown tier level {level}")))?;
        Ok(Some(StandingSnapshot {
            member_id,
            tier,
            version: row.get("version"),
        }))
    }

    async fn save_standing(
        &self,
        member_id: Uuid,
        tier: Tier,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        let level = tier.level() as i16;
        let row = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO caregroup_attendance.standings (member_id, tier, version)
                    VALUES ($1, $2, 1)
                    ON CONFLICT (member_id) DO NOTHING
                    RETURNING version
                    "#,
                )
                .bind(member_id)
                .bind(level)
                .fetch_optional(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE caregroup_attendance.standings
                    SET tier = $2, version = version + 1, updated_at = now()
                    WHERE member_id = $1 AND version = $3
                    RETURNING version
                    "#,
                )
                .bind(member_id)
                .bind(level)
                .bind(expected)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(|row| row.get("version"))
            .ok_or(EngineError::Conflict(member_id))
    }

    async fn insert_escalation(&self, record: EscalationRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO caregroup_attendance.escalations
            (id, member_id, leader_id, trigger_streak, created_at, acknowledged)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            ON CONFLICT (member_id) WHERE closed_at IS NULL DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.member_id)
        .bind(record.leader_id)
        .bind(i32::try_from(record.trigger_streak).unwrap_or(i32::MAX))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn open_escalation(&self, member_id: Uuid) -> Result<Option<EscalationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM caregroup_attendance.escalations \
             WHERE member_id = $1 AND closed_at IS NULL"
        ))
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(escalation_from_row).transpose()
    }

    async fn latest_escalation(&self, member_id: Uuid) -> Result<Option<EscalationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM caregroup_attendance.escalations \
             WHERE member_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(escalation_from_row).transpose()
    }

    async fn close_escalation(
        &self,
        member_id: Uuid,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Result<Option<EscalationRecord>> {
        let row = sqlx::query(&format!(
            "UPDATE caregroup_attendance.escalations \
             SET closed_at = $2, close_reason = $3, acknowledged = $4 \
             WHERE member_id = $1 AND closed_at IS NULL \
             RETURNING {ESCALATION_COLUMNS}"
        ))
        .bind(member_id)
        .bind(at)
        .bind(reason.as_str())
        .bind(reason == CloseReason::Acknowledged)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(escalation_from_row).transpose()
    }

    async fn mark_notified(&self, escalation_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE caregroup_attendance.escalations \
             SET notified_at = COALESCE(notified_at, $2) WHERE id = $1",
        )
        .bind(escalation_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("escalation", escalation_id));
        }
        Ok(())
    }

    async fn pending_notifications(&self) -> Result<Vec<EscalationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM caregroup_attendance.escalations \
             WHERE closed_at IS NULL AND notified_at IS NULL ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(escalation_from_row).collect()
    }
}
