use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::standing::{StatusColor, Tier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub group_id: Option<Uuid>,
    pub active: bool,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caregroup {
    pub id: Uuid,
    pub name: String,
    pub leader_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gathering {
    pub id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub finalized: bool,
}

impl Gathering {
    pub fn held_on(&self) -> NaiveDate {
        self.starts_at.date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Present,
    Absent,
    Excused,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Present => "PRESENT",
            Outcome::Absent => "ABSENT",
            Outcome::Excused => "EXCUSED",
        }
    }
}

impl FromStr for Outcome {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PRESENT" => Ok(Outcome::Present),
            "ABSENT" => Ok(Outcome::Absent),
            "EXCUSED" => Ok(Outcome::Excused),
            other => Err(EngineError::Validation(format!(
                "unknown attendance outcome '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check-in command for one member at one gathering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAttendance {
    pub member_id: Uuid,
    pub gathering_id: Uuid,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
}

/// One member's outcome at one gathering. `starts_at` is carried from the
/// gathering so histories can be ordered without a second lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEvent {
    pub member_id: Uuid,
    pub gathering_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Acknowledged,
    Resolved,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Acknowledged => "acknowledged",
            CloseReason::Resolved => "resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "acknowledged" => Some(CloseReason::Acknowledged),
            "resolved" => Some(CloseReason::Resolved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationRecord {
    pub id: Uuid,
    pub member_id: Uuid,
    pub leader_id: Option<Uuid>,
    pub trigger_streak: u32,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub notified_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn open(
        member_id: Uuid,
        leader_id: Option<Uuid>,
        trigger_streak: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            member_id,
            leader_id,
            trigger_streak,
            created_at,
            acknowledged: false,
            closed_at: None,
            close_reason: None,
            notified_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Last tier the escalation engine evaluated for a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandingSnapshot {
    pub member_id: Uuid,
    pub tier: Tier,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedGathering {
    pub gathering_id: Uuid,
    pub marked_absent: Vec<Uuid>,
    pub attendees: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderContact {
    pub name: String,
    pub caregroup_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub status_level: u8,
    pub absences: u32,
    pub attendance_status: String,
    pub follow_up_status: Option<String>,
    pub last_attendance_date: Option<DateTime<Utc>>,
    pub notification_message: String,
    pub status_color: StatusColor,
    pub progress_percentage: u8,
    pub caregroup_leader: Option<LeaderContact>,
}

#[derive(Debug, Clone)]
pub struct MemberStanding {
    pub member: Member,
    pub summary: StatusSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub caregroup_name: String,
    pub total_members: usize,
    pub active_members: usize,
    pub warning_members: usize,
    pub to_follow_up_members: usize,
}
