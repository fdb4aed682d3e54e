use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Caregroup, Gathering, Member, Outcome, RecordAttendance};
use crate::status::StatusService;
use crate::store::AttendanceStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub recorded: usize,
    pub skipped: usize,
}

/// Create a caregroup. The leader must already be enrolled; they are moved
/// into the new group.
pub async fn create_caregroup(
    store: &dyn AttendanceStore,
    name: String,
    leader_id: Option<Uuid>,
) -> anyhow::Result<Caregroup> {
    if let Some(leader_id) = leader_id {
        store
            .member(leader_id)
            .await?
            .ok_or_else(|| EngineError::not_found("member", leader_id))?;
    }
    let group = Caregroup {
        id: Uuid::new_v4(),
        name,
        leader_id,
    };
    store.add_caregroup(group.clone()).await?;
    if let Some(leader_id) = leader_id {
        store.assign_group(leader_id, Some(group.id)).await?;
    }
    Ok(group)
}

/// Enroll a member, directly into `group_id` when given.
pub async fn enroll(
    store: &dyn AttendanceStore,
    full_name: String,
    email: String,
    group_id: Option<Uuid>,
) -> anyhow::Result<Member> {
    if let Some(group_id) = group_id {
        store
            .caregroup(group_id)
            .await?
            .ok_or_else(|| EngineError::not_found("caregroup", group_id))?;
    }
    let member = Member {
        id: Uuid::new_v4(),
        full_name,
        email,
        group_id,
        active: true,
        enrolled_at: Utc::now(),
    };
    store.add_member(member.clone()).await?;
    Ok(member)
}

pub async fn seed(service: &StatusService) -> anyhow::Result<Uuid> {
    let store = service.store();
    let enrolled_at = Utc
        .with_ymd_and_hms(2025, 9, 7, 9, 0, 0)
        .single()
        .context("invalid enrollment timestamp")?;

    let leader = Member {
        id: Uuid::parse_str("6a1f0c3e-4b7d-4f2a-9c1e-2d8b5e7f9a10")?,
        full_name: "John Leader".to_string(),
        email: "leader@church.com".to_string(),
        group_id: None,
        active: true,
        enrolled_at,
    };
    store.add_member(leader.clone()).await?;

    let group = Caregroup {
        id: Uuid::parse_str("c0a8e2b4-1d3f-4e5a-8b7c-9d0e1f2a3b4c")?,
        name: "Alpha Caregroup".to_string(),
        leader_id: Some(leader.id),
    };
    store.add_caregroup(group.clone()).await?;
    store.assign_group(leader.id, Some(group.id)).await?;

    let members = vec![
        (
            Uuid::parse_str("3b9d6f2a-8c4e-4d1b-a7f3-5e2c9b8d1a06")?,
            "Jane Member",
            "user@church.com",
        ),
        (
            Uuid::parse_str("9e4c2a7b-5d1f-4b3e-8a6c-0f7d2e9b4c15")?,
            "Robert Johnson",
            "robert@example.com",
        ),
        (
            Uuid::parse_str("d2f7a9c1-3e6b-4a8d-b5c4-7e1f0a2d6b38")?,
            "Sarah Williams",
            "teamlead1@example.com",
        ),
    ];
    for (id, name, email) in &members {
        store
            .add_member(Member {
                id: *id,
                full_name: name.to_string(),
                email: email.to_string(),
                group_id: Some(group.id),
                active: true,
                enrolled_at,
            })
            .await?;
    }

    let gatherings = [
        ("8f1e2d3c-4b5a-4697-8a8b-9c0d1e2f3a41", 4),
        ("8f1e2d3c-4b5a-4697-8a8b-9c0d1e2f3a42", 11),
        ("8f1e2d3c-4b5a-4697-8a8b-9c0d1e2f3a43", 18),
        ("8f1e2d3c-4b5a-4697-8a8b-9c0d1e2f3a44", 25),
    ];
    use Outcome::*;
    let attendance = [
        // John, Jane, Robert, Sarah
        [Present, Present, Present, Present],
        [Present, Present, Absent, Present],
        [Present, Excused, Absent, Present],
        [Present, Present, Absent, Absent],
    ];

    let roster = std::iter::once(leader.id)
        .chain(members.iter().map(|(id, _, _)| *id))
        .collect::<Vec<_>>();
    for ((gathering_id, day), outcomes) in gatherings.iter().zip(attendance.iter()) {
        let starts_at = Utc
            .with_ymd_and_hms(2026, 1, *day, 10, 0, 0)
            .single()
            .context("invalid gathering start")?;
        let gathering = Gathering {
            id: Uuid::parse_str(gathering_id)?,
            title: "Sunday Service".to_string(),
            starts_at,
            finalized: false,
        };
        store.add_gathering(gathering.clone()).await?;
        let recorded_at = starts_at + Duration::minutes(90);

        for (member_id, outcome) in roster.iter().zip(outcomes.iter()) {
            service
                .record_attendance(RecordAttendance {
                    member_id: *member_id,
                    gathering_id: gathering.id,
                    outcome: *outcome,
                    recorded_at,
                })
                .await?;
        }
    }

    Ok(group.id)
}

#[derive(serde::Deserialize)]
struct CsvRow {
    email: String,
    gathering: String,
    starts_at: DateTime<Utc>,
    outcome: String,
    recorded_at: Option<DateTime<Utc>>,
}

/// Import check-in exports. Gatherings are created on first sight; rows for
/// unknown members, finalized gatherings or bad outcomes are skipped.
pub async fn import_csv(service: &StatusService, csv_path: &Path) -> anyhow::Result<ImportSummary> {
    let store = service.store();
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut summary = ImportSummary::default();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed row {}", line + 1))?;

        let Some(member) = store.member_by_email(&row.email).await? else {
            warn!(row = line + 1, email = %row.email, "skipping row for unknown member");
            summary.skipped += 1;
            continue;
        };

        let gathering = match store.gathering_on(&row.gathering, row.starts_at).await? {
            Some(gathering) => gathering,
            None => {
                store
                    .add_gathering(Gathering {
                        id: Uuid::new_v4(),
                        title: row.gathering.clone(),
                        starts_at: row.starts_at,
                        finalized: false,
                    })
                    .await?;
                store
                    .gathering_on(&row.gathering, row.starts_at)
                    .await?
                    .context("gathering vanished after insert")?
            }
        };

        let outcome = match row.outcome.parse::<Outcome>() {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(row = line + 1, error = %err, "skipping row");
                summary.skipped += 1;
                continue;
            }
        };

        let command = RecordAttendance {
            member_id: member.id,
            gathering_id: gathering.id,
            outcome,
            recorded_at: row.recorded_at.unwrap_or_else(Utc::now),
        };
        match service.record_attendance(command).await {
            Ok(_) => summary.recorded += 1,
            Err(err @ (EngineError::Validation(_) | EngineError::NotFound { .. })) => {
                warn!(row = line + 1, error = %err, "skipping row");
                summary.skipped += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Ok(summary)
}
