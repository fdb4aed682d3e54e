use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::Outcome;
use crate::store::{bounded, AttendanceStore, EventHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Streak {
    pub absences: u32,
    pub last_attended_at: Option<DateTime<Utc>>,
}

/// Count consecutive absences from the most recent gathering backwards.
/// Excused gatherings are skipped; the first attended one ends the walk.
pub fn compute_streak(history: &EventHistory) -> Streak {
    let mut absences = 0u32;
    for event in history.iter_latest_first() {
        match event.outcome {
            Outcome::Absent => absences += 1,
            Outcome::Excused => continue,
            Outcome::Present => {
                return Streak {
                    absences,
                    last_attended_at: Some(event.recorded_at),
                }
            }
        }
    }
    Streak {
        absences,
        last_attended_at: None,
    }
}

#[derive(Clone)]
pub struct StreakTracker {
    store: Arc<dyn AttendanceStore>,
    timeout: Duration,
}

impl StreakTracker {
    pub fn new(store: Arc<dyn AttendanceStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn current(&self, member_id: Uuid) -> Result<Streak> {
        let history = bounded(
            self.timeout,
            "list attendance events",
            self.store.list_events(member_id, None),
        )
        .await?;
        Ok(compute_streak(&history))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttendanceEvent;
    use chrono::TimeZone;

    fn history(outcomes: &[Outcome]) -> EventHistory {
        let events = outcomes
            .iter()
            .enumerate()
            .map(|(i, outcome)| {
                let starts_at = Utc.with_ymd_and_hms(2026, 1, 4, 10, 0, 0).unwrap()
                    + chrono::Duration::weeks(i as i64);
                AttendanceEvent {
                    member_id: Uuid::nil(),
                    gathering_id: Uuid::new_v4(),
                    starts_at,
                    outcome: *outcome,
                    recorded_at: starts_at,
                }
            })
            .collect();
        EventHistory::new(events)
    }

    #[test]
    fn empty_history_has_no_streak() {
        assert_eq!(compute_streak(&EventHistory::default()), Streak::default());
    }

    #[test]
    fn counts_trailing_absences() {
        use Outcome::*;
        let streak = compute_streak(&history(&[Absent, Absent, Absent]));
        assert_eq!(streak.absences, 3);
        assert_eq!(streak.last_attended_at, None);
    }

    #[test]
    fn present_resets_and_reports_last_attendance() {
        use Outcome::*;
        let h = history(&[Absent, Absent, Absent, Present]);
        let streak = compute_streak(&h);
        assert_eq!(streak.absences, 0);
        assert_eq!(
            streak.last_attended_at,
            Some(h.iter().last().unwrap().recorded_at)
        );

        let streak = compute_streak(&history(&[Present, Absent, Absent]));
        assert_eq!(streak.absences, 2);
        assert!(streak.last_attended_at.is_some());
    }

    #[test]
    fn excused_is_neutral() {
        use Outcome::*;
        assert_eq!(compute_streak(&history(&[Absent, Excused, Absent])).absences, 2);
        assert_eq!(compute_streak(&history(&[Absent, Absent, Excused])).absences, 2);
        assert_eq!(compute_streak(&history(&[Present, Excused])).absences, 0);
        assert_eq!(compute_streak(&history(&[Excused])).absences, 0);
    }

    #[test]
    fn evening_absence_after_morning_attendance_counts() {
        let day = |hour| Utc.with_ymd_and_hms(2026, 1, 4, hour, 0, 0).unwrap();
        // ids deliberately sort opposite to start time
        let morning = AttendanceEvent {
            member_id: Uuid::nil(),
            gathering_id: Uuid::from_u128(u128::MAX),
            starts_at: day(9),
            outcome: Outcome::Present,
            recorded_at: day(9),
        };
        let evening = AttendanceEvent {
            gathering_id: Uuid::from_u128(1),
            starts_at: day(19),
            outcome: Outcome::Absent,
            recorded_at: day(19),
            ..morning.clone()
        };

        let streak = compute_streak(&EventHistory::new(vec![evening, morning]));
        assert_eq!(streak.absences, 1);
        assert_eq!(streak.last_attended_at, Some(day(9)));
    }
}
