use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{GroupStats, MemberStanding};

pub fn group_stats(caregroup_name: &str, standings: &[MemberStanding]) -> GroupStats {
    let mut warning_members = 0usize;
    let mut to_follow_up_members = 0usize;

    for standing in standings {
        match standing.summary.status_level {
            2 => warning_members += 1,
            3 => to_follow_up_members += 1,
            _ => {}
        }
    }

    GroupStats {
        caregroup_name: caregroup_name.to_string(),
        total_members: standings.len(),
        active_members: standings.len() - to_follow_up_members,
        warning_members,
        to_follow_up_members,
    }
}

pub fn build_report(
    stats: &GroupStats,
    generated_on: NaiveDate,
    standings: &[MemberStanding],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Caregroup Attendance Report");
    let _ = writeln!(
        output,
        "Generated for {} on {}",
        stats.caregroup_name, generated_on
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Roster");
    let _ = writeln!(output, "- Members: {}", stats.total_members);
    let _ = writeln!(output, "- Active: {}", stats.active_members);
    let _ = writeln!(output, "- Warning: {}", stats.warning_members);
    let _ = writeln!(output, "- To follow up: {}", stats.to_follow_up_members);

    let mut ranked = standings.to_vec();
    ranked.sort_by(|a, b| {
        b.summary
            .absences
            .cmp(&a.summary.absences)
            .then_with(|| a.member.full_name.cmp(&b.member.full_name))
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Follow-up");
    let follow_ups: Vec<&MemberStanding> = ranked
        .iter()
        .filter(|s| s.summary.status_level == 3)
        .collect();
    if follow_ups.is_empty() {
        let _ = writeln!(output, "No members need follow-up.");
    } else {
        for standing in follow_ups {
            let _ = writeln!(
                output,
                "- {} ({}) missed {} in a row, follow-up {}",
                standing.member.full_name,
                standing.member.email,
                standing.summary.absences,
                standing
                    .summary
                    .follow_up_status
                    .as_deref()
                    .unwrap_or("not opened")
                    .to_lowercase()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Warnings");
    let warnings: Vec<&MemberStanding> = ranked
        .iter()
        .filter(|s| s.summary.status_level == 2)
        .collect();
    if warnings.is_empty() {
        let _ = writeln!(output, "No members on warning.");
    } else {
        for standing in warnings {
            let _ = writeln!(
                output,
                "- {} ({}) missed {} ({}% into warning)",
                standing.member.full_name,
                standing.member.email,
                standing.summary.absences,
                standing.summary.progress_percentage
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Last Attended");
    for standing in ranked.iter() {
        let last = standing
            .summary
            .last_attendance_date
            .map(|at| at.date_naive().to_string())
            .unwrap_or_else(|| "never".to_string());
        let _ = writeln!(output, "- {}: {}", standing.member.full_name, last);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Member, StatusSummary};
    use crate::standing::Tier;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn standing(name: &str, tier: Tier, absences: u32) -> MemberStanding {
        MemberStanding {
            member: Member {
                id: Uuid::new_v4(),
                full_name: name.to_string(),
                email: format!("{}@church.com", name.to_lowercase().replace(' ', ".")),
                group_id: None,
                active: true,
                enrolled_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            },
            summary: StatusSummary {
                status_level: tier.level(),
                absences,
                attendance_status: tier.attendance_status().to_string(),
                follow_up_status: (tier == Tier::FollowUp).then(|| "PENDING".to_string()),
                last_attendance_date: None,
                notification_message: String::new(),
                status_color: tier.color(),
                progress_percentage: 0,
                caregroup_leader: None,
            },
        }
    }

    #[test]
    fn stats_split_roster_by_tier() {
        let standings = vec![
            standing("Jane Member", Tier::GoodStanding, 0),
            standing("Robert Johnson", Tier::FollowUp, 4),
            standing("Sarah Williams", Tier::Warning, 1),
        ];
        let stats = group_stats("Alpha Caregroup", &standings);
        assert_eq!(stats.total_members, 3);
        assert_eq!(stats.active_members, 2);
        assert_eq!(stats.warning_members, 1);
        assert_eq!(stats.to_follow_up_members, 1);
    }

    #[test]
    fn report_lists_follow_ups_and_warnings() {
        let standings = vec![
            standing("Jane Member", Tier::GoodStanding, 0),
            standing("Robert Johnson", Tier::FollowUp, 4),
        ];
        let stats = group_stats("Alpha Caregroup", &standings);
        let report = build_report(
            &stats,
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            &standings,
        );
        assert!(report.contains("Generated for Alpha Caregroup on 2026-03-01"));
        assert!(report.contains("- Robert Johnson (robert.johnson@church.com) missed 4 in a row, follow-up pending"));
        assert!(report.contains("No members on warning."));
        assert!(report.contains("- Jane Member: never"));
    }
}
