use serde::Serialize;

use crate::config::{ProgressPolicy, TierBoundaries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    GoodStanding,
    Warning,
    FollowUp,
}

impl Tier {
    pub fn level(&self) -> u8 {
        match self {
            Tier::GoodStanding => 1,
            Tier::Warning => 2,
            Tier::FollowUp => 3,
        }
    }

    pub fn from_level(level: i16) -> Option<Self> {
        match level {
            1 => Some(Tier::GoodStanding),
            2 => Some(Tier::Warning),
            3 => Some(Tier::FollowUp),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Tier::GoodStanding => "Good Standing",
            Tier::Warning => "Warning",
            Tier::FollowUp => "Needs Follow-up",
        }
    }

    /// Roster status shown to leaders.
    pub fn attendance_status(&self) -> &'static str {
        match self {
            Tier::FollowUp => "TO_FOLLOW_UP",
            _ => "ACTIVE",
        }
    }

    pub fn color(&self) -> StatusColor {
        match self {
            Tier::GoodStanding => StatusColor::Green,
            Tier::Warning => StatusColor::Yellow,
            Tier::FollowUp => StatusColor::Red,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tier: Tier,
    pub color: StatusColor,
    pub message: String,
}

pub fn tier_for(streak: u32, boundaries: &TierBoundaries) -> Tier {
    if streak >= boundaries.follow_up_from {
        Tier::FollowUp
    } else if streak >= boundaries.warning_from {
        Tier::Warning
    } else {
        Tier::GoodStanding
    }
}

pub fn classify(streak: u32, boundaries: &TierBoundaries) -> Classification {
    let tier = tier_for(streak, boundaries);
    let message = match tier {
        Tier::GoodStanding => "You are in good standing with your attendance.".to_string(),
        Tier::Warning => format!(
            "You have missed {streak} consecutive {}. Please reconnect with your group.",
            gathering_noun(streak)
        ),
        Tier::FollowUp => format!(
            "You have missed {streak} consecutive {}. Your group leader has been notified.",
            gathering_noun(streak)
        ),
    };

    Classification {
        tier,
        color: tier.color(),
        message,
    }
}

fn gathering_noun(count: u32) -> &'static str {
    if count == 1 {
        "gathering"
    } else {
        "gatherings"
    }
}

/// How far the member is into the current tier's range, 0..=100.
pub fn progress(streak: u32, boundaries: &TierBoundaries, policy: ProgressPolicy) -> u8 {
    let percent = match tier_for(streak, boundaries) {
        Tier::GoodStanding => 0,
        Tier::Warning => {
            let lower = boundaries.warning_from;
            let upper = boundaries.follow_up_from.saturating_sub(1);
            span_percent(streak, lower, upper)
        }
        Tier::FollowUp => match policy {
            ProgressPolicy::Saturate => 100,
            ProgressPolicy::Graded { ceiling } => {
                span_percent(streak, boundaries.follow_up_from, ceiling)
            }
        },
    };
    percent.min(100) as u8
}

fn span_percent(value: u32, lower: u32, upper: u32) -> u64 {
    if upper <= lower {
        return 100;
    }
    let offset = value.saturating_sub(lower) as u64;
    offset * 100 / (upper - lower) as u64
}
