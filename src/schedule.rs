//! Habit schedules and the per-date occurrence rules.
//!
//! Everything here is pure: the database layer loads habits and hides, and
//! these functions decide which habits are due on a calendar date.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::AppError;

/// Weekday index, 0 = Sunday through 6 = Saturday.
pub type WeekDay = u8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Weekly(BTreeSet<WeekDay>),
    Monthly(u32),
    OneOff(NaiveDate),
}

impl Schedule {
    /// Builds a schedule from the three optional wire fields. Exactly one of
    /// them must be set; an empty weekday list counts as unset.
    pub fn from_parts(
        week_days: Option<&[i64]>,
        monthly_day: Option<i64>,
        specific_date: Option<NaiveDate>,
    ) -> Result<Self, AppError> {
        let week_days = week_days.filter(|days| !days.is_empty());

        match (week_days, monthly_day, specific_date) {
            (Some(days), None, None) => {
                let mut set = BTreeSet::new();
                for day in days {
                    if !(0..=6).contains(day) {
                        return Err(AppError::Validation(format!(
                            "Week day {} is out of range 0-6",
                            day
                        )));
                    }
                    set.insert(*day as WeekDay);
                }
                Ok(Schedule::Weekly(set))
            }
            (None, Some(day), None) => {
                if !(1..=31).contains(&day) {
                    return Err(AppError::Validation(format!(
                        "Monthly day {} is out of range 1-31",
                        day
                    )));
                }
                Ok(Schedule::Monthly(day as u32))
            }
            (None, None, Some(date)) => Ok(Schedule::OneOff(date)),
            (None, None, None) => Err(AppError::Validation(
                "A week day set, monthly day or specific date is required".to_string(),
            )),
            _ => Err(AppError::Validation(
                "Only one of week days, monthly day or specific date may be set".to_string(),
            )),
        }
    }

    pub fn occurs_on(&self, date: NaiveDate) -> bool {
        match self {
            Schedule::Weekly(days) => days.contains(&weekday_index(date)),
            Schedule::Monthly(day) => date.day() == *day,
            Schedule::OneOff(on) => *on == date,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::OneOff(_))
    }

    pub fn week_days(&self) -> Vec<WeekDay> {
        match self {
            Schedule::Weekly(days) => days.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    pub fn monthly_day(&self) -> Option<u32> {
        match self {
            Schedule::Monthly(day) => Some(*day),
            _ => None,
        }
    }

    pub fn specific_date(&self) -> Option<NaiveDate> {
        match self {
            Schedule::OneOff(date) => Some(*date),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Habit {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: NaiveDate,
    pub schedule: Schedule,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
}

impl Habit {
    pub fn is_due(&self, date: NaiveDate, hidden: bool) -> bool {
        if self.created_at > date || !self.schedule.occurs_on(date) {
            return false;
        }
        // Hides only suppress recurring occurrences.
        !(hidden && self.schedule.is_recurring())
    }
}

pub fn weekday_index(date: NaiveDate) -> WeekDay {
    date.weekday().num_days_from_sunday() as WeekDay
}

/// Newest first, then title ascending.
pub fn display_order(a: &Habit, b: &Habit) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.title.cmp(&b.title))
}

pub fn sort_habits(habits: &mut [Habit]) {
    habits.sort_by(display_order);
}

/// Habits due on `date`, in display order. `hidden` holds the ids of habits
/// with a hide entry for that same date.
pub fn possible_habits(habits: &[Habit], hidden: &HashSet<i64>, date: NaiveDate) -> Vec<Habit> {
    let mut due: Vec<Habit> = habits
        .iter()
        .filter(|habit| habit.is_due(date, hidden.contains(&habit.id)))
        .cloned()
        .collect();
    sort_habits(&mut due);
    due
}

/// A day is complete when it has at least one due habit and all of them are done.
pub fn is_day_completed(possible: &[Habit], completed: &HashSet<i64>) -> bool {
    !possible.is_empty() && possible.iter().all(|habit| completed.contains(&habit.id))
}

/// The first date a new habit can be due on.
///
/// A recurring habit whose start time has already passed today begins
/// tomorrow. A one-off habit dated in the past starts on its own date so it
/// is still listed there.
pub fn effective_start(
    schedule: &Schedule,
    time_start: Option<NaiveTime>,
    now: NaiveDateTime,
) -> NaiveDate {
    let today = now.date();

    match schedule {
        Schedule::OneOff(date) => (*date).min(today),
        _ => match time_start {
            Some(start) if now.time() > start => today + Duration::days(1),
            _ => today,
        },
    }
}

/// Parses a calendar date from either `YYYY-MM-DD` or an RFC 3339 timestamp.
/// Timestamps are normalised to the local calendar day.
pub fn parse_date(value: &str) -> Result<NaiveDate, AppError> {
    let value = value.trim();

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }

    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Local).date_naive())
        .map_err(|_| AppError::Validation(format!("Invalid date '{}'", value)))
}

pub fn parse_time(value: &str) -> Result<NaiveTime, AppError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| AppError::Validation(format!("Invalid time '{}', expected HH:MM", value)))
}
