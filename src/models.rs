use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::schedule::{Habit, Schedule};

#[derive(sqlx::FromRow, Clone, Debug)]
pub struct DbHabit {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: NaiveDate,
    pub monthly_day: Option<i64>,
    pub specific_date: Option<NaiveDate>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
    pub week_days: Option<String>, // group_concat of habit_week_days
}

impl TryFrom<DbHabit> for Habit {
    type Error = AppError;

    fn try_from(row: DbHabit) -> Result<Self, Self::Error> {
        let week_days = row
            .week_days
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().parse::<i64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                AppError::Internal(format!("Corrupt week days for habit {}: {}", row.id, e))
            })?;

        let schedule = Schedule::from_parts(Some(&week_days), row.monthly_day, row.specific_date)
            .map_err(|e| {
                AppError::Internal(format!("Habit {} has no valid schedule: {}", row.id, e))
            })?;

        Ok(Habit {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            created_at: row.created_at,
            schedule,
            time_start: row.time_start,
            time_end: row.time_end,
        })
    }
}

pub struct NewHabit {
    pub title: String,
    pub schedule: Schedule,
    pub created_at: NaiveDate,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
}

#[derive(sqlx::FromRow, Clone, Debug)]
pub struct DbDay {
    pub id: i64,
    pub date: NaiveDate,
    pub completed: bool,
    pub completed_count: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    pub id: Option<i64>,
    pub date: NaiveDate,
    pub is_completed: bool,
    pub completed: f64,
    pub amount: f64,
}
