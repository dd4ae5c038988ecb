use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, pool::PoolConnection};
use tracing::{info, instrument, warn};

use crate::{
    auth::{DbUser, DbUserSession, User, UserSession},
    error::AppError,
    models::{DbDay, DbHabit, NewHabit, SummaryEntry},
    schedule::{self, Habit},
};

const HABIT_SELECT: &str = "SELECT h.id, h.user_id, h.title, h.created_at, h.monthly_day,
        h.specific_date, h.time_start, h.time_end,
        (SELECT group_concat(w.week_day) FROM habit_week_days w WHERE w.habit_id = h.id) AS week_days
     FROM habits h";

const USER_SELECT: &str = "SELECT id, email, name, created_at FROM users";

pub const MAX_SUMMARY_DAYS: i64 = 366;

#[instrument]
pub async fn get_user(pool: &Pool<Sqlite>, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(&format!("{} WHERE id = ?", USER_SELECT))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(user) => Ok(User::from(user)),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument]
pub async fn find_user_by_email(
    pool: &Pool<Sqlite>,
    email: &str,
) -> Result<Option<User>, AppError> {
    info!("Finding user by email");
    let row = sqlx::query_as::<_, DbUser>(&format!("{} WHERE email = ?", USER_SELECT))
        .bind(email)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(User::from))
}

#[instrument(skip_all, fields(email))]
pub async fn create_user(
    pool: &Pool<Sqlite>,
    email: &str,
    password: &str,
    name: &str,
) -> Result<i64, AppError> {
    info!("Creating new user");

    if find_user_by_email(pool, email).await?.is_some() {
        return Err(AppError::Conflict(format!(
            "Email '{}' is already registered",
            email
        )));
    }

    let hashed_password = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;

    let res = sqlx::query("INSERT INTO users (email, password, name) VALUES (?, ?, ?)")
        .bind(email)
        .bind(hashed_password)
        .bind(name)
        .execute(pool)
        .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip_all, fields(email))]
pub async fn authenticate_user(
    pool: &Pool<Sqlite>,
    email: &str,
    password: &str,
) -> Result<Option<User>, AppError> {
    info!("Authenticating user");
    let row = sqlx::query_as::<_, (i64, String)>("SELECT id, password FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((id, hash)) => match bcrypt::verify(password, &hash) {
            Ok(true) => Ok(Some(get_user(pool, id).await?)),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

#[instrument(skip(pool, password))]
pub async fn verify_user_password(
    pool: &Pool<Sqlite>,
    user_id: i64,
    password: &str,
) -> Result<bool, AppError> {
    let hash = sqlx::query_scalar::<_, String>("SELECT password FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User with id {} not found", user_id)))?;

    Ok(bcrypt::verify(password, &hash).unwrap_or(false))
}

#[instrument(skip(pool, new_password))]
pub async fn update_user_profile(
    pool: &Pool<Sqlite>,
    user_id: i64,
    name: &str,
    email: &str,
    new_password: Option<&str>,
) -> Result<User, AppError> {
    info!("Updating user profile");

    let taken = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE email = ? AND id != ?")
        .bind(email)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    if taken.is_some() {
        return Err(AppError::Conflict("This email is already in use".to_string()));
    }

    sqlx::query("UPDATE users SET name = ?, email = ? WHERE id = ?")
        .bind(name)
        .bind(email)
        .bind(user_id)
        .execute(pool)
        .await?;

    if let Some(password) = new_password {
        let hashed_password = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        sqlx::query("UPDATE users SET password = ? WHERE id = ?")
            .bind(hashed_password)
            .bind(user_id)
            .execute(pool)
            .await?;
    }

    get_user(pool, user_id).await
}

#[instrument(skip(pool, token))]
pub async fn create_user_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    token: &str,
    expires_at: NaiveDateTime,
) -> Result<i64, AppError> {
    info!("Creating user session");

    let res = sqlx::query("INSERT INTO user_sessions (user_id, token, expires_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .execute(pool)
        .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(pool, token))]
pub async fn get_session_by_token(
    pool: &Pool<Sqlite>,
    token: &str,
) -> Result<UserSession, AppError> {
    let session = sqlx::query_as::<_, DbUserSession>(
        "SELECT id, user_id, token, created_at, expires_at FROM user_sessions WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    match session {
        Some(session) => Ok(UserSession::from(session)),
        _ => Err(AppError::Authentication(
            "Invalid session token".to_string(),
        )),
    }
}

#[instrument(skip(pool, token))]
pub async fn invalidate_session(pool: &Pool<Sqlite>, token: &str) -> Result<(), AppError> {
    info!("Invalidating session");

    sqlx::query("DELETE FROM user_sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await?;

    Ok(())
}

#[instrument(skip(pool))]
pub async fn clean_expired_sessions(pool: &Pool<Sqlite>) -> Result<u64, AppError> {
    info!("Cleaning expired sessions");

    let now = Utc::now().naive_utc();

    let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at < ?")
        .bind(now)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

async fn fetch_user_habits(
    conn: &mut SqliteConnection,
    user_id: i64,
) -> Result<Vec<Habit>, AppError> {
    let rows = sqlx::query_as::<_, DbHabit>(&format!("{} WHERE h.user_id = ?", HABIT_SELECT))
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;

    rows.into_iter().map(Habit::try_from).collect()
}

async fn fetch_habit(
    conn: &mut SqliteConnection,
    user_id: i64,
    habit_id: i64,
) -> Result<Habit, AppError> {
    let row = sqlx::query_as::<_, DbHabit>(&format!(
        "{} WHERE h.id = ? AND h.user_id = ?",
        HABIT_SELECT
    ))
    .bind(habit_id)
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Habit::try_from(row),
        _ => Err(AppError::NotFound(format!("Habit with id {} not found", habit_id))),
    }
}

async fn fetch_hidden_ids(
    conn: &mut SqliteConnection,
    user_id: i64,
    date: NaiveDate,
) -> Result<HashSet<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT hh.habit_id FROM habit_hides hh
         JOIN habits h ON h.id = hh.habit_id
         WHERE h.user_id = ? AND hh.date = ?",
    )
    .bind(user_id)
    .bind(date)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids.into_iter().collect())
}

async fn resolve_possible_habits(
    conn: &mut SqliteConnection,
    user_id: i64,
    date: NaiveDate,
) -> Result<Vec<Habit>, AppError> {
    let habits = fetch_user_habits(conn, user_id).await?;
    let hidden = fetch_hidden_ids(conn, user_id, date).await?;

    Ok(schedule::possible_habits(&habits, &hidden, date))
}

async fn find_day_id(
    conn: &mut SqliteConnection,
    user_id: i64,
    date: NaiveDate,
) -> Result<Option<i64>, AppError> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM days WHERE user_id = ? AND date = ?")
        .bind(user_id)
        .bind(date)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(id)
}

/// Recomputes and stores the completion flag of a day from its current
/// day-habit rows and the habits currently due on it.
async fn refresh_day_completion(
    conn: &mut SqliteConnection,
    user_id: i64,
    day_id: i64,
    date: NaiveDate,
) -> Result<bool, AppError> {
    let possible = resolve_possible_habits(conn, user_id, date).await?;

    let done: HashSet<i64> =
        sqlx::query_scalar::<_, i64>("SELECT habit_id FROM day_habits WHERE day_id = ?")
            .bind(day_id)
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();

    let completed = schedule::is_day_completed(&possible, &done);

    sqlx::query("UPDATE days SET completed = ? WHERE id = ?")
        .bind(completed)
        .bind(day_id)
        .execute(&mut *conn)
        .await?;

    Ok(completed)
}

#[instrument(skip(pool, habit), fields(title = %habit.title))]
pub async fn create_habit(
    pool: &Pool<Sqlite>,
    user_id: i64,
    habit: NewHabit,
) -> Result<Habit, AppError> {
    info!("Creating habit");
    let mut tx = pool.begin().await?;

    let res = sqlx::query(
        "INSERT INTO habits (user_id, title, created_at, monthly_day, specific_date, time_start, time_end)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(&habit.title)
    .bind(habit.created_at)
    .bind(habit.schedule.monthly_day())
    .bind(habit.schedule.specific_date())
    .bind(&habit.time_start)
    .bind(&habit.time_end)
    .execute(&mut *tx)
    .await?;

    let habit_id = res.last_insert_rowid();

    for week_day in habit.schedule.week_days() {
        sqlx::query("INSERT INTO habit_week_days (habit_id, week_day) VALUES (?, ?)")
            .bind(habit_id)
            .bind(week_day)
            .execute(&mut *tx)
            .await?;
    }

    let created = fetch_habit(&mut tx, user_id, habit_id).await?;
    tx.commit().await?;

    Ok(created)
}

#[instrument(skip(pool))]
pub async fn list_habits(pool: &Pool<Sqlite>, user_id: i64) -> Result<Vec<Habit>, AppError> {
    info!("Listing habits");
    let mut conn = pool.acquire().await?;

    let mut habits = fetch_user_habits(&mut conn, user_id).await?;
    schedule::sort_habits(&mut habits);

    Ok(habits)
}

#[instrument(skip(pool))]
pub async fn delete_habit(pool: &Pool<Sqlite>, user_id: i64, habit_id: i64) -> Result<(), AppError> {
    info!("Deleting habit");

    let res = sqlx::query("DELETE FROM habits WHERE id = ? AND user_id = ?")
        .bind(habit_id)
        .bind(user_id)
        .execute(pool)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Habit with id {} not found", habit_id)));
    }

    Ok(())
}

#[instrument(skip(pool))]
pub async fn get_possible_habits(
    pool: &Pool<Sqlite>,
    user_id: i64,
    date: NaiveDate,
) -> Result<Vec<Habit>, AppError> {
    info!("Resolving possible habits");
    let mut conn = pool.acquire().await?;

    resolve_possible_habits(&mut conn, user_id, date).await
}

#[instrument(skip(pool))]
pub async fn get_completed_habit_ids(
    pool: &Pool<Sqlite>,
    user_id: i64,
    date: NaiveDate,
) -> Result<Vec<i64>, AppError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT dh.habit_id FROM day_habits dh
         JOIN days d ON d.id = dh.day_id
         WHERE d.user_id = ? AND d.date = ?
         ORDER BY dh.habit_id",
    )
    .bind(user_id)
    .bind(date)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Opens a write transaction up front (`BEGIN IMMEDIATE`) so a concurrent
/// writer waits on the busy timeout instead of failing a lock upgrade.
async fn begin_immediate(pool: &Pool<Sqlite>) -> Result<PoolConnection<Sqlite>, AppError> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

/// Commits on success, rolls back otherwise. The connection must not go back
/// to the pool with the transaction still open.
async fn finish_immediate<T>(
    mut conn: PoolConnection<Sqlite>,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => Ok(value),
            Err(e) => {
                rollback(&mut conn).await;
                Err(e.into())
            }
        },
        Err(e) => {
            rollback(&mut conn).await;
            Err(e)
        }
    }
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        warn!("Failed to roll back transaction: {}", e);
    }
}

/// Flips the completion of a habit on a date and returns whether the whole
/// day is now complete. Runs as a single transaction.
#[instrument(skip(pool))]
pub async fn toggle_habit(
    pool: &Pool<Sqlite>,
    user_id: i64,
    habit_id: i64,
    date: NaiveDate,
) -> Result<bool, AppError> {
    info!("Toggling habit");
    let mut conn = begin_immediate(pool).await?;
    let result = toggle_in_transaction(&mut conn, user_id, habit_id, date).await;
    finish_immediate(conn, result).await
}

async fn toggle_in_transaction(
    conn: &mut SqliteConnection,
    user_id: i64,
    habit_id: i64,
    date: NaiveDate,
) -> Result<bool, AppError> {
    fetch_habit(conn, user_id, habit_id).await?;

    sqlx::query(
        "INSERT INTO days (user_id, date) VALUES (?, ?)
         ON CONFLICT (user_id, date) DO NOTHING",
    )
    .bind(user_id)
    .bind(date)
    .execute(&mut *conn)
    .await?;

    let day_id = find_day_id(conn, user_id, date)
        .await?
        .ok_or_else(|| AppError::Internal(format!("Day {} vanished during toggle", date)))?;

    let removed = sqlx::query("DELETE FROM day_habits WHERE day_id = ? AND habit_id = ?")
        .bind(day_id)
        .bind(habit_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if removed == 0 {
        sqlx::query(
            "INSERT INTO day_habits (day_id, habit_id) VALUES (?, ?)
             ON CONFLICT (day_id, habit_id) DO NOTHING",
        )
        .bind(day_id)
        .bind(habit_id)
        .execute(&mut *conn)
        .await?;
    }

    let marked_done = removed == 0;
    let completed = refresh_day_completion(conn, user_id, day_id, date).await?;

    info!(completed, marked_done, "Habit toggled");
    Ok(completed)
}

#[instrument(skip(pool))]
pub async fn hide_habit(
    pool: &Pool<Sqlite>,
    user_id: i64,
    habit_id: i64,
    date: NaiveDate,
) -> Result<(), AppError> {
    info!("Hiding habit occurrence");
    let mut conn = begin_immediate(pool).await?;
    let result = hide_in_transaction(&mut conn, user_id, habit_id, date).await;
    finish_immediate(conn, result).await
}

async fn hide_in_transaction(
    conn: &mut SqliteConnection,
    user_id: i64,
    habit_id: i64,
    date: NaiveDate,
) -> Result<(), AppError> {
    let habit = fetch_habit(conn, user_id, habit_id).await?;
    if !habit.schedule.is_recurring() {
        return Err(AppError::Validation(
            "Only recurring habits can be hidden for a date".to_string(),
        ));
    }

    sqlx::query(
        "INSERT INTO habit_hides (habit_id, date) VALUES (?, ?)
         ON CONFLICT (habit_id, date) DO NOTHING",
    )
    .bind(habit_id)
    .bind(date)
    .execute(&mut *conn)
    .await?;

    if let Some(day_id) = find_day_id(conn, user_id, date).await? {
        refresh_day_completion(conn, user_id, day_id, date).await?;
    }

    Ok(())
}

/// Deletes every day (and its day-habit rows) dated before `cutoff`.
#[instrument(skip(pool))]
pub async fn clean_old_days(pool: &Pool<Sqlite>, cutoff: NaiveDate) -> Result<u64, AppError> {
    info!("Cleaning old days");

    let result = sqlx::query("DELETE FROM days WHERE date < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

#[instrument(skip(pool))]
pub async fn get_summary(
    pool: &Pool<Sqlite>,
    user_id: i64,
    range: Option<(NaiveDate, NaiveDate)>,
) -> Result<Vec<SummaryEntry>, AppError> {
    info!("Building summary");

    if let Some((from, to)) = range {
        if from > to {
            return Err(AppError::Validation(
                "Summary range start is after its end".to_string(),
            ));
        }
        if (to - from).num_days() >= MAX_SUMMARY_DAYS {
            return Err(AppError::Validation(format!(
                "Summary range may span at most {} days",
                MAX_SUMMARY_DAYS
            )));
        }
    }

    let mut conn = pool.acquire().await?;

    let day_query = "SELECT d.id, d.date, d.completed,
            (SELECT COUNT(*) FROM day_habits dh WHERE dh.day_id = d.id) AS completed_count
         FROM days d
         WHERE d.user_id = ?";

    let days = match range {
        Some((from, to)) => {
            sqlx::query_as::<_, DbDay>(&format!(
                "{} AND d.date BETWEEN ? AND ? ORDER BY d.date",
                day_query
            ))
            .bind(user_id)
            .bind(from)
            .bind(to)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_as::<_, DbDay>(&format!("{} ORDER BY d.date", day_query))
                .bind(user_id)
                .fetch_all(&mut *conn)
                .await?
        }
    };

    let dates: Vec<NaiveDate> = match range {
        Some((from, to)) => from.iter_days().take_while(|d| *d <= to).collect(),
        None => days.iter().map(|d| d.date).collect(),
    };

    let (Some(first), Some(last)) = (dates.first().copied(), dates.last().copied()) else {
        return Ok(Vec::new());
    };

    let habits = fetch_user_habits(&mut conn, user_id).await?;

    let mut hides: HashMap<NaiveDate, HashSet<i64>> = HashMap::new();
    let hide_rows = sqlx::query_as::<_, (i64, NaiveDate)>(
        "SELECT hh.habit_id, hh.date FROM habit_hides hh
         JOIN habits h ON h.id = hh.habit_id
         WHERE h.user_id = ? AND hh.date BETWEEN ? AND ?",
    )
    .bind(user_id)
    .bind(first)
    .bind(last)
    .fetch_all(&mut *conn)
    .await?;

    for (habit_id, date) in hide_rows {
        hides.entry(date).or_default().insert(habit_id);
    }

    let days_by_date: HashMap<NaiveDate, DbDay> = days.into_iter().map(|d| (d.date, d)).collect();
    let no_hides = HashSet::new();

    let summary = dates
        .into_iter()
        .map(|date| {
            let hidden = hides.get(&date).unwrap_or(&no_hides);
            let amount = schedule::possible_habits(&habits, hidden, date).len();
            let day = days_by_date.get(&date);

            SummaryEntry {
                id: day.map(|d| d.id),
                date,
                is_completed: day.map(|d| d.completed).unwrap_or(false),
                completed: day.map(|d| d.completed_count).unwrap_or(0) as f64,
                amount: amount as f64,
            }
        })
        .collect();

    Ok(summary)
}

#[instrument(skip(pool))]
pub async fn sweep_then_summarize(
    pool: &Pool<Sqlite>,
    user_id: i64,
    range: Option<(NaiveDate, NaiveDate)>,
    cutoff: NaiveDate,
) -> Result<Vec<SummaryEntry>, AppError> {
    match clean_old_days(pool, cutoff).await {
        Ok(count) if count > 0 => info!("Removed {} old days", count),
        Ok(_) => {}
        Err(e) => warn!("Failed to clean old days: {}", e),
    }

    get_summary(pool, user_id, range).await
}
