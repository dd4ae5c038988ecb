use chrono::{Duration, Local, NaiveDate, Utc};
use rocket::State;
use rocket::data::{Data, ToByteUnit};
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::response::status::Custom;
use rocket::serde::{Deserialize, Serialize, json::Json};
use sqlx::{Pool, Sqlite};
use tracing::info;
use validator::Validate;

use crate::auth::{SESSION_COOKIE, User, UserSession};
use crate::db::{
    authenticate_user, create_habit, create_user, create_user_session, delete_habit,
    get_completed_habit_ids, get_possible_habits, get_user, hide_habit, invalidate_session,
    list_habits, sweep_then_summarize, toggle_habit, update_user_profile, verify_user_password,
};
use crate::env::AppConfig;
use crate::error::AppError;
use crate::models::{NewHabit, SummaryEntry};
use crate::schedule::{Habit, Schedule, WeekDay, effective_start, parse_date, parse_time};
use crate::validation::{
    ApiError, AppErrorExt, JsonValidateExt, TIME_OF_DAY, ValidationResponse,
};

const MAX_TITLE_LENGTH: usize = 200;
const DATE_BODY_LIMIT_KIB: u32 = 4;

#[derive(Serialize, Deserialize, Debug)]
pub struct UserData {
    pub id: i64,
    pub email: String,
    pub name: String,
}

impl From<User> for UserData {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AuthResponse {
    pub user: UserData,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HabitResponse {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub created_at: NaiveDate,
    #[serde(rename = "weekDays")]
    pub week_days: Vec<WeekDay>,
    pub monthly_day: Option<u32>,
    pub specific_date: Option<NaiveDate>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
}

impl From<Habit> for HabitResponse {
    fn from(habit: Habit) -> Self {
        Self {
            id: habit.id,
            user_id: habit.user_id,
            title: habit.title,
            created_at: habit.created_at,
            week_days: habit.schedule.week_days(),
            monthly_day: habit.schedule.monthly_day(),
            specific_date: habit.schedule.specific_date(),
            time_start: habit.time_start,
            time_end: habit.time_end,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DayResponse {
    pub possible_habits: Vec<HabitResponse>,
    pub completed_habits: Vec<i64>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ToggleResponse {
    pub is_completed: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

async fn start_session(
    db: &Pool<Sqlite>,
    cookies: &CookieJar<'_>,
    user_id: i64,
    hours: i64,
) -> Result<(), AppError> {
    let token = UserSession::generate_token();
    let expires_at = Utc::now() + Duration::hours(hours);

    create_user_session(db, user_id, &token, expires_at.naive_utc()).await?;

    cookies.add_private(
        Cookie::build((SESSION_COOKIE, token))
            .same_site(SameSite::Lax)
            .http_only(true)
            .max_age(rocket::time::Duration::hours(hours)),
    );

    Ok(())
}

#[derive(Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    email: String,
    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    password: String,
    #[validate(length(min = 1, max = 100, message = "Name is required"))]
    name: String,
}

#[post("/register", data = "<registration>")]
pub async fn api_register(
    registration: Json<RegisterRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Custom<Json<AuthResponse>>, ApiError> {
    let validated = registration.validate_custom()?;
    let email = validated.email.trim().to_lowercase();

    let user_id = create_user(db, &email, &validated.password, validated.name.trim())
        .await
        .validate_custom()?;

    start_session(db, cookies, user_id, config.session_hours)
        .await
        .validate_custom()?;

    let user = get_user(db, user_id).await.validate_custom()?;
    info!(user_id, "Registered new user");

    Ok(Custom(
        Status::Created,
        Json(AuthResponse {
            user: UserData::from(user),
        }),
    ))
}

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Email is required"))]
    email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    password: String,
}

#[post("/login", data = "<login>")]
pub async fn api_login(
    login: Json<LoginRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Json<AuthResponse>, ApiError> {
    let validated = login.validate_custom()?;
    let email = validated.email.trim().to_lowercase();

    match authenticate_user(db, &email, &validated.password)
        .await
        .validate_custom()?
    {
        Some(user) => {
            start_session(db, cookies, user.id, config.session_hours)
                .await
                .validate_custom()?;

            Ok(Json(AuthResponse {
                user: UserData::from(user),
            }))
        }
        None => Err(Custom(
            Status::Unauthorized,
            Json(ValidationResponse::with_error(
                "credentials",
                "Invalid email or password",
            )),
        )),
    }
}

#[get("/me")]
pub async fn api_me(user: User) -> Json<UserData> {
    Json(UserData::from(user))
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdateRequest {
    #[validate(length(min = 1, max = 100, message = "Name is required"))]
    name: String,
    #[validate(email(message = "Invalid email format"))]
    email: String,
    #[validate(length(min = 1, message = "Current password is required to confirm changes"))]
    current_password: String,
    #[validate(length(min = 8, message = "New password must be at least 8 characters"))]
    new_password: Option<String>,
}

#[put("/profile", data = "<profile>")]
pub async fn api_update_profile(
    profile: Json<ProfileUpdateRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<UserData>, ApiError> {
    let validated = profile.validate_custom()?;

    if !verify_user_password(db, user.id, &validated.current_password)
        .await
        .validate_custom()?
    {
        return Err(AppError::Forbidden(
            "Current password is incorrect".to_string(),
        ))
        .validate_custom();
    }

    let new_password = validated.new_password.as_deref().filter(|p| !p.is_empty());
    let updated = update_user_profile(
        db,
        user.id,
        validated.name.trim(),
        &validated.email.trim().to_lowercase(),
        new_password,
    )
    .await
    .validate_custom()?;

    Ok(Json(UserData::from(updated)))
}

#[post("/logout")]
pub async fn api_logout(cookies: &CookieJar<'_>, db: &State<Pool<Sqlite>>) -> Status {
    let token = cookies
        .get_private(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string());

    if let Some(token) = token {
        if let Err(e) = invalidate_session(db, &token).await {
            e.log_and_record("Logout");
        }
    }

    cookies.remove_private(Cookie::from(SESSION_COOKIE));

    Status::Ok
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateHabitRequest {
    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    title: String,
    week_days: Option<Vec<i64>>,
    monthly_day: Option<i64>,
    specific_date: Option<String>,
    #[validate(regex(path = *TIME_OF_DAY, message = "Time must be HH:MM"))]
    time_start: Option<String>,
    #[validate(regex(path = *TIME_OF_DAY, message = "Time must be HH:MM"))]
    time_end: Option<String>,
}

impl CreateHabitRequest {
    fn into_new_habit(self, now: chrono::NaiveDateTime) -> Result<NewHabit, AppError> {
        let title = self.title.trim().to_string();
        if title.is_empty() || title.chars().count() > MAX_TITLE_LENGTH {
            return Err(AppError::Validation("Title is required".to_string()));
        }

        let specific_date = self.specific_date.as_deref().map(parse_date).transpose()?;
        let schedule =
            Schedule::from_parts(self.week_days.as_deref(), self.monthly_day, specific_date)?;
        let start_time = self.time_start.as_deref().map(parse_time).transpose()?;

        Ok(NewHabit {
            created_at: effective_start(&schedule, start_time, now),
            title,
            schedule,
            time_start: self.time_start,
            time_end: self.time_end,
        })
    }
}

#[get("/habits")]
pub async fn api_list_habits(
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<Vec<HabitResponse>>, ApiError> {
    let habits = list_habits(db, user.id).await.validate_custom()?;

    Ok(Json(habits.into_iter().map(HabitResponse::from).collect()))
}

#[post("/habits", data = "<request>")]
pub async fn api_create_habit(
    request: Json<CreateHabitRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Custom<Json<HabitResponse>>, ApiError> {
    let validated = request.validate_custom()?;
    let new_habit = validated
        .into_new_habit(Local::now().naive_local())
        .validate_custom()?;

    let habit = create_habit(db, user.id, new_habit)
        .await
        .validate_custom()?;

    Ok(Custom(Status::Created, Json(HabitResponse::from(habit))))
}

#[delete("/habits/<id>")]
pub async fn api_delete_habit(
    id: i64,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<MessageResponse>, ApiError> {
    delete_habit(db, user.id, id).await.validate_custom()?;

    Ok(Json(MessageResponse {
        message: "Habit deleted successfully".to_string(),
    }))
}

#[derive(Deserialize)]
pub struct DateRequest {
    date: Option<String>,
}

/// Reads the optional `{date}` body of a toggle. An empty body means today;
/// anything else must parse.
async fn read_toggle_date(data: Data<'_>) -> Result<NaiveDate, AppError> {
    let body = data
        .open(DATE_BODY_LIMIT_KIB.kibibytes())
        .into_string()
        .await
        .map_err(|e| AppError::Validation(format!("Unreadable request body: {}", e)))?;

    if !body.is_complete() {
        return Err(AppError::Validation("Request body too large".to_string()));
    }

    let body = body.into_inner();
    if body.trim().is_empty() {
        return Ok(today());
    }

    let request: DateRequest = serde_json::from_str(&body)
        .map_err(|e| AppError::Validation(format!("Malformed request body: {}", e)))?;

    match request.date {
        Some(date) => parse_date(&date),
        None => Ok(today()),
    }
}

#[patch("/habits/<id>/toggle", data = "<body>")]
pub async fn api_toggle_habit(
    id: i64,
    body: Data<'_>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let date = read_toggle_date(body).await.validate_custom()?;

    let is_completed = toggle_habit(db, user.id, id, date)
        .await
        .validate_custom()?;

    Ok(Json(ToggleResponse { is_completed }))
}

#[patch("/habits/<id>/hide", data = "<request>")]
pub async fn api_hide_habit(
    id: i64,
    request: Json<DateRequest>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let date = request
        .into_inner()
        .date
        .ok_or_else(|| AppError::Validation("Missing date".to_string()))
        .and_then(|date| parse_date(&date))
        .validate_custom()?;

    hide_habit(db, user.id, id, date).await.validate_custom()?;

    Ok(Json(MessageResponse {
        message: format!("Habit hidden for {}", date),
    }))
}

#[get("/day?<date>")]
pub async fn api_get_day(
    date: Option<&str>,
    user: User,
    db: &State<Pool<Sqlite>>,
) -> Result<Json<DayResponse>, ApiError> {
    let date = date
        .ok_or_else(|| AppError::Validation("Missing date parameter".to_string()))
        .and_then(parse_date)
        .validate_custom()?;

    let possible = get_possible_habits(db, user.id, date)
        .await
        .validate_custom()?;
    let completed = get_completed_habit_ids(db, user.id, date)
        .await
        .validate_custom()?;

    Ok(Json(DayResponse {
        possible_habits: possible.into_iter().map(HabitResponse::from).collect(),
        completed_habits: completed,
    }))
}

#[get("/summary?<from>&<to>")]
pub async fn api_get_summary(
    from: Option<&str>,
    to: Option<&str>,
    user: User,
    db: &State<Pool<Sqlite>>,
    config: &State<AppConfig>,
) -> Result<Json<Vec<SummaryEntry>>, ApiError> {
    let range = match (from, to) {
        (Some(from), Some(to)) => Some((
            parse_date(from).validate_custom()?,
            parse_date(to).validate_custom()?,
        )),
        (None, None) => None,
        _ => {
            return Err(AppError::Validation(
                "Both from and to are required for a summary range".to_string(),
            ))
            .validate_custom();
        }
    };

    let cutoff = today() - Duration::days(config.retention_days);
    let summary = sweep_then_summarize(db, user.id, range, cutoff)
        .await
        .validate_custom()?;

    Ok(Json(summary))
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}
