#[macro_use]
extern crate rocket;

mod api;
mod auth;
mod db;
mod env;
mod error;
mod models;
mod schedule;
mod telemetry;
#[cfg(test)]
mod test;
mod validation;

use api::{
    api_create_habit, api_delete_habit, api_get_day, api_get_summary, api_hide_habit,
    api_list_habits, api_login, api_logout, api_me, api_register, api_toggle_habit,
    api_update_profile, health,
};
use auth::{bad_request_api, internal_error_api, not_found_api, unauthorized_api, unprocessable_api};
use db::clean_expired_sessions;
use env::{AppConfig, database_url, load_environment};
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, tokio};
use sqlx::SqlitePool;
use telemetry::{TelemetryFairing, init_tracing};
use tracing::{error, info};

const SESSION_SWEEP_INTERVAL_SECS: u64 = 3600;

#[launch]
async fn rocket() -> _ {
    if let Err(e) = load_environment() {
        eprintln!("Failed to load environment files: {}", e);
    }

    init_tracing();

    let pool = SqlitePool::connect(&database_url())
        .await
        .expect("Failed to connect to SQLite database");

    info!("Running database migrations...");
    match sqlx::migrate!("./migrations").run(&pool).await {
        Ok(_) => info!("Migrations completed successfully"),
        Err(e) => {
            error!("Failed to run migrations: {}", e);
            panic!("Database migration failed: {}", e);
        }
    }

    let pool_clone = pool.clone();

    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;

        loop {
            match clean_expired_sessions(&pool_clone).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Cleaned up {} expired sessions", count);
                    }
                }
                Err(e) => {
                    error!("Failed to clean expired sessions: {}", e);
                }
            }

            tokio::time::sleep(tokio::time::Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS))
                .await;
        }
    });

    init_rocket(pool).await
}

pub async fn init_rocket(pool: SqlitePool) -> Rocket<Build> {
    info!("Starting habit tracker");

    rocket::build()
        .manage(pool)
        .attach(AdHoc::config::<AppConfig>())
        .mount(
            "/api",
            routes![
                api_list_habits,
                api_create_habit,
                api_delete_habit,
                api_toggle_habit,
                api_hide_habit,
                api_get_day,
                api_get_summary,
                health,
            ],
        )
        .mount(
            "/api/auth",
            routes![api_register, api_login, api_me, api_update_profile, api_logout],
        )
        .register(
            "/api",
            catchers![
                bad_request_api,
                unauthorized_api,
                not_found_api,
                unprocessable_api,
                internal_error_api,
            ],
        )
        .attach(TelemetryFairing)
}
