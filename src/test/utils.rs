#[cfg(test)]
pub mod test_utils {
    use crate::db::{create_habit, create_user};
    use crate::error::AppError;
    use crate::init_rocket;
    use crate::models::NewHabit;
    use crate::schedule::Schedule;
    use chrono::NaiveDate;
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;
    use serde_json::json;
    use sqlx::{
        Pool, Sqlite,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    };
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Once;
    use uuid::Uuid;

    static INIT: Once = Once::new();
    pub static STANDARD_PASSWORD: &str = "password123";

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    /// 2025-03-03, a Monday.
    pub fn monday() -> NaiveDate {
        date(2025, 3, 3)
    }

    pub fn every_day() -> Schedule {
        Schedule::Weekly((0..=6).collect())
    }

    #[derive(Default)]
    pub struct TestDbBuilder {
        users: Vec<TestUser>,
        habits: Vec<TestHabit>,
        file_connections: Option<u32>,
    }

    pub struct TestUser {
        pub email: String,
        pub name: String,
        pub password: String,
    }

    pub struct TestHabit {
        pub owner_email: String,
        pub title: String,
        pub schedule: Schedule,
        pub created_at: NaiveDate,
    }

    impl TestDbBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn user(mut self, email: &str, name: &str) -> Self {
            self.users.push(TestUser {
                email: email.to_string(),
                name: name.to_string(),
                password: STANDARD_PASSWORD.to_string(),
            });
            self
        }

        pub fn habit(
            mut self,
            owner_email: &str,
            title: &str,
            schedule: Schedule,
            created_at: NaiveDate,
        ) -> Self {
            self.habits.push(TestHabit {
                owner_email: owner_email.to_string(),
                title: title.to_string(),
                schedule,
                created_at,
            });
            self
        }

        pub fn weekly_habit(
            self,
            owner_email: &str,
            title: &str,
            days: &[u8],
            created_at: NaiveDate,
        ) -> Self {
            self.habit(
                owner_email,
                title,
                Schedule::Weekly(days.iter().copied().collect()),
                created_at,
            )
        }

        /// Backs the database with a temporary file shared by `connections`
        /// pooled connections instead of one in-memory connection.
        pub fn file_backed(mut self, connections: u32) -> Self {
            self.file_connections = Some(connections);
            self
        }

        pub async fn build(self) -> Result<TestDb, AppError> {
            INIT.call_once(|| {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter("debug")
                    .with_test_writer()
                    .try_init();
            });

            let (pool, file) = match self.file_connections {
                Some(connections) => {
                    let path = std::env::temp_dir()
                        .join(format!("habit-tracker-test-{}.db", Uuid::new_v4()));
                    let options = SqliteConnectOptions::new()
                        .filename(&path)
                        .create_if_missing(true);
                    let pool = SqlitePoolOptions::new()
                        .max_connections(connections)
                        .connect_with(options)
                        .await?;
                    (pool, Some(path))
                }
                // A single long-lived connection keeps the in-memory database alive.
                None => {
                    let pool = SqlitePoolOptions::new()
                        .max_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                        .connect("sqlite::memory:")
                        .await?;
                    (pool, None)
                }
            };

            sqlx::migrate!("./migrations").run(&pool).await?;

            let mut user_id_map: HashMap<String, i64> = HashMap::new();
            let mut habit_id_map: HashMap<String, i64> = HashMap::new();

            for user in &self.users {
                let user_id = create_user(&pool, &user.email, &user.password, &user.name).await?;
                user_id_map.insert(user.email.clone(), user_id);
            }

            for habit in self.habits {
                let owner_id = user_id_map.get(&habit.owner_email).copied().ok_or_else(|| {
                    AppError::NotFound(format!("Test user {} not declared", habit.owner_email))
                })?;

                let created = create_habit(
                    &pool,
                    owner_id,
                    NewHabit {
                        title: habit.title.clone(),
                        schedule: habit.schedule,
                        created_at: habit.created_at,
                        time_start: None,
                        time_end: None,
                    },
                )
                .await?;

                habit_id_map.insert(habit.title, created.id);
            }

            Ok(TestDb {
                pool,
                user_id_map,
                habit_id_map,
                file,
            })
        }
    }

    pub struct TestDb {
        pub pool: Pool<Sqlite>,
        pub user_id_map: HashMap<String, i64>,
        pub habit_id_map: HashMap<String, i64>,
        file: Option<PathBuf>,
    }

    impl Drop for TestDb {
        fn drop(&mut self) {
            if let Some(path) = &self.file {
                for suffix in ["", "-wal", "-shm", "-journal"] {
                    let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
                }
            }
        }
    }

    impl TestDb {
        pub fn user_id(&self, email: &str) -> i64 {
            self.user_id_map
                .get(email)
                .copied()
                .unwrap_or_else(|| panic!("unknown test user {}", email))
        }

        pub fn habit_id(&self, title: &str) -> i64 {
            self.habit_id_map
                .get(title)
                .copied()
                .unwrap_or_else(|| panic!("unknown test habit {}", title))
        }

        pub async fn day_count(&self) -> i64 {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM days")
                .fetch_one(&self.pool)
                .await
                .expect("count days")
        }

        pub async fn day_habit_count(&self) -> i64 {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM day_habits")
                .fetch_one(&self.pool)
                .await
                .expect("count day habits")
        }
    }

    pub async fn create_standard_test_db() -> TestDb {
        TestDbBuilder::new()
            .user("ana@example.com", "Ana")
            .user("bruno@example.com", "Bruno")
            .build()
            .await
            .expect("Failed to build test database")
    }

    pub async fn setup_test_client(test_db: TestDb) -> (Client, TestDb) {
        let rocket = init_rocket(test_db.pool.clone()).await;
        let client = Client::tracked(rocket)
            .await
            .expect("valid rocket instance");

        (client, test_db)
    }

    /// Logs in through the API; the tracked client keeps the session cookie.
    pub async fn login_test_user(client: &Client, email: &str, password: &str) {
        let response = client
            .post("/api/auth/login")
            .header(ContentType::JSON)
            .body(json!({ "email": email, "password": password }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Ok, "login failed for {}", email);
    }
}
