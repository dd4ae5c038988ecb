use rocket::Request;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use sqlx::SqlitePool;

use crate::db::{get_session_by_token, get_user};
use crate::validation::{ApiError, ToValidationResponse, ValidationResponse};

use super::User;

pub const SESSION_COOKIE: &str = "session_token";

#[rocket::async_trait]
impl<'r> FromRequest<'r> for User {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        authenticate(request).await
    }
}

#[tracing::instrument(name = "user_auth_guard", skip_all)]
async fn authenticate(request: &Request<'_>) -> Outcome<User, ()> {
    let token = request
        .cookies()
        .get_private(SESSION_COOKIE)
        .map(|c| c.value().to_string());

    let Some(token) = token else {
        return Outcome::Error((Status::Unauthorized, ()));
    };

    let db = match request.rocket().state::<SqlitePool>() {
        Some(pool) => pool,
        _ => {
            tracing::error!("Database pool not found in managed state");
            return Outcome::Error((Status::InternalServerError, ()));
        }
    };

    match get_session_by_token(db, &token).await {
        Ok(session) => {
            if !session.is_valid() {
                tracing::warn!(session_id = session.id, "Session token expired");
                return Outcome::Error((Status::Unauthorized, ()));
            }

            match get_user(db, session.user_id).await {
                Ok(user) => {
                    tracing::debug!(user_id = user.id, "User authenticated via session token");
                    Outcome::Success(user)
                }
                Err(err) => {
                    tracing::error!(user_id = %session.user_id, error = ?err, "Failed to fetch user for valid session");
                    Outcome::Error((Status::Unauthorized, ()))
                }
            }
        }
        Err(err) => {
            tracing::warn!(error = ?err, "Invalid session token");
            Outcome::Error((Status::Unauthorized, ()))
        }
    }
}

fn error_body(status: Status, field: &str, message: &str) -> ApiError {
    Custom(status, Json(ValidationResponse::with_error(field, message)))
}

#[catch(401)]
pub fn unauthorized_api(_req: &Request) -> ApiError {
    Status::Unauthorized.to_validation_response()
}

#[catch(400)]
pub fn bad_request_api(_req: &Request) -> ApiError {
    Status::BadRequest.to_validation_response()
}

#[catch(404)]
pub fn not_found_api(_req: &Request) -> ApiError {
    Status::NotFound.to_validation_response()
}

#[catch(422)]
pub fn unprocessable_api(_req: &Request) -> ApiError {
    error_body(Status::UnprocessableEntity, "request", "Malformed request body")
}

#[catch(500)]
pub fn internal_error_api(_req: &Request) -> ApiError {
    Status::InternalServerError.to_validation_response()
}
