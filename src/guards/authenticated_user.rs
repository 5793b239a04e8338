use crate::guards::{BasicAuth, OrStatus};
use crate::store::Store;
use anyhow::{anyhow, Context};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use rocket::http::Status;
use rocket::outcome::try_outcome;
use rocket::request::{FromRequest, Outcome};
use rocket::{Request, State};
use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use uuid::Uuid;

/// An operator whose Basic credentials matched a stored argon2 hash. The
/// username doubles as the audit actor for admin actions.
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub username: String,
    // prevents construction outside of this module
    _private: (),
}

#[async_trait]
impl<'r> FromRequest<'r> for AuthenticatedUser {
    type Error = anyhow::Error;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let store = try_outcome!(request
            .guard::<&State<Arc<dyn Store>>>()
            .await
            .map_error(|_| (Status::InternalServerError, anyhow!("The store is not managed."))));
        let basic_auth = try_outcome!(request
            .guard::<BasicAuth>()
            .await
            .map_error(|_| (Status::Unauthorized, anyhow!("User has not been authenticated."))));

        match validate_credentials(store.inner().clone(), basic_auth).await {
            Ok(user) => Outcome::Success(user),
            Err((status, e)) => {
                tracing::warn!(error.cause_chain = ?e, "Rejected admin credentials");
                Outcome::Error((status, e))
            }
        }
    }
}

#[tracing::instrument(name = "Validate credentials", skip(store, basic_auth), fields(username = %basic_auth.username()))]
async fn validate_credentials(
    store: Arc<dyn Store>,
    basic_auth: BasicAuth,
) -> Result<AuthenticatedUser, (Status, anyhow::Error)> {
    let (user_id, password_hash) = store
        .get_credentials(basic_auth.username())
        .await
        .or_status(
            Status::InternalServerError,
            "Failed to perform a query to retrieve stored credentials.",
        )?
        .or_status(Status::Unauthorized, "Unknown username.")?;

    let password = basic_auth.password().clone();
    // hashing is CPU bound
    tokio::task::spawn_blocking(move || verify_password_hash(Secret::new(password_hash), password))
        .await
        .or_status(Status::InternalServerError, "Failed to spawn blocking task.")?
        .map_err(|e| (Status::Unauthorized, e))?;

    Ok(AuthenticatedUser {
        user_id,
        username: basic_auth.username().to_string(),
        _private: (),
    })
}

fn verify_password_hash(expected_password_hash: Secret<String>, password_candidate: Secret<String>) -> Result<(), anyhow::Error> {
    let expected_password_hash =
        PasswordHash::new(expected_password_hash.expose_secret()).context("Failed to parse hash in PHC string format.")?;
    Argon2::default()
        .verify_password(password_candidate.expose_secret().as_bytes(), &expected_password_hash)
        .map_err(|_| anyhow!("Invalid password."))
}
