//! Identity provider: hands out a fresh pseudonymous user id per sign-in.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::jwt::JwtSecret;
use crate::error::{AppError, AppResult};

/// Identity issued for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Unique and stable for the lifetime of the session.
    pub user_id: String,
    /// Bearer token proving the id was issued by this provider.
    pub token: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Issue a new identity. Rejections surface as [`AppError::AuthFailure`].
    async fn sign_in(&self) -> AppResult<Identity>;

    /// Recover the identity behind a token this provider issued earlier.
    async fn resume(&self, token: &str) -> AppResult<Identity>;
}

/// Anonymous sign-in: a random v4 id wrapped in a signed token.
#[derive(Clone)]
pub struct AnonymousIdentity {
    jwt: JwtSecret,
}

impl AnonymousIdentity {
    pub fn new(jwt: JwtSecret) -> Self {
        Self { jwt }
    }
}

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn sign_in(&self) -> AppResult<Identity> {
        let user_id = Uuid::new_v4().to_string();
        let token = self
            .jwt
            .issue(&user_id)
            .map_err(|e| AppError::AuthFailure(e.to_string()))?;
        info!(user_id = %user_id, "anonymous identity issued");
        Ok(Identity { user_id, token })
    }

    async fn resume(&self, token: &str) -> AppResult<Identity> {
        let user_id = self
            .jwt
            .validate(token)
            .map_err(|e| AppError::AuthFailure(e.to_string()))?;
        info!(user_id = %user_id, "anonymous identity resumed");
        Ok(Identity {
            user_id,
            token: token.to_string(),
        })
    }
}
