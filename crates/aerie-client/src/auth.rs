//! Authentication seam
//!
//! The login exchange itself belongs to the command layer. The routing engine only
//! needs to run it on every fresh connection and keep the resulting session.

use crate::connection::Connection;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// User credentials from the client policy
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Session returned by a successful login
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Opaque token presented on later connections
    pub token: Bytes,
    /// When the token stops being accepted
    pub expires_at: Option<Instant>,
}

impl SessionInfo {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// Logs a freshly opened connection in
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        conn: &mut Connection,
        credentials: &Credentials,
    ) -> Result<SessionInfo>;
}
