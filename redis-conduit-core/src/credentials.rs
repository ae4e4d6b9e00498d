//! Credential sources for the connection handshake

use crate::error::RedisResult;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Username and password sent during the handshake
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// ACL username; `None` authenticates as `default`
    pub username: Option<String>,
    /// Password; `None` skips authentication entirely
    pub password: Option<String>,
}

impl Credentials {
    /// Credentials with a password only
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            username: None,
            password: Some(password.into()),
        }
    }

    /// Credentials with both username and password
    pub fn user(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Whether there is anything to authenticate with
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.password.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Retry policy a provider applies to its own transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// A source of credentials, consulted on every (re)connect.
///
/// `refresh` is called once when the server rejects the current
/// credentials, so rotating providers get a chance to fetch new ones.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + fmt::Debug {
    /// Current credentials
    async fn credentials(&self) -> RedisResult<Credentials>;

    /// Fetch fresh credentials after an authentication failure
    async fn refresh(&self) -> RedisResult<Credentials> {
        self.credentials().await
    }

    /// How often a failing `credentials`/`refresh` call may be retried
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Provider that always returns the same credentials
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    /// Wrap fixed credentials
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn credentials(&self) -> RedisResult<Credentials> {
        Ok(self.0.clone())
    }
}
