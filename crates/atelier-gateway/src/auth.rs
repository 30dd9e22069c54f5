//! Token-to-identity lookup at connect time.
//!
//! The real identity service is an external collaborator; the gateway only
//! needs the mapping from an opaque token to a [`UserId`].

use async_trait::async_trait;

use atelier_shared::types::UserId;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a connection token to a user identity. `None` rejects the
    /// connection.
    async fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Development authenticator: any non-empty token IS the user id.
///
/// Production deployments implement [`Authenticator`] over the identity
/// service instead.
pub struct DevTokenAuthenticator;

#[async_trait]
impl Authenticator for DevTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<UserId> {
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(UserId::new(token))
        }
    }
}
