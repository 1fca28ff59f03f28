use std::{
    fmt::Debug,
    sync::Arc,
};

use anyhow::Result;

use crate::auth::auth_method::AuthMethod;

/// A provider of the shared secret used to answer a CHALLENGE.
///
/// The provider is invoked only when a challenge actually arrives, so the
/// secret is never held by the session itself.
pub type SecretProvider = Arc<dyn Fn() -> Result<String> + Send + Sync>;

/// Credentials a peer presents when joining a realm.
#[derive(Clone)]
pub struct ClientCredentials {
    /// The authentication ID to announce in HELLO.
    pub auth_id: String,
    /// Authentication methods the peer is willing to perform.
    pub auth_methods: Vec<AuthMethod>,
    /// Provider of the shared secret.
    pub secret: SecretProvider,
}

impl ClientCredentials {
    /// Creates credentials for wampcra with the given secret provider.
    pub fn new<S, F>(auth_id: S, secret: F) -> Self
    where
        S: Into<String>,
        F: Fn() -> Result<String> + Send + Sync + 'static,
    {
        Self {
            auth_id: auth_id.into(),
            auth_methods: Vec::from_iter([AuthMethod::WampCra]),
            secret: Arc::new(secret),
        }
    }
}

impl Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("auth_id", &self.auth_id)
            .field("auth_methods", &self.auth_methods)
            .finish_non_exhaustive()
    }
}
