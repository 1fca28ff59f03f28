use anyhow::Result;
use async_trait::async_trait;

use crate::{
    auth::wampcra::KeyDerivationParams,
    core::{
        error::AuthenticationError,
        hash::HashMap,
        uri::Uri,
    },
};

/// A user known to a router's wampcra database.
#[derive(Debug, Clone)]
pub struct CraUser {
    /// The shared secret.
    pub secret: String,
    /// The role assigned to the user at WELCOME.
    pub role: String,
    /// Optional key derivation parameters.
    ///
    /// When present, both sides stretch the secret with PBKDF2 before
    /// signing, so the plain secret never acts as an HMAC key.
    pub key_derivation: Option<KeyDerivationParams>,
}

impl CraUser {
    /// Creates a new user with the given secret and role.
    pub fn new<S, T>(secret: S, role: T) -> Self
    where
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            secret: secret.into(),
            role: role.into(),
            key_derivation: None,
        }
    }
}

/// A lookup source for wampcra users.
///
/// A router configured with a user database challenges every HELLO; sessions
/// cannot be established anonymously.
#[async_trait]
pub trait CraUserDatabase: Send + Sync {
    /// Looks up the user with the given authentication ID in the given realm.
    async fn user(&self, realm: &Uri, auth_id: &str) -> Result<CraUser>;
}

/// An in-memory [`CraUserDatabase`], keyed by authentication ID across all
/// realms.
#[derive(Debug, Default)]
pub struct MemoryCraUserDatabase {
    users: HashMap<String, CraUser>,
}

impl MemoryCraUserDatabase {
    /// Creates a database over the given users.
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = (S, CraUser)>,
        S: Into<String>,
    {
        Self {
            users: users
                .into_iter()
                .map(|(auth_id, user)| (auth_id.into(), user))
                .collect(),
        }
    }
}

#[async_trait]
impl CraUserDatabase for MemoryCraUserDatabase {
    async fn user(&self, _: &Uri, auth_id: &str) -> Result<CraUser> {
        self.users
            .get(auth_id)
            .cloned()
            .ok_or_else(|| AuthenticationError::UnknownAuthId.into())
    }
}
