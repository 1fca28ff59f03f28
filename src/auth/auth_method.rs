use std::fmt::Display;

use thiserror::Error;

/// An authentication method for establishing a WAMP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Challenge-response authentication: HMAC-SHA256 of a router-supplied
    /// challenge string under a shared secret.
    WampCra,
}

impl AuthMethod {
    /// The name of the method, as carried in HELLO `authmethods`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WampCra => "wampcra",
        }
    }
}

impl Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

#[derive(Debug, Error)]
#[error("unknown auth method")]
pub struct UnknownAuthMethod;

impl TryFrom<&str> for AuthMethod {
    type Error = UnknownAuthMethod;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "wampcra" => Ok(Self::WampCra),
            _ => Err(UnknownAuthMethod),
        }
    }
}
