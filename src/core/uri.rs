use std::{
    fmt::Display,
    sync::LazyLock,
};

use anyhow::Error;
use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
    de::{
        Unexpected,
        Visitor,
    },
};
use thiserror::Error;

use crate::core::error::{
    AuthenticationError,
    BasicError,
    HandshakeError,
    InteractionError,
    SessionClosedError,
    TransportError,
    WampError,
};

#[derive(Debug, Error)]
#[error("invalid URI")]
pub struct InvalidUri;

/// Validates a strict WAMP URI: dot-separated components of lowercase
/// letters, digits, and underscores.
pub fn validate_strict_uri<S>(uri: S) -> Result<(), InvalidUri>
where
    S: AsRef<str>,
{
    static RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^([0-9a-z_]+\.)*([0-9a-z_]+)$").unwrap());
    if !RE.is_match(uri.as_ref()) {
        return Err(InvalidUri);
    }
    Ok(())
}

/// A validated WAMP URI, identifying a realm, topic, procedure, or error.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Wraps a URI that is known to be valid, skipping validation.
    pub fn from_known<S>(value: S) -> Self
    where
        S: Into<String>,
    {
        Self(value.into())
    }

    /// The error URI communicated to a peer for the given error.
    pub fn for_error(error: &Error) -> Self {
        if error.is::<InvalidUri>() {
            Self::from_known("wamp.error.invalid_uri")
        } else if let Some(error) = error.downcast_ref::<BasicError>() {
            Self::from_known(format!("wamp.error.{}", error.uri_component()))
        } else if let Some(error) = error.downcast_ref::<InteractionError>() {
            Self::from_known(format!("wamp.error.{}", error.uri_component()))
        } else if error.is::<AuthenticationError>() {
            Self::from_known("wamp.error.not_authorized")
        } else if error.is::<SessionClosedError>() {
            Self::from_known("wamp.error.session_closed")
        } else if error.is::<TransportError>() || error.is::<HandshakeError>() {
            Self::from_known("wamp.error.network_failure")
        } else if let Some(error) = error.downcast_ref::<WampError>() {
            error.reason.clone()
        } else {
            Self::from_known("wamp.error.unknown_error")
        }
    }
}

impl Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for Uri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Uri {
    type Error = InvalidUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_strict_uri(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Uri {
    type Error = InvalidUri;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate_strict_uri(value)?;
        Ok(Self(value.to_owned()))
    }
}

impl From<Uri> for String {
    fn from(value: Uri) -> Self {
        value.0
    }
}

struct UriVisitor;

impl<'de> Visitor<'de> for UriVisitor {
    type Value = Uri;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a URI")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Uri::try_from(v.to_owned()).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(UriVisitor)
    }
}

#[cfg(test)]
mod uri_test {
    use crate::core::uri::{
        Uri,
        validate_strict_uri,
    };

    #[test]
    fn validates_strict_uris() {
        assert_matches::assert_matches!(validate_strict_uri("com"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com123"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.example.topic"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("com.example.TOPIC"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.example.topic_123-@!!"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.1"), Ok(()));
        assert_matches::assert_matches!(validate_strict_uri("."), Err(_));
        assert_matches::assert_matches!(validate_strict_uri(".."), Err(_));
        assert_matches::assert_matches!(validate_strict_uri(".com.example.topic1"), Err(_));
        assert_matches::assert_matches!(validate_strict_uri("com.example#"), Err(_));
    }

    #[test]
    fn fails_deserialization_invalid_uri() {
        assert_matches::assert_matches!(serde_json::from_str::<Uri>(r#""com.example.TOPIC""#), Err(err) => {
            assert!(err.to_string().contains("expected a URI"));
        });
    }
}
