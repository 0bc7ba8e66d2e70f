//! Rate keys and the store key namespace derived from them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const MAX_KEY_LEN: usize = 255;

/// Why a key or prefix was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key must not be empty")]
    Empty,
    #[error("key must not be longer than 255 bytes (got {0})")]
    TooLong(usize),
    #[error("key must not contain ':' (reserved as the namespace separator)")]
    Separator,
    #[error("key must not contain whitespace or control characters")]
    Whitespace,
}

fn validate(value: &str) -> Result<(), KeyError> {
    if value.is_empty() {
        Err(KeyError::Empty)
    } else if value.len() > MAX_KEY_LEN {
        Err(KeyError::TooLong(value.len()))
    } else if value.contains(':') {
        Err(KeyError::Separator)
    } else if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Err(KeyError::Whitespace)
    } else {
        Ok(())
    }
}

/// Identifier scoping one shared rate budget (an API credential, an endpoint name, ...).
///
/// Counters under different keys never interact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateKey(Arc<str>);

impl RateKey {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        validate(&value)?;
        Ok(Self(Arc::from(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RateKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RateKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for RateKey {
    type Error = KeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for RateKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Maps a [`RateKey`] to the store keys holding its counters.
///
/// Layout: `<prefix>:<key>:window` and `<prefix>:<key>:inflight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: Arc<str>,
}

impl KeySpace {
    pub const DEFAULT_PREFIX: &'static str = "rate";

    pub fn new(prefix: impl Into<String>) -> Result<Self, KeyError> {
        let prefix = prefix.into();
        validate(&prefix)?;
        Ok(Self { prefix: Arc::from(prefix) })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn window_key(&self, key: &RateKey) -> String {
        format!("{}:{}:window", self.prefix, key)
    }

    pub fn inflight_key(&self, key: &RateKey) -> String {
        format!("{}:{}:inflight", self.prefix, key)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self { prefix: Arc::from(Self::DEFAULT_PREFIX) }
    }
}
