// ABOUTME: Caller-chosen container names used as registry keys.
// ABOUTME: Restricted to a charset every backend accepts in names and labels.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MAX_LEN: usize = 63;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogicalNameError {
    #[error("container name cannot be empty")]
    Empty,

    #[error("container name exceeds {MAX_LEN} characters")]
    TooLong,

    #[error("container name must start and end with a letter or digit")]
    BadEdge,

    #[error("container name must be lowercase")]
    NotLowercase,

    #[error("invalid character {0:?} in container name")]
    InvalidChar(char),
}

/// The caller-facing identity of a container within a session.
///
/// Valid names are 1-63 characters of `[a-z0-9._-]`, starting and ending with
/// an alphanumeric. This fits Docker container names, CRI metadata names and
/// Kubernetes label values alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalName(String);

impl LogicalName {
    pub fn new(value: &str) -> Result<Self, LogicalNameError> {
        if value.is_empty() {
            return Err(LogicalNameError::Empty);
        }
        if value.len() > MAX_LEN {
            return Err(LogicalNameError::TooLong);
        }
        for c in value.chars() {
            if c.is_ascii_uppercase() {
                return Err(LogicalNameError::NotLowercase);
            }
            if !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')) {
                return Err(LogicalNameError::InvalidChar(c));
            }
        }
        let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
        if !edge_ok(value.chars().next()) || !edge_ok(value.chars().last()) {
            return Err(LogicalNameError::BadEdge);
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LogicalName {
    type Err = LogicalNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Borrow<str> for LogicalName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for LogicalName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for LogicalName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}
