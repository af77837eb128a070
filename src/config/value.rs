// ABOUTME: Label values that are either literal or read from the environment.
// ABOUTME: Resolved once when a session is opened.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// A configured value, either written inline or taken from an env var.
///
/// ```yaml
/// labels:
///   team: infra
///   commit: { env: GIT_COMMIT, default: unknown }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl ConfigValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            ConfigValue::Literal(s) => Ok(s.clone()),
            ConfigValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(val),
                Err(_) => default
                    .clone()
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Literal(value.to_string())
    }
}

pub fn resolve_values(map: &BTreeMap<String, ConfigValue>) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, v)| v.resolve().map(|resolved| (k.clone(), resolved)))
        .collect()
}
