// ABOUTME: Phantom-typed backend identifiers.
// ABOUTME: Keeps container, sandbox and exec ids from being passed for one another.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Names the kind of object an [`Id`] points at.
pub trait IdKind {
    const LABEL: &'static str;
}

pub enum ContainerMarker {}
pub enum SandboxMarker {}
pub enum ExecMarker {}

impl IdKind for ContainerMarker {
    const LABEL: &'static str = "ContainerId";
}

impl IdKind for SandboxMarker {
    const LABEL: &'static str = "SandboxId";
}

impl IdKind for ExecMarker {
    const LABEL: &'static str = "ExecId";
}

/// An opaque identifier assigned by a backend.
///
/// The value is whatever the engine handed back (a 64-char hex digest for
/// Docker and containerd, a UUID-ish string for others). It is never parsed.
#[must_use = "ids reference backend objects and should not be ignored"]
pub struct Id<K: IdKind> {
    value: String,
    _kind: PhantomData<K>,
}

impl<K: IdKind> Id<K> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _kind: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// First 12 characters, the form engines print in listings.
    pub fn short(&self) -> &str {
        match self.value.char_indices().nth(12) {
            Some((idx, _)) => &self.value[..idx],
            None => &self.value,
        }
    }

    pub fn into_inner(self) -> String {
        self.value
    }
}

// Trait impls are written by hand so that the marker type needs no bounds.

impl<K: IdKind> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(K::LABEL).field(&self.value).finish()
    }
}

impl<K: IdKind> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<K: IdKind> Clone for Id<K> {
    fn clone(&self) -> Self {
        Self::new(self.value.clone())
    }
}

impl<K: IdKind> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<K: IdKind> Eq for Id<K> {}

impl<K: IdKind> Hash for Id<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<K: IdKind> Serialize for Id<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, K: IdKind> Deserialize<'de> for Id<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

pub type ContainerId = Id<ContainerMarker>;
pub type SandboxId = Id<SandboxMarker>;
pub type ExecId = Id<ExecMarker>;
