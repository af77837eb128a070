// ABOUTME: Sealed trait pattern for backend driver traits.
// ABOUTME: Only the drivers in this crate may implement the capability traits.

/// Sealed trait to prevent external implementations.
///
/// Only types that implement Sealed (the Docker, CRI and in-memory drivers)
/// can implement the capability traits, so methods can be added without
/// breaking downstream code.
pub trait Sealed {}
