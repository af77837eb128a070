// ABOUTME: Test support utilities.
// ABOUTME: Tracing setup and session fixtures over the in-memory driver.

use berth::runtime::{ContainerSpec, MemoryDriver};
use berth::{RetryPolicy, RuntimeSession, SessionSettings};
use std::sync::Once;
use std::time::Duration;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("berth=debug".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Settings with fast retries and no background poller.
#[allow(dead_code)]
pub fn quick_settings() -> SessionSettings {
    SessionSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        },
        poll_interval: None,
        stop_timeout: Duration::from_secs(2),
        kill_grace: Duration::from_secs(1),
        ..SessionSettings::default()
    }
}

/// A session over a fresh memory driver, plus a handle on the driver for
/// fault injection.
#[allow(dead_code)]
pub async fn memory_session() -> (RuntimeSession<MemoryDriver>, MemoryDriver) {
    memory_session_with(quick_settings()).await
}

#[allow(dead_code)]
pub async fn memory_session_with(
    settings: SessionSettings,
) -> (RuntimeSession<MemoryDriver>, MemoryDriver) {
    init_tracing();
    let driver = MemoryDriver::new();
    let session = RuntimeSession::with_driver(driver.clone(), settings)
        .await
        .unwrap();
    (session, driver)
}

#[allow(dead_code)]
pub fn alpine() -> ContainerSpec {
    ContainerSpec::builder("alpine:3.20")
        .command(["sleep", "3600"])
        .build()
        .unwrap()
}
