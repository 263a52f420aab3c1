//! Common test helpers for OSCLive
//!
//! - A simulated StudioLive answering the SysEx register-link protocol
//! - A scripted register bus
//! - An OSC client for the relay's TCP framing
//! - Condition-based waiting (no hardcoded sleeps)

mod bus;
mod client;
mod mixer;

pub use bus::ScriptedBus;
pub use client::{flatten, float_arg, TestClient};
pub use mixer::{SimAdapter, SimAdapterFactory, SimulatedMixer, NACK, ROUTE_CHANNEL};

use std::time::{Duration, Instant};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Port Allocation
// ============================================================================

/// Find an available TCP port for testing
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Blocking variant for tests driving backend threads
pub fn wait_until<F>(check: F, max_wait: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check() {
            return true;
        }
        std::thread::sleep(DEFAULT_CHECK_INTERVAL);
    }
    check()
}
