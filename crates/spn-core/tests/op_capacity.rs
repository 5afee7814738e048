//! Capacity probe over a simulated link: the measured rate must sit inside
//! the window the flow queue allows.

use std::time::Duration;

use spn_core::op::capacity;
use spn_core::testing::terminal_pair;
use spn_core::{Permissions, TerminalOptions};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_is_bounded_by_the_flow_window() {
    let link_delay = Duration::from_millis(50);
    let queue_size: u16 = 1000;
    let msg_size: usize = 1000;
    let volume: usize = 10_000_000; // 10 MB

    let (a, b) = terminal_pair(link_delay, &TerminalOptions { queue_size });
    b.grant_permission(Permissions::IS_CRANE_CONTROLLER);

    let handle = capacity::start(
        &a,
        capacity::CapacityOptions {
            volume,
            max_time: Duration::from_secs(20),
            msg_size,
        },
    )
    .await
    .expect("failed to start probe");
    let measured = handle.wait().await.expect("probe failed") as f64;

    // One credit moves one message; the window cycles once per link delay
    // in the ideal case.
    let theoretical =
        (msg_size as f64 * 8.0 * f64::from(queue_size)) / link_delay.as_secs_f64();
    assert!(
        measured <= theoretical * 1.1,
        "measured {measured} bit/s exceeds theoretical {theoretical} bit/s"
    );
    assert!(
        measured >= theoretical * 0.2,
        "measured {measured} bit/s far below theoretical {theoretical} bit/s"
    );
}
