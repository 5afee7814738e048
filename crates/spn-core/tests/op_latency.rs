//! Latency probe over a simulated link.

use std::time::Duration;

use spn_core::op::latency;
use spn_core::testing::terminal_pair;
use spn_core::{Error, Permissions, TerminalOptions};

#[tokio::test(flavor = "multi_thread")]
async fn test_latency_measures_the_round_trip() {
    let link_delay = Duration::from_millis(10);
    let (a, b) = terminal_pair(link_delay, &TerminalOptions { queue_size: 10 });
    b.grant_permission(Permissions::IS_CRANE_CONTROLLER);

    let handle = latency::start(&a).await.expect("failed to start probe");
    let measured = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("probe timed out")
        .expect("probe failed");

    let expected = link_delay * 2;
    assert!(
        measured >= expected.mul_f64(0.9),
        "measured latency too low: {measured:?}"
    );
    assert!(
        measured <= expected.mul_f64(1.2),
        "measured latency too high: {measured:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_latency_requires_controller_permission() {
    let (a, _b) = terminal_pair(Duration::ZERO, &TerminalOptions::default());

    let handle = latency::start(&a).await.expect("failed to start probe");
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("no rejection"),
        Err(Error::PermissionDenied)
    ));
}
