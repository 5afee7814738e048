//! Crane-level tests over in-process ships: handshake, terminal carriage,
//! teardown and stray-frame handling.

use std::sync::Arc;
use std::time::Duration;

use spn_core::op::counter;
use spn_core::terminal::TerminalOptions;
use spn_core::{wire, Error as CoreError};
use spn_crypto::Identity;
use spn_transport::{Crane, CraneOptions, CraneState, HubId, RemoteHub, Ship, TestShip};

async fn start_crane_pair(
    prefix: &str,
    encrypted: bool,
) -> (Arc<Crane>, Arc<Crane>, Arc<Identity>) {
    let identity = Arc::new(Identity::generate());
    let (ship_a, ship_b) = TestShip::pair(Duration::from_millis(1), 400);
    let controller = Crane::new(
        ship_a,
        CraneOptions {
            id: format!("{prefix}-ctrl"),
            remote_hub: encrypted.then(|| RemoteHub {
                id: HubId::from(format!("{prefix}-peer").as_str()),
                key: identity.verifying_key(),
            }),
            optimal_min_load: 100,
            ..Default::default()
        },
    );
    let responder = Crane::new(
        ship_b,
        CraneOptions {
            id: format!("{prefix}-resp"),
            identity: encrypted.then(|| identity.clone()),
            optimal_min_load: 100,
            ..Default::default()
        },
    );
    let (started_a, started_b) = tokio::join!(controller.start(), responder.start());
    started_a.expect("controller start failed");
    started_b.expect("responder start failed");
    (controller, responder, identity)
}

async fn run_counter_over(controller: &Arc<Crane>, count_to: u64) {
    let terminal = controller
        .establish_terminal(&TerminalOptions { queue_size: 32 })
        .expect("failed to establish terminal");
    let mut handle = counter::start(
        &terminal,
        counter::CounterOptions {
            client_count_to: count_to,
            server_count_to: count_to,
            flush: false,
        },
    )
    .await
    .expect("failed to start counter");
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("counter timed out")
        .expect("counter failed");
    assert_eq!(handle.sent(), count_to);
    assert_eq!(handle.received(), count_to);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plain_crane_carries_a_terminal() {
    let (controller, responder, _) = start_crane_pair("plain", false).await;
    assert_eq!(controller.state(), CraneState::Running);
    assert!(controller.is_controller());
    assert!(!responder.is_controller());

    run_counter_over(&controller, 200).await;
    assert_eq!(controller.terminal_count(), 1);
    assert_eq!(responder.terminal_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_encrypted_crane_carries_a_terminal() {
    let (controller, responder, _) = start_crane_pair("enc", true).await;
    run_counter_over(&controller, 200).await;
    assert_eq!(responder.state(), CraneState::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_rejects_a_wrong_identity() {
    let actual = Arc::new(Identity::generate());
    let expected = Identity::generate();
    let (ship_a, ship_b) = TestShip::pair(Duration::from_millis(1), 400);
    let controller = Crane::new(
        ship_a,
        CraneOptions {
            id: "badkey-ctrl".into(),
            remote_hub: Some(RemoteHub {
                id: HubId::from("badkey-peer"),
                key: expected.verifying_key(),
            }),
            ..Default::default()
        },
    );
    let responder = Crane::new(
        ship_b,
        CraneOptions {
            id: "badkey-resp".into(),
            identity: Some(actual),
            ..Default::default()
        },
    );
    let (started_a, _) = tokio::join!(controller.start(), responder.start());
    assert!(started_a.is_err());
    assert_eq!(controller.state(), CraneState::Stopped);

    // The controller drops the ship, which tears the responder down too.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(responder.state(), CraneState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stopping_a_crane_tears_its_terminals() {
    let (controller, responder, _) = start_crane_pair("tear", false).await;
    let terminal = controller
        .establish_terminal(&TerminalOptions::default())
        .expect("failed to establish terminal");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(responder.terminal_count(), 1);

    controller.stop("test teardown");
    let end = tokio::time::timeout(Duration::from_secs(2), terminal.closed())
        .await
        .expect("terminal did not end");
    assert_eq!(end.error, Some(CoreError::CraneTorn));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.state(), CraneState::Stopped);
    assert_eq!(responder.state(), CraneState::Stopped);
    assert_eq!(responder.terminal_count(), 0);
}

/// Drive the responder side of the wire by hand: frames for unknown
/// terminal ids are dropped and counted unless they parse as initial data
/// with the right parity.
#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_frames_are_dropped_and_counted() {
    let (ship_a, ship_b) = TestShip::pair(Duration::ZERO, 400);
    let crane = Crane::new(
        ship_a,
        CraneOptions {
            id: "stray-ctrl".into(),
            ..Default::default()
        },
    );

    let starting = {
        let crane = crane.clone();
        tokio::spawn(async move { crane.start().await })
    };
    // Manual handshake: read the init, answer the ack.
    let blob = ship_b.read().await.expect("no handshake init");
    let mut offset = 0;
    let (terminal_id, body) = wire::parse_crane_frame(&blob, &mut offset).unwrap();
    assert_eq!(terminal_id, 0);
    assert_eq!(body[0], 1); // HandshakeInit
    let mut ack = Vec::new();
    wire::encode_crane_frame(&mut ack, 0, &[2, 1, 0]);
    ship_b.write(ack).await.unwrap();
    starting.await.unwrap().expect("controller start failed");

    // Garbage body for an unknown terminal id: dropped, counted.
    let mut stray = Vec::new();
    wire::encode_crane_frame(&mut stray, 8, &[0xFF, 0xFF, 0xFF]);
    ship_b.write(stray).await.unwrap();

    // Valid initial data but initiator parity (the controller allocates odd
    // ids itself): dropped, counted.
    let init = wire::InitialData {
        version: wire::WIRE_VERSION,
        queue_size: 16,
        expanded: false,
    };
    let mut wrong_parity = Vec::new();
    wire::encode_crane_frame(&mut wrong_parity, 7, &init.encode());
    ship_b.write(wrong_parity).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(crane.unknown_frames(), 2);
    assert_eq!(crane.terminal_count(), 0);

    // Correct parity: accepted as a remotely-initiated terminal.
    let mut accepted = Vec::new();
    wire::encode_crane_frame(&mut accepted, 8, &init.encode());
    ship_b.write(accepted).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(crane.unknown_frames(), 2);
    assert_eq!(crane.terminal_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_keepalive_refreshes_idleness() {
    let (controller, _responder, _) = start_crane_pair("ping", false).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(controller.idle_time() >= Duration::from_millis(100));

    controller.ping();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.idle_time() < Duration::from_millis(50));
}
