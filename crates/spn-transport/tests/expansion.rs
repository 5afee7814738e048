//! Multi-hop expansion: authorize at each hop, run ops on the outermost
//! terminal, and tear chains down from the middle.

use std::sync::Arc;
use std::time::Duration;

use spn_core::op::authorize::{self, install_access_authority};
use spn_core::op::counter;
use spn_core::terminal::{Terminal, TerminalOptions, TerminalState};
use spn_core::testing::TestAuthority;
use spn_core::{Error as CoreError, Permissions};
use spn_crypto::Identity;
use spn_transport::{
    expand_to, install_default_ops, registry, Crane, CraneOptions, HubId, RemoteHub, TestShip,
};

fn install() {
    let _ = tracing_subscriber::fmt::try_init();
    install_default_ops();
    let _ = install_access_authority(Arc::new(TestAuthority {
        grant: Permissions::IS_AUTHENTICATED | Permissions::MAY_EXPAND,
    }));
}

/// One crane hop; the responder's identity authenticates it when encrypting.
async fn start_link(id: &str, encrypted: bool) -> (Arc<Crane>, Arc<Crane>) {
    let identity = Arc::new(Identity::generate());
    let (ship_a, ship_b) = TestShip::pair(Duration::from_millis(1), 400);
    let controller = Crane::new(
        ship_a,
        CraneOptions {
            id: format!("{id}-ctrl"),
            remote_hub: encrypted.then(|| RemoteHub {
                id: HubId::from(format!("{id}-peer").as_str()),
                key: identity.verifying_key(),
            }),
            optimal_min_load: 100,
            ..Default::default()
        },
    );
    let responder = Crane::new(
        ship_b,
        CraneOptions {
            id: format!("{id}-resp"),
            identity: encrypted.then(|| identity.clone()),
            optimal_min_load: 100,
            ..Default::default()
        },
    );
    let (started_a, started_b) = tokio::join!(controller.start(), responder.start());
    started_a.expect("controller start failed");
    started_b.expect("responder start failed");
    controller.mark_public();
    responder.mark_public();
    (controller, responder)
}

async fn run_counter(terminal: &Arc<Terminal>, count_to: u64) {
    let mut handle = counter::start(
        terminal,
        counter::CounterOptions {
            client_count_to: count_to,
            server_count_to: count_to,
            flush: false,
        },
    )
    .await
    .expect("failed to start counter");
    tokio::time::timeout(Duration::from_secs(30), handle.wait())
        .await
        .expect("counter timed out")
        .expect("counter failed");
}

async fn authorize_hop(terminal: &Arc<Terminal>) {
    let handle = authorize::start(terminal, b"test-token".to_vec())
        .await
        .expect("failed to start authorize");
    let granted = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("authorize timed out")
        .expect("authorize failed");
    assert!(granted.has(Permissions::IS_AUTHENTICATED));
    assert!(terminal.granted().has(Permissions::IS_AUTHENTICATED));
}

/// Hubs A through D, three cranes, authorize at every hop, counters on
/// every terminal along the way.
async fn run_expansion(test_id: &str, encrypted: bool, count_to: u64) {
    install();
    let (crane1, _crane1_resp) = start_link(&format!("{test_id}-1"), encrypted).await;
    let (crane2, _crane2_resp) = start_link(&format!("{test_id}-2"), encrypted).await;
    let (crane3, _crane3_resp) = start_link(&format!("{test_id}-3"), encrypted).await;

    let hub_c = HubId::from(format!("{test_id}-hubC").as_str());
    let hub_d = HubId::from(format!("{test_id}-hubD").as_str());
    registry::assign_crane(hub_c.clone(), crane2.clone());
    registry::assign_crane(hub_d.clone(), crane3.clone());

    let home = crane1
        .establish_terminal(&TerminalOptions::default())
        .expect("failed to establish home terminal");
    run_counter(&home, count_to).await;

    authorize_hop(&home).await;
    let middle = expand_to(&home, &hub_c).await.expect("expansion to C failed");
    run_counter(&middle, count_to).await;

    authorize_hop(&middle).await;
    let outer = expand_to(&middle, &hub_d).await.expect("expansion to D failed");
    run_counter(&outer, count_to).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_hop_expansion_plain() {
    run_expansion("plain3", false, 200).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_hop_expansion_encrypted() {
    run_expansion("enc3", true, 200).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expand_without_authorization_is_denied_locally() {
    install();
    let (crane1, _resp) = start_link("unauth-1", true).await;
    let home = crane1
        .establish_terminal(&TerminalOptions::default())
        .expect("failed to establish home terminal");

    let hub = HubId::from("unauth-nowhere");
    assert!(matches!(
        expand_to(&home, &hub).await,
        Err(CoreError::PermissionDenied)
    ));

    // The underlying terminal keeps running and is still usable.
    assert_eq!(home.state(), TerminalState::Established);
    run_counter(&home, 50).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expand_is_also_enforced_remotely() {
    install();
    let (crane1, _resp) = start_link("remote-enf-1", true).await;
    let home = crane1
        .establish_terminal(&TerminalOptions::default())
        .expect("failed to establish home terminal");

    // Forge only the local mirror; the peer terminal was never authorized.
    home.note_granted(Permissions::IS_AUTHENTICATED);
    let facade = expand_to(&home, &HubId::from("remote-enf-hub"))
        .await
        .expect("local gate should pass");
    let end = tokio::time::timeout(Duration::from_secs(2), facade.closed())
        .await
        .expect("facade did not end");
    assert_eq!(end.error, Some(CoreError::PermissionDenied));
    assert_eq!(home.state(), TerminalState::Established);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expanding_to_an_unknown_hub_fails() {
    install();
    let (crane1, _resp) = start_link("nohub-1", true).await;
    let home = crane1
        .establish_terminal(&TerminalOptions::default())
        .expect("failed to establish home terminal");

    authorize_hop(&home).await;
    let facade = expand_to(&home, &HubId::from("nohub-unassigned"))
        .await
        .expect("expansion start failed");
    let end = tokio::time::timeout(Duration::from_secs(2), facade.closed())
        .await
        .expect("facade did not end");
    assert!(matches!(end.error, Some(CoreError::HubUnreachable(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tearing_a_middle_crane_tears_the_chain() {
    install();
    let (crane1, _r1) = start_link("midtear-1", true).await;
    let (crane2, _r2) = start_link("midtear-2", true).await;
    let (crane3, _r3) = start_link("midtear-3", true).await;
    let hub_c = HubId::from("midtear-hubC");
    let hub_d = HubId::from("midtear-hubD");
    registry::assign_crane(hub_c.clone(), crane2.clone());
    registry::assign_crane(hub_d.clone(), crane3.clone());

    let home = crane1
        .establish_terminal(&TerminalOptions::default())
        .expect("failed to establish home terminal");
    authorize_hop(&home).await;
    let middle = expand_to(&home, &hub_c).await.expect("expansion to C failed");
    authorize_hop(&middle).await;
    let outer = expand_to(&middle, &hub_d).await.expect("expansion to D failed");

    // A counter big enough to still be running when the middle crane dies.
    let mut handle = counter::start(
        &outer,
        counter::CounterOptions {
            client_count_to: 500_000,
            server_count_to: 500_000,
            flush: false,
        },
    )
    .await
    .expect("failed to start counter");
    tokio::time::sleep(Duration::from_millis(100)).await;

    crane2.stop("test teardown");
    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("chain did not tear in time");
    assert_eq!(result, Err(CoreError::CraneTorn));

    let end = tokio::time::timeout(Duration::from_secs(5), outer.closed())
        .await
        .expect("outer terminal did not end");
    assert_eq!(end.error, Some(CoreError::CraneTorn));
}
