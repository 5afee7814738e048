//! Expansion: chaining terminals across cranes, one authorized hop at a
//! time.
//!
//! `expand_to` opens an expand operation on an existing terminal; the hub at
//! the far end looks up its crane to the requested next hop, creates a relay
//! terminal there and pumps payloads between the operation and the relay,
//! one frame at a time. The caller gets back a tunnel terminal that behaves
//! exactly like a first-hop terminal while its payload stream actually
//! terminates at the next hop. Per-hop flow queues stay independent, so the
//! slowest hop paces the whole chain, and the relay never learns more than
//! its two neighbors.

use std::sync::Arc;

use tokio::sync::mpsc;

use spn_core::error::{Error as CoreError, Result as CoreResult};
use spn_core::op::{OpMsg, RemoteOpContext};
use spn_core::terminal::Terminal;
use spn_core::Permissions;

use crate::crane::HubId;
use crate::registry;

/// Wire name of the expand operation.
pub const EXPAND_OP: &str = "expand";

/// Expand `terminal` through its peer to `hub`, returning the new outer
/// terminal.
///
/// # Errors
///
/// Fails locally with [`CoreError::PermissionDenied`] unless the peer has
/// granted `IsAuthenticated`; the underlying terminal keeps running. The
/// relay answers `HubUnreachable` when it has no crane to `hub`.
pub async fn expand_to(terminal: &Arc<Terminal>, hub: &HubId) -> CoreResult<Arc<Terminal>> {
    if !terminal.granted().has(Permissions::IS_AUTHENTICATED) {
        return Err(CoreError::PermissionDenied);
    }
    let attachment = terminal
        .start_op(EXPAND_OP, hub.as_str().as_bytes().to_vec())
        .await?;
    let op_id = attachment.op_id;
    let mut msgs = attachment.msgs;

    // Single-frame hand-off into the tunnel keeps client-side buffering at
    // one frame, like the relay side.
    let (in_tx, in_rx) = mpsc::channel(1);
    let facade = Terminal::tunnel(
        terminal.clone(),
        op_id,
        in_rx,
        format!("{}>{}", terminal.label(), hub),
    );

    let pump_facade = facade.clone();
    tokio::spawn(async move {
        loop {
            match msgs.recv().await {
                None => {
                    pump_facade.abandon("expansion lost", Some(CoreError::TerminalEnded));
                    return;
                }
                Some(OpMsg::Data(body)) => {
                    if in_tx.send(body).await.is_err() {
                        return;
                    }
                }
                Some(OpMsg::End(err)) => {
                    pump_facade.abandon("expansion ended", err);
                    return;
                }
            }
        }
    });
    Ok(facade)
}

/// Registry start function for the relay side of an expansion.
pub fn start_remote(ctx: RemoteOpContext) -> CoreResult<()> {
    let hub = std::str::from_utf8(&ctx.init)
        .map_err(|_| CoreError::Malformed("hub id is not utf-8".into()))?;
    if hub.is_empty() {
        return Err(CoreError::Malformed("empty hub id".into()));
    }
    tokio::spawn(run_relay(ctx.terminal, ctx.op_id, ctx.msgs, HubId::from(hub)));
    Ok(())
}

async fn run_relay(
    terminal: Arc<Terminal>,
    op_id: u32,
    mut msgs: mpsc::Receiver<OpMsg>,
    hub: HubId,
) {
    let Some(crane) = registry::crane_by_hub(&hub) else {
        tracing::debug!(terminal = %terminal.label(), %hub, "no crane assigned to hub");
        terminal
            .op_end(op_id, Some(&CoreError::HubUnreachable(hub.to_string())))
            .await;
        return;
    };

    let (up_tx, mut up_rx) = mpsc::channel::<Vec<u8>>(1);
    let relay = match crane.establish_relay_terminal(up_tx) {
        Ok(relay) => relay,
        Err(err) => {
            terminal.op_end(op_id, Some(&err)).await;
            return;
        }
    };
    tracing::debug!(
        terminal = %terminal.label(),
        relay = %relay.label(),
        %hub,
        "expansion relay running"
    );

    // Downstream: expansion payloads into the next hop's flow queue. The
    // single frame in flight here is the only relay-side buffering.
    {
        let relay = relay.clone();
        tokio::spawn(async move {
            loop {
                match msgs.recv().await {
                    Some(OpMsg::Data(body)) => {
                        if relay.forward(body).await.is_err() {
                            return;
                        }
                    }
                    Some(OpMsg::End(err)) => {
                        relay.end("expansion ended", err);
                        return;
                    }
                    None => {
                        relay.end("expansion host ended", Some(CoreError::TerminalEnded));
                        return;
                    }
                }
            }
        });
    }

    // Upstream: next-hop payloads back to the expansion initiator.
    {
        let terminal = terminal.clone();
        tokio::spawn(async move {
            while let Some(body) = up_rx.recv().await {
                if terminal.op_send(op_id, body, false).await.is_err() {
                    return;
                }
            }
        });
    }

    // Whichever of terminal, op, relay or next crane dies first: the relay
    // terminal observes it, and ending the op propagates it to the client.
    let end = relay.closed().await;
    terminal.op_end(op_id, end.error.as_ref()).await;
}
