//! Authorize operation: present a token, receive permission bits.
//!
//! The token itself is opaque to the data plane. The responder hands it to
//! the installed [`AccessAuthority`] (the access subsystem's contract) and
//! grants whatever bits come back on the hosting terminal, then reports
//! them to the initiator, which mirrors them for local gating of expansion.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::op::{OpAttachment, OpMsg, RemoteOpContext, ResultSlot};
use crate::permission::Permissions;
use crate::terminal::Terminal;
use crate::wire;

/// Wire name of the authorize operation.
pub const AUTHORIZE_OP: &str = "authorize";

/// External token validation, implemented by the access subsystem.
#[async_trait]
pub trait AccessAuthority: Send + Sync {
    /// Validate a token and return the permission bits it grants.
    async fn authorize(&self, token: &[u8]) -> Result<Permissions>;
}

static AUTHORITY: OnceLock<Arc<dyn AccessAuthority>> = OnceLock::new();

/// Install the process-wide access authority. Fails if one is active.
pub fn install_access_authority(authority: Arc<dyn AccessAuthority>) -> Result<()> {
    AUTHORITY
        .set(authority)
        .map_err(|_| Error::Internal("access authority already installed".into()))
}

fn authority() -> Option<Arc<dyn AccessAuthority>> {
    AUTHORITY.get().cloned()
}

/// Handle of a running authorize op.
pub struct AuthorizeHandle {
    result: oneshot::Receiver<std::result::Result<Permissions, Error>>,
}

impl AuthorizeHandle {
    /// Wait for the granted permission bits.
    pub async fn wait(self) -> Result<Permissions> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(Error::TerminalEnded),
        }
    }
}

/// Present `token` to the peer of `terminal`.
pub async fn start(terminal: &Arc<Terminal>, token: Vec<u8>) -> Result<AuthorizeHandle> {
    let attachment = terminal.start_op(AUTHORIZE_OP, token).await?;
    let (slot, result) = ResultSlot::new();
    tokio::spawn(await_grant(attachment, slot));
    Ok(AuthorizeHandle { result })
}

async fn await_grant(
    attachment: OpAttachment,
    slot: Arc<ResultSlot<std::result::Result<Permissions, Error>>>,
) {
    let OpAttachment {
        terminal, mut msgs, ..
    } = attachment;
    let mut granted: Option<Permissions> = None;
    loop {
        match msgs.recv().await {
            None => {
                slot.fulfill(Err(Error::TerminalEnded));
                return;
            }
            Some(OpMsg::Data(body)) => {
                let mut offset = 0;
                match wire::read_varint(&body, &mut offset) {
                    Ok(bits) if bits <= u64::from(u16::MAX) => {
                        let permissions = Permissions::from_bits(bits as u16);
                        terminal.note_granted(permissions);
                        granted = Some(permissions);
                    }
                    _ => {
                        slot.fulfill(Err(Error::Malformed("bad permission grant".into())));
                        return;
                    }
                }
            }
            Some(OpMsg::End(None)) => {
                match granted {
                    Some(permissions) => slot.fulfill(Ok(permissions)),
                    None => slot.fulfill(Err(Error::Malformed(
                        "authorize ended without a grant".into(),
                    ))),
                }
                return;
            }
            Some(OpMsg::End(Some(err))) => {
                slot.fulfill(Err(err));
                return;
            }
        }
    }
}

pub(crate) fn start_remote(ctx: RemoteOpContext) -> Result<()> {
    let RemoteOpContext {
        terminal,
        op_id,
        init,
        msgs: _msgs,
    } = ctx;
    tokio::spawn(async move {
        let Some(authority) = authority() else {
            tracing::warn!(terminal = %terminal.label(), "no access authority installed");
            terminal.op_end(op_id, Some(&Error::PermissionDenied)).await;
            return;
        };
        match authority.authorize(&init).await {
            Err(err) => {
                tracing::debug!(terminal = %terminal.label(), error = %err, "authorize failed");
                terminal.op_end(op_id, Some(&err)).await;
            }
            Ok(permissions) => {
                terminal.grant_permission(permissions);
                tracing::debug!(
                    terminal = %terminal.label(),
                    permissions = %permissions,
                    "authorize granted"
                );
                let mut body = Vec::with_capacity(3);
                wire::put_varint(&mut body, u64::from(permissions.bits()));
                if terminal.op_send(op_id, body, true).await.is_ok() {
                    terminal.op_end(op_id, None).await;
                }
            }
        }
    });
    Ok(())
}
