//! `DialogLayer`: the dialog table plus the loop that turns newly dispatched
//! server transactions into either an inbound INVITE (new dialog) or an
//! in-dialog request routed to the dialog it belongs to.

use super::dialog::{Dialog, DialogStateSender};
use super::server_dialog::ServerInviteDialog;
use super::DialogId;
use crate::dialog::dialog::DialogInner;
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionRole;
use crate::transaction::transaction::{Transaction, TransactionEventReceiver};
use crate::Result;
use rsip::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub struct DialogLayerInner {
    pub dialogs: RwLock<HashMap<DialogId, Dialog>>,
    last_seq: AtomicU32,
}

/// Holds every dialog this user agent is party to, keyed by `DialogId`, and
/// owns the incoming-transaction loop that either attaches a transaction to
/// an existing dialog or spins up a new `ServerInviteDialog` for an inbound
/// INVITE.
#[derive(Clone)]
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub(crate) inner: Arc<DialogLayerInner>,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        Self {
            endpoint,
            inner: Arc::new(DialogLayerInner {
                dialogs: RwLock::new(HashMap::new()),
                last_seq: AtomicU32::new(crate::transaction::generate_random_cseq()),
            }),
        }
    }

    pub(crate) fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialogs.read().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    /// Removes a dialog and releases its resources (cancels its housekeeping
    /// token, if any).
    pub fn remove_dialog(&self, id: &DialogId) {
        if let Some(dialog) = self.inner.dialogs.write().unwrap().remove(id) {
            dialog.on_remove();
        }
    }

    /// Runs until `transactions` closes (the endpoint shut down). Each
    /// received transaction is either routed to the dialog it already
    /// belongs to, or — for a fresh INVITE — becomes a brand-new
    /// `ServerInviteDialog` that is announced on `new_dialogs` for the
    /// application to accept/reject.
    pub async fn serve(
        &self,
        mut transactions: TransactionEventReceiver,
        new_dialogs: tokio::sync::mpsc::UnboundedSender<(ServerInviteDialog, Transaction)>,
    ) {
        while let Some(tx) = transactions.recv().await {
            if let Err(e) = self.route(tx, &new_dialogs).await {
                warn!("dialog layer failed to route transaction: {}", e);
            }
        }
        debug!("dialog layer transaction loop ended");
    }

    async fn route(
        &self,
        mut tx: Transaction,
        new_dialogs: &tokio::sync::mpsc::UnboundedSender<(ServerInviteDialog, Transaction)>,
    ) -> Result<()> {
        let id = DialogId::from_request_as_uas(&tx.original)?;
        if let Some(mut dialog) = self.get_dialog(&id) {
            return dialog.handle(tx).await;
        }

        if tx.original.method != Method::Invite {
            // No dialog owns this request and it cannot start one; answer
            // politely instead of leaving the peer waiting on a retransmit
            // timer.
            let resp = crate::transaction::message::make_response(
                &tx.original,
                rsip::StatusCode::NotFound,
                None,
            );
            tx.respond(resp).await?;
            return Ok(());
        }

        let (state_tx, _state_rx) = tokio::sync::mpsc::unbounded_channel();
        let dlg_inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            tx.original.clone(),
            self.endpoint.clone(),
            state_tx,
            None,
            None,
        )?;
        let dialog = ServerInviteDialog::new(Arc::new(dlg_inner));
        self.inner
            .dialogs
            .write()
            .unwrap()
            .insert(id.clone(), Dialog::ServerInvite(dialog.clone()));
        info!("server invite dialog created: {}", id);

        if new_dialogs.send((dialog, tx)).is_err() {
            warn!("no listener for inbound dialogs, dropping INVITE {}", id);
            self.remove_dialog(&id);
        }
        Ok(())
    }

    /// Convenience used by an application that wants a push-model view of
    /// dialog state without wiring its own per-dialog channel: subscribes to
    /// every `DialogState` a dialog created under this layer ever emits.
    pub fn state_sender_for(&self, id: &DialogId) -> Option<DialogStateSender> {
        match self.get_dialog(id)? {
            Dialog::ClientInvite(d) => Some(d.inner.state_sender.clone()),
            Dialog::ServerInvite(d) => Some(d.inner.state_sender.clone()),
        }
    }
}
