//! `UserAgent`: the top-level facade gluing the transaction layer, the
//! dialog layer, and credential/flow-tracking concerns into the handful of
//! calls an application actually wants (register, invite, respond to an
//! inbound call, send an out-of-dialog request).

use crate::dialog::authenticate::{handle_client_authenticate, Credential};
use crate::dialog::dialog::{DialogState, TerminatedReason};
use crate::dialog::dialog_layer::DialogLayer;
use crate::dialog::invitation::InviteOption;
use crate::dialog::registration::Registration;
use crate::dialog::server_dialog::ServerInviteDialog;
use crate::dialog::DialogId;
use crate::flow_tracker::FlowTracker;
use crate::transaction::endpoint::{Endpoint, EndpointOption};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{Transaction, TransactionEventReceiver, TransactionEventSender};
use crate::transport::Connection;
use crate::{Error, Result};
use rsip::{Response, SipMessage, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events an application can subscribe to instead of polling dialog state
/// directly. Fed by the dispatch loop and by dialogs as they terminate.
#[derive(Debug, Clone)]
pub enum UaEvent {
    NewRequest(DialogId),
    ResponseReceived(DialogId, StatusCode),
    DialogTerminated(DialogId, TerminatedReason),
    TransactionTimeout(TransactionKey),
}

pub type UaEventReceiver = mpsc::UnboundedReceiver<UaEvent>;
type UaEventSender = mpsc::UnboundedSender<UaEvent>;

/// Realm-keyed credential table. A user agent typically holds one entry per
/// registrar/proxy it talks to; lookups happen by the realm a 401/407
/// challenge names.
#[derive(Default)]
pub struct CredentialStore {
    by_realm: RwLock<HashMap<String, Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cred: Credential) {
        let realm = cred.realm.clone().unwrap_or_default();
        self.by_realm.write().unwrap().insert(realm, cred);
    }

    pub fn get(&self, realm: &str) -> Option<Credential> {
        self.by_realm.read().unwrap().get(realm).cloned()
    }

    /// The single credential held, if there is exactly one — the common
    /// case of a user agent registered against one account.
    pub fn only(&self) -> Option<Credential> {
        let table = self.by_realm.read().unwrap();
        if table.len() == 1 {
            table.values().next().cloned()
        } else {
            None
        }
    }
}

/// Top-level handle to a running SIP user agent: one transport-bound
/// `Endpoint`, one `DialogLayer`, a credential table, and an event stream.
#[derive(Clone)]
pub struct UserAgent {
    pub endpoint: Endpoint,
    pub dialog_layer: DialogLayer,
    pub credentials: Arc<CredentialStore>,
    events: UaEventSender,
}

impl UserAgent {
    pub fn new(option: EndpointOption) -> (Self, UaEventReceiver) {
        let endpoint = Endpoint::new(option);
        let dialog_layer = DialogLayer::new(endpoint.inner.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                endpoint,
                dialog_layer,
                credentials: Arc::new(CredentialStore::new()),
                events: events_tx,
            },
            events_rx,
        )
    }

    /// Registers a `FlowTracker` with the underlying endpoint, which invokes
    /// it on every inbound message `dispatch` sees and every outbound one a
    /// transaction sends.
    pub fn with_flow_tracker(self, tracker: Arc<dyn FlowTracker>) -> Self {
        self.endpoint.set_flow_tracker(tracker);
        self
    }

    pub fn add_transport(&self, conn: Connection) {
        self.endpoint.add_transport(conn);
    }

    /// Spawns the inbound dispatch loop for one bound connection and wires
    /// the dialog layer's own transaction-routing loop to receive whatever
    /// the endpoint does not match to an already-open transaction.
    pub fn serve(&self, conn: Connection) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let (tu_tx, tu_rx): (TransactionEventSender, TransactionEventReceiver) = mpsc::unbounded_channel();
        self.endpoint.set_tu_sender(tu_tx);

        let dispatch = tokio::spawn(self.endpoint.clone().serve_connection(conn));

        let dialog_layer = self.dialog_layer.clone();
        let events = self.events.clone();
        let (new_dialogs_tx, mut new_dialogs_rx) =
            mpsc::unbounded_channel::<(ServerInviteDialog, Transaction)>();
        let routing = tokio::spawn(async move {
            let forward_events = events.clone();
            tokio::spawn(async move {
                while let Some((dialog, tx)) = new_dialogs_rx.recv().await {
                    let id = dialog.inner.id.lock().unwrap().clone();
                    let _ = forward_events.send(UaEvent::NewRequest(id));
                    // The application is expected to have its own listener
                    // for inbound calls; without one, politely decline so
                    // the peer is not left waiting on its Timer B.
                    if let Err(e) = dialog.reject(tx, StatusCode::NotImplemented).await {
                        warn!("failed to auto-decline unclaimed inbound INVITE: {}", e);
                    }
                }
            });
            dialog_layer.serve(tu_rx, new_dialogs_tx).await;
        });

        (dispatch, routing)
    }

    pub fn shutdown(&self) {
        self.endpoint.shutdown();
    }

    /// Registers with `server`, retrying once on a 401/407 using the
    /// matching `Credential` from the credential store.
    pub async fn register(&self, server: &str, realm: Option<&str>) -> Result<Response> {
        let credential = match realm {
            Some(realm) => self.credentials.get(realm),
            None => self.credentials.only(),
        };
        let mut registration = Registration::new(self.endpoint.inner.clone(), credential);
        registration.register(&server.to_string()).await
    }

    /// Places an outbound call, returning the confirmed dialog and final
    /// response once the peer answers (or the attempt fails).
    pub async fn invite(
        &self,
        opt: InviteOption,
    ) -> Result<(DialogId, Option<Response>)> {
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(state) = state_rx.recv().await {
                if let Some(event) = event_for_state(&state) {
                    let _ = events.send(event);
                }
            }
        });
        let (dialog, resp) = self.dialog_layer.do_invite(opt, state_tx).await?;
        Ok((dialog.inner.id.lock().unwrap().clone(), resp))
    }

    /// Ends a confirmed call or cancels one still ringing.
    pub async fn hangup(&self, id: &DialogId) -> Result<()> {
        let dialog = self
            .dialog_layer
            .get_dialog(id)
            .ok_or_else(|| Error::DialogGone(id.clone()))?;
        let result = dialog.hangup().await;
        self.dialog_layer.remove_dialog(id);
        result
    }

    /// Sends a request with no dialog of its own (OPTIONS keepalive, a bare
    /// MESSAGE, etc.), transparently retrying once on a digest challenge.
    pub async fn send_out_of_dialog(
        &self,
        request: rsip::Request,
        credential: Option<Credential>,
    ) -> Result<Response> {
        retry_on_challenge(&self.endpoint, request, credential).await
    }
}

fn event_for_state(state: &DialogState) -> Option<UaEvent> {
    match state {
        DialogState::Early(id, resp) => Some(UaEvent::ResponseReceived(id.clone(), resp.status_code.clone())),
        DialogState::Confirmed(id) => Some(UaEvent::ResponseReceived(id.clone(), StatusCode::OK)),
        DialogState::Terminated(id, reason) => Some(UaEvent::DialogTerminated(id.clone(), reason.clone())),
        _ => None,
    }
}

/// Sends `request` as a fresh client transaction and, if challenged with a
/// 401/407 and `credential` is available, rebuilds and resends it once with
/// an `Authorization`/`Proxy-Authorization` header. This is the same loop
/// `DialogInner::do_request` and `Registration::register` each already run
/// inline against their own transaction state; this standalone copy exists
/// for requests sent outside of any dialog, where there is no `DialogInner`
/// to own the retry.
pub async fn retry_on_challenge(
    endpoint: &Endpoint,
    request: rsip::Request,
    credential: Option<Credential>,
) -> Result<Response> {
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let (conn, dest) = endpoint
        .inner
        .transport_layer
        .lookup(&request.uri, endpoint.inner.transport_tx.clone())
        .await?;
    let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), Some(conn));
    tx.destination = Some(dest);
    tx.send().await?;

    let mut auth_sent = false;
    while let Some(msg) = tx.receive().await {
        let resp = match msg {
            SipMessage::Response(resp) => resp,
            SipMessage::Request(_) => continue,
        };
        match resp.status_code {
            StatusCode::Trying => continue,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired if !auth_sent => {
                auth_sent = true;
                match &credential {
                    Some(cred) => {
                        let seq = endpoint.inner.next_cseq();
                        tx = handle_client_authenticate(seq, tx, resp, cred).await?;
                        tx.send().await?;
                        continue;
                    }
                    None => {
                        let realm = crate::dialog::authenticate::challenge_realm(&resp)
                            .unwrap_or_else(|_| "unknown".to_string());
                        return Err(Error::AuthRequired(realm));
                    }
                }
            }
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                return Err(Error::AuthFailed);
            }
            _ => {
                debug!("out-of-dialog request answered with {}", resp.status_code);
                return Ok(resp);
            }
        }
    }
    Err(Error::Timeout)
}
