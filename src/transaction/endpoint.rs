//! `Endpoint`: the transaction layer's entry point. Owns the transport
//! layer, the transaction table, and the single inbound-demux loop that is
//! the one writer of that table — everything downstream of a dispatch (the
//! per-transaction FSM tasks) then owns only private state, which keeps the
//! transaction table serialized even though each transaction's FSM runs as
//! its own `tokio::spawn`ed task.

use super::key::{TransactionKey, TransactionRole};
use super::message::{make_request, make_response};
use super::timer::TimerConfig;
use super::transaction::{InboundSender, Transaction, TransactionEventSender};
use crate::dialog::authenticate::Authenticator;
use crate::flow_tracker::FlowTracker;
use crate::transport::{Connection, NewConnectionSender, SipAddr, TransportLayer};
use crate::{Error, Result};
use rsip::{Param, Request, Response, SipMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub user_agent: String,
    pub callid_suffix: Option<String>,
    pub timer_config: TimerConfig,
}

impl Default for EndpointOption {
    fn default() -> Self {
        Self {
            user_agent: "sipua/0.1".to_string(),
            callid_suffix: None,
            timer_config: TimerConfig::default(),
        }
    }
}

/// A live server transaction slot: the dispatcher hands it matched inbound
/// messages and (on first arrival) notifies `tu_sender` so the dialog/UA
/// layer can pick the new transaction up.
struct TransactionSlot {
    inbound: InboundSender,
}

/// The ACK last sent for a 2xx final response, kept around under the same
/// key the 2xx itself would hash to (`TransactionKey::from_response`
/// collapses CSeq method `Ack`-or-`Invite` the same way). Lets a
/// retransmitted 2xx arriving after the INVITE client transaction has
/// already terminated still get its ACK retransmitted, per RFC 3261
/// §13.2.2.4.
struct RetainedAck {
    request: Request,
    connection: Connection,
    destination: SipAddr,
}

pub struct EndpointInner {
    pub option: EndpointOption,
    pub user_agent: String,
    pub timer_config: TimerConfig,
    pub transport_layer: TransportLayer,
    pub transport_tx: NewConnectionSender,
    pub cancel_token: CancellationToken,
    transactions: RwLock<HashMap<TransactionKey, TransactionSlot>>,
    tu_sender: RwLock<Option<TransactionEventSender>>,
    cseq_seed: AtomicU32,
    pub authenticator: Authenticator,
    last_acks: RwLock<HashMap<TransactionKey, RetainedAck>>,
    flow_tracker: RwLock<Option<Arc<dyn FlowTracker>>>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

impl EndpointInner {
    /// Registers the channel new server transactions (ones not matching any
    /// open transaction) are announced on. The dialog layer is the usual
    /// subscriber: an unmatched INVITE/BYE/etc. creates a new server
    /// transaction and is handed to the transaction-user.
    pub fn set_tu_sender(&self, sender: TransactionEventSender) {
        *self.tu_sender.write().unwrap() = Some(sender);
    }

    pub fn set_flow_tracker(&self, tracker: Arc<dyn FlowTracker>) {
        *self.flow_tracker.write().unwrap() = Some(tracker);
    }

    pub(crate) fn notify_sent(&self, msg: &SipMessage, peer: &SipAddr) {
        if let Some(tracker) = self.flow_tracker.read().unwrap().as_ref() {
            tracker.on_send(msg, peer);
        }
    }

    fn notify_received(&self, msg: &SipMessage, peer: &SipAddr) {
        if let Some(tracker) = self.flow_tracker.read().unwrap().as_ref() {
            tracker.on_recv(msg, peer);
        }
    }

    /// Builds a Via header for an outgoing request. Uses `addr` if given
    /// (e.g. a NAT-discovered public address), else the first transport's
    /// bound local address. `branch` overrides the freshly generated one,
    /// needed when a dialog layer retry must keep it (it never does for a
    /// genuinely new transaction, but CANCEL reuses the INVITE's branch).
    pub fn get_via(&self, addr: Option<SipAddr>, branch: Option<Param>) -> Result<rsip::typed::Via> {
        let addr = match addr {
            Some(a) => a,
            None => self
                .transport_layer
                .first_local_addr()
                .ok_or_else(|| Error::TransportLost("no transport bound".to_string()))?,
        };
        let transport = addr.r#type.unwrap_or(rsip::Transport::Udp);
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport,
            uri: rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            },
            params: vec![
                branch.unwrap_or_else(super::make_branch),
                rsip::Param::Other("rport".into(), None),
            ],
        })
    }

    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> Request {
        make_request(self, method, req_uri, via, from, to, seq)
    }

    pub fn make_response(&self, request: &Request, status: rsip::StatusCode, body: Option<Vec<u8>>) -> Response {
        make_response(request, status, body)
    }

    /// A fresh per-endpoint CSeq value, seeded randomly at construction
    /// and monotonically increasing thereafter for any
    /// caller that does not already own the dialog's own counter.
    pub fn next_cseq(&self) -> u32 {
        self.cseq_seed.fetch_add(1, Ordering::SeqCst)
    }

    fn find_transaction_key_for_message(msg: &SipMessage) -> Result<(TransactionKey, Option<TransactionKey>)> {
        match msg {
            SipMessage::Request(req) => {
                let server_key = TransactionKey::from_request(req, TransactionRole::Server)?;
                Ok((server_key, None))
            }
            SipMessage::Response(resp) => {
                let client_key = TransactionKey::from_response(resp)?;
                Ok((client_key, None))
            }
        }
    }

    /// Routes one inbound datagram/segment to its matching transaction, or
    /// (for requests that match none) creates a new server transaction and
    /// announces it on `tu_sender`. This is the dispatcher: the only place
    /// that mutates `self.transactions`.
    async fn dispatch(self: &Arc<Self>, msg: SipMessage, conn: Connection, peer: SipAddr) -> Result<()> {
        let (key, _) = Self::find_transaction_key_for_message(&msg)?;
        self.notify_received(&msg, &peer);

        if let SipMessage::Request(req) = &msg {
            if req.method == rsip::Method::Ack {
                let table = self.transactions.read().unwrap();
                if let Some(slot) = table.get(&key) {
                    let _ = slot.inbound.send(msg);
                    return Ok(());
                }
                // ACK to a 2xx is handled by the dialog layer directly, not
                // by any still-open transaction.
                drop(table);
                if let Some(sender) = self.tu_sender.read().unwrap().as_ref() {
                    let tx = Transaction::new_server(key, req.clone(), self.clone(), Some(conn));
                    let _ = sender.send(tx);
                }
                return Ok(());
            }
        }

        let existing = {
            let table = self.transactions.read().unwrap();
            table.get(&key).map(|slot| slot.inbound.clone())
        };
        if let Some(inbound) = existing {
            let _ = inbound.send(msg);
            return Ok(());
        }

        match msg {
            SipMessage::Request(req) => {
                let tx = Transaction::new_server(key.clone(), req, self.clone(), Some(conn));
                self.register(key, tx.inbound_sender());
                if let Some(sender) = self.tu_sender.read().unwrap().as_ref() {
                    let _ = sender.send(tx);
                } else {
                    warn!("no transaction-user registered, dropping new server transaction");
                }
            }
            SipMessage::Response(resp) => {
                if resp.status_code.kind() == rsip::StatusCodeKind::Successful
                    && self.resend_ack(&key).await
                {
                    debug!("retransmitted ACK for retransmitted {}", resp.status_code);
                } else {
                    trace!("response {} matched no open transaction, discarding", resp.status_code);
                }
            }
        }
        Ok(())
    }

    /// Remembers the ACK sent for a 2xx so a retransmission of that 2xx can
    /// be matched back to it and resent; see `resend_ack`.
    pub fn record_ack(&self, key: TransactionKey, request: Request, connection: Connection, destination: SipAddr) {
        self.last_acks.write().unwrap().insert(
            key,
            RetainedAck {
                request,
                connection,
                destination,
            },
        );
    }

    async fn resend_ack(&self, key: &TransactionKey) -> bool {
        let entry = self
            .last_acks
            .read()
            .unwrap()
            .get(key)
            .map(|ack| (ack.request.clone(), ack.connection.clone(), ack.destination.clone()));
        match entry {
            Some((request, connection, destination)) => {
                let msg = SipMessage::Request(request);
                let _ = connection.send(&msg, &destination).await;
                self.notify_sent(&msg, &destination);
                true
            }
            None => false,
        }
    }

    pub fn register(&self, key: TransactionKey, inbound: InboundSender) {
        self.transactions.write().unwrap().insert(key, TransactionSlot { inbound });
    }

    pub fn unregister(&self, key: &TransactionKey) {
        self.transactions.write().unwrap().remove(key);
    }
}

/// Owning handle to the transaction layer. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

impl Endpoint {
    pub fn new(option: EndpointOption) -> Self {
        let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EndpointInner {
                timer_config: option.timer_config,
                user_agent: option.user_agent.clone(),
                option,
                transport_layer: TransportLayer::new(),
                transport_tx,
                cancel_token: CancellationToken::new(),
                transactions: RwLock::new(HashMap::new()),
                tu_sender: RwLock::new(None),
                cseq_seed: AtomicU32::new(super::generate_random_cseq()),
                authenticator: Authenticator::new(),
                last_acks: RwLock::new(HashMap::new()),
                flow_tracker: RwLock::new(None),
            }),
        }
    }

    pub fn add_transport(&self, conn: Connection) {
        self.inner.transport_layer.add(conn);
    }

    pub fn set_tu_sender(&self, sender: TransactionEventSender) {
        self.inner.set_tu_sender(sender);
    }

    pub fn set_flow_tracker(&self, tracker: Arc<dyn FlowTracker>) {
        self.inner.set_flow_tracker(tracker);
    }

    /// Starts a new client transaction for `request`, sending it immediately.
    pub async fn send_request(&self, request: Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let (conn, dest) = self
            .inner
            .transport_layer
            .lookup(&request.uri, self.inner.transport_tx.clone())
            .await?;
        let mut tx = Transaction::new_client(key.clone(), request, self.inner.clone(), Some(conn));
        tx.destination = Some(dest);
        self.inner.register(key, tx.inbound_sender());
        tx.send().await?;
        Ok(tx)
    }

    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> Request {
        self.inner.make_request(method, req_uri, via, from, to, seq)
    }

    pub fn make_response(&self, request: &Request, status: rsip::StatusCode, body: Option<Vec<u8>>) -> Response {
        self.inner.make_response(request, status, body)
    }

    /// Runs the inbound dispatch loop for one bound connection until the
    /// endpoint is cancelled or the transport reports it is lost. Intended
    /// to be spawned once per `Connection` the endpoint owns.
    pub async fn serve_connection(self: Endpoint, conn: Connection) {
        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    debug!("endpoint cancelled, stopping dispatch loop");
                    return;
                }
                received = conn.recv() => {
                    match received {
                        Ok((msg, peer)) => {
                            if let Err(e) = self.inner.dispatch(msg, conn.clone(), peer).await {
                                warn!("dispatch error: {}", e);
                            }
                        }
                        Err(e) => {
                            warn!("transport recv error, stopping dispatch loop: {}", e);
                            return;
                        }
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }
}
