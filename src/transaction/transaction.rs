//! The four RFC 3261 transaction state machines, expressed as
//! one tagged `Transaction` type with an exhaustive `TransactionState` rather
//! than four distinct structs, favoring tagged variants over a subclassing
//! hierarchy.

use super::endpoint::EndpointInnerRef;
use super::key::{TransactionKey, TransactionKind, TransactionRole};
use super::timer::{next_backoff, TimerKind, TimerSlot};
use crate::transport::{Connection, SipAddr};
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::{Request, Response, SipMessage, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type TransactionEventSender = mpsc::UnboundedSender<Transaction>;
pub type TransactionEventReceiver = mpsc::UnboundedReceiver<Transaction>;

pub type InboundSender = mpsc::UnboundedSender<SipMessage>;
pub type InboundReceiver = mpsc::UnboundedReceiver<SipMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Default)]
struct Timers {
    a: TimerSlot,
    b: TimerSlot,
    d: TimerSlot,
    e: TimerSlot,
    f: TimerSlot,
    g: TimerSlot,
    h: TimerSlot,
    i: TimerSlot,
    j: TimerSlot,
    k: TimerSlot,
}

impl Timers {
    /// Waits on whichever timer slots are currently armed for this
    /// transaction's kind/state, returning the first one to fire.
    async fn next_fire(&self, kind: TransactionKind, state: TransactionState) -> TimerKind {
        use TransactionKind::*;
        use TransactionState::*;
        match (kind, state) {
            (InviteClient, Calling) => {
                tokio::select! {
                    _ = self.a.wait() => TimerKind::A,
                    _ = self.b.wait() => TimerKind::B,
                }
            }
            (InviteClient, Proceeding) => {
                self.b.wait().await;
                TimerKind::B
            }
            (InviteClient, Completed) => {
                self.d.wait().await;
                TimerKind::D
            }
            (NonInviteClient, Trying) | (NonInviteClient, Proceeding) => {
                tokio::select! {
                    _ = self.e.wait() => TimerKind::E,
                    _ = self.f.wait() => TimerKind::F,
                }
            }
            (NonInviteClient, Completed) => {
                self.k.wait().await;
                TimerKind::K
            }
            (InviteServer, Completed) => {
                tokio::select! {
                    _ = self.g.wait() => TimerKind::G,
                    _ = self.h.wait() => TimerKind::H,
                }
            }
            (InviteServer, Confirmed) => {
                self.i.wait().await;
                TimerKind::I
            }
            (NonInviteServer, Completed) => {
                self.j.wait().await;
                TimerKind::J
            }
            _ => std::future::pending().await,
        }
    }
}

/// One SIP transaction. Owns the last
/// request/response it sent or received, the timers driving its own FSM,
/// and a reference to the transport hop it was created on.
pub struct Transaction {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub state: TransactionState,
    pub role: TransactionRole,
    pub original: Request,
    pub last_response: Option<Response>,
    pub connection: Option<Connection>,
    pub destination: Option<SipAddr>,
    pub cancel_pending: bool,
    pub(crate) endpoint: EndpointInnerRef,
    timers: Timers,
    inbound: Option<InboundReceiver>,
    inbound_tx: InboundSender,
}

impl Transaction {
    /// Creates a client transaction and registers it with the endpoint's
    /// transaction table so inbound responses reach it. Callers that build
    /// a request directly (the dialog layer, registration) rely on this
    /// rather than registering a second time themselves.
    pub fn new_client(
        key: TransactionKey,
        request: Request,
        endpoint: EndpointInnerRef,
        connection: Option<Connection>,
    ) -> Self {
        let kind = TransactionKind::for_method(&request.method, TransactionRole::Client);
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.register(key.clone(), tx.clone());
        Self {
            key,
            kind,
            state: if kind.is_invite() {
                TransactionState::Calling
            } else {
                TransactionState::Trying
            },
            role: TransactionRole::Client,
            original: request,
            last_response: None,
            connection,
            destination: None,
            cancel_pending: false,
            endpoint,
            timers: Timers::default(),
            inbound: Some(rx),
            inbound_tx: tx,
        }
    }

    pub fn new_server(
        key: TransactionKey,
        request: Request,
        endpoint: EndpointInnerRef,
        connection: Option<Connection>,
    ) -> Self {
        let kind = TransactionKind::for_method(&request.method, TransactionRole::Server);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            key,
            kind,
            state: if kind.is_invite() {
                TransactionState::Proceeding
            } else {
                TransactionState::Trying
            },
            role: TransactionRole::Server,
            original: request,
            last_response: None,
            connection,
            destination: None,
            cancel_pending: false,
            endpoint,
            timers: Timers::default(),
            inbound: Some(rx),
            inbound_tx: tx,
        }
    }

    /// The sender the endpoint's dispatcher uses to hand this transaction
    /// matched retransmissions/ACKs after it has been created.
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound_tx.clone()
    }

    fn reliable(&self) -> bool {
        self.connection.as_ref().map(|c| c.reliable()).unwrap_or(false)
    }

    async fn resolve_destination(&self) -> Result<SipAddr> {
        if let Some(dest) = &self.destination {
            return Ok(dest.clone());
        }
        crate::transport::resolve(&self.original.uri).await
    }

    /// Binds `self.connection`/`self.destination` via the endpoint's
    /// transport layer if this transaction was created without one (the
    /// common case for a client transaction built directly by the dialog
    /// layer rather than through `Endpoint::send_request`).
    async fn ensure_connection(&mut self) -> Result<SipAddr> {
        if self.connection.is_none() {
            let (conn, dest) = self
                .endpoint
                .transport_layer
                .lookup(&self.original.uri, self.endpoint.transport_tx.clone())
                .await?;
            self.connection = Some(conn);
            self.destination = Some(dest);
        }
        self.resolve_destination().await
    }

    async fn transport_send(&self, msg: &SipMessage, dest: &SipAddr) -> Result<()> {
        match &self.connection {
            Some(conn) => {
                conn.send(msg, dest).await?;
                self.endpoint.notify_sent(msg, dest);
                Ok(())
            }
            None => Err(Error::TransportLost(
                "transaction has no bound transport".to_string(),
            )),
        }
    }

    /// Sends the initial request (client transactions only) and arms the
    /// timers appropriate for its kind.
    pub async fn send(&mut self) -> Result<()> {
        if self.role != TransactionRole::Client {
            return Err(Error::ProtocolViolation(
                "send() called on a server transaction".to_string(),
            ));
        }
        let dest = self.ensure_connection().await?;
        let t1 = self.endpoint.timer_config.t1;
        let t2 = self.endpoint.timer_config.t2;
        self.transport_send(&SipMessage::Request(self.original.clone()), &dest)
            .await?;
        self.destination = Some(dest);

        match self.kind {
            TransactionKind::InviteClient => {
                if !self.reliable() {
                    self.timers.a.arm(t1);
                }
                self.timers.b.arm(t1 * 64);
            }
            TransactionKind::NonInviteClient => {
                if !self.reliable() {
                    self.timers.e.arm(t1);
                } else {
                    let _ = t2;
                }
                self.timers.f.arm(t1 * 64);
            }
            _ => unreachable!("send() is only valid for client transactions"),
        }
        Ok(())
    }

    /// Retransmits the last request/response sent, honoring the current
    /// back-off schedule. Used internally by `receive()` on Timer A/E/G.
    async fn retransmit(&mut self, msg: SipMessage) -> Result<()> {
        let dest = self.destination.clone().ok_or_else(|| {
            Error::ProtocolViolation("retransmit with no destination".to_string())
        })?;
        self.transport_send(&msg, &dest).await
    }

    /// Drives the transaction forward, returning the next response (client
    /// side) once the peer event loop delivers one, `None` once the
    /// transaction has reached `Terminated`. Handles retransmission and
    /// timer-driven transitions internally.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        loop {
            if self.state == TransactionState::Terminated {
                self.endpoint.unregister(&self.key);
                return None;
            }
            let inbound = self.inbound.as_mut()?;
            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Some(out) = self.on_message(msg).await {
                                return Some(out);
                            }
                        }
                        None => {
                            self.endpoint.unregister(&self.key);
                            return None;
                        }
                    }
                }
                fired = self.timers.next_fire(self.kind, self.state) => {
                    if let Err(e) = self.on_timer(fired).await {
                        warn!("timer handling error on {}: {}", self.key, e);
                    }
                    if self.state == TransactionState::Terminated {
                        self.endpoint.unregister(&self.key);
                        return None;
                    }
                }
            }
        }
    }

    async fn on_timer(&mut self, fired: TimerKind) -> Result<()> {
        use TimerKind::*;
        match fired {
            A => {
                let cur = self.timers.a.interval().unwrap_or(self.endpoint.timer_config.t1);
                self.retransmit(SipMessage::Request(self.original.clone())).await?;
                self.timers.a.arm(next_backoff(cur, None));
            }
            B => {
                info!("Timer B fired on {}: INVITE client timeout", self.key);
                self.state = TransactionState::Terminated;
            }
            D => {
                debug!("Timer D fired on {}: client transaction done", self.key);
                self.state = TransactionState::Terminated;
            }
            E => {
                let t2 = self.endpoint.timer_config.t2;
                let cur = self.timers.e.interval().unwrap_or(self.endpoint.timer_config.t1);
                self.retransmit(SipMessage::Request(self.original.clone())).await?;
                self.timers.e.arm(next_backoff(cur, Some(t2)));
            }
            F => {
                info!("Timer F fired on {}: non-INVITE client timeout", self.key);
                self.state = TransactionState::Terminated;
            }
            G => {
                let t2 = self.endpoint.timer_config.t2;
                let cur = self.timers.g.interval().unwrap_or(self.endpoint.timer_config.t1);
                if let Some(resp) = self.last_response.clone() {
                    self.retransmit(SipMessage::Response(resp)).await?;
                }
                self.timers.g.arm(next_backoff(cur, Some(t2)));
            }
            H => {
                warn!("Timer H fired on {}: no ACK received", self.key);
                self.state = TransactionState::Terminated;
                return Err(Error::ProtocolViolation("no ACK (Timer H)".to_string()));
            }
            I => {
                debug!("Timer I fired on {}: server transaction done", self.key);
                self.state = TransactionState::Terminated;
            }
            J => {
                debug!("Timer J fired on {}: server transaction done", self.key);
                self.state = TransactionState::Terminated;
            }
            K => {
                debug!("Timer K fired on {}: client transaction done", self.key);
                self.state = TransactionState::Terminated;
            }
        }
        Ok(())
    }

    async fn on_message(&mut self, msg: SipMessage) -> Option<SipMessage> {
        match (&msg, self.role) {
            (SipMessage::Response(resp), TransactionRole::Client) => {
                self.on_response(resp.clone()).await;
                Some(msg)
            }
            (SipMessage::Request(req), TransactionRole::Server) => {
                if req.method == rsip::Method::Ack && self.kind == TransactionKind::InviteServer {
                    // ACK to a non-2xx final response: this transaction is
                    // still open (a 2xx already terminated it in `respond()`
                    // before the ACK could ever reach here).
                    self.on_ack();
                    None
                } else if self.state == TransactionState::Completed {
                    // Retransmitted request while Completed: resend last
                    // final response without spawning a new transaction.
                    if let Some(resp) = self.last_response.clone() {
                        if let Some(dest) = self.destination.clone() {
                            let _ = self.transport_send(&SipMessage::Response(resp), &dest).await;
                        }
                    }
                    None
                } else {
                    Some(msg)
                }
            }
            _ => None,
        }
    }

    async fn on_response(&mut self, resp: Response) {
        let t1 = self.endpoint.timer_config.t1;
        let code = resp.status_code.clone();
        self.last_response = Some(resp);
        match self.kind {
            TransactionKind::InviteClient => match code.kind() {
                rsip::StatusCodeKind::Provisional => {
                    self.timers.a.cancel();
                    self.state = TransactionState::Proceeding;
                }
                rsip::StatusCodeKind::Successful => {
                    // Dialog layer owns the ACK for a 2xx; this transaction
                    // is done the instant a 2xx is seen.
                    self.state = TransactionState::Terminated;
                }
                _ => {
                    self.timers.a.cancel();
                    self.state = TransactionState::Completed;
                    if self.reliable() {
                        self.timers.d.arm(std::time::Duration::from_secs(0));
                    } else {
                        self.timers.d.arm(std::time::Duration::from_secs(32));
                    }
                }
            },
            TransactionKind::NonInviteClient => match code.kind() {
                rsip::StatusCodeKind::Provisional => {
                    self.state = TransactionState::Proceeding;
                }
                _ => {
                    self.state = TransactionState::Completed;
                    self.timers.e.cancel();
                    self.timers.f.cancel();
                    let t4 = self.endpoint.timer_config.t4;
                    self.timers.k.arm(if self.reliable() {
                        std::time::Duration::from_secs(0)
                    } else {
                        t4
                    });
                }
            },
            _ => {}
        }
        let _ = t1;
    }

    /// Sends a response from a server transaction, advancing its state
    ///.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.role != TransactionRole::Server {
            return Err(Error::ProtocolViolation(
                "respond() called on a client transaction".to_string(),
            ));
        }
        let dest = self.resolve_destination().await?;
        self.transport_send(&SipMessage::Response(response.clone()), &dest).await?;
        self.destination = Some(dest);
        let status = response.status_code.clone();
        self.last_response = Some(response);
        let t1 = self.endpoint.timer_config.t1;
        let t2 = self.endpoint.timer_config.t2;
        let t4 = self.endpoint.timer_config.t4;

        match self.kind {
            TransactionKind::InviteServer => match status.kind() {
                rsip::StatusCodeKind::Provisional => {
                    self.state = TransactionState::Proceeding;
                }
                rsip::StatusCodeKind::Successful => {
                    self.state = TransactionState::Terminated;
                }
                _ => {
                    self.state = TransactionState::Completed;
                    if !self.reliable() {
                        self.timers.g.arm(t1);
                    }
                    self.timers.h.arm(t1 * 64);
                }
            },
            TransactionKind::NonInviteServer => match status.kind() {
                rsip::StatusCodeKind::Provisional => {
                    self.state = TransactionState::Proceeding;
                }
                _ => {
                    self.state = TransactionState::Completed;
                    self.timers.j.arm(if self.reliable() {
                        std::time::Duration::from_secs(0)
                    } else {
                        t1 * 64
                    });
                }
            },
            _ => {}
        }
        let _ = t2;
        let _ = t4;
        Ok(())
    }

    /// Drives a server transaction to `Terminated` in the background after
    /// its final response has already been sent, so Timer G/H/I/J still run
    /// (retransmission on loss, `unregister()` on expiry) even though the
    /// caller has nothing further to do with the transaction itself.
    pub fn spawn_drain(mut self) {
        tokio::spawn(async move { while self.receive().await.is_some() {} });
    }

    /// Notifies an INVITE server transaction of the ACK it was waiting for
    /// in `Completed`.
    pub fn on_ack(&mut self) {
        if self.kind == TransactionKind::InviteServer && self.state == TransactionState::Completed {
            self.timers.g.cancel();
            self.timers.h.cancel();
            self.state = TransactionState::Confirmed;
            let t4 = self.endpoint.timer_config.t4;
            self.timers.i.arm(if self.reliable() {
                std::time::Duration::from_secs(0)
            } else {
                t4
            });
        }
    }
}
