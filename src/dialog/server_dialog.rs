use super::authenticate::Credential;
use super::dialog::{DialogInnerRef, DialogState, TerminatedReason};
use crate::transaction::transaction::Transaction;
use crate::Result;
use rsip::{Method, StatusCode};
use tracing::info;

/// A UAS INVITE dialog: born from an inbound INVITE, owns the server
/// transaction through its provisional/final response and the ACK that
/// confirms it, then handles in-dialog requests (BYE, ...) for the rest of
/// the call.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub inner: DialogInnerRef,
}

impl ServerInviteDialog {
    pub fn new(inner: DialogInnerRef) -> Self {
        Self { inner }
    }

    /// Sends a provisional response (100/180/183) on the still-open INVITE
    /// server transaction. Does not change dialog state for 100 Trying,
    /// which is hop-by-hop and never reaches the dialog's peer-visible
    /// state machine.
    pub async fn provisional(&self, tx: &mut Transaction, status: StatusCode) -> Result<()> {
        if !matches!(status.kind(), rsip::StatusCodeKind::Informational) {
            return Err(crate::Error::ProtocolViolation(format!(
                "{} is not a provisional status",
                status
            )));
        }
        let resp = self.inner.make_response(&tx.original, status.clone(), None, None);
        tx.respond(resp.clone()).await?;
        let id = self.inner.id.lock().unwrap().clone();
        if status != StatusCode::Trying {
            self.inner.transition(DialogState::Early(id, resp))?;
        }
        Ok(())
    }

    /// Accepts the call: sends the 2xx. Per RFC 3261 §13.3.1.4 the INVITE
    /// server transaction terminates the instant the 2xx goes out — the ACK
    /// confirming it is not part of this transaction and is never seen by
    /// `tx` again, so it is left to drain (unregistering it from the
    /// endpoint) while the real ACK arrives separately as a fresh request
    /// and is confirmed in `handle`'s `Method::Ack` arm.
    pub async fn accept(
        &self,
        mut tx: Transaction,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let resp = self
            .inner
            .make_response(&tx.original, StatusCode::OK, headers, body);
        tx.respond(resp.clone()).await?;
        let id = self.inner.id.lock().unwrap().clone();
        self.inner.transition(DialogState::WaitAck(id, resp))?;
        tx.spawn_drain();
        Ok(())
    }

    /// Rejects the call with a final non-2xx response, then drains the
    /// transaction in the background so Timer G/H still retransmit on loss
    /// and unregister it once the ACK (or Timer H) ends it.
    pub async fn reject(&self, mut tx: Transaction, status: StatusCode) -> Result<()> {
        let resp = self.inner.make_response(&tx.original, status.clone(), None, None);
        tx.respond(resp).await?;
        let id = self.inner.id.lock().unwrap().clone();
        let reason = match status {
            StatusCode::BusyHere => TerminatedReason::UasBusy,
            StatusCode::Decline => TerminatedReason::UasDecline,
            other => TerminatedReason::UasOther(Some(other)),
        };
        self.inner.transition(DialogState::Terminated(id, reason))?;
        tx.spawn_drain();
        Ok(())
    }

    /// Sends a BYE to tear down a confirmed dialog and waits for its 200.
    pub async fn bye(&self) -> Result<()> {
        let request = self
            .inner
            .make_request(Method::Bye, None, None, None, None, None)?;
        let resp = self.inner.do_request(request).await?;
        let id = self.inner.id.lock().unwrap().clone();
        match resp {
            Some(resp) if resp.status_code == StatusCode::OK => {
                self.inner
                    .transition(DialogState::Terminated(id, TerminatedReason::UasBye))?;
            }
            Some(resp) => {
                info!("BYE answered with {}", resp.status_code);
                self.inner
                    .transition(DialogState::Terminated(id, TerminatedReason::UasBye))?;
            }
            None => {
                self.inner
                    .transition(DialogState::Terminated(id, TerminatedReason::UasBye))?;
            }
        }
        Ok(())
    }

    /// Handles an in-dialog request arriving as a freshly dispatched server
    /// transaction: BYE tears the dialog down, everything else gets a
    /// conservative 200 OK (most in-dialog methods this library does not
    /// model specially are fine to just acknowledge).
    pub async fn handle(&mut self, mut tx: Transaction) -> Result<()> {
        match tx.original.method {
            Method::Bye => {
                let resp = self
                    .inner
                    .make_response(&tx.original, StatusCode::OK, None, None);
                tx.respond(resp).await?;
                let id = self.inner.id.lock().unwrap().clone();
                self.inner
                    .transition(DialogState::Terminated(id, TerminatedReason::UacBye))?;
                tx.spawn_drain();
            }
            Method::Ack => {
                // The ACK confirming a 2xx sent from `accept`: that
                // transaction was already terminated by `respond()`, so it
                // never reaches `tx.receive()` and lands here instead as a
                // fresh unmatched request (RFC 3261 §13.3.1.4).
                let id = self.inner.id.lock().unwrap().clone();
                self.inner.transition(DialogState::Confirmed(id))?;
            }
            _ => {
                let resp = self
                    .inner
                    .make_response(&tx.original, StatusCode::OK, None, None);
                tx.respond(resp).await?;
                tx.spawn_drain();
            }
        }
        Ok(())
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.inner.credential.as_ref()
    }
}
