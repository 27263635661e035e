//! UAC side of an INVITE dialog: drives the initial INVITE transaction to
//! completion, builds the ACK RFC 3261 §13.2.2.4 requires the dialog layer
//! (not the transaction layer) to own, and owns the confirmed dialog's
//! BYE/CANCEL/re-INVITE requests afterward.

use super::authenticate::handle_client_authenticate;
use super::dialog::{DialogInnerRef, DialogState, TerminatedReason};
use super::DialogId;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transport::SipAddr;
use crate::Result;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Param, Response, SipMessage, StatusCode};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ClientInviteDialog {
    pub inner: DialogInnerRef,
}

impl ClientInviteDialog {
    pub fn set_public_address(&self, addr: SipAddr) {
        self.inner.set_public_address(addr);
    }

    /// Drives the freshly-sent INVITE transaction to a final outcome,
    /// confirming the dialog and sending the ACK on a 2xx.
    pub async fn process_invite(&self, mut tx: Transaction) -> Result<(DialogId, Response)> {
        let mut auth_sent = false;
        loop {
            let msg = match tx.receive().await {
                Some(msg) => msg,
                None => {
                    let id = self.inner.id.lock().unwrap().clone();
                    self.inner
                        .transition(DialogState::Terminated(id.clone(), TerminatedReason::Timeout))?;
                    return Err(crate::Error::Timeout);
                }
            };
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                SipMessage::Request(_) => continue,
            };

            match resp.status_code {
                StatusCode::Trying => continue,
                StatusCode::Ringing | StatusCode::SessionProgress => {
                    let id = self.inner.id.lock().unwrap().clone();
                    self.inner.transition(DialogState::Early(id, resp))?;
                    continue;
                }
                StatusCode::ProxyAuthenticationRequired | StatusCode::Unauthorized => {
                    if auth_sent {
                        let id = self.inner.id.lock().unwrap().clone();
                        self.inner.transition(DialogState::Terminated(
                            id.clone(),
                            TerminatedReason::ProxyAuthRequired,
                        ))?;
                        tx.spawn_drain();
                        return Ok((id, resp));
                    }
                    auth_sent = true;
                    match &self.inner.credential {
                        Some(cred) => {
                            let seq = self.inner.increment_local_seq();
                            tx = handle_client_authenticate(seq, tx, resp, cred).await?;
                            tx.send().await?;
                            continue;
                        }
                        None => {
                            let id = self.inner.id.lock().unwrap().clone();
                            self.inner.transition(DialogState::Terminated(
                                id.clone(),
                                TerminatedReason::ProxyAuthRequired,
                            ))?;
                            tx.spawn_drain();
                            return Ok((id, resp));
                        }
                    }
                }
                code if code.kind() == rsip::StatusCodeKind::Successful => {
                    tx.spawn_drain();
                    return self.on_success(resp).await;
                }
                _ => {
                    let id = self.inner.id.lock().unwrap().clone();
                    self.inner.transition(DialogState::Terminated(
                        id.clone(),
                        TerminatedReason::UacOther(Some(resp.status_code.clone())),
                    ))?;
                    tx.spawn_drain();
                    return Ok((id, resp));
                }
            }
        }
    }

    async fn on_success(&self, resp: Response) -> Result<(DialogId, Response)> {
        let to = resp.to_header()?.typed()?;
        let to_tag = to
            .params
            .iter()
            .find_map(|p| match p {
                Param::Tag(t) => Some(t.to_string()),
                _ => None,
            })
            .unwrap_or_default();
        self.inner.update_remote_tag(&to_tag)?;

        let mut route_set = self.inner.route_set.lock().unwrap();
        route_set.clear();
        for h in resp.headers.iter() {
            if let rsip::Header::RecordRoute(rr) = h {
                route_set.push(rsip::headers::Route::from(rr.value()));
            }
        }
        route_set.reverse();
        drop(route_set);

        let id = self.inner.id.lock().unwrap().clone();
        self.inner.transition(DialogState::Confirmed(id.clone()))?;

        if let Err(e) = self.send_ack(&resp).await {
            warn!("failed to send ACK for {}: {}", id, e);
        }
        Ok((id, resp))
    }

    /// The ACK confirming a 2xx is not a transaction of its own (RFC 3261
    /// §13.2.2.4): it is sent directly over the transport rather than
    /// through `Transaction::new_client`, and kept around so a retransmitted
    /// 2xx (the INVITE client transaction having already terminated) still
    /// gets it resent by the endpoint dispatcher.
    async fn send_ack(&self, resp: &Response) -> Result<()> {
        let ack = self.inner.make_request(
            rsip::Method::Ack,
            Some(self.inner.get_local_seq()),
            None,
            None,
            None,
            None,
        )?;
        let endpoint = &self.inner.endpoint_inner;
        let (conn, dest) = endpoint
            .transport_layer
            .lookup(&ack.uri, endpoint.transport_tx.clone())
            .await?;
        conn.send(&SipMessage::Request(ack.clone()), &dest).await?;
        endpoint.notify_sent(&SipMessage::Request(ack.clone()), &dest);
        let key = TransactionKey::from_request(&ack, TransactionRole::Client)?;
        endpoint.record_ack(key, ack, conn, dest);
        debug!("ACK sent for {} OK", resp.status_code);
        Ok(())
    }

    /// Handles an in-dialog server transaction (BYE/re-INVITE/INFO/etc.
    /// received from the peer after the dialog is confirmed).
    pub async fn handle(&mut self, mut tx: Transaction) -> Result<()> {
        let method = tx.original.method;
        self.inner.increment_remote_seq();
        match method {
            rsip::Method::Bye => {
                let resp = self.inner.make_response(&tx.original, StatusCode::OK, None, None);
                tx.respond(resp).await?;
                let id = self.inner.id.lock().unwrap().clone();
                self.inner
                    .transition(DialogState::Terminated(id, TerminatedReason::UasBye))?;
                tx.spawn_drain();
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

    pub async fn bye(&self) -> Result<()> {
        let request = self
            .inner
            .make_request(rsip::Method::Bye, None, None, None, None, None)?;
        let resp = self.inner.do_request(request).await?;
        let id = self.inner.id.lock().unwrap().clone();
        self.inner
            .transition(DialogState::Terminated(id, TerminatedReason::UacBye))?;
        info!("BYE sent, final response: {:?}", resp.map(|r| r.status_code));
        Ok(())
    }

    pub async fn cancel(&self) -> Result<()> {
        let mut cancel = self.inner.initial_request.clone();
        cancel.method = rsip::Method::Cancel;
        cancel.body = Vec::new();
        cancel.headers.retain(|h| {
            !matches!(
                h,
                rsip::Header::ContentType(_) | rsip::Header::ContentLength(_) | rsip::Header::Contact(_)
            )
        });
        cancel
            .headers
            .unique_push(rsip::Header::ContentLength(0.into()));
        let key = TransactionKey::from_request(&cancel, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, cancel, self.inner.endpoint_inner.clone(), None);
        tx.send().await?;
        while tx.receive().await.is_some() {}
        let id = self.inner.id.lock().unwrap().clone();
        self.inner
            .transition(DialogState::Terminated(id, TerminatedReason::UacCancel))?;
        Ok(())
    }
}

