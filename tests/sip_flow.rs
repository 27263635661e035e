//! End-to-end scenarios run over real UDP sockets bound to 127.0.0.1:0: a
//! call placed by one `UserAgent` and answered by another, an out-of-dialog
//! request that gets digest-challenged and retried, and a call that is
//! rejected.

use sipua::dialog::authenticate::Credential;
use sipua::dialog::invitation::InviteOption;
use sipua::dialog::server_dialog::ServerInviteDialog;
use sipua::transaction::endpoint::{Endpoint, EndpointOption};
use sipua::transaction::transaction::{Transaction, TransactionEventReceiver, TransactionEventSender};
use sipua::transport::UdpConnection;
use sipua::useragent::{CredentialStore, UaEvent, UserAgent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn bind_loopback() -> Arc<UdpConnection> {
    Arc::new(
        UdpConnection::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind loopback udp socket"),
    )
}

fn contact_uri(conn: &UdpConnection) -> rsip::Uri {
    use sipua::transport::Transport;
    let addr = conn.local_addr();
    format!("sip:user@{}", addr.addr).as_str().try_into().unwrap()
}

/// Spawns the dispatch loop plus a dialog-routing loop that accepts every
/// inbound INVITE with a 200 OK and no SDP, mirroring the minimal UAS an
/// application would wire up around `ServerInviteDialog::accept`.
fn serve_auto_answer(ua: &UserAgent, conn: Arc<UdpConnection>) {
    let (tu_tx, tu_rx): (TransactionEventSender, TransactionEventReceiver) = mpsc::unbounded_channel();
    ua.endpoint.set_tu_sender(tu_tx);
    tokio::spawn(ua.endpoint.clone().serve_connection(conn));

    let dialog_layer = ua.dialog_layer.clone();
    let (new_dialogs_tx, mut new_dialogs_rx) =
        mpsc::unbounded_channel::<(ServerInviteDialog, Transaction)>();
    tokio::spawn(async move {
        while let Some((dialog, tx)) = new_dialogs_rx.recv().await {
            tokio::spawn(async move {
                dialog.accept(tx, None, None).await.expect("UAS accept");
            });
        }
    });
    tokio::spawn(async move {
        dialog_layer.serve(tu_rx, new_dialogs_tx).await;
    });
}

/// Same shape as `serve_auto_answer` but declines every inbound INVITE.
fn serve_auto_decline(ua: &UserAgent, conn: Arc<UdpConnection>, status: rsip::StatusCode) {
    let (tu_tx, tu_rx): (TransactionEventSender, TransactionEventReceiver) = mpsc::unbounded_channel();
    ua.endpoint.set_tu_sender(tu_tx);
    tokio::spawn(ua.endpoint.clone().serve_connection(conn));

    let dialog_layer = ua.dialog_layer.clone();
    let (new_dialogs_tx, mut new_dialogs_rx) =
        mpsc::unbounded_channel::<(ServerInviteDialog, Transaction)>();
    tokio::spawn(async move {
        while let Some((dialog, tx)) = new_dialogs_rx.recv().await {
            let status = status.clone();
            tokio::spawn(async move {
                dialog.reject(tx, status).await.expect("UAS reject");
            });
        }
    });
    tokio::spawn(async move {
        dialog_layer.serve(tu_rx, new_dialogs_tx).await;
    });
}

#[tokio::test]
async fn invite_is_answered_and_confirmed_then_torn_down() {
    let uas_conn = bind_loopback().await;
    let uac_conn = bind_loopback().await;

    let (uas, _uas_events) = UserAgent::new(EndpointOption::default());
    uas.add_transport(uas_conn.clone());
    serve_auto_answer(&uas, uas_conn.clone());

    let (uac, _uac_events) = UserAgent::new(EndpointOption::default());
    uac.add_transport(uac_conn.clone());
    let (dispatch, routing) = uac.serve(uac_conn.clone());

    let callee: rsip::Uri = format!("sip:bob@{}", {
        use sipua::transport::Transport;
        uas_conn.local_addr().addr
    })
    .as_str()
    .try_into()
    .unwrap();

    let opt = InviteOption {
        caller: "sip:alice@example.com".try_into().unwrap(),
        callee,
        content_type: None,
        offer: None,
        contact: contact_uri(&uac_conn),
        credential: None,
        headers: None,
    };

    let (dialog_id, resp) = uac.invite(opt).await.expect("invite completes");
    let resp = resp.expect("final response present");
    assert_eq!(resp.status_code, rsip::StatusCode::OK);

    uac.hangup(&dialog_id).await.expect("hangup sends BYE");
    assert!(uac.dialog_layer.get_dialog(&dialog_id).is_none());

    dispatch.abort();
    routing.abort();
}

#[tokio::test]
async fn invite_declined_reports_final_response() {
    let uas_conn = bind_loopback().await;
    let uac_conn = bind_loopback().await;

    let (uas, _uas_events) = UserAgent::new(EndpointOption::default());
    uas.add_transport(uas_conn.clone());
    serve_auto_decline(&uas, uas_conn.clone(), rsip::StatusCode::BusyHere);

    let (uac, _uac_events) = UserAgent::new(EndpointOption::default());
    uac.add_transport(uac_conn.clone());
    let (dispatch, routing) = uac.serve(uac_conn.clone());

    let callee: rsip::Uri = format!("sip:bob@{}", {
        use sipua::transport::Transport;
        uas_conn.local_addr().addr
    })
    .as_str()
    .try_into()
    .unwrap();

    let opt = InviteOption {
        caller: "sip:alice@example.com".try_into().unwrap(),
        callee,
        content_type: None,
        offer: None,
        contact: contact_uri(&uac_conn),
        credential: None,
        headers: None,
    };

    let (_dialog_id, resp) = uac.invite(opt).await.expect("invite completes");
    let resp = resp.expect("final response present");
    assert_eq!(resp.status_code, rsip::StatusCode::BusyHere);

    dispatch.abort();
    routing.abort();
}

/// A UAS that answers every non-dialog request with a digest challenge the
/// first time it sees a given Call-ID, then 200 OK once a matching
/// Authorization header shows up.
async fn serve_challenge_once(endpoint: Endpoint, conn: Arc<UdpConnection>) {
    use sipua::transport::Transport;
    loop {
        let (msg, peer) = conn.recv().await.expect("recv");
        let req = match msg {
            rsip::SipMessage::Request(r) => r,
            _ => continue,
        };
        let has_auth = req.headers.iter().any(|h| matches!(h, rsip::Header::Authorization(_)));
        let resp = if has_auth {
            endpoint.make_response(&req, rsip::StatusCode::OK, None)
        } else {
            let mut resp = endpoint.make_response(&req, rsip::StatusCode::Unauthorized, None);
            resp.headers.unique_push(rsip::Header::WwwAuthenticate(
                "Digest realm=\"example.com\", nonce=\"abcd1234\", qop=\"auth\"".into(),
            ));
            resp
        };
        conn.send(&rsip::SipMessage::Response(resp), &peer).await.expect("send response");
        if has_auth {
            return;
        }
    }
}

#[tokio::test]
async fn out_of_dialog_request_retries_once_on_challenge() {
    let uas_conn = bind_loopback().await;
    let uac_conn = bind_loopback().await;

    let uas_endpoint = Endpoint::new(EndpointOption::default());
    let uas_task = tokio::spawn(serve_challenge_once(uas_endpoint, uas_conn.clone()));

    let (uac, _events) = UserAgent::new(EndpointOption::default());
    uac.add_transport(uac_conn.clone());

    let uas_addr = {
        use sipua::transport::Transport;
        uas_conn.local_addr().addr
    };
    let req_uri: rsip::Uri = format!("sip:registrar@{}", uas_addr).as_str().try_into().unwrap();
    let via = uac.endpoint.inner.get_via(None, None).unwrap();
    let from = rsip::typed::From {
        display_name: None,
        uri: "sip:alice@example.com".try_into().unwrap(),
        params: vec![],
    }
    .with_tag(sipua::transaction::make_tag());
    let to = rsip::typed::To {
        display_name: None,
        uri: req_uri.clone(),
        params: vec![],
    };
    let request = uac
        .endpoint
        .make_request(rsip::Method::Options, req_uri, via, from, to, 1);

    let credential = Credential {
        username: "alice".to_string(),
        password: "secret".to_string(),
        realm: Some("example.com".to_string()),
    };

    let resp = uac
        .send_out_of_dialog(request, Some(credential))
        .await
        .expect("challenge retry succeeds");
    assert_eq!(resp.status_code, rsip::StatusCode::OK);

    uas_task.await.expect("uas task joins");
}

#[tokio::test]
async fn credential_store_looks_up_by_realm_and_falls_back_to_only() {
    let store = CredentialStore::new();
    store.insert(Credential {
        username: "alice".into(),
        password: "secret".into(),
        realm: Some("example.com".into()),
    });

    assert!(store.get("nowhere.test").is_none());
    assert_eq!(store.get("example.com").unwrap().username, "alice");
    assert_eq!(store.only().unwrap().username, "alice");

    store.insert(Credential {
        username: "bob".into(),
        password: "hunter2".into(),
        realm: Some("other.example.com".into()),
    });
    assert!(store.only().is_none());
}

#[tokio::test]
async fn ua_event_stream_reports_early_and_confirmed_states() {
    let uas_conn = bind_loopback().await;
    let uac_conn = bind_loopback().await;

    let (uas, _uas_events) = UserAgent::new(EndpointOption::default());
    uas.add_transport(uas_conn.clone());
    serve_auto_answer(&uas, uas_conn.clone());

    let (uac, mut uac_events) = UserAgent::new(EndpointOption::default());
    uac.add_transport(uac_conn.clone());
    let (dispatch, routing) = uac.serve(uac_conn.clone());

    let callee: rsip::Uri = format!("sip:bob@{}", {
        use sipua::transport::Transport;
        uas_conn.local_addr().addr
    })
    .as_str()
    .try_into()
    .unwrap();
    let opt = InviteOption {
        caller: "sip:alice@example.com".try_into().unwrap(),
        callee,
        content_type: None,
        offer: None,
        contact: contact_uri(&uac_conn),
        credential: None,
        headers: None,
    };

    let (_dialog_id, resp) = uac.invite(opt).await.expect("invite completes");
    assert_eq!(resp.unwrap().status_code, rsip::StatusCode::OK);

    let mut saw_confirmed = false;
    let deadline = tokio::time::sleep(Duration::from_millis(500));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(event) = uac_events.recv() => {
                if matches!(event, UaEvent::ResponseReceived(_, rsip::StatusCode::OK)) {
                    saw_confirmed = true;
                    break;
                }
            }
            _ = &mut deadline => break,
        }
    }
    assert!(saw_confirmed, "expected a ResponseReceived(OK) event for the answered call");

    dispatch.abort();
    routing.abort();
}
