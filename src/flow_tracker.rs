//! Passive observation of SIP traffic, independent of transaction/dialog
//! state: every message this user agent sends or receives passes through a
//! `FlowTracker`, used for call logging and diagnostics without coupling the
//! transaction layer to any particular sink.

use crate::transport::SipAddr;
use rsip::SipMessage;
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub at: SystemTime,
    pub direction: FlowDirection,
    pub peer: SipAddr,
    pub summary: String,
    pub dialog_id: Option<String>,
    pub transaction_id: Option<String>,
}

fn summarize(msg: &SipMessage) -> String {
    match msg {
        SipMessage::Request(req) => format!("{} {}", req.method, req.uri),
        SipMessage::Response(resp) => format!("{}", resp.status_code),
    }
}

/// Observer invoked on every message crossing the transport boundary.
/// Implementations must not block: the dispatcher calls this inline on the
/// hot path, so any buffering/log-shipping should happen on a separate task
/// fed by a channel, not inside these calls.
pub trait FlowTracker: Send + Sync {
    fn on_send(&self, msg: &SipMessage, peer: &SipAddr);
    fn on_recv(&self, msg: &SipMessage, peer: &SipAddr);
}

/// In-memory `FlowTracker` that just appends to a `Vec`, useful for tests and
/// small deployments that want a call log without standing up a real sink.
#[derive(Default)]
pub struct InMemoryFlowTracker {
    records: Mutex<Vec<FlowRecord>>,
}

impl InMemoryFlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FlowRecord> {
        self.records.lock().unwrap().clone()
    }

    fn push(&self, direction: FlowDirection, msg: &SipMessage, peer: &SipAddr) {
        self.records.lock().unwrap().push(FlowRecord {
            at: SystemTime::now(),
            direction,
            peer: peer.clone(),
            summary: summarize(msg),
            dialog_id: None,
            transaction_id: None,
        });
    }
}

impl FlowTracker for InMemoryFlowTracker {
    fn on_send(&self, msg: &SipMessage, peer: &SipAddr) {
        self.push(FlowDirection::Sent, msg, peer);
    }

    fn on_recv(&self, msg: &SipMessage, peer: &SipAddr) {
        self.push(FlowDirection::Received, msg, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SipAddr {
        SipAddr {
            r#type: Some(rsip::Transport::Udp),
            addr: rsip::HostWithPort {
                host: std::net::IpAddr::from([127, 0, 0, 1]).into(),
                port: Some(5060.into()),
            },
        }
    }

    #[test]
    fn records_accumulate_in_order() {
        let tracker = InMemoryFlowTracker::new();
        let req = SipMessage::Request(rsip::Request {
            method: rsip::Method::Options,
            uri: "sip:bob@example.com".try_into().unwrap(),
            headers: Default::default(),
            body: Vec::new(),
            version: rsip::Version::V2,
        });
        tracker.on_send(&req, &addr());
        tracker.on_recv(&req, &addr());

        let records = tracker.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, FlowDirection::Sent);
        assert_eq!(records[1].direction, FlowDirection::Received);
        assert_eq!(records[0].summary, "OPTIONS sip:bob@example.com");
    }
}
