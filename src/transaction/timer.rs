//! Timer service: one-shot deadlines derived from T1/T2/T4,
//! armed per transaction and re-armed on retransmit. Deadlines are absolute
//! (`tokio::time::Instant`) so cooperative scheduling jitter and clock drift
//! never compound across retransmits.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// INVITE client retransmit (UDP only).
    A,
    /// INVITE client give-up, 64*T1.
    B,
    /// INVITE client wait-for-retransmits after ACK, 32s on UDP.
    D,
    /// non-INVITE client retransmit, doubles up to T2.
    E,
    /// non-INVITE client give-up, 64*T1.
    F,
    /// INVITE server response retransmit, doubles up to T2.
    G,
    /// INVITE server wait-for-ACK, 64*T1.
    H,
    /// INVITE server wait-for-retransmits after ACK, T4 on UDP.
    I,
    /// non-INVITE server wait-for-retransmitted-request, 64*T1 on UDP.
    J,
    /// INVITE client wait-for-retransmits of 2xx-triggered ACK, T4 on UDP.
    K,
}

/// Doubling back-off starting at T1, capped at `cap` (T2 for non-INVITE
/// retransmit ladders, unbounded for the INVITE Timer-A ladder which is
/// instead bounded by Timer B).
pub fn next_backoff(current: Duration, cap: Option<Duration>) -> Duration {
    let doubled = current * 2;
    match cap {
        Some(cap) if doubled > cap => cap,
        _ => doubled,
    }
}

/// A single named timer slot for one transaction: either idle or armed with
/// an absolute deadline. `invariant: "every open transaction either
/// has a running timer or is in a state where a network event is the only
/// driver" — FSMs enforce this by always leaving exactly the timers valid
/// for the current state armed.
#[derive(Debug, Default)]
pub struct TimerSlot {
    deadline: Option<Instant>,
    interval: Option<Duration>,
}

impl TimerSlot {
    pub fn arm(&mut self, delay: Duration) {
        self.deadline = Some(Instant::now() + delay);
        self.interval = Some(delay);
    }

    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.interval = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Waits for this slot's deadline; pending forever if unarmed, so it is
    /// always safe to use inside a `tokio::select!` arm alongside other
    /// timers/channels.
    pub async fn wait(&self) {
        match self.deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_t2() {
        let t1 = Duration::from_millis(500);
        let t2 = Duration::from_secs(4);
        let mut cur = t1;
        for _ in 0..10 {
            cur = next_backoff(cur, Some(t2));
        }
        assert_eq!(cur, t2);
    }

    #[test]
    fn backoff_uncapped_follows_invite_ladder() {
        // 500, 1000, 2000, 4000, 8000, 16000ms: sum with the initial 500ms
        // send reproduces the INVITE client retransmit schedule
        // 0,500,1500,3500,7500,15500,31000ms.
        let t1 = Duration::from_millis(500);
        let mut cur = t1;
        let mut total = Duration::from_millis(0);
        let mut marks = vec![total];
        for _ in 0..6 {
            total += cur;
            marks.push(total);
            cur = next_backoff(cur, None);
        }
        let expect_ms = [0, 500, 1500, 3500, 7500, 15500, 31000];
        for (m, e) in marks.iter().zip(expect_ms.iter()) {
            assert_eq!(m.as_millis() as u64, *e);
        }
    }

    #[tokio::test]
    async fn unarmed_slot_never_fires() {
        let slot = TimerSlot::default();
        tokio::select! {
            _ = slot.wait() => panic!("unarmed timer fired"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }
}
