use std::time::Duration;

use tokio::time::Instant;

/// Sleep between schedule checks while waiting for the next send.
pub const SEND_QUANTUM: Duration = Duration::from_millis(1);

/// Wall time between two rate reports.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingAction {
    /// Target rate is zero, nothing will ever be sent
    Paused,
    /// A send is due
    Send,
    /// Too early, check again after this long
    Wait(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateReport {
    pub sent: u64,
    pub elapsed: Duration,
    pub achieved_rate: f64,
    pub target_rate: u32,
}

/// Wall-clock send schedule for a target rate.
///
/// The n-th send is due at `start + n / rate`. Sends that fall behind (slow
/// enqueue, scheduler stalls) are caught up in a burst instead of being
/// dropped, so the long-run rate converges on the target whatever the jitter.
#[derive(Debug)]
pub struct RateSchedule {
    rate: u32,
    start: Instant,
    next_send: Instant,
    sent: u64,
    last_report: Instant,
}

impl RateSchedule {
    pub fn new(rate: u32, start: Instant) -> Self {
        Self {
            rate,
            start,
            next_send: start,
            sent: 0,
            last_report: start,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.rate
    }

    pub fn is_paused(&self) -> bool {
        self.rate == 0
    }

    /// Time between two sends, `None` while paused.
    pub fn interval(&self) -> Option<Duration> {
        match self.rate {
            0 => None,
            rate => Some(Duration::from_secs(1) / rate),
        }
    }

    pub fn next_send_instant(&self) -> Instant {
        self.next_send
    }

    pub fn sent_count(&self) -> u64 {
        self.sent
    }

    pub fn next_action(&self, now: Instant) -> PacingAction {
        if self.is_paused() {
            PacingAction::Paused
        } else if now >= self.next_send {
            PacingAction::Send
        } else {
            PacingAction::Wait(SEND_QUANTUM)
        }
    }

    /// Account for one send and move the deadline one interval forward.
    pub fn record_sent(&mut self) {
        if self.is_paused() {
            return;
        }
        self.sent += 1;
        // Derived from the count rather than summed, so rounding never accumulates
        let nanos = u128::from(self.sent) * 1_000_000_000 / u128::from(self.rate);
        self.next_send = self.start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    }

    /// A report every `REPORT_INTERVAL` of wall time, `None` in between.
    pub fn report(&mut self, now: Instant) -> Option<RateReport> {
        if now.saturating_duration_since(self.last_report) < REPORT_INTERVAL {
            return None;
        }
        self.last_report = now;

        let elapsed = now.saturating_duration_since(self.start);
        let achieved_rate = match elapsed.as_secs_f64() {
            secs if secs > 0.0 => self.sent as f64 / secs,
            _ => 0.0,
        };
        Some(RateReport {
            sent: self.sent,
            elapsed,
            achieved_rate,
            target_rate: self.rate,
        })
    }
}
