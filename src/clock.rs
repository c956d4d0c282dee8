/// Monotonic time base for value timestamps.
///
/// Timestamps are microseconds since a process-wide epoch captured the first
/// time the clock is read. They never go backwards and are independent of
/// wall-clock adjustments. Clients additionally keep a [`ClockOffset`] that
/// maps their local time base onto the server's, so timestamps written by
/// different processes can be compared for last-writer-wins.
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in microseconds.
///
/// The first call pins the epoch, and the value is offset by one so a real
/// timestamp is never zero (zero means "no time" on the wire).
pub fn now_micros() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64 + 1
}

/// Estimated offset between a client's clock and its server's clock.
///
/// Updated from keep-alive round trips. Until the first sample arrives the
/// offset is zero.
#[derive(Debug, Default)]
pub struct ClockOffset {
    offset: AtomicI64,
    valid: AtomicBool,
}

impl ClockOffset {
    /// Create an offset with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a round trip: `sent` and `received` in local time, `server_time`
    /// as reported by the server when it answered.
    pub fn record(&self, sent: u64, received: u64, server_time: u64) {
        let rtt2 = received.saturating_sub(sent) / 2;
        let offset = server_time as i64 + rtt2 as i64 - received as i64;
        self.offset.store(offset, Ordering::Relaxed);
        self.valid.store(true, Ordering::Relaxed);
    }

    /// Whether at least one sample has been recorded.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    /// Current offset in microseconds (server minus local).
    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Forget the estimate; used when the connection drops.
    pub fn reset(&self) {
        self.offset.store(0, Ordering::Relaxed);
        self.valid.store(false, Ordering::Relaxed);
    }

    /// Convert a local timestamp to server time.
    pub fn to_server(&self, local: u64) -> u64 {
        shift(local, self.offset())
    }

    /// Convert a server timestamp to local time.
    pub fn to_local(&self, server: u64) -> u64 {
        shift(server, -self.offset())
    }
}

fn shift(time: u64, by: i64) -> u64 {
    if time == 0 {
        return 0;
    }
    (time as i64).saturating_add(by).max(1) as u64
}
