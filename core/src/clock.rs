//! Wall-clock helpers and interval bookkeeping for background loops.

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub const MS_PER_HOUR: u64 = 3_600_000;

/// Convert an hour count into milliseconds, saturating on overflow.
pub fn hours_to_ms(hours: u64) -> u64 {
    hours.saturating_mul(MS_PER_HOUR)
}

// ---------------------------------------------------------------------------
// IntervalSchedule
// ---------------------------------------------------------------------------

/// Tracks when a periodic task last ran and whether it is due again.
///
/// A schedule that has never run is always due.
#[derive(Debug, Clone)]
pub struct IntervalSchedule {
    interval_ms: u64,
    last_run_ms: Option<u64>,
}

impl IntervalSchedule {
    pub fn new(interval_ms: u64) -> Self {
        IntervalSchedule {
            interval_ms,
            last_run_ms: None,
        }
    }

    /// Whether the interval has elapsed since the last recorded run.
    pub fn is_due(&self, now_ms: u64) -> bool {
        match self.last_run_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
        }
    }

    /// Record that the task ran at `now_ms`.
    pub fn mark_run(&mut self, now_ms: u64) {
        self.last_run_ms = Some(now_ms);
    }

    pub fn last_run_ms(&self) -> Option<u64> {
        self.last_run_ms
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}
