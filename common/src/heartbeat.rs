/// Fixed-period gate for the announcement timer. Fires at most once per
/// `poll` and never sooner than one period after the previous firing; a
/// late poll delays the following deadline rather than bursting.
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    period_ms: u64,
    next_due_ms: u64,
}

impl HeartbeatSchedule {
    pub fn new(period_ms: u64, start_ms: u64) -> Self {
        let period_ms = period_ms.max(1);
        Self {
            period_ms,
            next_due_ms: start_ms.saturating_add(period_ms),
        }
    }

    pub fn next_due_ms(&self) -> u64 {
        self.next_due_ms
    }

    pub fn poll(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_due_ms {
            return false;
        }

        self.next_due_ms = now_ms.saturating_add(self.period_ms);
        true
    }

    pub fn until_due_ms(&self, now_ms: u64) -> u64 {
        self.next_due_ms.saturating_sub(now_ms)
    }
}
