use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters of one consume loop.
#[derive(Debug, Default)]
pub struct LoopStats {
    received: AtomicU64,
    emitted: AtomicU64,
    acknowledged: AtomicU64,
    emit_failures: AtomicU64,
    ack_failures: AtomicU64,
    receive_errors: AtomicU64,
}

/// Point-in-time copy of [`LoopStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStatsSnapshot {
    pub received: u64,
    pub emitted: u64,
    pub acknowledged: u64,
    pub emit_failures: u64,
    pub ack_failures: u64,
    pub receive_errors: u64,
}

impl LoopStats {
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emit_failure(&self) {
        self.emit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            emit_failures: self.emit_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}
