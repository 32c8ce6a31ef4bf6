use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterMetricsSnapshot {
    pub commands: u64,
    pub events: u64,
    pub command_success: u64,
    pub command_failures: u64,
    pub command_latency_total_us: u64,
}

impl AdapterMetricsSnapshot {
    pub fn mean_latency(&self) -> Option<Duration> {
        (self.command_success > 0)
            .then(|| Duration::from_micros(self.command_latency_total_us / self.command_success))
    }
}

/// Counters for commands sent and events decoded by one adapter.
#[derive(Default, Debug)]
pub struct AdapterMetrics {
    commands: AtomicU64,
    events: AtomicU64,
    command_success: AtomicU64,
    command_failures: AtomicU64,
    command_latency_total_us: AtomicU64,
}

impl AdapterMetrics {
    pub fn record_command(&self) {
        self.commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command_success(&self, duration: Duration) {
        self.command_success.fetch_add(1, Ordering::Relaxed);
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        self.command_latency_total_us
            .fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_command_failure(&self) {
        self.command_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdapterMetricsSnapshot {
        AdapterMetricsSnapshot {
            commands: self.commands.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            command_success: self.command_success.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            command_latency_total_us: self.command_latency_total_us.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.commands.store(0, Ordering::Relaxed);
        self.events.store(0, Ordering::Relaxed);
        self.command_success.store(0, Ordering::Relaxed);
        self.command_failures.store(0, Ordering::Relaxed);
        self.command_latency_total_us.store(0, Ordering::Relaxed);
    }
}
