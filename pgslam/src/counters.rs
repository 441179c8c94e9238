//! Process-wide operation counters sampled by the run coordinator's report loop.
use crate::error::PoisonedCounters;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub ops: u64,
    pub busy: Duration,
    pub idle: Duration,
}

/// `(opCount, totalBusyDuration, totalIdleDuration)` behind one mutex.
///
/// The lock is only ever held for an increment or a copy, never across I/O or an await.
#[derive(Debug, Default)]
pub struct AggregateCounters {
    state: Mutex<CounterSnapshot>,
}

impl AggregateCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ops: u64, busy: Duration) -> Result<(), PoisonedCounters> {
        let mut state = self.lock()?;
        state.ops += ops;
        state.busy += busy;
        Ok(())
    }

    pub fn record_idle(&self, idle: Duration) -> Result<(), PoisonedCounters> {
        self.lock()?.idle += idle;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<CounterSnapshot, PoisonedCounters> {
        Ok(*self.lock()?)
    }

    /// Read the idle total and zero it, leaving ops and busy time cumulative.
    pub fn take_idle(&self) -> Result<Duration, PoisonedCounters> {
        Ok(std::mem::take(&mut self.lock()?.idle))
    }

    /// Discard everything recorded so far (used to drop warm-up measurements).
    pub fn reset(&self) -> Result<(), PoisonedCounters> {
        *self.lock()? = CounterSnapshot::default();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, CounterSnapshot>, PoisonedCounters> {
        Ok(self.state.lock()?)
    }
}
