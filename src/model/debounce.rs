use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What a fired rescan timer asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRescan {
    pub refresh: bool,
    /// Sequence number current when the rescan was scheduled.
    pub sequence: u64,
}

/// Single-slot rescan timer where the earliest deadline wins.
///
/// The timer task only reports its id through `notify`; the owner then calls
/// `fire` with that id, which ignores timers that were cleared or replaced in
/// the meantime.
#[derive(Debug, Default)]
pub struct RescanScheduler {
    deadline: Option<Instant>,
    pending: Option<ScheduledRescan>,
    timer_id: u64,
    handle: Option<JoinHandle<()>>,
}

impl RescanScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a rescan `delay` from now. A request whose deadline is not
    /// sooner than the pending one is ignored. Returns whether a timer was
    /// (re)armed.
    pub fn schedule<F>(&mut self, delay: Duration, refresh: bool, sequence: u64, notify: F) -> bool
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        if matches!(self.deadline, Some(current) if current <= deadline) {
            return false;
        }

        self.clear();
        self.timer_id += 1;
        let id = self.timer_id;
        self.deadline = Some(deadline);
        self.pending = Some(ScheduledRescan { refresh, sequence });
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            notify(id);
        }));
        true
    }

    /// Claim the rescan for timer `id`, if that timer is still the live one.
    pub fn fire(&mut self, id: u64) -> Option<ScheduledRescan> {
        if self.deadline.is_none() || id != self.timer_id {
            return None;
        }
        self.deadline = None;
        self.handle = None;
        self.pending.take()
    }

    /// Cancel the pending timer, if any.
    pub fn clear(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.deadline = None;
        self.pending = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Outcome of `Aggregator::run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorRun {
    /// Quiet window: the caller runs the work now.
    RunNow,
    /// A trailing run was scheduled.
    Scheduled,
    /// Folded into the already scheduled trailing run.
    Coalesced,
}

/// Collapses bursts of calls into at most one run per window.
#[derive(Debug)]
pub struct Aggregator {
    window: Duration,
    last_run: Option<Instant>,
    timer_id: u64,
    handle: Option<JoinHandle<()>>,
}

impl Aggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_run: None,
            timer_id: 0,
            handle: None,
        }
    }

    pub fn run<F>(&mut self, notify: F) -> AggregatorRun
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if self.handle.is_some() {
            return AggregatorRun::Coalesced;
        }

        let now = Instant::now();
        let due = match self.last_run {
            Some(last) if now.duration_since(last) < self.window => last + self.window,
            _ => {
                self.last_run = Some(now);
                return AggregatorRun::RunNow;
            }
        };

        self.timer_id += 1;
        let id = self.timer_id;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            notify(id);
        }));
        AggregatorRun::Scheduled
    }

    /// Claim the trailing run for timer `id`.
    pub fn fire(&mut self, id: u64) -> bool {
        if self.handle.is_none() || id != self.timer_id {
            return false;
        }
        self.handle = None;
        self.last_run = Some(Instant::now());
        true
    }

    pub fn clear(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }
}
