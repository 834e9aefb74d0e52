use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {tokio::sync::oneshot, tracing::trace};

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub type SharedScheduler = Arc<dyn Scheduler>;

/// Timer capability: a clock plus `after(delay, task) -> cancelable`.
pub trait Scheduler: Send + Sync {
    /// Milliseconds since the Unix epoch, as seen by this scheduler.
    fn now_ms(&self) -> u64;

    /// Run `task` once after `delay`, unless the returned handle is cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn unix_now_ms() -> u64 {
    duration_ms(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO),
    )
}

// ── Timer handle ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct TimerState {
    cancelled: AtomicBool,
    fired: AtomicBool,
    abort: Mutex<Option<tokio::task::AbortHandle>>,
}

/// Cancelation handle for a scheduled task. Dropping it does not cancel.
#[derive(Clone, Default)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        let abort = self
            .state
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(abort) = abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    /// Neither fired nor cancelled yet.
    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && !self.has_fired()
    }

    /// Claim the right to run the task. At most one caller ever gets `true`.
    fn claim(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        !self.state.fired.swap(true, Ordering::SeqCst)
    }

    fn set_abort(&self, abort: tokio::task::AbortHandle) {
        *self
            .state
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(abort);
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .field("fired", &self.has_fired())
            .finish()
    }
}

/// Await `delay` on the given scheduler. The timer is cancelled if the future is dropped.
pub async fn sleep(scheduler: &dyn Scheduler, delay: Duration) {
    struct CancelOnDrop(TimerHandle);

    impl Drop for CancelOnDrop {
        fn drop(&mut self) {
            self.0.cancel();
        }
    }

    let (tx, rx) = oneshot::channel::<()>();
    let handle = scheduler.schedule(
        delay,
        Box::new(move || {
            let _ = tx.send(());
        }),
    );
    let _guard = CancelOnDrop(handle);
    let _ = rx.await;
}

// ── Tokio ────────────────────────────────────────────────────────────────────

/// Real-time scheduler backed by `tokio::time`. Must be used inside a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn shared() -> SharedScheduler {
        Arc::new(Self)
    }
}

impl Scheduler for TokioScheduler {
    fn now_ms(&self) -> u64 {
        unix_now_ms()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let timer = handle.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timer.claim() {
                task();
            }
        });
        handle.set_abort(join.abort_handle());
        handle
    }
}

// ── Manual (virtual time) ────────────────────────────────────────────────────

struct ScheduledTask {
    due_ms: u64,
    order: u64,
    handle: TimerHandle,
    task: Task,
}

struct ManualState {
    now_ms: u64,
    next_order: u64,
    queue: Vec<ScheduledTask>,
}

/// Virtual-time scheduler: nothing runs until [`ManualScheduler::advance`].
///
/// Tasks due at the same instant run in scheduling order. Tasks scheduled by a
/// running task are eligible within the same `advance` call if they fall due
/// before its target time.
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new(start_ms: u64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now_ms: start_ms,
                next_order: 0,
                queue: Vec::new(),
            }),
        }
    }

    pub fn shared(start_ms: u64) -> Arc<Self> {
        Arc::new(Self::new(start_ms))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move virtual time forward, running every task that falls due.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now_ms.saturating_add(duration_ms(by));
        loop {
            let next = {
                let mut state = self.lock();
                state.queue.retain(|t| !t.handle.is_cancelled());
                let idx = state
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due_ms <= target)
                    .min_by_key(|(_, t)| (t.due_ms, t.order))
                    .map(|(idx, _)| idx);
                match idx {
                    Some(idx) => {
                        let scheduled = state.queue.swap_remove(idx);
                        state.now_ms = state.now_ms.max(scheduled.due_ms);
                        Some(scheduled)
                    },
                    None => {
                        state.now_ms = target;
                        None
                    },
                }
            };
            let Some(scheduled) = next else {
                break;
            };
            if scheduled.handle.claim() {
                trace!(due_ms = scheduled.due_ms, "manual scheduler firing task");
                (scheduled.task)();
            }
        }
    }

    /// Run everything already due without moving time.
    pub fn run_due(&self) {
        self.advance(Duration::ZERO);
    }

    /// Number of scheduled tasks that are neither cancelled nor fired.
    pub fn pending(&self) -> usize {
        self.lock()
            .queue
            .iter()
            .filter(|t| t.handle.is_pending())
            .count()
    }
}

impl Scheduler for ManualScheduler {
    fn now_ms(&self) -> u64 {
        self.lock().now_ms
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.lock();
        let order = state.next_order;
        state.next_order += 1;
        let due_ms = state.now_ms.saturating_add(duration_ms(delay));
        state.queue.push(ScheduledTask {
            due_ms,
            order,
            handle: handle.clone(),
            task,
        });
        handle
    }
}
