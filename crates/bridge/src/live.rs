//! Per-agent batching of streaming patches.
//!
//! Patches queued within one tick are merged and handed to the sink together
//! on the next tick, so a burst of deltas costs one update per agent.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use {
    studio_common::{SharedScheduler, TimerHandle},
    tracing::{debug, trace},
};

use crate::{
    policy::{AgentStatusPatch, FieldPatch},
    sink::IntentSink,
};

/// Merge `next` into whatever is queued for the same agent.
///
/// Fields are last-write-wins, except that a patch naming a different run than
/// the queued one replaces the queued patch outright: nothing from the old
/// run may leak into the new one. A queued patch that never named a run
/// counts as a different run.
pub fn merge_live_patch(queued: Option<AgentStatusPatch>, next: AgentStatusPatch) -> AgentStatusPatch {
    match queued {
        Some(queued) if !switches_run(&queued, &next) => queued.overlay(next),
        _ => next,
    }
}

fn switches_run(queued: &AgentStatusPatch, next: &AgentStatusPatch) -> bool {
    !next.run_id.is_keep() && queued.run_id != next.run_id
}

#[derive(Default)]
struct QueueState {
    /// Pending patches in first-queued order.
    pending: Vec<(String, AgentStatusPatch)>,
    timer: Option<TimerHandle>,
    disposed: bool,
}

struct QueueInner {
    scheduler: SharedScheduler,
    sink: Arc<dyn IntentSink>,
    tick: Duration,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) {
        let pending = {
            let mut state = self.lock();
            state.timer = None;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            trace!(agents = pending.len(), "flushing live patches");
        }
        for (agent_id, patch) in pending {
            self.sink.patch_agent(&agent_id, &patch);
        }
    }
}

pub struct LivePatchQueue {
    inner: Arc<QueueInner>,
}

impl LivePatchQueue {
    pub fn new(scheduler: SharedScheduler, sink: Arc<dyn IntentSink>, tick: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                scheduler,
                sink,
                tick,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue a patch for the next tick.
    pub fn enqueue(&self, agent_id: &str, patch: AgentStatusPatch) {
        let mut state = self.inner.lock();
        if state.disposed {
            debug!(agent_id, "live patch after dispose dropped");
            return;
        }
        match state.pending.iter_mut().find(|(id, _)| id == agent_id) {
            Some((_, queued)) => {
                let previous = std::mem::take(queued);
                *queued = merge_live_patch(Some(previous), patch);
            },
            None => state
                .pending
                .push((agent_id.to_string(), merge_live_patch(None, patch))),
        }

        if state.timer.is_none() {
            let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
            let handle = self.inner.scheduler.schedule(
                self.inner.tick,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush();
                    }
                }),
            );
            state.timer = Some(handle);
        }
    }

    /// Drop whatever is queued for `agent_id` without applying it.
    pub fn clear(&self, agent_id: &str) {
        let mut state = self.inner.lock();
        state.pending.retain(|(id, _)| id != agent_id);
        if state.pending.is_empty()
            && let Some(timer) = state.timer.take()
        {
            timer.cancel();
        }
    }

    pub fn has_pending(&self, agent_id: &str) -> bool {
        self.inner.lock().pending.iter().any(|(id, _)| id == agent_id)
    }

    /// Cancel the armed tick and forget queued patches. Later enqueues are dropped.
    pub fn dispose(&self) {
        let mut state = self.inner.lock();
        state.disposed = true;
        state.pending.clear();
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }
}
