//! Applies intents to the sink, guarding against stale terminal updates.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    studio_common::{SharedScheduler, TimerHandle},
    studio_config::BridgeConfig,
    tracing::{debug, info, trace},
};

use crate::{
    classify::ClassifiedEvent,
    live::LivePatchQueue,
    policy::{AgentStatusPatch, EventIntent},
    sink::IntentSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    pub closed_run_ttl: Duration,
    pub summary_debounce: Duration,
    pub live_tick: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}

impl HandlerOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            closed_run_ttl: Duration::from_millis(config.closed_run_ttl_ms),
            summary_debounce: Duration::from_millis(config.summary_debounce_ms),
            live_tick: Duration::from_millis(config.live_tick_ms),
        }
    }
}

// ── Closed runs ──────────────────────────────────────────────────────────────

/// Run ids that reached a terminal state recently, with their expiry times.
#[derive(Debug, Default)]
pub struct ClosedRuns {
    ttl_ms: u64,
    entries: HashMap<String, u64>,
}

impl ClosedRuns {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, run_id: &str, now_ms: u64) {
        self.entries
            .insert(run_id.to_string(), now_ms.saturating_add(self.ttl_ms));
    }

    pub fn contains(&self, run_id: &str, now_ms: u64) -> bool {
        self.entries
            .get(run_id)
            .is_some_and(|expires| *expires > now_ms)
    }

    /// Drop expired entries.
    pub fn prune(&mut self, now_ms: u64) {
        self.entries.retain(|_, expires| *expires > now_ms);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── Handler ──────────────────────────────────────────────────────────────────

pub struct IntentHandler {
    scheduler: SharedScheduler,
    sink: Arc<dyn IntentSink>,
    options: HandlerOptions,
    live: LivePatchQueue,
    closed: ClosedRuns,
    /// Run each agent is currently known to be executing.
    active_runs: HashMap<String, String>,
    summary_timer: Option<TimerHandle>,
    history_timers: Vec<TimerHandle>,
}

impl IntentHandler {
    pub fn new(
        scheduler: SharedScheduler,
        sink: Arc<dyn IntentSink>,
        options: HandlerOptions,
    ) -> Self {
        let live = LivePatchQueue::new(
            Arc::clone(&scheduler),
            Arc::clone(&sink),
            options.live_tick,
        );
        Self {
            scheduler,
            sink,
            options,
            live,
            closed: ClosedRuns::new(options.closed_run_ttl),
            active_runs: HashMap::new(),
            summary_timer: None,
            history_timers: Vec::new(),
        }
    }

    pub fn live_queue(&self) -> &LivePatchQueue {
        &self.live
    }

    pub fn closed_runs(&self) -> &ClosedRuns {
        &self.closed
    }

    pub fn active_run(&self, agent_id: &str) -> Option<&str> {
        self.active_runs.get(agent_id).map(String::as_str)
    }

    /// Apply `intents` in order.
    pub fn apply_intents(&mut self, intents: Vec<EventIntent>, event: &ClassifiedEvent) {
        self.closed.prune(self.scheduler.now_ms());
        for intent in intents {
            trace!(event = %event.event, plane = ?intent.plane(), "applying intent");
            self.apply(intent, event);
        }
    }

    fn apply(&mut self, intent: EventIntent, event: &ClassifiedEvent) {
        match intent {
            EventIntent::QueueLivePatch { agent_id, patch } => {
                if let Some(run_id) = patch.run_id.as_set() {
                    if self.closed.contains(run_id, self.scheduler.now_ms()) {
                        debug!(agent_id = %agent_id, run_id = %run_id, "live patch for closed run dropped");
                        return;
                    }
                    self.active_runs.insert(agent_id.clone(), run_id.clone());
                }
                self.live.enqueue(&agent_id, patch);
            },
            EventIntent::ClearPendingLivePatch { agent_id } => self.live.clear(&agent_id),
            EventIntent::CommitChat {
                agent_id,
                run_id,
                patch,
                output_lines,
            } => {
                if !output_lines.is_empty() {
                    self.sink.commit_chat(&agent_id, &output_lines);
                }
                self.apply_status(&agent_id, run_id, patch);
            },
            EventIntent::UpdateAgentStatus {
                agent_id,
                run_id,
                patch,
            } => self.apply_status(&agent_id, run_id, patch),
            EventIntent::ScheduleSummaryRefresh => self.schedule_summary_refresh(),
            EventIntent::RequestHistoryRefresh { agent_id, reason } => {
                self.history_timers.retain(TimerHandle::is_pending);
                let sink = Arc::clone(&self.sink);
                let handle = self.scheduler.schedule(
                    Duration::ZERO,
                    Box::new(move || sink.refresh_history(&agent_id, &reason)),
                );
                self.history_timers.push(handle);
            },
            EventIntent::ApprovalPending { agent_id, approval } => {
                info!(agent_id = %agent_id, approval_id = %approval.id, "approval pending");
                self.sink.approval_pending(&agent_id, &approval);
            },
            EventIntent::ApprovalResolved {
                agent_id,
                resolution,
            } => self.sink.approval_resolved(&agent_id, &resolution),
            EventIntent::Ignore { reason } => {
                debug!(event = %event.event, reason = %reason, "event ignored");
            },
        }
    }

    /// Apply a status patch unless it belongs to a run that already ended.
    ///
    /// `run_id` is the run the source event named; without one the agent's
    /// active run stands in.
    fn apply_status(&mut self, agent_id: &str, run_id: Option<String>, patch: AgentStatusPatch) {
        let now = self.scheduler.now_ms();
        let run = run_id.or_else(|| self.active_runs.get(agent_id).cloned());

        if let Some(run) = &run
            && self.closed.contains(run, now)
        {
            debug!(agent_id, run_id = %run, running = patch.is_running(), "stale status patch dropped");
            return;
        }

        if patch.is_running() {
            if let Some(new_run) = patch.run_id.as_set() {
                self.active_runs
                    .insert(agent_id.to_string(), new_run.clone());
            }
            self.sink.patch_agent(agent_id, &patch);
            return;
        }

        self.sink.patch_agent(agent_id, &patch);
        if let Some(run) = run {
            debug!(agent_id, run_id = %run, "run closed");
            if self.active_runs.get(agent_id) == Some(&run) {
                self.active_runs.remove(agent_id);
            }
            self.closed.insert(&run, now);
        }
    }

    fn schedule_summary_refresh(&mut self) {
        if let Some(timer) = self.summary_timer.take() {
            timer.cancel();
        }
        let sink = Arc::clone(&self.sink);
        self.summary_timer = Some(self.scheduler.schedule(
            self.options.summary_debounce,
            Box::new(move || sink.refresh_summary()),
        ));
    }

    /// Cancel every armed timer and forget closed runs.
    pub fn dispose(&mut self) {
        if let Some(timer) = self.summary_timer.take() {
            timer.cancel();
        }
        for timer in self.history_timers.drain(..) {
            timer.cancel();
        }
        self.live.dispose();
        self.closed.clear();
        self.active_runs.clear();
        debug!("intent handler disposed");
    }
}
