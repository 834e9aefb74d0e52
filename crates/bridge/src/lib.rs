//! Turns server-pushed gateway events into agent state patches.
//!
//! ```text
//! EventFrame ─classify→ ClassifiedEvent ─decide→ [EventIntent] ─IntentHandler→ IntentSink
//!                                                      └─ live patches ─LivePatchQueue─┘
//! ```
//!
//! Classification and policy are pure. The handler owns the only state: the
//! closed-run cache that keeps late terminal events from reopening a finished
//! run, the summary debounce timer, and the per-agent live patch queue.

pub mod approval;
pub mod classify;
pub mod handler;
pub mod live;
pub mod policy;
pub mod pump;
pub mod sink;

pub use {
    approval::{ApprovalResolution, PendingApproval},
    classify::{ClassifiedEvent, EventKind, agent_id_from_session_key, classify, is_reasoning_stream},
    handler::{ClosedRuns, HandlerOptions, IntentHandler},
    live::{LivePatchQueue, merge_live_patch},
    policy::{AgentStatus, AgentStatusPatch, EventIntent, FieldPatch, Plane, decide},
    pump::pump,
    sink::{IntentSink, TracingSink},
};
