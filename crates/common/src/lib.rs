//! Shared capabilities for the studio crates.
//!
//! Everything that waits on wall-clock time (reconnect backoff, debounce,
//! closed-run expiry, live patch batching) goes through [`Scheduler`] so tests
//! can drive a [`ManualScheduler`] instead of sleeping.

pub mod scheduler;

pub use scheduler::{
    ManualScheduler, Scheduler, SharedScheduler, Task, TimerHandle, TokioScheduler, sleep,
    unix_now_ms,
};
