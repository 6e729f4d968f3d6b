//! Taskgate - per-user task list API with shared admission control
//!
//! Protected operations are admitted under a fixed-window quota per caller.
//! Counters live in a shared store (Redis) so that every server process sees
//! the same count for the same caller, operation and window.

pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod ratelimit;
pub mod tasks;
