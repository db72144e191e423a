//! Actor-based scheduling
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │  MonitoringHub   │
//!                 └────────┬─────────┘
//!                          │ spawns
//!            ┌─────────────┴─────────────┐
//!            │                           │
//!   ┌────────▼─────────┐       ┌─────────▼─────────┐
//!   │ PollScheduler    │       │ Reachability      │
//!   │ (tick: 1s)       │       │ (sweep: 15 min)   │
//!   └────────┬─────────┘       └─────────┬─────────┘
//!            │                           │
//!            └─────────────┬─────────────┘
//!                          │
//!                ┌─────────▼──────────┐
//!                │ Broadcast Channel  │ (MonitorEvent)
//!                └─────────┬──────────┘
//!                          │ subscribe
//!                     API, tests, ...
//! ```
//!
//! ## Actor Types
//!
//! - **PollSchedulerActor**: Reads due points, evaluates thresholds, stores readings
//! - **ReachabilityActor**: Probes devices, logs transitions, stores indicators
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Actors publish events to a broadcast channel for fan-out
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod messages;
pub mod poller;
pub mod reachability;
