//! Point and device monitoring logic, independent of scheduling
//!
//! - [`threshold`]: per-point MIN/MAX alarm state machine
//! - [`reachability`]: ICMP probing and OK/NOK transitions
//! - [`indicators`]: fleet indicators computed after each sweep

pub mod indicators;
pub mod reachability;
pub mod threshold;
