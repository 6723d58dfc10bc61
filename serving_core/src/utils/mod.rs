//! # Utilities Module
//!
//! General-purpose helpers that do not belong to a specific subsystem.
//!
//! - **`sys_info`**: the `sysinfo`-backed `HardwareProbe`.
//! - **`stats`**: small numeric helpers shared by the trackers.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Host measurements through `sysinfo`.
pub mod sys_info;
/// Mean, percentile and variation helpers.
pub mod stats;
