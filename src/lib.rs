//! crashwatch: runtime crash-risk and stall diagnosis for plugin-extensible
//! host processes.
//!
//! Three cooperating parts:
//! - [`risk`]: fuses noisy symptoms into one time-decayed score and raises a
//!   rate-limited composite alert.
//! - [`stall`]: confirms a monitored thread is stuck (not merely busy) by
//!   repeated stack sampling cross-checked against CPU time.
//! - [`attribution`]: maps stacks, faults, and logger names back to the
//!   extension module most likely responsible.
//!
//! [`monitors`] feed the aggregator from runtime metrics and [`guardian`]
//! wires everything together for a host.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod schedule;

pub mod modules;
pub mod stack;

pub mod attribution;
pub mod risk;
pub mod sampling;
pub mod stall;

pub mod guardian;
pub mod monitors;
