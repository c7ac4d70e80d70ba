//! Master-side cloud reconciliation.
//!
//! [`cluster`] diffs the Machine table against the union of every cloud's
//! inventory and boots or terminates the difference; [`foreman`] pushes each
//! booted machine its minion configuration and reads back what the minion
//! reports. Both run from the same trigger loop, rate limited so tick storms
//! don't hammer the cloud APIs.

pub mod cluster;
pub mod foreman;

pub use cluster::{run, Cluster};
pub use foreman::Foreman;
