//! The minion: everything that runs on each VM.
//!
//! A minion process is role-agnostic until the foreman tells it otherwise.
//! The [`supervisor`] keeps the system containers (etcd, OVS, OVN, swarm)
//! matched to the role; the [`scheduler`] (on the master leader) drives the
//! swarm; the [`network`] worker wires every scheduled container into the
//! software-defined network; [`server`] is the config RPC the foreman talks
//! to. The container runtime is consumed through the thin [`docker`]
//! interface so every loop is testable against the in-memory fake.

pub mod docker;
pub mod network;
pub mod scheduler;
pub mod server;
pub mod supervisor;
