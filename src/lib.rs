//! Cortex: a concurrent port scanning engine with nmap-style service
//! detection and an asynchronous scan task queue.
//!
//! The pieces, leaves first: [`probes`] loads the service-detection
//! database, [`techniques`] implements the three probing strategies,
//! [`scanner`] fans jobs out to a worker pool, and [`tasks`] drives queued
//! scan tasks through their lifecycle against a pluggable [`tasks::TaskStore`].

pub mod models;
pub mod probes;
pub mod scanner;
pub mod tasks;
pub mod techniques;
pub mod utils;
