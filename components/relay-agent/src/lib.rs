//! Relay Agent: a high-throughput log collection and aggregation agent.
//!
//! Events flow from the inputs (file tailer, syslog, HTTP ingestion)
//! through the parser and transform stage into a bounded buffer, and from
//! there through a worker pool toward downstream delivery, with on-disk
//! position checkpoints giving file sources bounded-loss resume.

pub mod buffer;
pub mod checkpoint;
pub mod cli;
pub mod helpers;
pub mod input;
pub mod instrumentation;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod pool;
pub mod runtime;
pub mod tailer;
pub mod transform;
