//! Provides API for the pipebench operator and related tooling.
#![warn(missing_docs)]

/// Operator configuration constructed once at process start.
pub mod config;
/// DataSet module for referencing generated test data.
pub mod dataset;
/// Experiment module for orchestrating load experiments.
pub mod experiment;
/// Labels module for managing resource labels.
pub(crate) mod labels;
/// Lgen module for the load generator's TestRun resource.
pub mod lgen;
/// LoadPattern module for describing traffic shapes.
pub mod loadpattern;
/// Pipeline module for the system under test and its advisory lock.
pub mod pipeline;
/// Utils module for shared utility functions.
pub mod utils;
