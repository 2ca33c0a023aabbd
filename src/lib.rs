//! Workflows shipped with the `hive` binary.

pub mod taskflow;
