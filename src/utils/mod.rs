//! Process-level helpers shared by salesbus binaries.

pub mod bootstrap;
