//! Library half of the `ringwatch` binary: command definitions, layered
//! configuration and the failure-detection simulation.

pub mod cli;
pub mod config;
pub mod simulation;
