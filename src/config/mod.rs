//! Configuration module
//!
//! Handles loading the simulator configuration file.

mod simulator;

pub use simulator::*;
