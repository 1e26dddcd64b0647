//! # cg-driver
//!
//! Advances an ask/tell optimizer by exactly one iteration of the
//! coarse-graining pipeline: read the evaluated state file, feed the results
//! back, propose the next candidates, and persist both the new state file and
//! the optimizer snapshot.

mod config;
mod driver;

pub use config::{DriverConfig, DEFAULT_EPS, TEST_MODE_ENV, TEST_MODE_SEED};
pub use driver::{IterationDriver, IterationReport, Transition};
