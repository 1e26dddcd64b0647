//! # cg-optimizer
//!
//! Ask/tell optimization strategies for the coarse-graining iteration driver.
//!
//! Provides the strategy interface the driver talks to, a native CMA
//! evolution strategy implementing it, and the versioned snapshot that carries
//! optimizer memory from one pipeline iteration to the next.

mod cma;
mod snapshot;
mod strategy;

pub use cma::{CmaEvolutionStrategy, CmaOptions};
pub use snapshot::{
    OptimizerSnapshot, Tolerance, DEFAULT_SNAPSHOT_IN, DEFAULT_SNAPSHOT_OUT,
    SNAPSHOT_FORMAT_VERSION,
};
pub use strategy::{ObjectiveDirection, OptimizationStrategy, StrategyFactory, StrategyStart};
