//! Strategy interface shared by every optimizer the driver can step.

use cg_types::{config_error, CgResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Whether lower or higher results are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// Order two results best-first. Non-finite results always rank last.
    pub fn rank(&self, a: f64, b: f64) -> Ordering {
        let key = |v: f64| {
            if !v.is_finite() {
                f64::INFINITY
            } else if *self == Self::Maximize {
                -v
            } else {
                v
            }
        };
        key(a).total_cmp(&key(b))
    }
}

/// Everything needed to build a fresh strategy from a single starting point.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyStart {
    pub x0: Vec<f64>,
    /// Initial spread of the search around `x0`.
    pub step_size: f64,
    pub seed: Option<u64>,
    pub population_size: Option<usize>,
}

impl StrategyStart {
    pub fn new(x0: Vec<f64>, step_size: f64) -> Self {
        Self {
            x0,
            step_size,
            seed: None,
            population_size: None,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_population_size(mut self, n: Option<usize>) -> Self {
        self.population_size = n;
        self
    }
}

/// Ask/tell interface of an optimizer.
pub trait OptimizationStrategy: Send {
    /// Human-readable strategy name, recorded in snapshots.
    fn name(&self) -> &str;

    /// Length of every parameter vector.
    fn dimension(&self) -> usize;

    /// Number of candidates returned by each `propose_next`.
    fn population_size(&self) -> usize;

    /// Report evaluated candidates, in the order they were proposed.
    fn feedback(&mut self, parameters: &[Vec<f64>], results: &[f64]) -> CgResult<()>;

    /// Generate the next batch of candidates to evaluate.
    fn propose_next(&mut self) -> Vec<Vec<f64>>;

    /// Internal state as an opaque JSON value.
    fn export_state(&self) -> CgResult<serde_json::Value>;
}

/// Construction side of a strategy: from a starting point or a saved state.
pub trait StrategyFactory: OptimizationStrategy + Sized {
    const NAME: &'static str;

    fn initialize(start: &StrategyStart) -> CgResult<Self>;

    fn restore(state: serde_json::Value) -> CgResult<Self>;
}

/// Shape checks every `feedback` implementation applies before learning.
pub(crate) fn check_feedback_batch(
    strategy: &dyn OptimizationStrategy,
    parameters: &[Vec<f64>],
    results: &[f64],
) -> CgResult<()> {
    if parameters.len() != results.len() {
        return Err(config_error!(
            "{} parameter sets but {} results",
            parameters.len(),
            results.len()
        ));
    }
    if parameters.len() != strategy.population_size() {
        return Err(config_error!(
            "{} expects {} evaluated candidates, got {}",
            strategy.name(),
            strategy.population_size(),
            parameters.len()
        ));
    }
    if let Some((idx, p)) = parameters
        .iter()
        .enumerate()
        .find(|(_, p)| p.len() != strategy.dimension())
    {
        return Err(config_error!(
            "parameter set {} has dimension {}, expected {}",
            idx + 1,
            p.len(),
            strategy.dimension()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimize_ranks_lower_first() {
        let dir = ObjectiveDirection::default();
        assert_eq!(dir, ObjectiveDirection::Minimize);
        assert_eq!(dir.rank(0.1, 0.5), Ordering::Less);
        assert_eq!(dir.rank(2.0, -1.0), Ordering::Greater);
    }

    #[test]
    fn maximize_ranks_higher_first() {
        let dir = ObjectiveDirection::Maximize;
        assert_eq!(dir.rank(0.5, 0.1), Ordering::Less);
    }

    #[test]
    fn non_finite_results_rank_last() {
        for dir in [ObjectiveDirection::Minimize, ObjectiveDirection::Maximize] {
            assert_eq!(dir.rank(f64::NAN, 1e300), Ordering::Greater);
            assert_eq!(dir.rank(-5.0, f64::NAN), Ordering::Less);
            assert_eq!(dir.rank(f64::NEG_INFINITY, 0.0), Ordering::Greater);
        }
    }

    #[test]
    fn start_builder_chain() {
        let start = StrategyStart::new(vec![1.0, 2.0], 0.1)
            .with_seed(Some(1984))
            .with_population_size(Some(8));
        assert_eq!(start.seed, Some(1984));
        assert_eq!(start.population_size, Some(8));
        assert_eq!(start.x0, vec![1.0, 2.0]);
    }
}
