use cg_optimizer::{Tolerance, DEFAULT_SNAPSHOT_IN, DEFAULT_SNAPSHOT_OUT};
use cg_types::{config_error, CgResult};
use std::path::PathBuf;

/// Initial step size used when none is configured.
pub const DEFAULT_EPS: f64 = 0.1;

/// Setting this variable (to anything) makes the driver reproducible.
pub const TEST_MODE_ENV: &str = "CSG_RUNTEST";

/// Seed used in test mode.
pub const TEST_MODE_SEED: u64 = 1984;

/// Everything one driver invocation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// State file produced by the previous stage.
    pub input: PathBuf,
    /// State file handed to the next stage.
    pub output: PathBuf,
    /// Initial step size; only used on the Initialization transition.
    pub eps: f64,
    pub seed: Option<u64>,
    /// Overrides the strategy's default candidates per iteration.
    pub population_size: Option<usize>,
    pub snapshot_in: PathBuf,
    pub snapshot_out: PathBuf,
    /// How closely the state file must reproduce the last proposed candidates.
    pub tolerance: Tolerance,
}

impl DriverConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            eps: DEFAULT_EPS,
            seed: None,
            population_size: None,
            snapshot_in: PathBuf::from(DEFAULT_SNAPSHOT_IN),
            snapshot_out: PathBuf::from(DEFAULT_SNAPSHOT_OUT),
            tolerance: Tolerance::default(),
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_population_size(mut self, n: Option<usize>) -> Self {
        self.population_size = n;
        self
    }

    pub fn with_snapshot_paths(
        mut self,
        snapshot_in: impl Into<PathBuf>,
        snapshot_out: impl Into<PathBuf>,
    ) -> Self {
        self.snapshot_in = snapshot_in.into();
        self.snapshot_out = snapshot_out.into();
        self
    }

    /// Pin the seed to [`TEST_MODE_SEED`] when `enabled`.
    pub fn with_test_mode(self, enabled: bool) -> Self {
        if enabled {
            self.with_seed(Some(TEST_MODE_SEED))
        } else {
            self
        }
    }

    /// Enable test mode if [`TEST_MODE_ENV`] is set in the environment.
    pub fn with_test_mode_from_env(self) -> Self {
        let enabled = std::env::var_os(TEST_MODE_ENV).is_some();
        self.with_test_mode(enabled)
    }

    pub fn validate(&self) -> CgResult<()> {
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(config_error!("eps must be a positive number, got {}", self.eps));
        }
        if let Some(n) = self.population_size {
            if n < 2 {
                return Err(config_error!("population size must be at least 2, got {n}"));
            }
        }
        if self.snapshot_in == self.snapshot_out {
            return Err(config_error!(
                "snapshot input and output must differ, both are {}",
                self.snapshot_in.display()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_types::CgError;

    #[test]
    fn defaults_match_pipeline_conventions() {
        let config = DriverConfig::new("state.in", "state.out");
        assert_eq!(config.eps, 0.1);
        assert_eq!(config.seed, None);
        assert_eq!(config.snapshot_in, PathBuf::from("cma.internal_state.cur"));
        assert_eq!(config.snapshot_out, PathBuf::from("cma.internal_state.new"));
        config.validate().unwrap();
    }

    #[test]
    fn test_mode_pins_seed() {
        let config = DriverConfig::new("a", "b").with_test_mode(true);
        assert_eq!(config.seed, Some(1984));

        let config = DriverConfig::new("a", "b").with_test_mode(false);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn rejects_bad_values() {
        for eps in [0.0, -0.1, f64::NAN, f64::INFINITY] {
            let config = DriverConfig::new("a", "b").with_eps(eps);
            assert!(matches!(config.validate(), Err(CgError::Config(_))), "eps {eps}");
        }

        let config = DriverConfig::new("a", "b").with_population_size(Some(1));
        assert!(matches!(config.validate(), Err(CgError::Config(_))));

        let config = DriverConfig::new("a", "b").with_snapshot_paths("same", "same");
        assert!(matches!(config.validate(), Err(CgError::Config(_))));
    }
}
