//! CMA-ES (Covariance Matrix Adaptation Evolution Strategy).
//!
//! Maintains a multivariate normal search distribution (mean, step size,
//! covariance) that adapts after every evaluated generation. Candidates live
//! directly in parameter space; there is no boundary mapping.

use cg_types::{config_error, consistency_error, CgResult};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::strategy::{
    check_feedback_batch, ObjectiveDirection, OptimizationStrategy, StrategyFactory,
    StrategyStart,
};

/// Eigenvalues below this are clamped before taking square roots.
const MIN_EIGENVALUE: f64 = 1e-20;

/// Tunable options for a fresh strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CmaOptions {
    /// Fixed RNG seed; `None` draws one from the thread-local generator.
    pub seed: Option<u64>,
    /// Candidates per generation; `None` uses `4 + floor(3 ln n)`.
    pub population_size: Option<usize>,
    pub direction: ObjectiveDirection,
}

/// Persisted form of the strategy. Learning rates are derived from
/// `dimension` and `population_size` on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CmaState {
    population_size: usize,
    direction: ObjectiveDirection,
    mean: Vec<f64>,
    sigma: f64,
    /// Row-major.
    covariance: Vec<Vec<f64>>,
    p_c: Vec<f64>,
    p_sigma: Vec<f64>,
    generation: u64,
    rng: RngState,
}

/// Position of the ChaCha stream, enough to resume it exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RngState {
    seed: [u8; 32],
    stream: u64,
    word_pos: u64,
}

impl RngState {
    fn capture(rng: &ChaCha8Rng) -> CgResult<Self> {
        let word_pos = u64::try_from(rng.get_word_pos()).map_err(|_| {
            consistency_error!("random stream position {} exceeds u64", rng.get_word_pos())
        })?;
        Ok(Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos,
        })
    }

    fn resume(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(u128::from(self.word_pos));
        rng
    }
}

/// Selection weights and learning rates (Hansen's standard settings).
#[derive(Debug, Clone)]
struct Coefficients {
    mu: usize,
    weights: DVector<f64>,
    mu_eff: f64,
    c_c: f64,
    c_sigma: f64,
    c_1: f64,
    c_mu: f64,
    d_sigma: f64,
    /// `E[||N(0, I)||]`
    expected_norm: f64,
}

impl Coefficients {
    fn new(dimension: usize, population_size: usize) -> Self {
        let n = dimension as f64;
        let mu = population_size / 2;

        let raw_weights: Vec<f64> = (0..mu)
            .map(|i| (mu as f64 + 0.5).ln() - ((i + 1) as f64).ln())
            .collect();
        let w_sum: f64 = raw_weights.iter().sum();
        let weights = DVector::from_iterator(mu, raw_weights.iter().map(|w| w / w_sum));
        let mu_eff = 1.0 / weights.iter().map(|w| w * w).sum::<f64>();

        let c_sigma = (mu_eff + 2.0) / (n + mu_eff + 5.0);
        let d_sigma = 1.0 + 2.0 * (((mu_eff - 1.0) / (n + 1.0)).sqrt() - 1.0).max(0.0) + c_sigma;
        let c_c = (4.0 + mu_eff / n) / (n + 4.0 + 2.0 * mu_eff / n);
        let c_1 = 2.0 / ((n + 1.3).powi(2) + mu_eff);
        let c_mu =
            (2.0 * (mu_eff - 2.0 + 1.0 / mu_eff) / ((n + 2.0).powi(2) + mu_eff)).min(1.0 - c_1);
        let expected_norm = n.sqrt() * (1.0 - 1.0 / (4.0 * n) + 1.0 / (21.0 * n.powi(2)));

        Self {
            mu,
            weights,
            mu_eff,
            c_c,
            c_sigma,
            c_1,
            c_mu,
            d_sigma,
            expected_norm,
        }
    }
}

/// CMA evolution strategy behind the ask/tell interface.
#[derive(Debug, Clone)]
pub struct CmaEvolutionStrategy {
    dimension: usize,
    population_size: usize,
    direction: ObjectiveDirection,
    mean: DVector<f64>,
    sigma: f64,
    covariance: DMatrix<f64>,
    /// Evolution path for covariance adaptation.
    p_c: DVector<f64>,
    /// Evolution path for step-size adaptation.
    p_sigma: DVector<f64>,
    generation: u64,
    coefficients: Coefficients,
    rng: ChaCha8Rng,
}

impl CmaEvolutionStrategy {
    /// Start a search centered on `x0` with initial step size `sigma0`.
    pub fn new(x0: &[f64], sigma0: f64, options: &CmaOptions) -> CgResult<Self> {
        let dimension = x0.len();
        if dimension == 0 {
            return Err(config_error!("initial parameter set is empty"));
        }
        if x0.iter().any(|v| !v.is_finite()) {
            return Err(config_error!("initial parameter set {x0:?} is not finite"));
        }
        if !sigma0.is_finite() || sigma0 <= 0.0 {
            return Err(config_error!("initial step size must be positive, got {sigma0}"));
        }

        let population_size = options
            .population_size
            .unwrap_or_else(|| 4 + (3.0 * (dimension as f64).ln()).floor() as usize);
        if population_size < 2 {
            return Err(config_error!(
                "population size must be at least 2, got {population_size}"
            ));
        }

        let rng = match options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };

        tracing::debug!(
            dimension,
            population_size,
            sigma = sigma0,
            seed = ?options.seed,
            "initialized CMA-ES"
        );

        Ok(Self {
            dimension,
            population_size,
            direction: options.direction,
            mean: DVector::from_column_slice(x0),
            sigma: sigma0,
            covariance: DMatrix::identity(dimension, dimension),
            p_c: DVector::zeros(dimension),
            p_sigma: DVector::zeros(dimension),
            generation: 0,
            coefficients: Coefficients::new(dimension, population_size),
            rng,
        })
    }

    /// Number of completed `feedback` updates.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current global step size.
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Current distribution mean.
    pub fn mean(&self) -> Vec<f64> {
        self.mean.iter().copied().collect()
    }

    fn to_state(&self) -> CgResult<CmaState> {
        Ok(CmaState {
            population_size: self.population_size,
            direction: self.direction,
            mean: self.mean(),
            sigma: self.sigma,
            covariance: self
                .covariance
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
            p_c: self.p_c.iter().copied().collect(),
            p_sigma: self.p_sigma.iter().copied().collect(),
            generation: self.generation,
            rng: RngState::capture(&self.rng)?,
        })
    }

    fn from_state(state: CmaState) -> CgResult<Self> {
        let dimension = state.mean.len();
        if dimension == 0 {
            return Err(consistency_error!("saved CMA-ES state has an empty mean"));
        }
        if state.p_c.len() != dimension
            || state.p_sigma.len() != dimension
            || state.covariance.len() != dimension
            || state.covariance.iter().any(|row| row.len() != dimension)
        {
            return Err(consistency_error!(
                "saved CMA-ES state is not {dimension}-dimensional throughout"
            ));
        }
        if state.population_size < 2 {
            return Err(consistency_error!(
                "saved CMA-ES population size {} is below 2",
                state.population_size
            ));
        }

        let covariance = DMatrix::from_fn(dimension, dimension, |i, j| state.covariance[i][j]);

        Ok(Self {
            dimension,
            population_size: state.population_size,
            direction: state.direction,
            mean: DVector::from_vec(state.mean),
            sigma: state.sigma,
            covariance,
            p_c: DVector::from_vec(state.p_c),
            p_sigma: DVector::from_vec(state.p_sigma),
            generation: state.generation,
            coefficients: Coefficients::new(dimension, state.population_size),
            rng: state.rng.resume(),
        })
    }
}

impl OptimizationStrategy for CmaEvolutionStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn population_size(&self) -> usize {
        self.population_size
    }

    fn feedback(&mut self, parameters: &[Vec<f64>], results: &[f64]) -> CgResult<()> {
        check_feedback_batch(&*self, parameters, results)?;

        let n = self.dimension;
        let coeff = &self.coefficients;
        let population: Vec<DVector<f64>> = parameters
            .iter()
            .map(|p| DVector::from_column_slice(p))
            .collect();

        // Best first
        let mut indices: Vec<usize> = (0..population.len()).collect();
        indices.sort_by(|&a, &b| self.direction.rank(results[a], results[b]));

        let old_mean = self.mean.clone();
        let mut new_mean = DVector::zeros(n);
        for (w_idx, &pop_idx) in indices.iter().take(coeff.mu).enumerate() {
            new_mean += coeff.weights[w_idx] * &population[pop_idx];
        }

        // C^{-1/2}
        let eigen = SymmetricEigen::new(self.covariance.clone());
        let inv_sqrt_d = DMatrix::from_diagonal(
            &eigen
                .eigenvalues
                .map(|v| 1.0 / v.max(MIN_EIGENVALUE).sqrt()),
        );
        let c_inv_sqrt = &eigen.eigenvectors * inv_sqrt_d * eigen.eigenvectors.transpose();

        let mean_diff = (&new_mean - &old_mean) / self.sigma;

        self.p_sigma = (1.0 - coeff.c_sigma) * &self.p_sigma
            + (coeff.c_sigma * (2.0 - coeff.c_sigma) * coeff.mu_eff).sqrt()
                * &c_inv_sqrt
                * &mean_diff;

        // h_sigma stalls the p_c update while p_sigma is too long
        let gen_factor = 1.0 - (1.0 - coeff.c_sigma).powi(2 * (self.generation as i32 + 1));
        let p_sigma_norm = self.p_sigma.norm();
        let h_sigma_threshold =
            (1.4 + 2.0 / (n as f64 + 1.0)) * coeff.expected_norm * gen_factor.sqrt();
        let h_sigma = if p_sigma_norm < h_sigma_threshold { 1.0 } else { 0.0 };

        self.p_c = (1.0 - coeff.c_c) * &self.p_c
            + h_sigma * (coeff.c_c * (2.0 - coeff.c_c) * coeff.mu_eff).sqrt() * &mean_diff;

        let mut rank_mu_update = DMatrix::zeros(n, n);
        for (w_idx, &pop_idx) in indices.iter().take(coeff.mu).enumerate() {
            let y_i = (&population[pop_idx] - &old_mean) / self.sigma;
            rank_mu_update += coeff.weights[w_idx] * &y_i * y_i.transpose();
        }

        let delta_h_sigma = (1.0 - h_sigma) * coeff.c_c * (2.0 - coeff.c_c);
        let base_weight = 1.0 - coeff.c_1 - coeff.c_mu + coeff.c_1 * delta_h_sigma;
        self.covariance = base_weight * &self.covariance
            + coeff.c_1 * &self.p_c * self.p_c.transpose()
            + coeff.c_mu * rank_mu_update;
        self.covariance = (&self.covariance + self.covariance.transpose()) * 0.5;

        self.sigma *=
            ((coeff.c_sigma / coeff.d_sigma) * (p_sigma_norm / coeff.expected_norm - 1.0)).exp();
        self.mean = new_mean;
        self.generation += 1;

        tracing::debug!(
            generation = self.generation,
            sigma = self.sigma,
            best = results[indices[0]],
            "CMA-ES update"
        );
        Ok(())
    }

    fn propose_next(&mut self) -> Vec<Vec<f64>> {
        let n = self.dimension;

        // C = B D^2 B^T
        let eigen = SymmetricEigen::new(self.covariance.clone());
        let sqrt_d =
            DMatrix::from_diagonal(&eigen.eigenvalues.map(|v| v.max(MIN_EIGENVALUE).sqrt()));
        let bd = &eigen.eigenvectors * sqrt_d;

        let mut candidates = Vec::with_capacity(self.population_size);
        for _ in 0..self.population_size {
            let z = DVector::from_iterator(
                n,
                (0..n).map(|_| {
                    let sample: f64 = StandardNormal.sample(&mut self.rng);
                    sample
                }),
            );
            let x = &self.mean + self.sigma * &bd * z;
            candidates.push(x.iter().copied().collect());
        }
        candidates
    }

    fn export_state(&self) -> CgResult<serde_json::Value> {
        Ok(serde_json::to_value(self.to_state()?)?)
    }
}

impl StrategyFactory for CmaEvolutionStrategy {
    const NAME: &'static str = "cma-es";

    fn initialize(start: &StrategyStart) -> CgResult<Self> {
        let options = CmaOptions {
            seed: start.seed,
            population_size: start.population_size,
            ..CmaOptions::default()
        };
        Self::new(&start.x0, start.step_size, &options)
    }

    fn restore(state: serde_json::Value) -> CgResult<Self> {
        let state: CmaState = serde_json::from_value(state)?;
        Self::from_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cg_types::CgError;

    fn sphere(x: &[f64], center: &[f64]) -> f64 {
        x.iter().zip(center).map(|(a, b)| (a - b).powi(2)).sum()
    }

    #[test]
    fn default_population_size_follows_dimension() {
        let one = CmaEvolutionStrategy::new(&[1.0], 0.1, &CmaOptions::default()).unwrap();
        assert_eq!(one.population_size(), 4);

        let ten = CmaEvolutionStrategy::new(&[0.0; 10], 0.1, &CmaOptions::default()).unwrap();
        assert_eq!(ten.population_size(), 10);
        assert_eq!(ten.dimension(), 10);
    }

    #[test]
    fn rejects_invalid_starting_points() {
        let opts = CmaOptions::default();
        assert!(matches!(
            CmaEvolutionStrategy::new(&[], 0.1, &opts),
            Err(CgError::Config(_))
        ));
        assert!(matches!(
            CmaEvolutionStrategy::new(&[f64::NAN], 0.1, &opts),
            Err(CgError::Config(_))
        ));
        assert!(matches!(
            CmaEvolutionStrategy::new(&[1.0], 0.0, &opts),
            Err(CgError::Config(_))
        ));
        let tiny = CmaOptions {
            population_size: Some(1),
            ..CmaOptions::default()
        };
        assert!(matches!(
            CmaEvolutionStrategy::new(&[1.0], 0.1, &tiny),
            Err(CgError::Config(_))
        ));
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let opts = CmaOptions {
            seed: Some(1984),
            ..CmaOptions::default()
        };
        let mut a = CmaEvolutionStrategy::new(&[1.0, 2.0], 0.1, &opts).unwrap();
        let mut b = CmaEvolutionStrategy::new(&[1.0, 2.0], 0.1, &opts).unwrap();
        assert_eq!(a.propose_next(), b.propose_next());

        let other = CmaOptions {
            seed: Some(7),
            ..CmaOptions::default()
        };
        let mut c = CmaEvolutionStrategy::new(&[1.0, 2.0], 0.1, &other).unwrap();
        assert_ne!(a.propose_next(), c.propose_next());
    }

    #[test]
    fn candidates_scatter_around_start() {
        let opts = CmaOptions {
            seed: Some(3),
            population_size: Some(200),
            ..CmaOptions::default()
        };
        let mut es = CmaEvolutionStrategy::new(&[5.0, -5.0], 0.1, &opts).unwrap();
        let candidates = es.propose_next();
        assert_eq!(candidates.len(), 200);
        for c in &candidates {
            assert_eq!(c.len(), 2);
            assert!((c[0] - 5.0).abs() < 1.0 && (c[1] + 5.0).abs() < 1.0, "{c:?}");
        }
        let mean_x: f64 = candidates.iter().map(|c| c[0]).sum::<f64>() / 200.0;
        assert!((mean_x - 5.0).abs() < 0.05, "sample mean {mean_x}");
    }

    #[test]
    fn converges_on_shifted_sphere() {
        let opts = CmaOptions {
            seed: Some(1984),
            ..CmaOptions::default()
        };
        let target = [2.0, 1.0];
        let mut es = CmaEvolutionStrategy::new(&[0.0, 0.0], 0.5, &opts).unwrap();

        for _ in 0..80 {
            let candidates = es.propose_next();
            let results: Vec<f64> = candidates.iter().map(|c| sphere(c, &target)).collect();
            es.feedback(&candidates, &results).unwrap();
        }

        assert_eq!(es.generation(), 80);
        let mean = es.mean();
        assert!(sphere(&mean, &target) < 1e-3, "mean {mean:?} too far from {target:?}");
    }

    #[test]
    fn maximize_climbs_toward_peak() {
        let opts = CmaOptions {
            seed: Some(11),
            direction: ObjectiveDirection::Maximize,
            ..CmaOptions::default()
        };
        let mut es = CmaEvolutionStrategy::new(&[1.0], 0.3, &opts).unwrap();
        for _ in 0..60 {
            let candidates = es.propose_next();
            let results: Vec<f64> = candidates.iter().map(|c| -sphere(c, &[-1.0])).collect();
            es.feedback(&candidates, &results).unwrap();
        }
        assert!((es.mean()[0] + 1.0).abs() < 0.05, "mean {:?}", es.mean());
    }

    #[test]
    fn feedback_rejects_mismatched_batches() {
        let opts = CmaOptions {
            seed: Some(1),
            ..CmaOptions::default()
        };
        let mut es = CmaEvolutionStrategy::new(&[1.0, 2.0], 0.1, &opts).unwrap();
        let candidates = es.propose_next();

        let short = vec![0.0; candidates.len() - 1];
        assert!(matches!(es.feedback(&candidates, &short), Err(CgError::Config(_))));

        let partial = &candidates[..2];
        assert!(matches!(
            es.feedback(partial, &[0.0, 0.0]),
            Err(CgError::Config(_))
        ));

        let mut wrong_dim = candidates.clone();
        wrong_dim[1].push(0.0);
        let results = vec![0.0; wrong_dim.len()];
        assert!(matches!(es.feedback(&wrong_dim, &results), Err(CgError::Config(_))));
        assert_eq!(es.generation(), 0);
    }

    #[test]
    fn non_finite_results_do_not_poison_state() {
        let opts = CmaOptions {
            seed: Some(5),
            ..CmaOptions::default()
        };
        let mut es = CmaEvolutionStrategy::new(&[0.0, 0.0], 0.2, &opts).unwrap();
        let candidates = es.propose_next();
        let mut results: Vec<f64> = candidates.iter().map(|c| c[0] * c[0] + c[1]).collect();
        results[0] = f64::NAN;
        results[1] = f64::INFINITY;
        es.feedback(&candidates, &results).unwrap();

        assert!(es.sigma().is_finite());
        assert!(es.mean().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn exported_state_restores_identical_stream() {
        let opts = CmaOptions {
            seed: Some(42),
            ..CmaOptions::default()
        };
        let target = [0.5, 0.5, 0.5];
        let mut es = CmaEvolutionStrategy::new(&[0.0, 0.0, 0.0], 0.3, &opts).unwrap();
        for _ in 0..3 {
            let candidates = es.propose_next();
            let results: Vec<f64> = candidates.iter().map(|c| sphere(c, &target)).collect();
            es.feedback(&candidates, &results).unwrap();
        }

        let state = es.export_state().unwrap();
        let mut restored = CmaEvolutionStrategy::restore(state).unwrap();

        assert_eq!(restored.generation(), es.generation());
        assert_eq!(restored.sigma(), es.sigma());
        assert_eq!(restored.mean(), es.mean());
        assert_eq!(restored.propose_next(), es.propose_next());
    }

    #[test]
    fn oversized_stream_position_is_not_truncated() {
        let mut es = CmaEvolutionStrategy::new(&[0.0], 0.3, &CmaOptions::default()).unwrap();
        es.rng.set_word_pos(u128::from(u64::MAX) + 16);
        assert!(matches!(es.export_state(), Err(CgError::Consistency(_))));

        es.rng.set_word_pos(u128::from(u64::MAX) - 15);
        let restored = CmaEvolutionStrategy::restore(es.export_state().unwrap()).unwrap();
        assert_eq!(restored.rng.get_word_pos(), es.rng.get_word_pos());
    }

    #[test]
    fn restore_rejects_inconsistent_state() {
        let es = CmaEvolutionStrategy::new(&[0.0, 0.0], 0.3, &CmaOptions::default()).unwrap();
        let mut state = es.export_state().unwrap();
        state["p_c"] = serde_json::json!([0.0]);
        assert!(matches!(
            CmaEvolutionStrategy::restore(state),
            Err(CgError::Consistency(_))
        ));

        let garbage = serde_json::json!({ "mean": "nope" });
        assert!(matches!(
            CmaEvolutionStrategy::restore(garbage),
            Err(CgError::Serialization(_))
        ));
    }
}
