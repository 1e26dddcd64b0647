//! Versioned optimizer snapshot persisted between pipeline iterations.

use cg_types::{consistency_error, dependency_error, write_atomically, CgResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::strategy::{OptimizationStrategy, StrategyFactory};

/// Newest snapshot layout this build reads and the one it writes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Where the previous iteration's snapshot is read from.
pub const DEFAULT_SNAPSHOT_IN: &str = "cma.internal_state.cur";

/// Where this iteration's snapshot is written. The pipeline promotes it to
/// [`DEFAULT_SNAPSHOT_IN`] before the next run.
pub const DEFAULT_SNAPSHOT_OUT: &str = "cma.internal_state.new";

/// Element-wise closeness test: `|a - b| <= atol + rtol * |b|`, with `b`
/// the reference value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-8,
        }
    }
}

impl Tolerance {
    pub fn is_close(&self, a: f64, b: f64) -> bool {
        if a == b {
            return true;
        }
        (a - b).abs() <= self.atol + self.rtol * b.abs()
    }
}

/// Optimizer memory plus the candidates it last handed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSnapshot {
    pub format_version: u32,
    /// Name of the strategy that owns `algorithm_state`.
    pub strategy: String,
    pub saved_at: DateTime<Utc>,
    pub algorithm_state: serde_json::Value,
    pub last_asked: Vec<Vec<f64>>,
}

impl OptimizerSnapshot {
    pub fn capture(
        strategy: &dyn OptimizationStrategy,
        last_asked: Vec<Vec<f64>>,
    ) -> CgResult<Self> {
        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            strategy: strategy.name().to_string(),
            saved_at: Utc::now(),
            algorithm_state: strategy.export_state()?,
            last_asked,
        })
    }

    /// Load a snapshot, refusing layouts newer than this build understands.
    pub fn load<P: AsRef<Path>>(path: P) -> CgResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let raw: serde_json::Value = serde_json::from_str(&text)?;

        let version = raw
            .get("format_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        if version == 0 || version > u64::from(SNAPSHOT_FORMAT_VERSION) {
            return Err(dependency_error!(
                "{} uses snapshot format {version}, this driver supports 1..={SNAPSHOT_FORMAT_VERSION}",
                path.display()
            ));
        }

        let snapshot: Self = serde_json::from_value(raw)?;
        tracing::debug!(
            path = %path.display(),
            strategy = %snapshot.strategy,
            saved_at = %snapshot.saved_at,
            last_asked = snapshot.last_asked.len(),
            "loaded optimizer snapshot"
        );
        Ok(snapshot)
    }

    pub fn to_json(&self) -> CgResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> CgResult<()> {
        let path = path.as_ref();
        write_atomically(path, self.to_json()?.as_bytes())?;
        tracing::debug!(path = %path.display(), "saved optimizer snapshot");
        Ok(())
    }

    /// Rebuild the strategy this snapshot was captured from.
    pub fn restore<S: StrategyFactory>(&self) -> CgResult<S> {
        if self.strategy != S::NAME {
            return Err(dependency_error!(
                "snapshot was written by strategy '{}', but only '{}' is available",
                self.strategy,
                S::NAME
            ));
        }
        S::restore(self.algorithm_state.clone())
    }

    /// Check that `parameters` are, in order, the candidates this snapshot
    /// last proposed.
    pub fn verify_last_asked(&self, parameters: &[Vec<f64>], tolerance: Tolerance) -> CgResult<()> {
        if parameters.len() != self.last_asked.len() {
            return Err(consistency_error!(
                "parameter file holds {} sets, optimizer last proposed {}",
                parameters.len(),
                self.last_asked.len()
            ));
        }

        for (idx, (found, asked)) in parameters.iter().zip(&self.last_asked).enumerate() {
            let matches = found.len() == asked.len()
                && found
                    .iter()
                    .zip(asked)
                    .all(|(f, a)| tolerance.is_close(*a, *f));
            if !matches {
                return Err(consistency_error!(
                    "parameter set {} {found:?} mismatches internally saved parameters {asked:?}",
                    idx + 1
                ));
            }
        }
        Ok(())
    }
}
