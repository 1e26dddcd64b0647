//! One iteration of the optimizer state machine.

use cg_optimizer::{OptimizerSnapshot, StrategyFactory, StrategyStart};
use cg_types::{config_error, write_atomically, CgError, CgResult, StateLabel, StateRecord, Trial};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::DriverConfig;

/// Which way the driver entered the shared advance step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Fresh optimizer seeded from the single starting point.
    Initialization,
    /// Optimizer restored from the previous snapshot and fed the new results.
    Running,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => f.write_str("Initialization"),
            Self::Running => f.write_str("Running"),
        }
    }
}

/// Summary of a completed iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub transition: Transition,
    pub candidates: usize,
    pub dimension: usize,
    pub output: PathBuf,
    pub snapshot: PathBuf,
}

/// Drives a strategy through one pipeline iteration.
#[derive(Debug, Clone)]
pub struct IterationDriver {
    config: DriverConfig,
}

impl IterationDriver {
    pub fn new(config: DriverConfig) -> CgResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Read the input state, step the optimizer and write the next state and
    /// snapshot. Nothing is written if any check fails.
    pub fn run<S: StrategyFactory>(&self) -> CgResult<IterationReport> {
        let record = StateRecord::read(&self.config.input)
            .map_err(|e| with_path(e, "reading state file", &self.config.input))?;
        tracing::info!(
            label = %record.label,
            parameters = ?record.parameters(),
            results = ?record.results(),
            "we are in state"
        );

        match record.label {
            StateLabel::Initialization => {
                let strategy = self.start::<S>(&record)?;
                self.advance(Transition::Initialization, strategy, &record)
            }
            _ => {
                let strategy = self.resume::<S>(&record)?;
                self.advance(Transition::Running, strategy, &record)
            }
        }
    }

    fn start<S: StrategyFactory>(&self, record: &StateRecord) -> CgResult<S> {
        let [entry] = record.entries.as_slice() else {
            return Err(config_error!(
                "in the Initialization step the state file should contain only one set (line), found {}",
                record.len()
            ));
        };

        let start = StrategyStart::new(entry.parameters.clone(), self.config.eps)
            .with_seed(self.config.seed)
            .with_population_size(self.config.population_size);
        let strategy = S::initialize(&start)?;
        tracing::info!(
            strategy = S::NAME,
            dimension = strategy.dimension(),
            population_size = strategy.population_size(),
            eps = self.config.eps,
            seed = ?self.config.seed,
            "initialized optimizer"
        );
        Ok(strategy)
    }

    fn resume<S: StrategyFactory>(&self, record: &StateRecord) -> CgResult<S> {
        let path = &self.config.snapshot_in;
        let snapshot = OptimizerSnapshot::load(path)
            .map_err(|e| with_path(e, "reading optimizer snapshot", path))?;
        let mut strategy = snapshot.restore::<S>()?;

        snapshot.verify_last_asked(&record.parameters(), self.config.tolerance)?;
        tracing::debug!(
            sets = snapshot.last_asked.len(),
            "state file matches last proposed candidates"
        );

        // The snapshot holds the candidates at full precision; the file only
        // carries their printed form.
        strategy.feedback(&snapshot.last_asked, &record.results())?;
        Ok(strategy)
    }

    fn advance<S: StrategyFactory>(
        &self,
        transition: Transition,
        mut strategy: S,
        previous: &StateRecord,
    ) -> CgResult<IterationReport> {
        let candidates = strategy.propose_next();
        let next = StateRecord::new(
            StateLabel::Running,
            candidates.iter().cloned().map(Trial::pending).collect(),
            previous.comments.clone(),
        );
        tracing::info!(
            label = %next.label,
            parameters = ?candidates,
            results = ?next.results(),
            "we are going to state"
        );

        let report = IterationReport {
            transition,
            candidates: next.len(),
            dimension: next.dimension(),
            output: self.config.output.clone(),
            snapshot: self.config.snapshot_out.clone(),
        };

        let state_text = next.render();
        let snapshot_json = OptimizerSnapshot::capture(&strategy, candidates)?.to_json()?;

        write_atomically(&self.config.output, state_text.as_bytes())
            .map_err(|e| with_path(e, "writing state file", &self.config.output))?;
        write_atomically(&self.config.snapshot_out, snapshot_json.as_bytes())
            .map_err(|e| with_path(e, "writing optimizer snapshot", &self.config.snapshot_out))?;

        tracing::info!(
            %transition,
            candidates = report.candidates,
            output = %report.output.display(),
            snapshot = %report.snapshot.display(),
            "iteration complete"
        );
        Ok(report)
    }
}

/// Name the file an I/O failure happened on.
fn with_path(err: CgError, action: &str, path: &Path) -> CgError {
    match err {
        CgError::Io(io) => CgError::Io(std::io::Error::new(
            io.kind(),
            format!("{action} {}: {io}", path.display()),
        )),
        other => other,
    }
}
