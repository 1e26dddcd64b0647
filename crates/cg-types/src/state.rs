//! State-file model exchanged with the simulation pipeline.
//!
//! A state file looks like
//!
//! ```text
//! #State = Running
//! # free-form comment lines
//! 1.000000e+00 2.000000e+00 0.5 complete
//! ```
//!
//! where every data line holds the parameter vector, the scalar result of the
//! trial and a status token.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

use crate::errors::{CgResult, StateFormatError};

/// Prefix of the header line carrying the state label.
pub const HEADER_PREFIX: &str = "#State = ";

/// Placeholder label of a record whose state was never set.
pub const UNDEFINED_LABEL: &str = "Undefined";

/// Prefix of comment lines.
pub const COMMENT_PREFIX: char = '#';

/// Which phase of the pipeline produced a state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateLabel {
    Initialization,
    Running,
    /// Any other tag defined by the surrounding pipeline.
    Other(String),
}

impl StateLabel {
    pub fn from_token(token: &str) -> Self {
        match token {
            "Initialization" => Self::Initialization,
            "Running" => Self::Running,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialization => "Initialization",
            Self::Running => "Running",
            Self::Other(tag) => tag,
        }
    }
}

impl fmt::Display for StateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion status of a single trial, matched case-insensitively on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Complete,
    Try,
    Pending,
    Other(String),
}

impl TrialStatus {
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("complete") {
            Self::Complete
        } else if token.eq_ignore_ascii_case("try") {
            Self::Try
        } else if token.eq_ignore_ascii_case("pending") {
            Self::Pending
        } else {
            Self::Other(token.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Complete => "complete",
            Self::Try => "try",
            Self::Pending => "pending",
            Self::Other(token) => token,
        }
    }

    /// Whether the optimizer may consume this trial's result.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Complete | Self::Try)
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parameter vector with its evaluated result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub parameters: Vec<f64>,
    pub result: f64,
    pub status: TrialStatus,
}

impl Trial {
    /// A trial proposed for evaluation, result placeholder zero.
    pub fn pending(parameters: Vec<f64>) -> Self {
        Self {
            parameters,
            result: 0.0,
            status: TrialStatus::Pending,
        }
    }
}

/// Parsed and validated contents of one state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub label: StateLabel,
    /// Order matches the optimizer's candidate order.
    pub entries: Vec<Trial>,
    pub comments: String,
}

impl StateRecord {
    pub fn new(label: StateLabel, entries: Vec<Trial>, comments: impl Into<String>) -> Self {
        Self {
            label,
            entries,
            comments: comments.into(),
        }
    }

    /// Read and validate a state file.
    pub fn read<P: AsRef<Path>>(path: P) -> CgResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let record = Self::parse_named(&text, &path.display().to_string())?;
        tracing::debug!(
            path = %path.display(),
            label = %record.label,
            entries = record.entries.len(),
            "read state file"
        );
        Ok(record)
    }

    /// Parse state-file text that did not come from a named file.
    pub fn parse(text: &str) -> Result<Self, StateFormatError> {
        Self::parse_named(text, "<input>")
    }

    fn parse_named(text: &str, source_name: &str) -> Result<Self, StateFormatError> {
        let mut label: Option<StateLabel> = None;
        let mut comment_lines: Vec<&str> = Vec::new();
        let mut entries = Vec::new();
        let mut line_numbers = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_number = idx + 1;

            if let Some(rest) = line.strip_prefix(HEADER_PREFIX) {
                label = rest
                    .split_whitespace()
                    .next()
                    .filter(|token| *token != UNDEFINED_LABEL)
                    .map(StateLabel::from_token);
                continue;
            }
            if line.starts_with(COMMENT_PREFIX) {
                comment_lines.push(line);
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }

            entries.push(parse_trial(line, line_number)?);
            line_numbers.push(line_number);
        }

        let label = label.ok_or_else(|| StateFormatError::MissingLabel {
            source_name: source_name.to_string(),
        })?;

        let Some(first) = entries.first() else {
            return Err(StateFormatError::Empty {
                source_name: source_name.to_string(),
            });
        };

        let expected = first.parameters.len();
        if let Some((idx, trial)) = entries
            .iter()
            .enumerate()
            .find(|(_, trial)| trial.parameters.len() != expected)
        {
            return Err(StateFormatError::RaggedParameters {
                set: idx + 1,
                expected,
                found: trial.parameters.len(),
            });
        }

        if label != StateLabel::Initialization {
            if let Some((trial, line)) = entries
                .iter()
                .zip(&line_numbers)
                .find(|(trial, _)| !trial.status.is_accepted())
            {
                return Err(StateFormatError::InvalidStatus {
                    line: *line,
                    token: trial.status.as_str().to_string(),
                });
            }
        }

        Ok(Self {
            label,
            entries,
            comments: comment_lines.join("\n").trim().to_string(),
        })
    }

    /// Render the record as state-file text.
    ///
    /// Every entry is flagged `pending`: the written file describes trials
    /// the pipeline has yet to evaluate.
    pub fn render(&self) -> String {
        let mut out = format!("{HEADER_PREFIX}{}\n{}\n", self.label, self.comments);
        for trial in &self.entries {
            for value in &trial.parameters {
                out.push_str(&format_scientific(*value));
                out.push(' ');
            }
            out.push_str(&format!("{} {}\n", trial.result, TrialStatus::Pending));
        }
        out
    }

    /// Write the record to `path`, replacing any previous file atomically.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> CgResult<()> {
        let path = path.as_ref();
        write_atomically(path, self.render().as_bytes())?;
        tracing::debug!(
            path = %path.display(),
            label = %self.label,
            entries = self.entries.len(),
            "wrote state file"
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimensionality of the optimization problem.
    pub fn dimension(&self) -> usize {
        self.entries.first().map_or(0, |t| t.parameters.len())
    }

    pub fn parameters(&self) -> Vec<Vec<f64>> {
        self.entries.iter().map(|t| t.parameters.clone()).collect()
    }

    pub fn results(&self) -> Vec<f64> {
        self.entries.iter().map(|t| t.result).collect()
    }
}

fn parse_trial(line: &str, line_number: usize) -> Result<Trial, StateFormatError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((status, numeric)) = tokens.split_last() else {
        return Err(StateFormatError::TooFewTokens {
            line: line_number,
            text: line.trim().to_string(),
        });
    };

    let values = numeric
        .iter()
        .map(|token| token.parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .map_err(|_| StateFormatError::NonNumeric {
            line: line_number,
            text: line.trim().to_string(),
        })?;

    let Some((result, parameters)) = values.split_last() else {
        return Err(StateFormatError::TooFewTokens {
            line: line_number,
            text: line.trim().to_string(),
        });
    };

    Ok(Trial {
        parameters: parameters.to_vec(),
        result: *result,
        status: TrialStatus::from_token(status),
    })
}

/// Format a value like C's `%e`: six fractional digits and a signed,
/// at least two-digit exponent (`1.500000e-03`).
pub fn format_scientific(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let formatted = format!("{value:.6e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

/// Write `contents` to a temporary file next to `path` and rename it into
/// place, so readers never observe a half-written file.
pub fn write_atomically(path: &Path, contents: &[u8]) -> CgResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
