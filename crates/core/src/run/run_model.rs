use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskId, TaskSource};

/// How to read a metric's values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Interpretation {
    LessIsBetter,
    MoreIsBetter,
    Neutral,
}

/// Outcome of a single metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MeasurementResult {
    Values {
        values: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interpretation: Option<Interpretation>,
    },
    Error {
        message: String,
    },
}

/// One metric of one benchmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub benchmark: String,
    pub metric: String,
    pub result: MeasurementResult,
}

impl Measurement {
    pub fn is_error(&self) -> bool {
        matches!(self.result, MeasurementResult::Error { .. })
    }
}

/// Who is to blame for a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// The benchmark script failed or produced nothing usable
    BenchScript,
    /// The runner failed before or around the benchmark script
    Runner,
    /// The backend could not prepare the run
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub kind: RunErrorKind,
}

impl RunError {
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

/// Either an error or a non-empty list of measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RunResult {
    Error(RunError),
    Measurements(Vec<Measurement>),
}

impl RunResult {
    /// Wrap measurements, turning an empty list into a bench script error
    pub fn measurements(measurements: Vec<Measurement>) -> Self {
        if measurements.is_empty() {
            Self::Error(RunError::new(
                RunErrorKind::BenchScript,
                "benchmark script produced no measurements",
            ))
        } else {
            Self::Measurements(measurements)
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Recorded outcome of executing a task. Shares the task's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: TaskId,
    pub author: String,
    pub runner_name: String,
    #[serde(default)]
    pub runner_info: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub source: TaskSource,
    pub result: RunResult,
}

impl Run {
    /// Build the run of a finished task, stopping now
    pub fn finish(
        task: &Task,
        runner_name: impl Into<String>,
        runner_info: impl Into<String>,
        start_time: DateTime<Utc>,
        result: RunResult,
    ) -> Self {
        Self {
            id: task.id,
            author: task.author.clone(),
            runner_name: runner_name.into(),
            runner_info: runner_info.into(),
            start_time,
            stop_time: Utc::now(),
            source: task.source.clone(),
            result,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.stop_time - self.start_time
    }
}
