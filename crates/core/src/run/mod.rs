mod persistence;
mod run_model;
mod sink;

pub use persistence::FileRunStore;
pub use run_model::{
    Interpretation, Measurement, MeasurementResult, Run, RunError, RunErrorKind, RunResult,
};
pub use sink::ResultSink;
