//! Runner wire protocol
//!
//! Text frames carry JSON envelopes `{"type": ..., "data": ...}`. Binary frames
//! carry archive bytes, prefixed with a single final-chunk flag byte.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bench_core::run::{Interpretation, Measurement, MeasurementResult, RunError, RunErrorKind, RunResult};
use bench_core::task::TaskId;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Backend -> runner messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum BackendMessage {
    RequestRun(RequestRun),
    GetStatus,
    GetResult,
    ClearResult,
    AbortRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRun {
    pub task_id: TaskId,
    /// Current benchmark tooling hash, if the backend knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bench_hash: Option<String>,
}

/// Runner -> backend messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RunnerMessage {
    GetStatusReply(GetStatusReply),
    GetResultReply(GetResultReply),
    ClearResultReply,
    RunRequestReply(RunRequestReply),
    WorkReceived(WorkReceived),
    AbortRunReply,
}

impl RunnerMessage {
    /// Decode and validate a text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text)?;
        if let Self::GetResultReply(reply) = &msg {
            reply.validate()?;
        }
        Ok(msg)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetStatusReply(_) => "get-status-reply",
            Self::GetResultReply(_) => "get-result-reply",
            Self::ClearResultReply => "clear-result-reply",
            Self::RunRequestReply(_) => "run-request-reply",
            Self::WorkReceived(_) => "work-received",
            Self::AbortRunReply => "abort-run-reply",
        }
    }
}

/// What the runner reports itself to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerActivity {
    Idle,
    Preparing,
    Running,
    Aborting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStatusReply {
    pub info: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bench_hash: Option<String>,
    pub result_available: bool,
    pub status: RunnerActivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<TaskId>,
}

/// Which archives the runner needs before it can start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequestReply {
    pub bench: bool,
    pub run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkReceived {
    pub run_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResultReply {
    pub run_id: TaskId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BenchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of the benchmark script: benchmarks or a script-level error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benchmarks: Option<Vec<Benchmark>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
    pub name: String,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<Interpretation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<f64>>,
}

impl GetResultReply {
    fn validate(&self) -> Result<(), ProtocolError> {
        match (self.success, &self.result, &self.error) {
            (true, Some(result), None) => result.validate(),
            (true, _, _) => Err(ProtocolError::Invalid(
                "successful result must carry a result and no error".to_string(),
            )),
            (false, None, Some(_)) => Ok(()),
            (false, _, _) => Err(ProtocolError::Invalid(
                "failed result must carry an error and no result".to_string(),
            )),
        }
    }

    /// Turn the runner's answer into the recorded result
    pub fn into_run_result(self) -> RunResult {
        if !self.success {
            let message = self.error.unwrap_or_default();
            return RunResult::Error(RunError::new(RunErrorKind::Runner, message));
        }

        let Some(result) = self.result else {
            return RunResult::Error(RunError::new(RunErrorKind::Runner, "runner sent no result"));
        };
        if let Some(error) = result.error {
            return RunResult::Error(RunError::new(RunErrorKind::BenchScript, error));
        }

        let measurements = result
            .benchmarks
            .unwrap_or_default()
            .into_iter()
            .flat_map(|benchmark| {
                let name = benchmark.name;
                benchmark.metrics.into_iter().map(move |metric| metric.into_measurement(&name))
            })
            .collect();
        RunResult::measurements(measurements)
    }
}

impl BenchResult {
    fn validate(&self) -> Result<(), ProtocolError> {
        match (&self.benchmarks, &self.error) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ProtocolError::Invalid(
                "result must carry either benchmarks or an error".to_string(),
            )),
        }
    }
}

impl Metric {
    fn into_measurement(self, benchmark: &str) -> Measurement {
        let result = match (self.error, self.values) {
            (Some(message), _) => MeasurementResult::Error { message },
            (None, Some(values)) => MeasurementResult::Values {
                values,
                unit: self.unit,
                interpretation: self.interpretation,
            },
            (None, None) => MeasurementResult::Error {
                message: "metric has neither values nor an error".to_string(),
            },
        };
        Measurement {
            benchmark: benchmark.to_string(),
            metric: self.name,
            result,
        }
    }
}

/// Build a binary archive frame
pub fn encode_chunk(payload: &[u8], last: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(u8::from(last));
    frame.extend_from_slice(payload);
    frame
}

/// Split a binary archive frame into its final flag and payload, the way a runner reads it
#[cfg(test)]
pub(crate) fn decode_chunk(frame: &[u8]) -> Option<(bool, &[u8])> {
    frame
        .split_first()
        .map(|(flag, payload)| (*flag != 0, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_backend_message_serialization() {
        let id = TaskId(Uuid::nil());
        let msg = BackendMessage::RequestRun(RequestRun {
            task_id: id,
            bench_hash: Some("cafe".to_string()),
        });

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"request-run\""));
        assert!(json.contains("\"benchHash\":\"cafe\""));
        assert!(json.contains("\"taskId\":\"00000000-0000-0000-0000-000000000000\""));

        let json = serde_json::to_string(&BackendMessage::GetStatus).unwrap();
        assert!(json.contains("\"type\":\"get-status\""));
    }

    #[test]
    fn test_runner_message_deserialization() {
        let json = r#"{"type":"run-request-reply","data":{"bench":true,"run":true}}"#;
        match RunnerMessage::decode(json).unwrap() {
            RunnerMessage::RunRequestReply(reply) => {
                assert!(reply.bench);
                assert!(reply.run);
            }
            other => panic!("Expected RunRequestReply, got {:?}", other),
        }

        let json = r#"{"type":"get-status-reply","data":{"info":"8 cores","resultAvailable":false,"status":"IDLE"}}"#;
        match RunnerMessage::decode(json).unwrap() {
            RunnerMessage::GetStatusReply(reply) => {
                assert_eq!(reply.info, "8 cores");
                assert_eq!(reply.status, RunnerActivity::Idle);
                assert!(reply.run_id.is_none());
            }
            other => panic!("Expected GetStatusReply, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_and_unknown_messages() {
        assert!(matches!(RunnerMessage::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(RunnerMessage::decode(r#"{"type":"teleport","data":{}}"#).is_err());
        assert!(RunnerMessage::decode(r#"{"type":"run-request-reply","data":{"bench":true}}"#).is_err());
    }

    #[test]
    fn test_result_reply_validation() {
        let id = Uuid::new_v4();
        let both = format!(
            r#"{{"type":"get-result-reply","data":{{"runId":"{}","success":true,"result":{{"error":"x"}},"error":"y"}}}}"#,
            id
        );
        assert!(matches!(RunnerMessage::decode(&both), Err(ProtocolError::Invalid(_))));

        let failed_without_error = format!(
            r#"{{"type":"get-result-reply","data":{{"runId":"{}","success":false}}}}"#,
            id
        );
        assert!(matches!(
            RunnerMessage::decode(&failed_without_error),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn test_result_conversion() {
        let json = r#"{
            "runId": "6f9619ff-8b86-d011-b42d-00cf4fc964ff",
            "success": true,
            "result": {"benchmarks": [
                {"name": "build", "metrics": [
                    {"name": "time", "unit": "s", "interpretation": "LESS_IS_BETTER", "values": [1.5, 1.7]},
                    {"name": "size", "error": "no binary"}
                ]}
            ]}
        }"#;
        let reply: GetResultReply = serde_json::from_str(json).unwrap();
        match reply.into_run_result() {
            RunResult::Measurements(measurements) => {
                assert_eq!(measurements.len(), 2);
                assert_eq!(measurements[0].benchmark, "build");
                assert_eq!(measurements[0].metric, "time");
                assert!(!measurements[0].is_error());
                assert!(measurements[1].is_error());
            }
            other => panic!("Expected measurements, got {:?}", other),
        }
    }

    #[test]
    fn test_result_conversion_errors() {
        let runner_failure = GetResultReply {
            run_id: TaskId::new(),
            success: false,
            result: None,
            error: Some("disk full".to_string()),
        };
        assert_eq!(
            runner_failure.into_run_result(),
            RunResult::Error(RunError::new(RunErrorKind::Runner, "disk full"))
        );

        let no_benchmarks = GetResultReply {
            run_id: TaskId::new(),
            success: true,
            result: Some(BenchResult {
                benchmarks: Some(Vec::new()),
                error: None,
            }),
            error: None,
        };
        match no_benchmarks.into_run_result() {
            RunResult::Error(err) => assert_eq!(err.kind, RunErrorKind::BenchScript),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_chunk_framing() {
        let frame = encode_chunk(b"abc", true);
        assert_eq!(frame, vec![1, b'a', b'b', b'c']);
        let (last, payload) = decode_chunk(&frame).unwrap();
        assert!(last);
        assert_eq!(payload, b"abc");

        let empty = encode_chunk(&[], false);
        let (last, payload) = decode_chunk(&empty).unwrap();
        assert!(!last);
        assert!(payload.is_empty());
        assert!(decode_chunk(&[]).is_none());
    }
}
