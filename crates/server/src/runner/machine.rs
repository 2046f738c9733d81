//! Per-runner protocol state machine
//!
//! The machine is pure: it consumes [`Event`]s and returns the [`Effect`]s the
//! session driver has to carry out. It never touches a socket, a timer or the
//! queue itself, so every transition can be tested as a table.
//!
//! Whenever a connection ends while a task is assigned, the task is handed back
//! through exactly one [`Effect::ReleaseTask`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use bench_core::run::Run;
use bench_core::task::{Task, TaskId};

use super::protocol::{
    BackendMessage, GetResultReply, GetStatusReply, RequestRun, RunRequestReply, RunnerActivity,
    RunnerMessage,
};
use super::status::CloseCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingRunReply,
    AwaitingBenchTransfer,
    AwaitingTaskTransfer,
    Executing,
    AwaitingAbortReply,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Waiting for the run request reply
    Reply,
    /// Waiting for the next archive chunk to go out
    NextChunk,
    /// Waiting for the abort acknowledgement
    AbortReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Bench,
    Task,
}

#[derive(Debug)]
pub enum Event {
    Assign {
        task: Task,
        bench_hash: Option<String>,
    },
    Message(RunnerMessage),
    /// A text frame that failed to decode
    Malformed,
    /// A binary frame arrived from the runner
    InboundBinary,
    /// An archive frame was written to the runner
    ChunkSent { last: bool },
    /// The archive for the current transfer could not be read
    TransferFailed,
    Abort,
    StatusTick,
    TimerFired(TimerKind),
    PingTimeout,
    /// The transport is gone
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(BackendMessage),
    /// Start a timer, replacing the running one
    StartTimer(TimerKind),
    CancelTimer,
    BeginTransfer(TransferKind),
    DiscardTransfer,
    RecordRun(Run),
    ReleaseTask(Task),
    /// The runner can take a new task
    BecameIdle,
    Close(CloseCode),
}

#[derive(Debug, Clone)]
struct Assignment {
    task: Task,
    started_at: DateTime<Utc>,
    task_transfer_pending: bool,
    work_received: bool,
    result_requested: bool,
}

/// Protocol state of one runner connection
#[derive(Debug)]
pub struct SessionMachine {
    runner_name: String,
    state: SessionState,
    assignment: Option<Assignment>,
    runner_info: String,
    bench_hash: Option<String>,
    activity: Option<RunnerActivity>,
    /// Task id of the run recorded last
    last_run: Option<TaskId>,
}

impl SessionMachine {
    pub fn new(runner_name: impl Into<String>) -> Self {
        Self {
            runner_name: runner_name.into(),
            state: SessionState::Idle,
            assignment: None,
            runner_info: String::new(),
            bench_hash: None,
            activity: None,
            last_run: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    pub fn task(&self) -> Option<&Task> {
        self.assignment.as_ref().map(|a| &a.task)
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task().map(|t| t.id)
    }

    pub fn runner_info(&self) -> &str {
        &self.runner_info
    }

    /// Tooling hash last reported by the runner
    pub fn bench_hash(&self) -> Option<&str> {
        self.bench_hash.as_deref()
    }

    pub fn activity(&self) -> Option<RunnerActivity> {
        self.activity
    }

    /// Whether an abort for `task_id` would be accepted now
    pub fn can_abort(&self, task_id: TaskId) -> bool {
        !matches!(
            self.state,
            SessionState::Idle | SessionState::AwaitingAbortReply | SessionState::Disconnected
        ) && self.task_id() == Some(task_id)
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        if self.state == SessionState::Disconnected {
            return match event {
                Event::Assign { task, .. } => vec![Effect::ReleaseTask(task)],
                _ => Vec::new(),
            };
        }

        match event {
            Event::Assign { task, bench_hash } => self.on_assign(task, bench_hash),
            Event::Message(msg) => self.on_message(msg),
            Event::Malformed => self.close(CloseCode::IllegalPacket),
            Event::InboundBinary => self.close(CloseCode::IllegalBinaryPacket),
            Event::ChunkSent { last } => self.on_chunk_sent(last),
            Event::TransferFailed => self.on_transfer_failed(),
            Event::Abort => self.on_abort(),
            Event::StatusTick => vec![Effect::Send(BackendMessage::GetStatus)],
            Event::TimerFired(kind) => self.on_timer(kind),
            Event::PingTimeout => self.close(CloseCode::PingTimeout),
            Event::Closed => self.disconnect(),
        }
    }

    fn on_assign(&mut self, task: Task, bench_hash: Option<String>) -> Vec<Effect> {
        if self.state != SessionState::Idle {
            return vec![Effect::ReleaseTask(task)];
        }

        let request = RequestRun {
            task_id: task.id,
            bench_hash,
        };
        self.assignment = Some(Assignment {
            task,
            started_at: Utc::now(),
            task_transfer_pending: false,
            work_received: false,
            result_requested: false,
        });
        self.state = SessionState::AwaitingRunReply;
        vec![
            Effect::Send(BackendMessage::RequestRun(request)),
            Effect::StartTimer(TimerKind::Reply),
        ]
    }

    fn on_message(&mut self, msg: RunnerMessage) -> Vec<Effect> {
        if self.state == SessionState::AwaitingAbortReply {
            return match msg {
                RunnerMessage::AbortRunReply => {
                    self.state = SessionState::Idle;
                    vec![Effect::CancelTimer, Effect::BecameIdle]
                }
                RunnerMessage::GetStatusReply(reply) => {
                    self.update_status(&reply);
                    Vec::new()
                }
                // Anything that raced the abort is stale
                _ => Vec::new(),
            };
        }

        match (self.state, msg) {
            // The pushed result won the race against our get-result
            (_, RunnerMessage::GetResultReply(reply)) if Some(reply.run_id) == self.last_run => {
                Vec::new()
            }
            (_, RunnerMessage::GetStatusReply(reply)) => self.on_status(reply),
            (_, RunnerMessage::ClearResultReply) => Vec::new(),
            (SessionState::AwaitingRunReply, RunnerMessage::RunRequestReply(reply)) => {
                self.on_run_request_reply(reply)
            }
            (SessionState::Executing, RunnerMessage::GetResultReply(reply)) => self.on_result(reply),
            (SessionState::Executing, RunnerMessage::WorkReceived(received)) => {
                let Some(assignment) = self.assignment.as_mut() else {
                    return self.close(CloseCode::InternalError);
                };
                if assignment.work_received || received.run_id != assignment.task.id {
                    return self.close(CloseCode::IllegalBehaviour);
                }
                assignment.work_received = true;
                Vec::new()
            }
            _ => self.close(CloseCode::IllegalBehaviour),
        }
    }

    fn on_run_request_reply(&mut self, reply: RunRequestReply) -> Vec<Effect> {
        if !reply.run {
            return self.close(CloseCode::IllegalPacket);
        }

        let Some(assignment) = self.assignment.as_mut() else {
            return self.close(CloseCode::InternalError);
        };
        let kind = if reply.bench {
            assignment.task_transfer_pending = true;
            self.state = SessionState::AwaitingBenchTransfer;
            TransferKind::Bench
        } else {
            self.state = SessionState::AwaitingTaskTransfer;
            TransferKind::Task
        };
        vec![
            Effect::CancelTimer,
            Effect::BeginTransfer(kind),
            Effect::StartTimer(TimerKind::NextChunk),
        ]
    }

    fn on_chunk_sent(&mut self, last: bool) -> Vec<Effect> {
        if !matches!(
            self.state,
            SessionState::AwaitingBenchTransfer | SessionState::AwaitingTaskTransfer
        ) {
            return Vec::new();
        }
        if !last {
            return vec![Effect::StartTimer(TimerKind::NextChunk)];
        }

        let Some(assignment) = self.assignment.as_mut() else {
            return self.close(CloseCode::InternalError);
        };
        if self.state == SessionState::AwaitingBenchTransfer && assignment.task_transfer_pending {
            assignment.task_transfer_pending = false;
            self.state = SessionState::AwaitingTaskTransfer;
            return vec![
                Effect::CancelTimer,
                Effect::BeginTransfer(TransferKind::Task),
                Effect::StartTimer(TimerKind::NextChunk),
            ];
        }

        self.state = SessionState::Executing;
        vec![Effect::CancelTimer]
    }

    fn on_transfer_failed(&mut self) -> Vec<Effect> {
        if !matches!(
            self.state,
            SessionState::AwaitingBenchTransfer | SessionState::AwaitingTaskTransfer
        ) {
            return Vec::new();
        }
        self.abort_assignment()
    }

    fn on_abort(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::Idle | SessionState::AwaitingAbortReply | SessionState::Disconnected => {
                Vec::new()
            }
            _ => self.abort_assignment(),
        }
    }

    fn abort_assignment(&mut self) -> Vec<Effect> {
        self.state = SessionState::AwaitingAbortReply;
        let mut effects = vec![
            Effect::DiscardTransfer,
            Effect::Send(BackendMessage::AbortRun),
            Effect::StartTimer(TimerKind::AbortReply),
        ];
        if let Some(assignment) = self.assignment.take() {
            effects.push(Effect::ReleaseTask(assignment.task));
        }
        effects
    }

    fn on_result(&mut self, reply: GetResultReply) -> Vec<Effect> {
        let Some(assignment) = self.assignment.take() else {
            return self.close(CloseCode::InternalError);
        };
        if reply.run_id != assignment.task.id {
            self.assignment = Some(assignment);
            return self.close(CloseCode::IllegalBehaviour);
        }

        let run = Run::finish(
            &assignment.task,
            self.runner_name.clone(),
            self.runner_info.clone(),
            assignment.started_at,
            reply.into_run_result(),
        );
        self.state = SessionState::Idle;
        self.last_run = Some(assignment.task.id);
        vec![
            Effect::RecordRun(run),
            Effect::Send(BackendMessage::ClearResult),
            Effect::BecameIdle,
        ]
    }

    fn on_status(&mut self, reply: GetStatusReply) -> Vec<Effect> {
        self.update_status(&reply);
        if !reply.result_available {
            return Vec::new();
        }

        match self.state {
            SessionState::Idle => vec![Effect::Send(BackendMessage::ClearResult)],
            SessionState::Executing => match self.assignment.as_mut() {
                Some(assignment)
                    if !assignment.result_requested && reply.run_id == Some(assignment.task.id) =>
                {
                    assignment.result_requested = true;
                    vec![Effect::Send(BackendMessage::GetResult)]
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn update_status(&mut self, reply: &GetStatusReply) {
        self.runner_info = reply.info.clone();
        self.bench_hash = reply.bench_hash.clone();
        self.activity = Some(reply.status);
    }

    fn on_timer(&mut self, kind: TimerKind) -> Vec<Effect> {
        let expected = match self.state {
            SessionState::AwaitingRunReply => TimerKind::Reply,
            SessionState::AwaitingBenchTransfer | SessionState::AwaitingTaskTransfer => {
                TimerKind::NextChunk
            }
            SessionState::AwaitingAbortReply => TimerKind::AbortReply,
            _ => return Vec::new(),
        };
        if kind != expected {
            return Vec::new();
        }
        self.close(CloseCode::CommandTimeout)
    }

    /// Close the connection from our side
    fn close(&mut self, code: CloseCode) -> Vec<Effect> {
        let mut effects = self.disconnect();
        effects.push(Effect::Close(code));
        effects
    }

    fn disconnect(&mut self) -> Vec<Effect> {
        self.state = SessionState::Disconnected;
        let mut effects = vec![Effect::CancelTimer, Effect::DiscardTransfer];
        if let Some(assignment) = self.assignment.take() {
            effects.push(Effect::ReleaseTask(assignment.task));
        }
        effects
    }
}
