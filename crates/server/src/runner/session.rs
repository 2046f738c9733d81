//! Session driver
//!
//! One task per runner connection. It feeds socket frames, dispatcher commands,
//! timers and archive chunks into the [`SessionMachine`] one at a time and
//! carries out the resulting effects.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use bench_core::archive::ArchiveStream;

use super::machine::{Effect, Event, SessionMachine, SessionState, TimerKind, TransferKind};
use super::protocol::{encode_chunk, RunnerMessage};
use super::registry::{RunnerHandle, RunnerStatus, SessionChannels, SessionCommand};
use crate::config::SessionConfig;
use crate::dispatcher::Dispatcher;

/// An archive being streamed to the runner.
///
/// One chunk is held back so the final frame can be flagged as such.
struct Transfer {
    kind: TransferKind,
    chunks: ArchiveStream,
    buffered: Option<Bytes>,
}

pub struct RunnerSession {
    machine: SessionMachine,
    handle: Arc<RunnerHandle>,
    commands: mpsc::Receiver<SessionCommand>,
    status: watch::Sender<RunnerStatus>,
    dispatcher: Arc<Dispatcher>,
    config: SessionConfig,
    timer: Option<(Instant, TimerKind)>,
    transfer: Option<Transfer>,
}

impl RunnerSession {
    pub fn new(
        handle: Arc<RunnerHandle>,
        channels: SessionChannels,
        dispatcher: Arc<Dispatcher>,
        config: SessionConfig,
    ) -> Self {
        Self {
            machine: SessionMachine::new(handle.name()),
            handle,
            commands: channels.commands,
            status: channels.status,
            dispatcher,
            config,
            timer: None,
            transfer: None,
        }
    }

    /// Drive the connection until it closes
    pub async fn run<Si, St, E>(mut self, mut sink: Si, mut stream: St)
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Display,
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let name = self.handle.name().to_string();
        info!("Runner {} connected", name);
        self.handle.set_available(true);
        self.dispatcher.notify_idle();

        let mut ping = time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_poll = time::interval(self.config.status_interval);
        status_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        while self.machine.state() != SessionState::Disconnected {
            let event = tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        match msg {
                            Message::Text(text) => match RunnerMessage::decode(text.as_str()) {
                                Ok(msg) => {
                                    debug!("Runner {} sent {}", name, msg.kind());
                                    Event::Message(msg)
                                }
                                Err(e) => {
                                    warn!("Runner {} sent an invalid message: {}", name, e);
                                    Event::Malformed
                                }
                            },
                            Message::Binary(_) => {
                                warn!("Unexpected binary frame from runner {}", name);
                                Event::InboundBinary
                            }
                            // Axum answers pings itself
                            Message::Ping(_) | Message::Pong(_) => continue,
                            Message::Close(_) => {
                                info!("Runner {} sent close frame", name);
                                Event::Closed
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from runner {}: {}", name, e);
                        Event::Closed
                    }
                    None => Event::Closed,
                },
                command = self.commands.recv() => match command {
                    Some(command) => match self.on_command(command).await {
                        Some(event) => event,
                        None => continue,
                    },
                    None => Event::Closed,
                },
                kind = wait_for(self.timer) => {
                    self.timer = None;
                    warn!("Runner {} timed out ({:?})", name, kind);
                    Event::TimerFired(kind)
                }
                chunk = next_chunk(&mut self.transfer) => match chunk {
                    Some(Ok(bytes)) => {
                        let previous = self.transfer.as_mut().and_then(|t| t.buffered.replace(bytes));
                        match previous {
                            Some(previous) => self.send_chunk(&mut sink, previous, false).await,
                            None => continue,
                        }
                    }
                    Some(Err(e)) => {
                        error!("Failed to read archive for runner {}: {}", name, e);
                        Event::TransferFailed
                    }
                    None => {
                        let last = self.transfer.take().and_then(|t| t.buffered).unwrap_or_default();
                        self.send_chunk(&mut sink, last, true).await
                    }
                },
                _ = ping.tick() => {
                    if last_seen.elapsed() > self.config.pong_timeout {
                        warn!("Runner {} missed its heartbeat", name);
                        Event::PingTimeout
                    } else {
                        match send_frame(&mut sink, Message::Ping(Bytes::new()), self.config.reply_timeout).await {
                            Ok(()) => continue,
                            Err(e) => {
                                warn!("Failed to ping runner {}: {}", name, e);
                                Event::Closed
                            }
                        }
                    }
                }
                _ = status_poll.tick() => Event::StatusTick,
            };

            self.process(event, &mut sink).await;
        }

        self.handle.set_available(false);
        self.dispatcher.remove_runner(&name).await;

        // Whatever is still queued for us goes back
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Assign { task, reply } => {
                    let _ = reply.send(Err(task));
                }
                SessionCommand::Abort { reply, .. } => {
                    let _ = reply.send(false);
                }
            }
        }
        info!("Runner {} disconnected", name);
    }

    async fn on_command(&mut self, command: SessionCommand) -> Option<Event> {
        match command {
            SessionCommand::Assign { task, reply } => {
                if !self.machine.is_idle() {
                    let _ = reply.send(Err(task));
                    return None;
                }

                let bench_hash = match self.dispatcher.archives().bench_hash().await {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        warn!("Benchmark tooling hash unavailable: {}", e);
                        None
                    }
                };
                let _ = reply.send(Ok(()));
                Some(Event::Assign { task, bench_hash })
            }
            SessionCommand::Abort { task_id, reply } => {
                let accepted = self.machine.can_abort(task_id);
                let _ = reply.send(accepted);
                accepted.then_some(Event::Abort)
            }
        }
    }

    /// Run an event and everything it triggers through the machine
    async fn process<Si>(&mut self, event: Event, sink: &mut Si)
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Display,
    {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.apply(effect, sink).await {
                    events.push_back(follow_up);
                }
            }
        }
        self.publish_status();
    }

    async fn apply<Si>(&mut self, effect: Effect, sink: &mut Si) -> Option<Event>
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Display,
    {
        let name = self.handle.name();
        match effect {
            Effect::Send(msg) => {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize message for runner {}: {}", name, e);
                        return None;
                    }
                };
                if let Err(e) = send_frame(sink, Message::Text(json.into()), self.config.reply_timeout).await {
                    warn!("Failed to send to runner {}: {}", name, e);
                    return Some(Event::Closed);
                }
            }
            Effect::StartTimer(kind) => {
                self.timer = Some((Instant::now() + self.timeout_of(kind), kind));
            }
            Effect::CancelTimer => self.timer = None,
            Effect::BeginTransfer(kind) => {
                let archives = Arc::clone(self.dispatcher.archives());
                let opened = match kind {
                    TransferKind::Bench => archives.bench_archive().await,
                    TransferKind::Task => match self.machine.task() {
                        Some(task) => archives.task_archive(task).await,
                        None => return None,
                    },
                };
                match opened {
                    Ok(chunks) => {
                        debug!("Streaming {:?} archive to runner {}", kind, name);
                        self.transfer = Some(Transfer {
                            kind,
                            chunks,
                            buffered: None,
                        });
                    }
                    Err(e) => {
                        error!("Failed to open {:?} archive for runner {}: {}", kind, name, e);
                        return Some(Event::TransferFailed);
                    }
                }
            }
            Effect::DiscardTransfer => {
                if let Some(transfer) = self.transfer.take() {
                    debug!("Dropped {:?} transfer to runner {}", transfer.kind, name);
                }
            }
            Effect::RecordRun(run) => self.dispatcher.complete_run(run).await,
            Effect::ReleaseTask(task) => {
                info!("Runner {} gave back task {}", name, task.id);
                self.dispatcher.release_task(task).await;
            }
            Effect::BecameIdle => {
                self.handle.set_available(true);
                self.dispatcher.notify_idle();
            }
            Effect::Close(code) => {
                warn!("Closing connection to runner {}: {}", name, code);
                self.handle.set_available(false);
                let frame = Message::Close(Some(CloseFrame {
                    code: code.as_u16(),
                    reason: Utf8Bytes::from_static(code.reason()),
                }));
                if let Err(e) = send_frame(sink, frame, self.config.reply_timeout).await {
                    debug!("Close frame to runner {} not delivered: {}", name, e);
                }
            }
        }
        None
    }

    async fn send_chunk<Si>(&mut self, sink: &mut Si, payload: Bytes, last: bool) -> Event
    where
        Si: Sink<Message> + Unpin,
        Si::Error: Display,
    {
        let frame = Message::Binary(Bytes::from(encode_chunk(&payload, last)));
        match send_frame(sink, frame, self.config.chunk_timeout).await {
            Ok(()) => Event::ChunkSent { last },
            Err(e) => {
                warn!("Failed to send archive chunk to runner {}: {}", self.handle.name(), e);
                Event::Closed
            }
        }
    }

    fn timeout_of(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::Reply | TimerKind::AbortReply => self.config.reply_timeout,
            TimerKind::NextChunk => self.config.chunk_timeout,
        }
    }

    fn publish_status(&self) {
        let machine = &self.machine;
        self.status.send_modify(|status| {
            status.info = machine.runner_info().to_string();
            status.state = machine.state();
            status.activity = machine.activity();
            status.task_id = machine.task_id();
            status.bench_hash = machine.bench_hash().map(str::to_string);
        });
    }
}

async fn wait_for(timer: Option<(Instant, TimerKind)>) -> TimerKind {
    match timer {
        Some((deadline, kind)) => {
            time::sleep_until(deadline).await;
            kind
        }
        None => pending().await,
    }
}

async fn next_chunk(transfer: &mut Option<Transfer>) -> Option<std::io::Result<Bytes>> {
    match transfer {
        Some(transfer) => transfer.chunks.next().await,
        None => pending().await,
    }
}

async fn send_frame<Si>(sink: &mut Si, frame: Message, limit: Duration) -> Result<(), String>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("send timed out".to_string()),
    }
}
