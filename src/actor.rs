//! Supervised instance runtime: one tokio task per active identity.
//!
//! The task owns the identity's state and processes messages from a bounded
//! `mpsc` mailbox strictly one at a time. Events are appended to the log
//! before state changes or a reply is sent. On a transient failure the task
//! tears its state down and recovers again after a backoff delay; messages
//! that arrive meanwhile wait in the mailbox.
//!
//! Public API: [`EntityHandle`] (cloneable async handle) and
//! [`spawn_entity`] (starts the task).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::aggregate::{Aggregate, fold_events};
use crate::backoff::RetryPolicy;
use crate::command::CommandContext;
use crate::error::{ExecuteError, LogError, RecoveryError, StateError};
use crate::event::{StreamId, encode_domain_event};
use crate::log::EventLog;
use crate::recovery::recover;
use crate::snapshot::{Snapshot, SnapshotPolicy};
use crate::tagging::TagScheme;

/// Configuration for an entity instance.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// How long the instance waits for a message before passivating.
    pub idle_timeout: Duration,
    /// Mailbox capacity; senders wait when it is full.
    pub mailbox_capacity: usize,
    /// Restart policy for recovery and persistence failures.
    pub retry: RetryPolicy,
    /// Snapshot cadence and retention.
    pub snapshots: SnapshotPolicy,
    /// Projection tag scheme stamped onto every event, if any.
    pub tags: Option<TagScheme>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            mailbox_capacity: 32,
            retry: RetryPolicy::default(),
            snapshots: SnapshotPolicy::default(),
            tags: None,
        }
    }
}

/// Lifecycle of one instance.
///
/// `Uninitialized -> Recovering -> Ready -> [Persisting -> Ready]* -> Stopped`,
/// with `(Recovering | Persisting) -> Failed -> Recovering` on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    /// Spawned, recovery not started.
    Uninitialized,
    /// Rebuilding state from the log.
    Recovering,
    /// Accepting commands.
    Ready,
    /// Appending the events of the current command.
    Persisting,
    /// A failure occurred; waiting out the backoff delay or shutting down.
    Failed,
    /// The task has exited. Terminal.
    Stopped,
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<A> = Result<<A as Aggregate>::Reply, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from [`EntityHandle`] to the instance task.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the entity.
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Retrieve a clone of the current state.
    GetState {
        reply: oneshot::Sender<Result<A, StateError>>,
    },

    /// Stop after everything queued before this message was processed.
    Passivate,
}

/// A command accepted from the mailbox but not yet answered.
struct Pending<A: Aggregate> {
    cmd: A::Command,
    ctx: CommandContext,
    reply: oneshot::Sender<ExecuteResult<A>>,
}

/// What the loop does after one command.
enum Step<A: Aggregate> {
    Continue,
    /// Persisting failed transiently; recover and decide the command again.
    /// Relies on a failed append having left the stream unchanged.
    Restart(Pending<A>, LogError),
    Stop,
}

struct Instance<A: Aggregate> {
    log: Arc<dyn EventLog>,
    stream: StreamId,
    tags: Vec<String>,
    config: ActorConfig,
    state: A,
    sequence: u64,
    status: watch::Sender<InstanceStatus>,
}

impl<A: Aggregate> Instance<A> {
    fn set_status(&self, status: InstanceStatus) {
        self.status.send_replace(status);
    }

    async fn execute(&mut self, pending: Pending<A>) -> Step<A> {
        let Pending { cmd, ctx, reply } = pending;

        let events = match self.state.handle(&self.stream.instance_id, cmd.clone()) {
            Ok(events) => events,
            Err(e) => {
                let _ = reply.send(Err(ExecuteError::Domain(e)));
                return Step::Continue;
            }
        };

        if events.is_empty() {
            let _ = reply.send(Ok(self.state.reply()));
            return Step::Continue;
        }

        let proposed = match events
            .iter()
            .map(|e| encode_domain_event::<A>(e, &ctx, &self.tags))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(proposed) => proposed,
            Err(e) => {
                let _ = reply.send(Err(ExecuteError::Storage(LogError::Codec(e))));
                return Step::Continue;
            }
        };

        self.set_status(InstanceStatus::Persisting);
        match self.log.append(&self.stream, self.sequence, proposed).await {
            Ok(head) => {
                let previous = self.sequence;
                self.state = fold_events(std::mem::take(&mut self.state), &events);
                self.sequence = head;
                self.set_status(InstanceStatus::Ready);
                tracing::debug!(count = events.len(), sequence = head, "events appended");

                if self.config.snapshots.is_due(previous, head) {
                    self.take_snapshot().await;
                }
                let _ = reply.send(Ok(self.state.reply()));
                Step::Continue
            }
            Err(LogError::Conflict { expected, actual }) => {
                tracing::error!(
                    expected,
                    actual,
                    "concurrent writer detected; stopping instance"
                );
                self.set_status(InstanceStatus::Failed);
                let _ = reply.send(Err(ExecuteError::Conflict));
                Step::Stop
            }
            Err(e) => {
                self.set_status(InstanceStatus::Failed);
                Step::Restart(Pending { cmd, ctx, reply }, e)
            }
        }
    }

    async fn take_snapshot(&self) {
        let record = match (Snapshot {
            state: self.state.clone(),
            sequence: self.sequence,
        })
        .to_record()
        {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode snapshot");
                return;
            }
        };

        if let Err(e) = self.log.write_snapshot(&self.stream, record).await {
            tracing::warn!(sequence = self.sequence, error = %e, "failed to write snapshot");
            return;
        }
        match self
            .log
            .prune_snapshots(&self.stream, self.config.snapshots.keep)
            .await
        {
            Ok(pruned) => tracing::debug!(sequence = self.sequence, pruned, "snapshot taken"),
            Err(e) => tracing::warn!(error = %e, "failed to prune snapshots"),
        }
    }

    /// Recover state, retrying transient failures per the restart policy.
    ///
    /// `attempt` carries over so that a persist failure followed by recovery
    /// failures shares one backoff sequence.
    async fn recover_with_backoff(&mut self, attempt: &mut u32) -> Result<(), RecoveryError> {
        loop {
            self.set_status(InstanceStatus::Recovering);
            match recover::<A>(self.log.as_ref(), &self.stream).await {
                Ok(recovered) => {
                    self.state = recovered.state;
                    self.sequence = recovered.sequence;
                    self.set_status(InstanceStatus::Ready);
                    return Ok(());
                }
                Err(e) if e.is_transient() && self.config.retry.allows(*attempt) => {
                    self.set_status(InstanceStatus::Failed);
                    let delay = self.config.retry.delay(*attempt);
                    tracing::warn!(
                        attempt = *attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "recovery failed; restarting after backoff"
                    );
                    *attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.set_status(InstanceStatus::Failed);
                    tracing::error!(error = %e, "recovery failed; instance stopped");
                    return Err(e);
                }
            }
        }
    }
}

/// Runs the instance loop until passivation, idle timeout, or a fatal error.
async fn run_actor<A: Aggregate>(
    mut instance: Instance<A>,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
) {
    let mut attempt: u32 = 0;
    let mut pending: Option<Pending<A>> = None;

    'life: loop {
        if let Err(e) = instance.recover_with_backoff(&mut attempt).await {
            fail_first_waiter(&mut rx, pending.take(), e);
            break 'life;
        }

        if let Some(retained) = pending.take() {
            match instance.execute(retained).await {
                Step::Continue => attempt = 0,
                Step::Stop => break 'life,
                Step::Restart(retained, e) => {
                    if !schedule_restart(&instance.config.retry, &mut attempt, &e).await {
                        let _ = retained.reply.send(Err(ExecuteError::Storage(e)));
                        break 'life;
                    }
                    pending = Some(retained);
                    continue 'life;
                }
            }
        }

        loop {
            let msg = tokio::time::timeout(instance.config.idle_timeout, rx.recv()).await;
            match msg {
                Ok(Some(ActorMessage::Execute { cmd, ctx, reply })) => {
                    let step = instance
                        .execute(Pending { cmd, ctx, reply })
                        .instrument(tracing::info_span!("execute"))
                        .await;
                    match step {
                        Step::Continue => attempt = 0,
                        Step::Stop => break 'life,
                        Step::Restart(retained, e) => {
                            if !schedule_restart(&instance.config.retry, &mut attempt, &e).await {
                                let _ = retained.reply.send(Err(ExecuteError::Storage(e)));
                                break 'life;
                            }
                            pending = Some(retained);
                            continue 'life;
                        }
                    }
                }
                Ok(Some(ActorMessage::GetState { reply })) => {
                    let _ = reply.send(Ok(instance.state.clone()));
                }
                Ok(Some(ActorMessage::Passivate)) => {
                    tracing::info!("passivating");
                    break 'life;
                }
                // All handles dropped.
                Ok(None) => break 'life,
                Err(_elapsed) => {
                    tracing::info!("actor idle, shutting down");
                    break 'life;
                }
            }
        }
    }

    // Anything still queued is answered with `ActorGone` when its reply
    // sender drops.
    rx.close();
    while rx.try_recv().is_ok() {}
    instance.set_status(InstanceStatus::Stopped);
}

/// Log a persist failure and sleep out the backoff delay.
///
/// Returns `false` when the policy has no attempts left.
async fn schedule_restart(retry: &RetryPolicy, attempt: &mut u32, error: &LogError) -> bool {
    if !error.is_transient() || !retry.allows(*attempt) {
        tracing::error!(attempt = *attempt, error = %error, "persist failed; giving up");
        return false;
    }
    let delay = retry.delay(*attempt);
    tracing::warn!(
        attempt = *attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "persist failed; restarting after backoff"
    );
    *attempt += 1;
    tokio::time::sleep(delay).await;
    true
}

/// Hand a fatal recovery error to the caller waiting longest.
///
/// Later callers observe `ActorGone`, retry, and meet the same error
/// through a fresh activation.
fn fail_first_waiter<A: Aggregate>(
    rx: &mut mpsc::Receiver<ActorMessage<A>>,
    pending: Option<Pending<A>>,
    error: RecoveryError,
) {
    if let Some(p) = pending {
        let _ = p.reply.send(Err(ExecuteError::Recovery(error)));
        return;
    }
    match rx.try_recv() {
        Ok(ActorMessage::Execute { reply, .. }) => {
            let _ = reply.send(Err(ExecuteError::Recovery(error)));
        }
        Ok(ActorMessage::GetState { reply }) => {
            let _ = reply.send(Err(StateError::Recovery(error)));
        }
        Ok(ActorMessage::Passivate) | Err(_) => {}
    }
}

/// Async handle to a running entity instance.
///
/// Lightweight, cloneable, and `Send + Sync`.
#[derive(Debug)]
pub struct EntityHandle<A: Aggregate> {
    instance_id: Arc<str>,
    sender: mpsc::Sender<ActorMessage<A>>,
    status: watch::Receiver<InstanceStatus>,
}

// Manual `Clone`: deriving would require `A: Clone` on the handle itself.
impl<A: Aggregate> Clone for EntityHandle<A> {
    fn clone(&self) -> Self {
        Self {
            instance_id: Arc::clone(&self.instance_id),
            sender: self.sender.clone(),
            status: self.status.clone(),
        }
    }
}

impl<A: Aggregate> EntityHandle<A> {
    /// The identity this instance serves.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Send a command and wait for its reply.
    ///
    /// The reply is sent only after the command's events are durably
    /// appended. If the caller stops waiting, the command may still take
    /// effect.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] if the entity rejected the command.
    /// * [`ExecuteError::Conflict`] if another writer appended first.
    /// * [`ExecuteError::Storage`] if restarts were exhausted.
    /// * [`ExecuteError::Recovery`] if the entity could not be recovered.
    /// * [`ExecuteError::ActorGone`] if the instance stopped first.
    pub async fn execute(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<A::Reply, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::Execute {
                cmd,
                ctx,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Read a clone of the current state, after all earlier commands.
    ///
    /// # Errors
    ///
    /// * [`StateError::Recovery`] if the entity could not be recovered.
    /// * [`StateError::ActorGone`] if the instance stopped first.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Current lifecycle status.
    pub fn status(&self) -> InstanceStatus {
        *self.status.borrow()
    }

    /// Subscribe to lifecycle changes.
    pub fn watch_status(&self) -> watch::Receiver<InstanceStatus> {
        self.status.clone()
    }

    /// Whether the instance task is still accepting messages.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Whether both handles address the same spawned instance.
    pub(crate) fn same_instance(&self, other: &Self) -> bool {
        self.sender.same_channel(&other.sender)
    }

    /// Ask the instance to stop once everything already queued is done.
    pub async fn passivate(&self) {
        // A closed mailbox means the instance is already stopping.
        let _ = self.sender.send(ActorMessage::Passivate).await;
    }

    /// Wait until the instance task has exited.
    pub async fn stopped(&self) {
        let mut status = self.status.clone();
        // A dropped sender also means the task is gone.
        let _ = status.wait_for(|s| *s == InstanceStatus::Stopped).await;
    }
}

/// Spawn an instance task for `instance_id` of entity type `A`.
///
/// The task starts recovering immediately; commands sent meanwhile queue
/// in the mailbox. Must be called from within a tokio runtime.
pub fn spawn_entity<A: Aggregate>(
    log: Arc<dyn EventLog>,
    instance_id: impl Into<String>,
    config: ActorConfig,
) -> EntityHandle<A> {
    let stream = StreamId::of::<A>(instance_id);
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(InstanceStatus::Uninitialized);

    let tags = config
        .tags
        .as_ref()
        .map(|scheme| vec![scheme.tag_for(&stream.instance_id)])
        .unwrap_or_default();
    let span = tracing::info_span!(
        "entity",
        aggregate_type = A::AGGREGATE_TYPE,
        instance_id = %stream.instance_id,
    );
    let handle = EntityHandle {
        instance_id: Arc::from(stream.instance_id.as_str()),
        sender: tx,
        status: status_rx,
    };

    let instance = Instance {
        log,
        stream,
        tags,
        config,
        state: A::default(),
        sequence: 0,
        status: status_tx,
    };
    tokio::spawn(run_actor(instance, rx).instrument(span));
    handle
}
