//! Live projection loop: catch up on one tag, then follow its feed.

use std::any::Any;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OnceCell, watch};
use tokio_stream::StreamExt;

use crate::log::EventLog;
use crate::projection::{FeedConfig, ProjectionCatchUp, feed};

type Runner = Mutex<Box<dyn ProjectionCatchUp>>;

/// Set once the loop has loaded the runner's checkpoint.
type SharedRunner = Arc<OnceCell<Runner>>;

/// Builds the runner, loading its checkpoint. Retried until it succeeds.
pub(crate) type RunnerLoader = Box<dyn Fn() -> io::Result<Box<dyn ProjectionCatchUp>> + Send + Sync>;

/// Handle for controlling one live projection loop.
///
/// Dropping the handle does **not** stop the loop; call
/// [`shutdown`](LiveHandle::shutdown) for termination with a final
/// checkpoint save.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct LiveHandle {
    name: Arc<str>,
    tag: Arc<str>,
    shutdown_tx: watch::Sender<bool>,
    caught_up: Arc<AtomicBool>,
    runner: SharedRunner,
    task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("projection", &self.name)
            .field("tag", &self.tag)
            .field("caught_up", &self.is_caught_up())
            .finish_non_exhaustive()
    }
}

impl LiveHandle {
    /// The tag this loop consumes.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns `true` once the initial catch-up has completed.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// Last processed offset, 0 until the checkpoint has loaded.
    pub async fn offset(&self) -> u64 {
        match self.runner.get() {
            Some(runner) => runner.lock().await.offset(),
            None => 0,
        }
    }

    /// Clone of the current projection state, or `None` if `P` is not the
    /// projection this loop runs or its checkpoint has not loaded yet.
    pub async fn state<P: 'static>(&self) -> Option<P> {
        let boxed: Box<dyn Any + Send> = self.runner.get()?.lock().await.state_any();
        boxed.downcast::<P>().ok().map(|b| *b)
    }

    /// Signal the loop to stop and wait for its final checkpoint save.
    ///
    /// Calling `shutdown` more than once is safe; subsequent calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the loop task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task {
            join_handle
                .await
                .map_err(|e| io::Error::other(format!("live loop task panicked: {e}")))?;
        }
        Ok(())
    }
}

/// Spawn a live loop for projection `name` on `tag`. The loop loads its
/// runner through `load` first, retrying with backoff.
pub(crate) fn start_live(
    log: Arc<dyn EventLog>,
    name: &str,
    tag: &str,
    load: RunnerLoader,
    config: FeedConfig,
) -> LiveHandle {
    let name: Arc<str> = Arc::from(name);
    let tag: Arc<str> = Arc::from(tag);
    let runner: SharedRunner = Arc::new(OnceCell::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let caught_up = Arc::new(AtomicBool::new(false));

    let task = tokio::spawn(run_live_loop(
        log,
        LoopTarget {
            name: Arc::clone(&name),
            tag: Arc::clone(&tag),
            runner: Arc::clone(&runner),
            load,
        },
        config,
        Arc::clone(&caught_up),
        shutdown_rx,
    ));

    LiveHandle {
        name,
        tag,
        shutdown_tx,
        caught_up,
        runner,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

struct LoopTarget {
    name: Arc<str>,
    tag: Arc<str>,
    runner: SharedRunner,
    load: RunnerLoader,
}

async fn save_checkpoint(runner: &Runner) {
    let runner = runner.lock().await;
    if let Err(e) = runner.save() {
        tracing::error!(
            projection = runner.name(),
            tag = %runner.tag(),
            error = %e,
            "failed to save projection checkpoint"
        );
    }
}

/// Load the runner, backing off between failures. `None` if shutdown was
/// requested first.
async fn load_runner(
    target: &LoopTarget,
    config: &FeedConfig,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Box<dyn ProjectionCatchUp>> {
    let mut delay = config.reconnect_base_delay;
    loop {
        if *shutdown_rx.borrow() {
            return None;
        }
        match (target.load)() {
            Ok(runner) => return Some(runner),
            Err(e) => {
                tracing::error!(
                    projection = %target.name,
                    tag = %target.tag,
                    error = %e,
                    "failed to load projection checkpoint, will retry"
                );
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return None,
        }
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
}

/// Load the checkpoint, catch up, then apply the tag feed as events
/// arrive. Checkpoints are saved periodically, after a feed error and on
/// shutdown. Errors back off exponentially and resume from the last
/// applied offset.
async fn run_live_loop(
    log: Arc<dyn EventLog>,
    target: LoopTarget,
    config: FeedConfig,
    caught_up: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let Some(loaded) = load_runner(&target, &config, &mut shutdown_rx).await else {
        return;
    };
    let runner: &Runner = target
        .runner
        .get_or_init(|| async move { Mutex::new(loaded) })
        .await;
    let (name, tag) = (&*target.name, target.tag.to_string());

    let mut backoff_delay = config.reconnect_base_delay;
    let mut checkpoint_interval = tokio::time::interval(config.checkpoint_interval);
    // The first tick completes immediately; consume it.
    checkpoint_interval.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            save_checkpoint(runner).await;
            return;
        }

        let caught = runner.lock().await.catch_up().await;
        if let Err(e) = caught {
            tracing::error!(projection = name, tag = %tag, error = %e, "catch-up failed, will retry");
            tokio::select! {
                _ = tokio::time::sleep(backoff_delay) => {}
                _ = shutdown_rx.changed() => {
                    save_checkpoint(runner).await;
                    return;
                }
            }
            backoff_delay = (backoff_delay * 2).min(config.reconnect_max_delay);
            continue;
        }
        caught_up.store(true, Ordering::Release);
        backoff_delay = config.reconnect_base_delay;

        let from_offset = runner.lock().await.offset();
        tracing::info!(projection = name, tag = %tag, from_offset, "following tag feed");
        let stream = feed(Arc::clone(&log), tag.clone(), from_offset, &config);
        tokio::pin!(stream);

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        runner.lock().await.apply_event(&event);
                    }
                    Some(Err(e)) => {
                        tracing::error!(projection = name, tag = %tag, error = %e, "feed error, will resume");
                        save_checkpoint(runner).await;
                        tokio::select! {
                            _ = tokio::time::sleep(backoff_delay) => {}
                            _ = shutdown_rx.changed() => return,
                        }
                        backoff_delay = (backoff_delay * 2).min(config.reconnect_max_delay);
                        break;
                    }
                    None => break,
                },
                _ = checkpoint_interval.tick() => {
                    save_checkpoint(runner).await;
                }
                _ = shutdown_rx.changed() => {
                    save_checkpoint(runner).await;
                    return;
                }
            }
        }
    }
}
