use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use dcbkit_core::Clock;
use dcbkit_events::{Event, EventBus, MultiProjectionRunner, Subscription, TagProjector};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Projection worker loop over an event bus subscription.
///
/// - Delivery is at-least-once, so handlers must be idempotent
/// - Events without a tag in `tag_group` (when given) are skipped
/// - Idle ticks give the handler a chance to promote aged events
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub const IDLE_TICK: Duration = Duration::from_millis(250);

    /// Spawn a worker thread that hands every matching event to `handler`.
    pub fn spawn<B, H, E>(
        name: &'static str,
        bus: B,
        tag_group: Option<String>,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        B: EventBus<Event> + 'static,
        H: FnMut(Event) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        Self::spawn_loop(name, bus, tag_group, move |event| match event {
            Some(event) => handler(event),
            None => Ok(()),
        })
    }

    /// Spawn a worker that feeds `runner` and promotes its buffered events
    /// while the bus is quiet. Readers lock the runner to snapshot it.
    pub fn spawn_runner<B, P, C>(
        name: &'static str,
        bus: B,
        runner: Arc<Mutex<MultiProjectionRunner<P, C>>>,
    ) -> io::Result<WorkerHandle>
    where
        B: EventBus<Event> + 'static,
        P: TagProjector,
        C: Clock + 'static,
    {
        let tag_group = {
            let guard = runner.lock().unwrap_or_else(|p| p.into_inner());
            guard.projector().tag_group().to_string()
        };
        Self::spawn_loop(name, bus, Some(tag_group), move |event| {
            let mut guard = runner.lock().unwrap_or_else(|p| p.into_inner());
            match event {
                Some(event) => guard.apply(&event),
                None => guard.tick(),
            }
        })
    }

    fn spawn_loop<B, H, E>(
        name: &'static str,
        bus: B,
        tag_group: Option<String>,
        mut handler: H,
    ) -> io::Result<WorkerHandle>
    where
        B: EventBus<Event> + 'static,
        H: FnMut(Option<Event>) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<Event> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, tag_group, &mut handler))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<H, E>(
    name: &'static str,
    sub: Subscription<Event>,
    shutdown_rx: mpsc::Receiver<()>,
    tag_group: Option<String>,
    handler: &mut H,
) where
    H: FnMut(Option<Event>) -> Result<(), E>,
    E: core::fmt::Debug,
{
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let step = match sub.recv_timeout(ProjectionWorker::IDLE_TICK) {
            Ok(event) => {
                if let Some(group) = &tag_group {
                    if !event.tags.iter().any(|t| t.group() == group) {
                        continue;
                    }
                }
                Some(event)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        if let Err(err) = handler(step) {
            warn!(worker = name, error = ?err, "projection worker handler failed");
        }
    }
    debug!(worker = name, "projection worker stopped");
}
