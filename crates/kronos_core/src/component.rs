//! Components: units of application behaviour and how they are driven.
//!
//! Application logic implements [`Handler`]. The framework wraps each handler
//! in a [`Component`] that owns its lifecycle state and one of three
//! concurrency strategies:
//!
//! | Strategy | `receive_event` | Processing happens on |
//! |----------|-----------------|-----------------------|
//! | [`Concurrency::Passive`] | calls the handler | the caller's thread |
//! | [`Concurrency::Queued`] | non-blocking enqueue | whoever calls [`Component::drain`] |
//! | [`Concurrency::Active`] | non-blocking enqueue | the component's own task |
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──init──▶ Initialized ──start──▶ Running ──destroy──▶ Destroyed
//!                        └──────────────destroy─────────────────────▲
//! ```
//!
//! `Destroyed` is terminal. Active components spawn their task in `init`, but
//! the task only starts consuming its queue once the component is `Running`.
//!
//! ## Message ownership
//!
//! `receive_event` consumes exactly one pool reference of the handle it is
//! given: the reference is released after processing, or immediately when the
//! message is dropped (full queue, destroyed component).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ActiveConfig, QueueConfig};
use crate::error::{KronosError, Result};
use crate::message::{EventMessage, MessageHandle, Opcode, Payload};
use crate::pool::MessagePool;

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Registered, not yet initialized.
    Created,
    /// `init` succeeded.
    Initialized,
    /// The framework has started.
    Running,
    /// Torn down. Terminal.
    Destroyed,
}

/// How a component is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Synchronous call-through, no queue.
    Passive,
    /// Bounded queue drained cooperatively.
    Queued(QueueConfig),
    /// Bounded queue drained by a dedicated task.
    Active(ActiveConfig),
}

impl Concurrency {
    /// A queued strategy with the given capacity.
    #[must_use]
    pub fn queued(capacity: usize) -> Self {
        Self::Queued(QueueConfig { capacity })
    }

    /// An active strategy with the given queue capacity and default hints.
    #[must_use]
    pub fn active(capacity: usize) -> Self {
        Self::Active(ActiveConfig {
            queue: QueueConfig { capacity },
            ..ActiveConfig::default()
        })
    }

    /// The strategy without its settings.
    #[must_use]
    pub fn kind(&self) -> ConcurrencyKind {
        match self {
            Self::Passive => ConcurrencyKind::Passive,
            Self::Queued(_) => ConcurrencyKind::Queued,
            Self::Active(_) => ConcurrencyKind::Active,
        }
    }
}

/// Tag of a [`Concurrency`] strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConcurrencyKind {
    /// See [`Concurrency::Passive`].
    Passive,
    /// See [`Concurrency::Queued`].
    Queued,
    /// See [`Concurrency::Active`].
    Active,
}

/// Application logic of a component.
///
/// Every method receives the [`Component`] wrapping the handler, which gives
/// access to the component name and the message pool. Handlers of active
/// components run on their own task while other threads publish, so state
/// must use interior mutability.
pub trait Handler: Send + Sync + 'static {
    /// Called once by [`Framework::start`](crate::Framework::start).
    ///
    /// # Errors
    ///
    /// A failure aborts the start sequence.
    fn init(&self, _component: &Component) -> Result<()> {
        Ok(())
    }

    /// Called after every component has been initialized.
    ///
    /// # Errors
    ///
    /// A failure aborts the start sequence.
    fn post_init(&self, _component: &Component) -> Result<()> {
        Ok(())
    }

    /// Called once when the component is torn down.
    ///
    /// # Errors
    ///
    /// Failures are logged; teardown continues.
    fn destroy(&self, _component: &Component) -> Result<()> {
        Ok(())
    }

    /// Handle one event message.
    ///
    /// # Errors
    ///
    /// Failures are logged by the component; the message is released either
    /// way.
    fn process_event(&self, component: &Component, message: &EventMessage) -> Result<()>;
}

impl<T: Handler + ?Sized> Handler for Arc<T> {
    fn init(&self, component: &Component) -> Result<()> {
        (**self).init(component)
    }

    fn post_init(&self, component: &Component) -> Result<()> {
        (**self).post_init(component)
    }

    fn destroy(&self, component: &Component) -> Result<()> {
        (**self).destroy(component)
    }

    fn process_event(&self, component: &Component, message: &EventMessage) -> Result<()> {
        (**self).process_event(component, message)
    }
}

/// A [`Handler`] built from a closure. See [`from_fn`].
pub struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Component, &EventMessage) -> Result<()> + Send + Sync + 'static,
{
    fn process_event(&self, component: &Component, message: &EventMessage) -> Result<()> {
        (self.0)(component, message)
    }
}

/// Wrap a closure as a handler with no-op lifecycle hooks.
pub fn from_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Component, &EventMessage) -> Result<()> + Send + Sync + 'static,
{
    FnHandler(f)
}

/// What became of a message handed to [`Component::receive_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Processed (passive) or enqueued (queued, active).
    Accepted,
    /// Released unprocessed because the component is torn down.
    Discarded,
}

/// Processing counters of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentStats {
    /// Messages handed to the handler (pings answered included).
    pub processed: u64,
    /// Messages dropped because the queue was full.
    pub dropped: u64,
    /// Handler invocations that returned an error.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Run signal shared between an active component and its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunSignal {
    Waiting,
    Running,
    Stopped,
}

#[derive(Debug)]
struct MessageQueue {
    capacity: usize,
    tx: mpsc::Sender<MessageHandle>,
    rx: Mutex<Option<mpsc::Receiver<MessageHandle>>>,
}

impl MessageQueue {
    fn new(config: QueueConfig) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            capacity,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn receiver(&self) -> MutexGuard<'_, Option<mpsc::Receiver<MessageHandle>>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn len(&self) -> usize {
        if self.tx.is_closed() {
            return 0;
        }
        self.capacity - self.tx.capacity()
    }
}

#[derive(Debug)]
struct ActiveState {
    config: ActiveConfig,
    queue: MessageQueue,
    signal: watch::Sender<RunSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
enum Strategy {
    Passive,
    Queued(MessageQueue),
    Active(ActiveState),
}

/// A registered component: a [`Handler`] plus its lifecycle and strategy.
pub struct Component {
    name: String,
    concurrency: Concurrency,
    state: Mutex<LifecycleState>,
    handler: Box<dyn Handler>,
    pool: Arc<MessagePool>,
    strategy: Strategy,
    counters: Counters,
    this: Weak<Component>,
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Component {
    /// Create a component in the `Created` state.
    ///
    /// Components are normally created through
    /// [`Framework::create_component`](crate::Framework::create_component),
    /// which also enforces name uniqueness.
    pub fn new(
        name: impl Into<String>,
        concurrency: Concurrency,
        handler: impl Handler,
        pool: Arc<MessagePool>,
    ) -> Arc<Self> {
        let strategy = match concurrency {
            Concurrency::Passive => Strategy::Passive,
            Concurrency::Queued(config) => Strategy::Queued(MessageQueue::new(config)),
            Concurrency::Active(config) => Strategy::Active(ActiveState {
                config,
                queue: MessageQueue::new(config.queue),
                signal: watch::Sender::new(RunSignal::Waiting),
                task: Mutex::new(None),
            }),
        };
        let name = name.into();
        Arc::new_cyclic(|this| Self {
            name,
            concurrency,
            state: Mutex::new(LifecycleState::Created),
            handler: Box::new(handler),
            pool,
            strategy,
            counters: Counters::default(),
            this: this.clone(),
        })
    }

    /// The unique component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The concurrency strategy and its settings.
    #[must_use]
    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Shorthand for `self.concurrency().kind()`.
    #[must_use]
    pub fn kind(&self) -> ConcurrencyKind {
        self.concurrency.kind()
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The message pool this component releases into.
    #[must_use]
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// Number of messages waiting in the queue. Always 0 for passive
    /// components.
    #[must_use]
    pub fn pending(&self) -> usize {
        match &self.strategy {
            Strategy::Passive => 0,
            Strategy::Queued(queue) => queue.len(),
            Strategy::Active(active) => active.queue.len(),
        }
    }

    /// Processing counters.
    #[must_use]
    pub fn stats(&self) -> ComponentStats {
        ComponentStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn expect_state(&self, allowed: &[LifecycleState], to: LifecycleState) -> Result<()> {
        let from = self.state();
        if allowed.contains(&from) {
            Ok(())
        } else {
            Err(KronosError::InvalidTransition {
                component: self.name.clone(),
                from,
                to,
            })
        }
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Initialize the component (`Created` → `Initialized`).
    ///
    /// Active components spawn their dedicated task here, on the tokio
    /// runtime of the calling thread.
    ///
    /// # Errors
    ///
    /// - [`KronosError::InvalidTransition`] if not in `Created`.
    /// - [`KronosError::TaskCreateFailed`] if no runtime is available.
    /// - Any error returned by [`Handler::init`].
    pub fn init(&self) -> Result<()> {
        self.expect_state(&[LifecycleState::Created], LifecycleState::Initialized)?;

        if let Strategy::Active(active) = &self.strategy {
            self.spawn_task(active)?;
        }

        if let Err(err) = self.handler.init(self) {
            if let Strategy::Active(active) = &self.strategy {
                active.signal.send_replace(RunSignal::Stopped);
            }
            return Err(err);
        }

        self.set_state(LifecycleState::Initialized);
        debug!(component = %self.name, "component initialized");
        Ok(())
    }

    /// Second initialization pass, run once every component is initialized.
    ///
    /// # Errors
    ///
    /// - [`KronosError::InvalidTransition`] if not in `Initialized`.
    /// - Any error returned by [`Handler::post_init`].
    pub fn post_init(&self) -> Result<()> {
        self.expect_state(&[LifecycleState::Initialized], LifecycleState::Initialized)?;
        self.handler.post_init(self)
    }

    /// Mark the component running (`Initialized` → `Running`). Active tasks
    /// begin consuming their queue.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::InvalidTransition`] if not in `Initialized`.
    pub fn start(&self) -> Result<()> {
        self.expect_state(&[LifecycleState::Initialized], LifecycleState::Running)?;
        self.set_state(LifecycleState::Running);
        if let Strategy::Active(active) = &self.strategy {
            active.signal.send_replace(RunSignal::Running);
        }
        Ok(())
    }

    /// Tear the component down (`Initialized`/`Running` → `Destroyed`).
    ///
    /// Active tasks are told to stop; queued messages that were never
    /// processed are released.
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::InvalidTransition`] from any other state.
    pub fn destroy(&self) -> Result<()> {
        self.expect_state(
            &[LifecycleState::Initialized, LifecycleState::Running],
            LifecycleState::Destroyed,
        )?;
        self.set_state(LifecycleState::Destroyed);

        match &self.strategy {
            Strategy::Passive => {}
            Strategy::Queued(queue) => {
                if let Some(rx) = queue.receiver().as_mut() {
                    rx.close();
                    while let Ok(handle) = rx.try_recv() {
                        self.release(handle);
                    }
                }
            }
            Strategy::Active(active) => {
                active.signal.send_replace(RunSignal::Stopped);
            }
        }

        if let Err(err) = self.handler.destroy(self) {
            warn!(component = %self.name, %err, "destroy hook failed");
        }
        debug!(component = %self.name, "component destroyed");
        Ok(())
    }

    /// Returns `true` once an active component's task has exited.
    #[must_use]
    pub fn task_finished(&self) -> bool {
        match &self.strategy {
            Strategy::Active(active) => active
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_none_or(JoinHandle::is_finished),
            _ => true,
        }
    }

    /// Deliver a message, consuming one pool reference of `handle`.
    ///
    /// Passive components process the message before returning. Queued and
    /// active components enqueue it without blocking. A destroyed component
    /// releases the message and returns [`Receipt::Discarded`].
    ///
    /// # Errors
    ///
    /// Returns [`KronosError::QueueFull`] if the queue has no room. The
    /// message reference is released and the caller is never blocked.
    pub fn receive_event(&self, handle: MessageHandle) -> Result<Receipt> {
        if self.state() == LifecycleState::Destroyed {
            debug!(component = %self.name, %handle, "discarding message for destroyed component");
            self.release(handle);
            return Ok(Receipt::Discarded);
        }

        let queue = match &self.strategy {
            Strategy::Passive => {
                self.dispatch(handle);
                return Ok(Receipt::Accepted);
            }
            Strategy::Queued(queue) => queue,
            Strategy::Active(active) => &active.queue,
        };

        match queue.tx.try_send(handle) {
            Ok(()) => Ok(Receipt::Accepted),
            Err(mpsc::error::TrySendError::Full(handle)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(component = %self.name, %handle, "queue full, dropping message");
                self.release(handle);
                Err(KronosError::QueueFull(self.name.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(handle)) => {
                debug!(component = %self.name, %handle, "queue closed, discarding message");
                self.release(handle);
                Ok(Receipt::Discarded)
            }
        }
    }

    /// Process the messages queued when the call started, in FIFO order.
    ///
    /// Messages enqueued while draining, including those a handler publishes
    /// to itself, wait for the next drain. The queue stays locked for the
    /// whole drain, so at most one handler runs at a time. Passive components
    /// and active components (whose queue belongs to their task) return 0.
    pub fn drain(&self) -> usize {
        let Strategy::Queued(queue) = &self.strategy else {
            return 0;
        };
        let mut guard = queue.receiver();
        let Some(rx) = guard.as_mut() else {
            return 0;
        };

        let budget = queue.len();
        let mut processed = 0;
        while processed < budget {
            let Ok(handle) = rx.try_recv() else { break };
            self.dispatch(handle);
            processed += 1;
        }
        processed
    }

    /// Resolve, process and release one message.
    fn dispatch(&self, handle: MessageHandle) {
        match self.pool.get(handle) {
            Ok(message) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.process(&message) {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(component = %self.name, opcode = %message.opcode, %err, "event processing failed");
                }
            }
            Err(err) => warn!(component = %self.name, %err, "received unknown message"),
        }
        self.release(handle);
    }

    fn process(&self, message: &EventMessage) -> Result<()> {
        if message.opcode == Opcode::HEALTH_PING && self.kind() == ConcurrencyKind::Active {
            return self.answer_ping(message);
        }
        self.handler.process_event(self, message)
    }

    /// Built-in liveness answer of active components.
    fn answer_ping(&self, message: &EventMessage) -> Result<()> {
        match message.reply_bus() {
            Some(bus) => {
                bus.emit(
                    Opcode::HEALTH_PONG,
                    Payload::Component(self.name.clone()),
                    None,
                )?;
            }
            None => debug!(component = %self.name, "ping without reply bus"),
        }
        Ok(())
    }

    fn release(&self, handle: MessageHandle) {
        if let Err(err) = self.pool.release(handle) {
            warn!(component = %self.name, %err, "failed to release message");
        }
    }

    fn spawn_task(&self, active: &ActiveState) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            KronosError::TaskCreateFailed {
                name: self.name.clone(),
                reason: err.to_string(),
            }
        })?;
        let rx = active
            .queue
            .receiver()
            .take()
            .ok_or_else(|| KronosError::TaskCreateFailed {
                name: self.name.clone(),
                reason: "queue already has a consumer".into(),
            })?;

        let task = runtime.spawn(run_active(
            self.this.clone(),
            Arc::clone(&self.pool),
            rx,
            active.signal.subscribe(),
        ));
        *active.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(
            component = %self.name,
            stack_size = active.config.stack_size,
            priority = active.config.priority,
            capacity = active.queue.capacity,
            "active task spawned"
        );
        Ok(())
    }
}

/// Body of an active component's dedicated task.
///
/// Waits for the run signal, then processes one message at a time and yields
/// after each. On stop, whatever is still queued is released unprocessed.
async fn run_active(
    component: Weak<Component>,
    pool: Arc<MessagePool>,
    mut rx: mpsc::Receiver<MessageHandle>,
    mut signal: watch::Receiver<RunSignal>,
) {
    let started = signal
        .wait_for(|s| *s != RunSignal::Waiting)
        .await
        .map(|s| *s == RunSignal::Running)
        .unwrap_or(false);

    if started {
        loop {
            tokio::select! {
                biased;
                changed = signal.changed() => {
                    if changed.is_err() || *signal.borrow() == RunSignal::Stopped {
                        break;
                    }
                }
                received = rx.recv() => {
                    let Some(handle) = received else { break };
                    match component.upgrade() {
                        Some(component) => component.dispatch(handle),
                        None => {
                            let _ = pool.release(handle);
                            break;
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    rx.close();
    while let Ok(handle) = rx.try_recv() {
        let _ = pool.release(handle);
    }
}
