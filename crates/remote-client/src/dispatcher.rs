//! Named background event loops and a bridge for synchronous callers.
//!
//! Each loop ID maps to one tokio runtime driven by a single worker thread
//! named `AsyncDispatcher-<id>`. Loops are created lazily on first use and
//! live until [`close_all`]. [`AsyncDispatcher`] schedules futures on a loop
//! and hands back one of three shapes: a [`DispatchFuture`] (default), the
//! plain result (blocking the caller), or an awaitable for use from inside
//! another loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::task::{AbortHandle, JoinError};

/// Loop used when a caller does not name one and no runtime is current.
pub const DEFAULT_LOOP: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Event loop {0} is closed")]
    LoopClosed(String),

    #[error("Failed to start event loop {id}: {message}")]
    Spawn { id: String, message: String },

    /// The dispatched call was used in a shape it was not created for.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Event loop {0} cannot be re-entered from its own thread")]
    Reentrant(String),
}

fn map_join_error(error: JoinError) -> DispatchError {
    if error.is_cancelled() {
        DispatchError::Cancelled
    } else {
        DispatchError::Panicked(error.to_string())
    }
}

// ============================================================================
// Loop registry
// ============================================================================

fn registry() -> &'static Mutex<HashMap<String, Arc<EventLoop>>> {
    static LOOPS: OnceLock<Mutex<HashMap<String, Arc<EventLoop>>>> = OnceLock::new();
    LOOPS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// How a caller picks a loop.
#[derive(Debug, Clone)]
pub enum LoopSelector {
    /// The runtime the caller is running on, or the default loop.
    Current,
    /// An existing runtime handle.
    Handle(Handle),
    /// A named loop from the registry, created on first use.
    Id(String),
}

impl From<&str> for LoopSelector {
    fn from(id: &str) -> Self {
        LoopSelector::Id(id.to_string())
    }
}

impl From<String> for LoopSelector {
    fn from(id: String) -> Self {
        LoopSelector::Id(id)
    }
}

impl From<Handle> for LoopSelector {
    fn from(handle: Handle) -> Self {
        LoopSelector::Handle(handle)
    }
}

/// Resolve a selector to a loop, creating named loops lazily.
pub fn get_event_loop(selector: impl Into<LoopSelector>) -> Result<Arc<EventLoop>, DispatchError> {
    match selector.into() {
        LoopSelector::Current => match Handle::try_current() {
            Ok(handle) => Ok(Arc::new(EventLoop::borrowed("current", handle))),
            Err(_) => get_or_create(DEFAULT_LOOP),
        },
        LoopSelector::Handle(handle) => Ok(Arc::new(EventLoop::borrowed("handle", handle))),
        LoopSelector::Id(id) => get_or_create(&id),
    }
}

fn get_or_create(id: &str) -> Result<Arc<EventLoop>, DispatchError> {
    let mut loops = registry().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = loops.get(id) {
        if !existing.is_closed() {
            return Ok(existing.clone());
        }
    }
    let event_loop = Arc::new(EventLoop::spawn(id)?);
    event_loop.install_reentrancy_patch();
    loops.insert(id.to_string(), event_loop.clone());
    Ok(event_loop)
}

/// Cancel every in-flight task on every named loop, best effort.
pub fn cancel_all() {
    let loops: Vec<Arc<EventLoop>> = registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .cloned()
        .collect();
    for event_loop in loops {
        event_loop.cancel_all();
    }
}

/// Cancel outstanding work and stop every named loop.
///
/// Call once at process exit. Each loop gets up to `timeout` to wind down.
pub fn close_all(timeout: Option<Duration>) {
    let loops: Vec<Arc<EventLoop>> = registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .map(|(_, l)| l)
        .collect();
    for event_loop in loops {
        event_loop.close(timeout);
    }
}

// ============================================================================
// Event loop
// ============================================================================

/// A cooperative scheduler bound to one background OS thread.
pub struct EventLoop {
    id: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    tasks: Mutex<Vec<AbortHandle>>,
    reentrant: AtomicBool,
    closed: AtomicBool,
}

impl EventLoop {
    fn spawn(id: &str) -> Result<Self, DispatchError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("AsyncDispatcher-{}", id))
            .enable_all()
            .build()
            .map_err(|e| DispatchError::Spawn {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        info!("[dispatcher] Started event loop {}", id);
        Ok(Self {
            id: id.to_string(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            tasks: Mutex::new(Vec::new()),
            reentrant: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn borrowed(id: &str, handle: Handle) -> Self {
        let reentrant = handle.runtime_flavor() == RuntimeFlavor::MultiThread;
        Self {
            id: id.to_string(),
            handle,
            runtime: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            reentrant: AtomicBool::new(reentrant),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit nested synchronous `block_on` calls from the loop's own thread.
    ///
    /// Installed once per loop; later calls are no-ops.
    fn install_reentrancy_patch(&self) {
        if self.reentrant.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("[dispatcher] Nested runs enabled for loop {}", self.id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_reentrant(&self) -> bool {
        self.reentrant.load(Ordering::SeqCst)
    }

    /// Schedule `fut` on this loop.
    pub fn spawn_task<F>(&self, fut: F) -> Result<DispatchFuture<F::Output>, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(DispatchError::LoopClosed(self.id.clone()));
        }
        let completion = Arc::new(Completion::new(self.handle.clone()));
        let inner = self.handle.spawn(fut);
        let abort = inner.abort_handle();
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.retain(|t| !t.is_finished());
            tasks.push(abort.clone());
        }
        let done = completion.clone();
        self.handle.spawn(async move {
            let result = inner.await.map_err(map_join_error);
            if matches!(result, Err(DispatchError::Cancelled)) {
                debug!("[dispatcher] Task cancelled");
            }
            done.complete(result);
        });
        Ok(DispatchFuture { completion, abort })
    }

    /// Run `fut` to completion on this loop and wait for it.
    ///
    /// From a thread that is not a runtime worker this simply blocks. From
    /// inside a multi-threaded runtime, including this loop's own thread,
    /// the call is admitted as a nested run.
    pub fn block_on<F>(&self, fut: F) -> Result<F::Output, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = self.spawn_task(fut)?;
        match Handle::try_current() {
            Err(_) => self.handle.block_on(task),
            Ok(current) => {
                if current.runtime_flavor() != RuntimeFlavor::MultiThread || !self.is_reentrant() {
                    task.cancel();
                    return Err(DispatchError::Reentrant(self.id.clone()));
                }
                tokio::task::block_in_place(|| self.handle.block_on(task))
            }
        }
    }

    /// Abort every task dispatched through this loop.
    pub fn cancel_all(&self) {
        let tasks: Vec<AbortHandle> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let pending = tasks.iter().filter(|t| !t.is_finished()).count();
        if pending > 0 {
            debug!("[dispatcher] Cancelling {} task(s) on loop {}", pending, self.id);
        }
        for task in tasks {
            task.abort();
        }
    }

    /// Cancel outstanding work and stop the loop's thread.
    pub fn close(&self, timeout: Option<Duration>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_all();
        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(runtime) = runtime {
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(timeout.unwrap_or(Duration::from_secs(1)));
            }
            info!("[dispatcher] Closed event loop {}", self.id);
        }
    }
}

// ============================================================================
// Futures and completion callbacks
// ============================================================================

type Callback<T> = Box<dyn FnOnce(&Result<T, DispatchError>) + Send>;

enum State<T> {
    Pending {
        callbacks: Vec<Callback<T>>,
        waker: Option<Waker>,
    },
    Done(Option<Result<T, DispatchError>>),
}

struct Completion<T> {
    state: Mutex<State<T>>,
    /// Set as soon as the task finishes, before callbacks run.
    finished: AtomicBool,
    handle: Handle,
}

impl<T: Send + 'static> Completion<T> {
    fn new(handle: Handle) -> Self {
        Self {
            state: Mutex::new(State::Pending {
                callbacks: Vec::new(),
                waker: None,
            }),
            finished: AtomicBool::new(false),
            handle,
        }
    }

    /// Run callbacks outside the lock, including any a callback adds, then
    /// store the result and wake the awaiting task.
    fn complete(&self, result: Result<T, DispatchError>) {
        self.finished.store(true, Ordering::SeqCst);
        loop {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let State::Pending { callbacks, waker } = &mut *state else {
                return;
            };
            if callbacks.is_empty() {
                let waker = waker.take();
                *state = State::Done(Some(result));
                drop(state);
                if let Some(waker) = waker {
                    waker.wake();
                }
                return;
            }
            let batch = std::mem::take(callbacks);
            drop(state);
            for callback in batch {
                callback(&result);
            }
        }
    }
}

/// Handle to a task running on an [`EventLoop`].
///
/// Awaiting it yields the task's result. Dropping it does not cancel the
/// task; call [`DispatchFuture::cancel`] for that.
pub struct DispatchFuture<T> {
    completion: Arc<Completion<T>>,
    abort: AbortHandle,
}

impl<T: Send + 'static> DispatchFuture<T> {
    /// Cancel the underlying task. The future resolves to `Cancelled`.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_done(&self) -> bool {
        self.completion.finished.load(Ordering::SeqCst)
    }

    /// Run `callback` on the loop thread once the task finishes.
    ///
    /// The callback must not touch GUI state; use
    /// [`DispatchFuture::add_done_callback_slot`] for that.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Result<T, DispatchError>) + Send + 'static) {
        let mut state = self.completion.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Pending { callbacks, .. } => callbacks.push(Box::new(callback)),
            State::Done(_) => {
                drop(state);
                let completion = self.completion.clone();
                self.completion.handle.spawn(async move {
                    let state = completion.state.lock().unwrap_or_else(|e| e.into_inner());
                    match &*state {
                        State::Done(Some(result)) => callback(result),
                        _ => debug!("[dispatcher] Result already taken, callback skipped"),
                    }
                });
            }
        }
    }

    /// Post `callback` to the GUI thread once the task finishes.
    pub fn add_done_callback_slot(
        &self,
        gui: Arc<dyn GuiExecutor>,
        callback: impl FnOnce(Result<T, DispatchError>) + Send + 'static,
    ) where
        T: Clone,
    {
        self.add_done_callback(move |result| {
            let result = result.clone();
            gui.post(Box::new(move || callback(result)));
        });
    }

    /// Block the calling thread until the task finishes.
    pub fn wait(self) -> Result<T, DispatchError> {
        match Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| futures::executor::block_on(self)),
            Err(_) => futures::executor::block_on(self),
        }
    }
}

impl<T> Future for DispatchFuture<T> {
    type Output = Result<T, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.completion.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Pending { waker, .. } => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Done(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Ready(Err(DispatchError::TypeMismatch(
                    "dispatch result was already consumed".into(),
                ))),
            },
        }
    }
}

// ============================================================================
// GUI marshaling
// ============================================================================

/// Something that runs closures on the GUI thread.
pub trait GuiExecutor: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send>);
}

/// Sending half of a [`GuiQueue`].
#[derive(Clone)]
pub struct GuiHandle {
    sender: std::sync::mpsc::Sender<Box<dyn FnOnce() + Send>>,
}

impl GuiExecutor for GuiHandle {
    fn post(&self, task: Box<dyn FnOnce() + Send>) {
        if self.sender.send(task).is_err() {
            warn!("[dispatcher] GUI queue is gone, dropping callback");
        }
    }
}

/// Message queue pumped by the GUI thread.
pub struct GuiQueue {
    receiver: std::sync::mpsc::Receiver<Box<dyn FnOnce() + Send>>,
}

impl GuiQueue {
    pub fn channel() -> (GuiHandle, GuiQueue) {
        let (sender, receiver) = std::sync::mpsc::channel();
        (GuiHandle { sender }, GuiQueue { receiver })
    }

    /// Run every queued callback on the calling thread. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one callback and run it.
    pub fn pump_one(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(_) => false,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// What a dispatched call hands back.
pub enum Dispatched<T> {
    Future(DispatchFuture<T>),
    Result(Result<T, DispatchError>),
    Awaitable(DispatchFuture<T>),
}

impl<T: Send + 'static> Dispatched<T> {
    /// The result, waiting for it if needed.
    pub fn into_result(self) -> Result<T, DispatchError> {
        match self {
            Dispatched::Result(result) => result,
            Dispatched::Future(fut) | Dispatched::Awaitable(fut) => fut.wait(),
        }
    }

    pub fn into_future(self) -> Result<DispatchFuture<T>, DispatchError> {
        match self {
            Dispatched::Future(fut) | Dispatched::Awaitable(fut) => Ok(fut),
            Dispatched::Result(_) => Err(DispatchError::TypeMismatch(
                "call was dispatched with early_return disabled".into(),
            )),
        }
    }
}

/// Runs futures on a named loop on behalf of synchronous callers.
#[derive(Clone)]
pub struct AsyncDispatcher {
    event_loop: Arc<EventLoop>,
    early_return: bool,
    return_awaitable: bool,
}

impl AsyncDispatcher {
    pub fn new(selector: impl Into<LoopSelector>) -> Result<Self, DispatchError> {
        Ok(Self {
            event_loop: get_event_loop(selector)?,
            early_return: true,
            return_awaitable: false,
        })
    }

    /// Return a future instead of blocking for the result. On by default.
    pub fn with_early_return(mut self, early_return: bool) -> Self {
        self.early_return = early_return;
        self
    }

    /// Return an awaitable meant for another loop.
    pub fn with_return_awaitable(mut self, return_awaitable: bool) -> Self {
        self.return_awaitable = return_awaitable;
        self
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Schedule `fut` and return it in the configured shape.
    pub fn call<F>(&self, fut: F) -> Dispatched<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.return_awaitable {
            return match self.event_loop.spawn_task(fut) {
                Ok(task) => Dispatched::Awaitable(task),
                Err(e) => Dispatched::Result(Err(e)),
            };
        }
        if !self.early_return {
            return Dispatched::Result(self.event_loop.block_on(fut));
        }
        match self.event_loop.spawn_task(fut) {
            Ok(task) => Dispatched::Future(task),
            Err(e) => Dispatched::Result(Err(e)),
        }
    }

    /// Wrap an async function so it can be called synchronously.
    pub fn decorate<A, F, Fut>(self, f: F) -> impl Fn(A) -> Dispatched<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        move |args| self.call(f(args))
    }

    pub fn dispatch<F>(&self, fut: F) -> Result<DispatchFuture<F::Output>, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.event_loop.spawn_task(fut)
    }

    pub fn block_on<F>(&self, fut: F) -> Result<F::Output, DispatchError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.event_loop.block_on(fut)
    }
}
