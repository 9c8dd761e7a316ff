//! Data-thread actor.
//!
//! A [`DataLoop<S>`] owns a state `S` (usually a node) on a dedicated thread.
//! Other threads reach the state only by posting closures through an
//! [`Invoker`]; fd sources such as doorbells are polled by the same thread and
//! dispatched with `&mut S`.
//!
//! Control thread → ArrayQueue + wakeup doorbell → data thread → `&mut S`

use crate::doorbell::{poll_fds, Doorbell};
use crate::error::{Error, Result};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const INVOKE_QUEUE_SIZE: usize = 256;
const INVOKE_POLL: Duration = Duration::from_millis(10);

struct LoopShared {
    name: String,
    running: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
}

/// Identity of a data loop, handed to nodes through [`crate::Support`].
#[derive(Clone)]
pub struct LoopRef {
    shared: Arc<LoopShared>,
}

impl LoopRef {
    /// A loop identity with no thread behind it. Every thread may access state
    /// guarded by it.
    pub fn detached(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                name: name.into(),
                running: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_current(&self) -> bool {
        *self.shared.thread.lock() == Some(thread::current().id())
    }

    /// Loop-owned state may be touched from here: the loop is not running, or
    /// this is its thread.
    pub fn can_access(&self) -> bool {
        !self.is_running() || self.is_current()
    }
}

impl fmt::Debug for LoopRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopRef")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceEvents(u32);

impl SourceEvents {
    pub const IN: SourceEvents = SourceEvents(1 << 0);
    pub const ERR: SourceEvents = SourceEvents(1 << 1);
    pub const HUP: SourceEvents = SourceEvents(1 << 2);

    pub const fn contains(self, other: SourceEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn from_revents(revents: libc::c_short) -> Self {
        let mut bits = 0;
        if revents & libc::POLLIN != 0 {
            bits |= Self::IN.0;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            bits |= Self::ERR.0;
        }
        if revents & libc::POLLHUP != 0 {
            bits |= Self::HUP.0;
        }
        SourceEvents(bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

trait Dispatch<S>: Send {
    fn fd(&self) -> RawFd;
    fn dispatch(&mut self, state: &mut S, events: SourceEvents);
}

struct IoSource<F, C> {
    io: F,
    callback: C,
}

impl<S, F, C> Dispatch<S> for IoSource<F, C>
where
    F: AsRawFd + Send,
    C: FnMut(&mut S, &F, SourceEvents) + Send,
{
    fn fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }

    fn dispatch(&mut self, state: &mut S, events: SourceEvents) {
        (self.callback)(state, &self.io, events)
    }
}

type InvokeFn<S> = Box<dyn FnOnce(&mut S) + Send>;

enum LoopMsg<S> {
    Invoke(InvokeFn<S>),
    AddSource(SourceId, Box<dyn Dispatch<S>>),
    RemoveSource(SourceId),
    Stop,
}

/// Posts work to a [`DataLoop`] from any thread. Cloning is cheap.
pub struct Invoker<S> {
    shared: Arc<LoopShared>,
    queue: Arc<ArrayQueue<LoopMsg<S>>>,
    wakeup: Arc<Doorbell>,
    next_source: Arc<AtomicU64>,
}

impl<S> Clone for Invoker<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            queue: Arc::clone(&self.queue),
            wakeup: Arc::clone(&self.wakeup),
            next_source: Arc::clone(&self.next_source),
        }
    }
}

impl<S: Send + 'static> Invoker<S> {
    fn post(&self, msg: LoopMsg<S>) -> Result<()> {
        if self.queue.push(msg).is_err() {
            return Err(Error::IoBusy(format!("{} invoke queue is full", self.shared.name)));
        }
        self.wakeup.signal(1)
    }

    /// Runs `f` on the data thread and waits for its result.
    ///
    /// Fails with [`Error::LoopStopped`] when the loop is not running or stops
    /// before `f` ran. Code already on the loop thread holds `&mut S` and must
    /// not call this.
    pub fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::LoopStopped);
        }
        if *self.shared.thread.lock() == Some(thread::current().id()) {
            return Err(Error::InvalidArgument(
                "blocking invoke from the data loop thread".into(),
            ));
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.post(LoopMsg::Invoke(Box::new(move |state: &mut S| {
            let _ = tx.send(f(state));
        })))?;
        loop {
            match rx.recv_timeout(INVOKE_POLL) {
                Ok(r) => return Ok(r),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::LoopStopped),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.shared.running.load(Ordering::Acquire) {
                        // Posted after the loop drained its queue.
                        drain(&self.queue);
                        return rx.try_recv().map_err(|_| Error::LoopStopped);
                    }
                }
            }
        }
    }

    /// Queues `f` without waiting.
    pub fn invoke_async<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.post(LoopMsg::Invoke(Box::new(f)))
    }

    /// Watches `io` for readability. `callback` runs on the data thread.
    ///
    /// The source is dropped after it reports an error or hangup.
    pub fn add_source<F, C>(&self, io: F, callback: C) -> Result<SourceId>
    where
        F: AsRawFd + Send + 'static,
        C: FnMut(&mut S, &F, SourceEvents) + Send + 'static,
    {
        let id = SourceId(self.next_source.fetch_add(1, Ordering::Relaxed));
        self.post(LoopMsg::AddSource(id, Box::new(IoSource { io, callback })))?;
        Ok(id)
    }

    pub fn remove_source(&self, id: SourceId) -> Result<()> {
        self.post(LoopMsg::RemoveSource(id))
    }

    pub fn loop_ref(&self) -> LoopRef {
        LoopRef {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Owner of the data thread. Stops and joins the thread on drop.
pub struct DataLoop<S: Send + 'static> {
    invoker: Invoker<S>,
    state: Option<S>,
    thread: Option<JoinHandle<Option<S>>>,
}

impl<S: Send + 'static> DataLoop<S> {
    pub fn new(name: impl Into<String>, state: S) -> Result<Self> {
        Self::with_state(name, |_| Ok(state))
    }

    /// Builds the state from the loop's own handle, for nodes that take it
    /// through [`crate::Support`].
    pub fn with_state<F>(name: impl Into<String>, build: F) -> Result<Self>
    where
        F: FnOnce(LoopRef) -> Result<S>,
    {
        let shared = Arc::new(LoopShared {
            name: name.into(),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        });
        let state = build(LoopRef {
            shared: Arc::clone(&shared),
        })?;
        Ok(Self {
            invoker: Invoker {
                shared,
                queue: Arc::new(ArrayQueue::new(INVOKE_QUEUE_SIZE)),
                wakeup: Arc::new(Doorbell::new()?),
                next_source: Arc::new(AtomicU64::new(0)),
            },
            state: Some(state),
            thread: None,
        })
    }

    pub fn handle(&self) -> LoopRef {
        self.invoker.loop_ref()
    }

    pub fn invoker(&self) -> Invoker<S> {
        self.invoker.clone()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// The state while the loop is stopped.
    pub fn state_mut(&mut self) -> Option<&mut S> {
        self.state.as_mut()
    }

    /// Runs `f` inline while stopped, otherwise on the data thread.
    pub fn invoke<R, F>(&mut self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        match self.state.as_mut() {
            Some(state) => Ok(f(state)),
            None => self.invoker.invoke(f),
        }
    }

    /// Moves the state onto a new data thread.
    pub fn start(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };
        let shared = Arc::clone(&self.invoker.shared);
        let queue = Arc::clone(&self.invoker.queue);
        let wakeup = Arc::clone(&self.invoker.wakeup);

        shared.running.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name(shared.name.clone())
            .spawn(move || {
                *shared.thread.lock() = Some(thread::current().id());
                let state = run(state, &queue, &wakeup, &shared.name);
                *shared.thread.lock() = None;
                shared.running.store(false, Ordering::Release);
                drain(&queue);
                state
            });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.invoker.shared.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Stops the data thread and takes the state back.
    pub fn stop(&mut self) -> Result<&mut S> {
        if let Some(handle) = self.thread.take() {
            // Stop must get through even when the queue is full.
            while self.invoker.queue.push(LoopMsg::Stop).is_err() {
                thread::yield_now();
            }
            self.invoker.wakeup.signal(1)?;
            match handle.join() {
                Ok(Some(state)) => self.state = Some(state),
                Ok(None) | Err(_) => {
                    error!("data loop {} lost its state", self.invoker.shared.name);
                    return Err(Error::LoopStopped);
                }
            }
        }
        self.state.as_mut().ok_or(Error::LoopStopped)
    }

    pub fn into_inner(mut self) -> Result<S> {
        self.stop()?;
        self.state.take().ok_or(Error::LoopStopped)
    }
}

impl<S: Send + 'static> Drop for DataLoop<S> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                warn!("failed to stop data loop: {}", e);
            }
        }
    }
}

/// Drops whatever is still queued, releasing the reply channels of pending
/// invokes.
fn drain<S>(queue: &ArrayQueue<LoopMsg<S>>) {
    let mut dropped = 0;
    while queue.pop().is_some() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!("dropped {} messages queued after stop", dropped);
    }
}

fn run<S>(
    mut state: S,
    queue: &ArrayQueue<LoopMsg<S>>,
    wakeup: &Doorbell,
    name: &str,
) -> Option<S> {
    let mut sources: Vec<(SourceId, Box<dyn Dispatch<S>>)> = Vec::new();
    let mut pfds: Vec<libc::pollfd> = Vec::new();
    debug!("data loop {} started", name);

    loop {
        pfds.clear();
        pfds.push(libc::pollfd {
            fd: wakeup.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        pfds.extend(sources.iter().map(|(_, s)| libc::pollfd {
            fd: s.fd(),
            events: libc::POLLIN,
            revents: 0,
        }));

        if let Err(e) = poll_fds(&mut pfds, None) {
            error!("data loop {} poll failed: {}", name, e);
            return Some(state);
        }

        // Sources first, in registration order, then control messages.
        let mut dead = Vec::new();
        for (i, (id, source)) in sources.iter_mut().enumerate() {
            let events = SourceEvents::from_revents(pfds[i + 1].revents);
            if events.is_empty() {
                continue;
            }
            source.dispatch(&mut state, events);
            if events.contains(SourceEvents::ERR) || events.contains(SourceEvents::HUP) {
                dead.push(*id);
            }
        }
        if !dead.is_empty() {
            trace!("data loop {} dropping {} sources", name, dead.len());
            sources.retain(|(id, _)| !dead.contains(id));
        }

        if pfds[0].revents != 0 {
            let _ = wakeup.read();
            while let Some(msg) = queue.pop() {
                match msg {
                    LoopMsg::Invoke(f) => f(&mut state),
                    LoopMsg::AddSource(id, source) => sources.push((id, source)),
                    LoopMsg::RemoveSource(id) => sources.retain(|(i, _)| *i != id),
                    LoopMsg::Stop => {
                        debug!("data loop {} stopped", name);
                        return Some(state);
                    }
                }
            }
        }
    }
}
