//! Lock-free socket bridge.
//!
//! Caller → ArrayQueue → bridge thread → socket → peer, and
//! peer → socket → bridge thread → channel → caller.
//!
//! The caller never touches the socket; the bridge thread runs a tokio
//! current-thread runtime that owns it.

use crate::error::{BridgeError, Result};
use crate::protocol::BridgeConfig;
use crate::transport::MessageTransport;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

enum Outgoing<M> {
    Send { msg: M, fds: Vec<OwnedFd> },
    Shutdown,
}

/// What the bridge thread hands back.
#[derive(Debug)]
pub enum Incoming<M> {
    Message { msg: M, fds: Vec<OwnedFd> },
    /// The socket is gone; no further messages follow.
    Disconnected(String),
}

/// One end of a bridged socket. `Out` is sent, `In` is received.
///
/// Drops gracefully: the thread is told to shut down and joined.
pub struct LockFreeBridge<Out, In> {
    queue: Arc<ArrayQueue<Outgoing<Out>>>,
    incoming: Receiver<Incoming<In>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl<Out, In> LockFreeBridge<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    /// Moves `stream` onto a new bridge thread named `name`.
    pub fn spawn(name: &str, stream: UnixStream, config: &BridgeConfig) -> Result<Self> {
        let queue = Arc::new(ArrayQueue::new(config.queue_size));
        let (tx, incoming) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let connected = Arc::new(AtomicBool::new(true));
        let max_frame = config.max_frame_size;

        let thread_handle = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let connected = Arc::clone(&connected);
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(rt) => rt,
                        Err(e) => {
                            connected.store(false, Ordering::Release);
                            let _ = tx.send(Incoming::Disconnected(e.to_string()));
                            return;
                        }
                    };

                    runtime.block_on(async move {
                        let transport = match MessageTransport::from_std(stream) {
                            Ok(t) => t.with_max_frame(max_frame),
                            Err(e) => {
                                connected.store(false, Ordering::Release);
                                let _ = tx.send(Incoming::Disconnected(e.to_string()));
                                return;
                            }
                        };
                        let reader = tokio::spawn(Self::read_loop(
                            transport.clone(),
                            tx.clone(),
                            Arc::clone(&connected),
                        ));
                        Self::write_loop(&transport, &queue, &running, &connected, &tx).await;
                        reader.abort();
                    });
                })?
        };

        Ok(Self {
            queue,
            incoming,
            running,
            connected,
            thread_handle: Some(thread_handle),
        })
    }

    async fn write_loop(
        transport: &MessageTransport,
        queue: &ArrayQueue<Outgoing<Out>>,
        running: &AtomicBool,
        connected: &AtomicBool,
        tx: &Sender<Incoming<In>>,
    ) {
        loop {
            match queue.pop() {
                Some(Outgoing::Send { msg, fds }) => {
                    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
                    if let Err(e) = transport.send(&msg, &raw).await {
                        warn!("bridge send failed: {}", e);
                        if connected.swap(false, Ordering::AcqRel) {
                            let _ = tx.send(Incoming::Disconnected(e.to_string()));
                        }
                        return;
                    }
                    // Our duplicates close here; the peer holds its own.
                    drop(fds);
                }
                Some(Outgoing::Shutdown) => {
                    debug!("bridge shutting down");
                    return;
                }
                None if !running.load(Ordering::Relaxed) => return,
                None => tokio::time::sleep(Duration::from_micros(100)).await,
            }
        }
    }

    async fn read_loop(transport: MessageTransport, tx: Sender<Incoming<In>>, connected: Arc<AtomicBool>) {
        loop {
            match transport.recv::<In>().await {
                Ok((msg, fds)) => {
                    if tx.send(Incoming::Message { msg, fds }).is_err() {
                        return;
                    }
                }
                Err(BridgeError::Serialization(e)) => {
                    // The frame was consumed whole; the stream is still in sync.
                    warn!("dropping undecodable frame: {}", e);
                }
                Err(e) => {
                    match &e {
                        BridgeError::Disconnected => debug!("peer closed the socket"),
                        other => warn!("bridge receive failed: {}", other),
                    }
                    if connected.swap(false, Ordering::AcqRel) {
                        let _ = tx.send(Incoming::Disconnected(e.to_string()));
                    }
                    return;
                }
            }
        }
    }

    /// Queues `msg` with `fds` attached. Never blocks.
    pub fn push(&self, msg: Out, fds: Vec<OwnedFd>) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::Disconnected);
        }
        self.queue
            .push(Outgoing::Send { msg, fds })
            .map_err(|_| BridgeError::QueueFull)?;
        trace!("queued message ({} pending)", self.queue.len());
        Ok(())
    }

    pub fn try_recv(&self) -> Option<Incoming<In>> {
        self.incoming.try_recv().ok()
    }

    /// Waits up to `timeout` for the next message; `None` waits forever.
    pub fn recv_timeout(&self, timeout: Option<Duration>) -> Option<Incoming<In>> {
        match timeout {
            Some(t) => match self.incoming.recv_timeout(t) {
                Ok(m) => Some(m),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
            None => self.incoming.recv().ok(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Sends everything already queued, then stops the thread.
    pub fn shutdown(&mut self) {
        if self.queue.push(Outgoing::Shutdown).is_err() {
            self.running.store(false, Ordering::Relaxed);
        }

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.connected.store(false, Ordering::Release);
    }
}

impl<Out, In> Drop for LockFreeBridge<Out, In> {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            if self.queue.push(Outgoing::Shutdown).is_err() {
                self.running.store(false, Ordering::Relaxed);
            }
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }
}
