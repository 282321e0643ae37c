use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amqmux_frame::Method;

use crate::error::{Result, TransportError};
use crate::traits::FrameTransport;

/// Create a connected in-process transport pair.
///
/// The [`LoopbackTransport`] half is handed to the channel engine; the
/// [`LoopbackReceiver`] half observes everything sent, in transmission
/// order. Tests play the broker by reading one side and routing replies
/// back through the connection's reader entry point.
pub fn loopback() -> (Arc<LoopbackTransport>, LoopbackReceiver) {
    let (tx, rx) = mpsc::channel();
    let transport = Arc::new(LoopbackTransport {
        tx: Mutex::new(Some(tx)),
        closed: AtomicBool::new(false),
    });
    (transport, LoopbackReceiver { rx })
}

/// In-process [`FrameTransport`] that hands frames to a paired receiver.
pub struct LoopbackTransport {
    tx: Mutex<Option<mpsc::Sender<(u16, Method)>>>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    /// Simulate transport loss: every subsequent send fails with `Closed`
    /// and the paired receiver sees end-of-stream once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    /// True once the link has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl FrameTransport for LoopbackTransport {
    fn send(&self, channel: u16, method: Method) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.send((channel, method)).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }
}

/// Receiving end of a loopback pair.
pub struct LoopbackReceiver {
    rx: mpsc::Receiver<(u16, Method)>,
}

impl LoopbackReceiver {
    /// Block until the next transmitted frame arrives.
    pub fn recv(&self) -> Option<(u16, Method)> {
        self.rx.recv().ok()
    }

    /// Block up to `timeout` for the next transmitted frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(u16, Method)> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain every frame transmitted so far without blocking.
    pub fn drain(&self) -> Vec<(u16, Method)> {
        self.rx.try_iter().collect()
    }
}
