//! Async write queue
//!
//! A single-consumer FIFO of persistence closures. Enqueueing never
//! blocks the caller: the queue is bounded and overflow drops the write
//! (logged at WARN). A dedicated consumer thread executes closures in
//! enqueue order, since sqlite access is blocking.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

/// Queue depth; writes beyond this are dropped
const QUEUE_CAPACITY: usize = 1000;

/// A persistence operation executed off the hot path
pub type WriteOp = Box<dyn FnOnce(&Connection) -> rusqlite::Result<()> + Send + 'static>;

pub(crate) struct AsyncWriter {
    tx: Mutex<Option<mpsc::Sender<WriteOp>>>,
    consumer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl AsyncWriter {
    pub(crate) fn start(conn: Arc<Mutex<Connection>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteOp>(QUEUE_CAPACITY);

        let consumer = std::thread::Builder::new()
            .name("haven-store-writer".to_string())
            .spawn(move || {
                // Channel closure is the shutdown signal; recv drains
                // whatever is still queued before returning None.
                while let Some(op) = rx.blocking_recv() {
                    let conn = conn.lock().unwrap();
                    if let Err(err) = op(&conn) {
                        error!(error = %err, "async database write failed");
                    }
                }
            })
            .expect("spawning the store writer thread");

        Self {
            tx: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Queue a write. Never blocks; drops the operation if the queue is
    /// full or already shut down.
    pub(crate) fn enqueue(&self, op: WriteOp) {
        let Some(tx) = self.tx.lock().unwrap().clone() else {
            warn!("write queue is shut down, dropping write");
            return;
        };

        if let Err(err) = tx.try_send(op) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("write queue full, dropping write");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("write queue is shut down, dropping write");
                }
            }
        }
    }

    /// Block until everything queued before this call has been executed.
    /// Test affordance: enqueues a barrier and waits for the consumer to
    /// reach it.
    pub(crate) async fn wait_for_writes(&self) {
        let Some(tx) = self.tx.lock().unwrap().clone() else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        let barrier: WriteOp = Box::new(move |_| {
            let _ = done_tx.send(());
            Ok(())
        });

        // The barrier must not be dropped on overflow, so it waits for
        // queue space instead of using try_send.
        if tx.send(barrier).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Refuse new work, drain the remaining queue, then stop the
    /// consumer. Idempotent.
    pub(crate) async fn shutdown(&self) {
        drop(self.tx.lock().unwrap().take());

        let consumer = self.consumer.lock().unwrap().take();
        if let Some(handle) = consumer {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}
