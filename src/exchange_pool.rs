//! A fixed-size worker pool for running exchanges.
//!
//! The accept loop hands every local connection to this pool instead of
//! spawning an unbounded task per connection. A small number of worker
//! tasks each drive many exchange futures through `FuturesUnordered`,
//! which caps the task fan-out no matter how fast connections arrive.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use log::debug;
use tokio::sync::mpsc;

pub const DEFAULT_NUM_WORKERS: usize = 8;

type BoxedExchange = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'static>>;

pub struct ExchangePool {
    /// One sender per worker, round-robin distribution.
    senders: Vec<mpsc::UnboundedSender<BoxedExchange>>,
    next_worker: AtomicUsize,
}

impl ExchangePool {
    pub fn new(num_workers: usize) -> Self {
        assert!(num_workers > 0, "must have at least one worker");

        let mut senders = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::unbounded_channel::<BoxedExchange>();
            senders.push(tx);
            tokio::spawn(worker_loop(worker_id, rx));
        }

        Self {
            senders,
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Submits an exchange future. Returns `false` if the chosen worker
    /// has terminated.
    pub fn submit<F>(&self, exchange: F) -> bool
    where
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        let worker_idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[worker_idx].send(Box::pin(exchange)).is_ok()
    }

    pub fn num_workers(&self) -> usize {
        self.senders.len()
    }
}

async fn worker_loop(worker_id: usize, mut rx: mpsc::UnboundedReceiver<BoxedExchange>) {
    let mut exchanges: FuturesUnordered<BoxedExchange> = FuturesUnordered::new();

    loop {
        // Biased so in-flight exchanges progress (and newly pushed ones
        // get their initial poll) before more work is accepted.
        tokio::select! {
            biased;

            Some(result) = exchanges.next(), if !exchanges.is_empty() => {
                // A failed exchange only closes its own connection.
                if let Err(e) = result {
                    debug!("exchange worker {worker_id}: exchange closed: {e}");
                }
            }
            Some(exchange) = rx.recv() => {
                exchanges.push(exchange);
            }
            else => {
                if exchanges.is_empty() {
                    debug!("exchange worker {worker_id} shutting down");
                    break;
                }
            }
        }
    }
}
