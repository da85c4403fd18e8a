use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread::{Builder, JoinHandle},
};

use anyhow::Context;
use mio::net::TcpStream;
use tracing::{error, warn};

use crate::{
    config::ReactorConfig,
    error::Result,
    handler::SocketEventHandler,
    selector::{SelectorHandle, SocketSelector},
};

/// Fixed set of selector threads. New channels are spread over them
/// round-robin.
pub struct SelectorPool {
    workers: Vec<Worker>,
    handles: Vec<SelectorHandle<TcpStream>>,
    next: AtomicUsize,
}

impl SelectorPool {
    pub fn new(config: &ReactorConfig) -> Result<Self> {
        let capacity = config.selectors.max(1);
        let mut pool = Self {
            workers: Vec::with_capacity(capacity),
            handles: Vec::with_capacity(capacity),
            next: AtomicUsize::new(0),
        };

        // a failure part way leaves `pool` to shut down what already started
        for id in 0..capacity {
            let selector = SocketSelector::new(id, config, SocketEventHandler::new())?;
            pool.handles.push(selector.handle());
            pool.workers.push(Worker::spawn(id, selector)?);
        }

        Ok(pool)
    }

    /// Next selector in round-robin order.
    pub fn next(&self) -> &SelectorHandle<TcpStream> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        &self.handles[index]
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Asks every selector to stop. Does not wait for them.
    pub fn shutdown(&self) {
        for handle in &self.handles {
            if let Err(e) = handle.shutdown() {
                warn!(selector = handle.index(), error = %e, "shutdown request not delivered");
            }
        }
    }
}

impl Drop for SelectorPool {
    fn drop(&mut self) {
        self.shutdown();
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!(selector = worker.id, "selector thread panicked");
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(id: usize, mut selector: SocketSelector) -> Result<Self> {
        let thread = Builder::new()
            .name(format!("selector-{id}"))
            .spawn(move || {
                // errors are logged by the loop itself
                let _ = selector.run();
            })
            .with_context(|| format!("couldn't create selector thread id={id}"))?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}
