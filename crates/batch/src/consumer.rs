//! Keyed batch windows flushed on a count or time bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Receives the items of one flushed window, in arrival order.
#[async_trait]
pub trait BatchHandler<T>: Send + Sync {
    /// Handles one flushed window for a key.
    async fn handle(&self, key: &str, items: Vec<T>) -> Result<()>;
}

/// Window bounds.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Flush as soon as a window holds this many items.
    pub message_limit: usize,

    /// Flush an underfull window this long after it opened.
    pub time_limit: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            message_limit: 10,
            time_limit: Duration::from_secs(1),
        }
    }
}

struct Window<T> {
    items: Vec<T>,
    generation: u64,
    timer: JoinHandle<()>,
}

struct ConsumerInner<T, H> {
    config: BatchConfig,
    handler: H,
    windows: Mutex<HashMap<String, Window<T>>>,
    next_generation: AtomicU64,
}

/// Buffers items into one open window per key.
///
/// A window closes on whichever bound is hit first: the count-limit flush
/// runs synchronously inside `accept`, the time-limit flush on a per-window
/// timer. The window map lock plus a generation stamp per window keep the
/// two paths from flushing the same window twice or losing an item that
/// arrives while a timer fires.
pub struct BatchConsumer<T, H> {
    inner: Arc<ConsumerInner<T, H>>,
}

impl<T, H> Clone for BatchConsumer<T, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, H> BatchConsumer<T, H>
where
    T: Send + 'static,
    H: BatchHandler<T> + 'static,
{
    /// Creates a consumer over the given handler.
    pub fn new(handler: H, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                config,
                handler,
                windows: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Appends an item to the key's open window, opening one if needed.
    ///
    /// When the item fills the window to the count limit, the flush happens
    /// before `accept` returns and a handler failure propagates to the
    /// caller. Time-limit flushes report failures via logs and metrics only.
    pub async fn accept(&self, key: &str, item: T) -> Result<()> {
        let full = {
            let mut windows = self.inner.windows.lock().await;
            match windows.get_mut(key) {
                Some(window) => {
                    window.items.push(item);
                    window.items.len() >= self.inner.config.message_limit
                }
                None => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let timer = self.spawn_timer(key.to_string(), generation);
                    windows.insert(
                        key.to_string(),
                        Window {
                            items: vec![item],
                            generation,
                            timer,
                        },
                    );
                    self.inner.config.message_limit <= 1
                }
            }
        };

        if full && let Some(items) = self.take_window(key, None).await {
            self.flush(key, items).await?;
        }
        Ok(())
    }

    /// Drains every open window. Shutdown path; handler failures propagate.
    pub async fn flush_all(&self) -> Result<()> {
        let drained: Vec<(String, Vec<T>)> = {
            let mut windows = self.inner.windows.lock().await;
            windows
                .drain()
                .map(|(key, window)| {
                    window.timer.abort();
                    (key, window.items)
                })
                .collect()
        };

        for (key, items) in drained {
            self.flush(&key, items).await?;
        }
        Ok(())
    }

    /// Returns the number of currently open windows.
    pub async fn open_windows(&self) -> usize {
        self.inner.windows.lock().await.len()
    }

    fn spawn_timer(&self, key: String, generation: u64) -> JoinHandle<()> {
        let consumer = self.clone();
        let time_limit = self.inner.config.time_limit;
        tokio::spawn(async move {
            tokio::time::sleep(time_limit).await;
            // A mismatched generation means the window this timer was armed
            // for was already flushed and possibly reopened; leave the new
            // window to its own timer.
            if let Some(items) = consumer.take_window(&key, Some(generation)).await
                && let Err(e) = consumer.flush(&key, items).await
            {
                tracing::error!(error = %e, key = %key, "time-limit flush failed");
            }
        })
    }

    /// Removes and returns the key's window. With `only_generation`, the
    /// window is taken only if the stamp matches (timer path, no abort);
    /// without it the live timer is aborted (count-limit and shutdown path).
    async fn take_window(&self, key: &str, only_generation: Option<u64>) -> Option<Vec<T>> {
        let mut windows = self.inner.windows.lock().await;

        let take = match (windows.get(key), only_generation) {
            (Some(window), Some(generation)) => window.generation == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !take {
            return None;
        }

        let window = windows.remove(key)?;
        if only_generation.is_none() {
            window.timer.abort();
        }
        Some(window.items)
    }

    async fn flush(&self, key: &str, items: Vec<T>) -> Result<()> {
        let size = items.len();
        self.inner.handler.handle(key, items).await.inspect_err(|_| {
            metrics::counter!("batch_flush_failures").increment(1);
        })?;

        metrics::counter!("batch_flushes").increment(1);
        metrics::histogram!("batch_flush_size").record(size as f64);
        tracing::debug!(key = %key, size, "flushed batch window");
        Ok(())
    }
}
