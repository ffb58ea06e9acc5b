//! Ship structured log events to an HTTP collector.
//!
//! [`LogShipper`] is a `MakeWriter` for a JSON `fmt` layer. Each formatted
//! event goes into a bounded channel; a background task batches the lines and
//! POSTs them as a JSON array. When the channel is full the event is dropped
//! and counted, so logging never blocks a request. [`ShipperHandle::finish`]
//! flushes what is queued at shutdown, while the subscriber still holds the
//! writer.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Metadata;
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggingConfig;
use crate::{Error, Result};

/// Targets never shipped: the HTTP stack used for shipping, and this module
const EXCLUDED_TARGETS: [&str; 5] = ["hyper", "reqwest", "h2", "rustls", module_path!()];

/// Writer factory feeding the shipping channel
#[derive(Clone, Debug)]
pub struct LogShipper {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl LogShipper {
    /// Start the batching task and return the writer factory.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(endpoint: &str, config: &LoggingConfig) -> Result<(Self, ShipperHandle)> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("Invalid logging.ship_endpoint {endpoint}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let (shipper, rx) = Self::channel(config.channel_capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_batcher(
            client,
            endpoint,
            rx,
            stop_rx,
            config.batch_size.max(1),
            config.flush_interval,
        ));
        Ok((
            shipper,
            ShipperHandle {
                stop: stop_tx,
                task,
            },
        ))
    }

    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Events discarded because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Control over the batching task
#[derive(Debug)]
pub struct ShipperHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ShipperHandle {
    /// Ship everything queued so far and stop the batching task.
    ///
    /// Waits at most `timeout`; events logged afterwards are dropped.
    pub async fn finish(self, timeout: Duration) -> bool {
        let _ = self.stop.send(());
        matches!(tokio::time::timeout(timeout, self.task).await, Ok(Ok(())))
    }
}

impl<'a> MakeWriter<'a> for LogShipper {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter {
            buf: Vec::with_capacity(256),
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

/// Buffers one formatted event; sends it when dropped
pub struct EventWriter {
    buf: Vec<u8>,
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl io::Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        let line = String::from_utf8_lossy(&self.buf);
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        if self.tx.try_send(line.to_owned()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-layer filter for the shipping layer
pub fn ship_target_allowed(metadata: &Metadata<'_>) -> bool {
    let target = metadata.target();
    !EXCLUDED_TARGETS.iter().any(|t| target.starts_with(t))
}

async fn run_batcher(
    client: reqwest::Client,
    endpoint: url::Url,
    mut rx: mpsc::Receiver<String>,
    mut stop: oneshot::Receiver<()>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut interval = tokio::time::interval(flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut stop_armed = true;

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    batch.push(line);
                    if batch.len() >= batch_size {
                        ship(&client, &endpoint, &mut batch).await;
                    }
                }
                None => {
                    ship(&client, &endpoint, &mut batch).await;
                    break;
                }
            },
            _ = interval.tick() => {
                ship(&client, &endpoint, &mut batch).await;
            }
            signal = &mut stop, if stop_armed => match signal {
                Ok(()) => {
                    rx.close();
                    while let Ok(line) = rx.try_recv() {
                        batch.push(line);
                        if batch.len() >= batch_size {
                            ship(&client, &endpoint, &mut batch).await;
                        }
                    }
                    ship(&client, &endpoint, &mut batch).await;
                    break;
                }
                // Handle dropped without finish: run until the channel closes
                Err(_) => stop_armed = false,
            },
        }
    }
}

async fn ship(client: &reqwest::Client, endpoint: &url::Url, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let events: Vec<Value> = batch
        .drain(..)
        .map(|line| serde_json::from_str(&line).unwrap_or(Value::String(line)))
        .collect();
    let count = events.len();

    let result = client
        .post(endpoint.clone())
        .json(&events)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status);

    // tracing here would feed back into this shipper
    if let Err(e) = result {
        eprintln!("log shipping: failed to ship {count} events to {endpoint}: {e}");
    }
}
