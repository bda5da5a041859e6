//! Heartbeat broadcasting the last allocated sequence id.
//!
//! Idle clients compare the advertised id with the last one they received
//! and reconcile when they are behind. A ping only reads state, unless
//! pending flushing is enabled, in which case each ping first redelivers
//! messages a broker outage left pending.

use crate::broker::Broker;
use crate::config::BusConfig;
use crate::error::Result;
use crate::publisher::Publisher;
use crate::types::SequenceId;
use crossbeam_channel::{select, tick, Sender};
use serde_json::{json, Map};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Periodic heartbeat over a publisher's broker.
#[derive(Clone)]
pub struct Pinger {
    publisher: Arc<Publisher>,
    topic: String,
    interval: Duration,
    flush_pending: bool,
}

impl Pinger {
    pub fn new(publisher: Arc<Publisher>, config: &BusConfig) -> Self {
        Self {
            publisher,
            topic: config.ping_topic(),
            interval: config.ping_interval,
            flush_pending: config.ping_flush_pending,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Broadcast the last allocated id once, returning it.
    pub fn ping(&self) -> Result<SequenceId> {
        if self.flush_pending {
            match self.publisher.flush() {
                Ok(true) => {}
                Ok(false) => tracing::debug!("pending messages remain after flush"),
                Err(e) => tracing::warn!(error = %e, "flush before ping failed"),
            }
        }

        let last = self.publisher.last_sequence_id()?;
        let mut kwargs = Map::new();
        kwargs.insert("last_msg_id".into(), json!(last.0));

        self.publisher.broker().publish(&self.topic, &[], &kwargs)?;
        tracing::trace!(topic = %self.topic, last_sequence_id = %last, "ping");
        Ok(last)
    }

    /// Ping on a background thread every interval until the handle is
    /// stopped or dropped.
    pub fn spawn(&self) -> PingerHandle {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let pinger = self.clone();

        let thread = thread::spawn(move || {
            let ticker = tick(pinger.interval);
            tracing::info!(topic = %pinger.topic, interval = ?pinger.interval, "pinger started");
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if let Err(e) = pinger.ping() {
                            tracing::warn!(error = %e, "ping failed");
                        }
                    }
                    recv(stopped) -> _ => break,
                }
            }
            tracing::info!(topic = %pinger.topic, "pinger stopped");
        });

        PingerHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    /// Ping from a tokio task every interval. Abort the returned handle to
    /// stop it.
    ///
    /// Each ping runs on the blocking pool so a slow broker never stalls
    /// the event loop.
    pub fn spawn_async(&self) -> tokio::task::JoinHandle<()> {
        let pinger = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pinger.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                topic = %pinger.topic,
                interval = ?pinger.interval,
                "async pinger started"
            );

            loop {
                ticker.tick().await;
                let task = pinger.clone();
                match tokio::task::spawn_blocking(move || task.ping()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "ping failed"),
                    Err(e) => tracing::warn!(error = %e, "ping task failed"),
                }
            }
        })
    }
}

/// Stops a thread-based pinger when dropped.
pub struct PingerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PingerHandle {
    /// Stop pinging and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the select.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PingerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
