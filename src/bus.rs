//! The bus handle.
//!
//! A [`Bus`] is built once at startup and cloned into every component that
//! needs it. It owns the publisher and reconciler for one namespace and
//! exposes each operation twice: a blocking method for ordinary threads and
//! an `_async` twin for event-loop contexts. The async twins run the same
//! code on tokio's blocking pool; lock waits sleep on the tokio timer.
//!
//! At most one logical publisher should exist per deployment namespace.
//! Several processes may each hold a `Bus` over the same backend; the
//! publisher lock keeps their sequencing consistent.

use crate::backend::Backend;
use crate::broker::{Broker, HttpBroker};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::pinger::Pinger;
use crate::publisher::{release, Publisher};
use crate::reconcile::{ReconcileReply, ReconcileRequest, Reconciler};
use crate::topics::CompiledRuleSet;
use crate::types::{BusStats, MessageInput, RepositoryId, SequenceId, StoredMessage};
use serde_json::Value;
use std::sync::Arc;

/// Cloneable handle to one bus namespace.
#[derive(Clone)]
pub struct Bus {
    config: Arc<BusConfig>,
    publisher: Arc<Publisher>,
    reconciler: Arc<Reconciler>,
}

impl Bus {
    pub fn new(
        backend: Arc<dyn Backend>,
        broker: Arc<dyn Broker>,
        config: BusConfig,
    ) -> Result<Self> {
        config.validate()?;

        let publisher = Arc::new(Publisher::new(backend, broker, &config));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&publisher), &config));

        tracing::debug!(namespace = %config.namespace, "bus ready");
        Ok(Self {
            config: Arc::new(config),
            publisher,
            reconciler,
        })
    }

    /// Bus forwarding to the HTTP broker at `config.broker_url`.
    ///
    /// Call outside async contexts; the HTTP client is blocking.
    pub fn with_http_broker(backend: Arc<dyn Backend>, config: BusConfig) -> Result<Self> {
        let url = config
            .broker_url
            .clone()
            .ok_or_else(|| BusError::InvalidConfig("broker_url is not set".into()))?;
        let broker = HttpBroker::new(url, config.broker_timeout)?;
        Self::new(backend, Arc::new(broker), config)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Heartbeat for this bus; start it with `spawn` or `spawn_async`.
    pub fn pinger(&self) -> Pinger {
        Pinger::new(Arc::clone(&self.publisher), &self.config)
    }

    pub fn publish(&self, input: MessageInput) -> Result<SequenceId> {
        self.publisher.publish(input)
    }

    pub async fn publish_async(&self, input: MessageInput) -> Result<SequenceId> {
        let guard = self
            .publisher
            .lock()
            .acquire_or_timeout_async(self.publisher.lock_wait())
            .await?;
        let publisher = Arc::clone(&self.publisher);

        tokio::task::spawn_blocking(move || {
            let published = publisher.publish_locked(input, &guard);
            release(guard, "publish");
            published
        })
        .await?
    }

    pub fn flush(&self) -> Result<bool> {
        self.publisher.flush()
    }

    pub async fn flush_async(&self) -> Result<bool> {
        let guard = self
            .publisher
            .lock()
            .acquire_or_timeout_async(self.publisher.lock_wait())
            .await?;
        let publisher = Arc::clone(&self.publisher);

        tokio::task::spawn_blocking(move || {
            let drained = publisher.send_unsent(&guard);
            release(guard, "flush");
            drained
        })
        .await?
    }

    pub fn get_messages(
        &self,
        first: Option<SequenceId>,
        last: Option<SequenceId>,
        rules: Option<&CompiledRuleSet>,
    ) -> Result<Vec<StoredMessage>> {
        self.publisher.get_messages(first, last, rules)
    }

    pub async fn get_messages_async(
        &self,
        first: Option<SequenceId>,
        last: Option<SequenceId>,
        rules: Option<CompiledRuleSet>,
    ) -> Result<Vec<StoredMessage>> {
        self.blocking(move |bus| bus.get_messages(first, last, rules.as_ref()))
            .await
    }

    pub fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileReply> {
        self.reconciler.reconcile(request)
    }

    pub async fn reconcile_async(&self, request: ReconcileRequest) -> Result<ReconcileReply> {
        self.blocking(move |bus| bus.reconcile(&request)).await
    }

    pub fn reconcile_json(&self, request: &Value) -> Result<ReconcileReply> {
        self.reconciler.reconcile_json(request)
    }

    pub async fn reconcile_json_async(&self, request: Value) -> Result<ReconcileReply> {
        self.blocking(move |bus| bus.reconcile_json(&request)).await
    }

    pub fn remove_repository(&self, repository_id: RepositoryId) -> Result<usize> {
        self.publisher.remove_repository(repository_id)
    }

    pub async fn remove_repository_async(&self, repository_id: RepositoryId) -> Result<usize> {
        self.blocking(move |bus| bus.remove_repository(repository_id))
            .await
    }

    pub fn clean(&self, min_to_keep: SequenceId) -> Result<usize> {
        self.publisher.clean(min_to_keep)
    }

    pub async fn clean_async(&self, min_to_keep: SequenceId) -> Result<usize> {
        self.blocking(move |bus| bus.clean(min_to_keep)).await
    }

    pub fn last_sequence_id(&self) -> Result<SequenceId> {
        self.publisher.last_sequence_id()
    }

    pub async fn last_sequence_id_async(&self) -> Result<SequenceId> {
        self.blocking(|bus| bus.last_sequence_id()).await
    }

    pub fn stats(&self) -> Result<BusStats> {
        self.publisher.stats()
    }

    pub async fn stats_async(&self) -> Result<BusStats> {
        self.blocking(|bus| bus.stats()).await
    }

    /// Run `f` on the blocking pool against a clone of this handle.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Bus) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let bus = self.clone();
        tokio::task::spawn_blocking(move || f(&bus)).await?
    }
}
