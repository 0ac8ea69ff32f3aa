//! Publish dispatcher.
//!
//! Items reach this module already claimed into `Publishing`. Each target
//! account gets one sequential lane so posts to the same account never
//! overlap; a shared semaphore caps how many publish calls run at once
//! across all lanes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    ContentItem, FailureReason, IdempotencyToken, ItemId, ItemState, ItemStore, PublishConfig,
    PublishError, StoreError,
};

/// Proof of a successful post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Platform-side id of the post.
    pub post_id: String,
}

/// The social platform's publish capability.
///
/// Implementations must pass `token` to the platform on every attempt so a
/// repeated call for the same item is deduplicated.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        item: &ContentItem,
        token: &IdempotencyToken,
    ) -> Result<PublishReceipt, PublishError>;
}

/// Account lanes and the tasks draining them.
///
/// Only grows: a lane stays open for every account seen until shutdown.
#[derive(Default)]
struct Lanes {
    senders: HashMap<String, mpsc::UnboundedSender<ItemId>>,
    tasks: JoinSet<()>,
}

/// Runs publish calls for claimed items and records the outcome.
pub struct PublishDispatcher {
    store: Arc<dyn ItemStore>,
    publisher: Arc<dyn Publisher>,
    config: PublishConfig,
    permits: Arc<Semaphore>,
    lanes: Mutex<Lanes>,
    in_flight: DashSet<ItemId>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PublishDispatcher {
    /// Create a dispatcher. Lanes are spawned on first use.
    pub fn new(
        store: Arc<dyn ItemStore>,
        publisher: Arc<dyn Publisher>,
        config: PublishConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Arc::new(Self {
            store,
            publisher,
            config,
            permits,
            lanes: Mutex::new(Lanes::default()),
            in_flight: DashSet::new(),
            shutdown_rx,
        })
    }

    /// Queue a `Publishing` item on its account lane.
    ///
    /// Returns `false` if the item is already queued or being published.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn submit(self: &Arc<Self>, id: ItemId) -> Result<bool, StoreError> {
        if !self.in_flight.insert(id.clone()) {
            debug!("publish already in flight, ignoring duplicate submit");
            return Ok(false);
        }

        let account = match self.store.get(&id).await {
            Ok(item) => item.account,
            Err(e) => {
                self.in_flight.remove(&id);
                return Err(e);
            }
        };

        let mut lanes = self.lanes.lock().await;
        if !lanes.senders.contains_key(&account) {
            let (tx, rx) = mpsc::unbounded_channel();
            lanes
                .tasks
                .spawn(Arc::clone(self).run_lane(account.clone(), rx));
            lanes.senders.insert(account.clone(), tx);
            debug!(account = %account, "opened publish lane");
        }

        let sent = lanes
            .senders
            .get(&account)
            .is_some_and(|tx| tx.send(id.clone()).is_ok());
        drop(lanes);

        if !sent {
            self.in_flight.remove(&id);
            warn!(account = %account, "publish lane closed, dropping submit");
            return Ok(false);
        }

        Ok(true)
    }

    /// Number of items queued or publishing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait for every lane to stop. Call after signalling shutdown.
    pub async fn join(&self) {
        let mut tasks = {
            let mut lanes = self.lanes.lock().await;
            lanes.senders.clear();
            std::mem::take(&mut lanes.tasks)
        };
        while tasks.join_next().await.is_some() {}
    }

    async fn run_lane(self: Arc<Self>, account: String, mut rx: mpsc::UnboundedReceiver<ItemId>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        debug!(account = %account, "publish lane started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let id = tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
            };

            loop {
                let result = self.publish_item(&id).await;
                self.in_flight.remove(&id);

                if let Err(e) = result {
                    error!(
                        id = %id,
                        account = %account,
                        error = %e,
                        "publish failed with store error"
                    );
                    break;
                }
                // A retry can re-claim the item while an abandoned attempt winds down
                if self.reclaimed(&id).await && self.in_flight.insert(id.clone()) {
                    debug!(id = %id, "item re-claimed for publishing, running again");
                    continue;
                }
                break;
            }
        }

        debug!(account = %account, "publish lane stopped");
    }

    async fn reclaimed(&self, id: &ItemId) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }
        matches!(self.store.get(id).await, Ok(item) if item.state == ItemState::Publishing)
    }

    /// Publish one item, retrying until it succeeds, is rejected, or runs
    /// out of retries.
    #[tracing::instrument(skip(self), fields(id = %id))]
    async fn publish_item(&self, id: &ItemId) -> Result<(), StoreError> {
        let mut item = self.store.get(id).await?;
        if item.state != ItemState::Publishing {
            debug!(state = %item.state, "item is not publishing, dropping");
            return Ok(());
        }

        let token = IdempotencyToken::for_item(id);
        let policy = &self.config.retry;
        let mut backoff = policy.backoff();
        let mut retries = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            // Hold the slot before claiming so nothing can cancel between claim and call
            let Ok(permit) = self.permits.acquire().await else {
                return Ok(());
            };

            // Claim the attempt; losing means the item was cancelled under us
            let recorded = last_error.take();
            item = match self
                .store
                .compare_and_swap(
                    id,
                    item.version,
                    Box::new(move |i| {
                        i.attempt += 1;
                        if recorded.is_some() {
                            i.last_error = recorded;
                        }
                    }),
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) if e.is_conflict() => {
                    debug!("item changed during publish, abandoning");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let result = match tokio::time::timeout(
                self.config.call_timeout,
                self.publisher.publish(&item, &token),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PublishError::Transient(format!(
                    "publish timed out after {}ms",
                    self.config.call_timeout.as_millis()
                ))),
            };
            drop(permit);

            let (message, delay) = match result {
                Ok(receipt) => return self.record_published(&item, receipt).await,
                Err(PublishError::Permanent(message)) => {
                    return self
                        .record_failed(&item, FailureReason::PublishRejected, message)
                        .await;
                }
                Err(err) => {
                    let delay = match &err {
                        PublishError::RateLimited { retry_after } => {
                            // A throttle restarts the backoff sequence
                            backoff.reset();
                            (*retry_after).or_else(|| backoff.next_backoff())
                        }
                        _ => backoff.next_backoff(),
                    };
                    (err.to_string(), delay.unwrap_or(policy.max_delay))
                }
            };

            if retries >= policy.max_retries {
                return self
                    .record_failed(&item, FailureReason::PublishExhausted, message)
                    .await;
            }
            retries += 1;

            warn!(
                attempt = item.attempt,
                retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "publish attempt failed, retrying"
            );
            last_error = Some(message);

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    // Left in Publishing; recovery resubmits it on restart
                    info!("shutdown during publish backoff");
                    return Ok(());
                }
            }
        }
    }

    async fn record_published(
        &self,
        item: &ContentItem,
        receipt: PublishReceipt,
    ) -> Result<(), StoreError> {
        let post_id = receipt.post_id.clone();
        match self
            .store
            .compare_and_swap(
                &item.id,
                item.version,
                Box::new(move |i| {
                    i.state = ItemState::Published;
                    i.post_id = Some(receipt.post_id);
                    i.published_at = Some(Utc::now());
                    i.last_error = None;
                    i.failure = None;
                }),
            )
            .await
        {
            Ok(published) => {
                info!(
                    post_id = %post_id,
                    attempt = published.attempt,
                    "item published"
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(
                    post_id = %post_id,
                    "item left publishing during the call, discarding result"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn record_failed(
        &self,
        item: &ContentItem,
        reason: FailureReason,
        message: String,
    ) -> Result<(), StoreError> {
        let logged = message.clone();
        match self
            .store
            .compare_and_swap(
                &item.id,
                item.version,
                Box::new(move |i| {
                    i.state = ItemState::Failed;
                    i.failure = Some(reason);
                    i.last_error = Some(message);
                }),
            )
            .await
        {
            Ok(failed) => {
                error!(
                    reason = ?reason,
                    attempt = failed.attempt,
                    error = %logged,
                    "publish failed"
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("item changed before failure could be recorded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
