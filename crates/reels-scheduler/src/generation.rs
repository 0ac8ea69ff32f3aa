//! Generation dispatcher.
//!
//! A fixed pool of workers drains a bounded queue of item ids. A worker
//! claims a `Draft` by moving it into its generating state, calls the
//! backend with retries, and writes the result back only if the item is
//! still at the version it claimed.

use std::sync::Arc;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use dashmap::DashSet;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    BackendError, ContentItem, FailureReason, GenerationConfig, ItemId, ItemState, ItemStore,
    MediaRef, SchedulerHandle, StoreError,
};

/// What the backend gets to work from when writing a caption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionContext {
    pub prompt: Option<String>,
    pub media_ref: Option<MediaRef>,
    /// Caption the user already typed, possibly empty.
    pub caption: String,
    pub hashtags: Vec<String>,
}

impl CaptionContext {
    fn for_item(item: &ContentItem) -> Self {
        Self {
            prompt: item.generation_prompt.clone(),
            media_ref: item.media_ref.clone(),
            caption: item.caption.clone(),
            hashtags: item.hashtags.clone(),
        }
    }
}

/// Caption and hashtags produced by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCaption {
    pub caption: String,
    pub hashtags: Vec<String>,
}

/// AI caption and video generation capability.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate_caption(
        &self,
        context: &CaptionContext,
    ) -> Result<GeneratedCaption, BackendError>;

    async fn generate_media(&self, prompt: &str) -> Result<MediaRef, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Media,
    Caption,
}

enum Output {
    Media(MediaRef),
    Caption(GeneratedCaption),
}

/// Bounded worker pool turning drafts into ready items.
pub struct GenerationDispatcher {
    store: Arc<dyn ItemStore>,
    backend: Arc<dyn GenerationBackend>,
    scheduler: SchedulerHandle,
    config: GenerationConfig,
    queue_tx: mpsc::Sender<ItemId>,
    in_flight: DashSet<ItemId>,
    workers: Mutex<JoinSet<()>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GenerationDispatcher {
    /// Create the dispatcher and spawn its workers.
    pub fn start(
        store: Arc<dyn ItemStore>,
        backend: Arc<dyn GenerationBackend>,
        scheduler: SchedulerHandle,
        config: GenerationConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let worker_count = config.workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let dispatcher = Arc::new(Self {
            store,
            backend,
            scheduler,
            config,
            queue_tx,
            in_flight: DashSet::new(),
            workers: Mutex::new(JoinSet::new()),
            shutdown_rx,
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(Arc::clone(&dispatcher).worker(worker_id, Arc::clone(&queue_rx)));
        }
        // Nothing else can hold the lock yet
        if let Ok(mut slot) = dispatcher.workers.try_lock() {
            *slot = workers;
        }

        info!(workers = worker_count, "generation dispatcher started");
        dispatcher
    }

    /// Queue an item for generation.
    ///
    /// Idempotent: returns `false` without queueing if the item is already
    /// queued or being worked on. Waits for room when the queue is full.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn enqueue(&self, id: ItemId) -> bool {
        if !self.in_flight.insert(id.clone()) {
            debug!("generation already in flight, ignoring duplicate enqueue");
            return false;
        }

        if self.queue_tx.send(id.clone()).await.is_err() {
            self.in_flight.remove(&id);
            warn!("generation queue closed, dropping enqueue");
            return false;
        }

        true
    }

    /// Number of items queued or generating.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait for every worker to stop. Call after signalling shutdown.
    pub async fn join(&self) {
        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        while workers.join_next().await.is_some() {}
    }

    async fn worker(self: Arc<Self>, worker_id: usize, queue: Arc<Mutex<mpsc::Receiver<ItemId>>>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        debug!(worker_id, "generation worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let id = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    id = rx.recv() => id,
                }
            };

            let Some(id) = id else {
                break;
            };

            loop {
                let result = self.process(&id).await;
                self.in_flight.remove(&id);

                if let Err(e) = result {
                    error!(worker_id, id = %id, error = %e, "generation failed with store error");
                    break;
                }
                // A retry can re-queue the item while an abandoned call winds down
                if self.reclaimed(&id).await && self.in_flight.insert(id.clone()) {
                    debug!(worker_id, id = %id, "item needs generation again, running again");
                    continue;
                }
                break;
            }
        }

        debug!(worker_id, "generation worker stopped");
    }

    async fn reclaimed(&self, id: &ItemId) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }
        match self.store.get(id).await {
            Ok(item) => {
                item.state.is_generating()
                    || (item.state == ItemState::Draft && item.generation_target().is_some())
            }
            Err(_) => false,
        }
    }

    /// Take one item from its current state to `Ready`, or to `Failed`.
    #[tracing::instrument(skip(self), fields(id = %id))]
    async fn process(&self, id: &ItemId) -> Result<(), StoreError> {
        let item = self.store.get(id).await?;

        let mut item = match item.state {
            ItemState::Draft => {
                let Some(target) = item.generation_target() else {
                    debug!("draft needs no generation, dropping");
                    return Ok(());
                };
                match self
                    .store
                    .compare_and_swap(id, item.version, Box::new(move |i| i.state = target))
                    .await
                {
                    Ok(claimed) => {
                        info!(state = %target, "claimed draft for generation");
                        claimed
                    }
                    Err(e) if e.is_conflict() => {
                        debug!("draft claimed elsewhere, dropping");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            // Claim left over from before a restart
            state if state.is_generating() => {
                info!(%state, "resuming interrupted generation");
                item
            }
            state => {
                debug!(%state, "item is not awaiting generation, dropping");
                return Ok(());
            }
        };

        if item.media_ref.is_none() {
            let Some((attempted, Output::Media(media))) = self.run_step(item, Step::Media).await?
            else {
                return Ok(());
            };
            info!(media = %media, "media generated");

            let finished = !attempted.needs_caption();
            let Some(written) = self
                .write_result(
                    &attempted,
                    Box::new(move |i| {
                        i.media_ref = Some(media);
                        i.last_error = None;
                        if finished {
                            i.state = ItemState::Ready;
                        }
                    }),
                )
                .await?
            else {
                return Ok(());
            };
            item = written;
        }

        if item.state != ItemState::Ready && item.needs_caption() {
            let Some((attempted, Output::Caption(generated))) =
                self.run_step(item, Step::Caption).await?
            else {
                return Ok(());
            };
            debug!(hashtags = generated.hashtags.len(), "caption generated");

            let Some(written) = self
                .write_result(
                    &attempted,
                    Box::new(move |i| {
                        i.caption = generated.caption;
                        i.hashtags = generated.hashtags;
                        i.request_caption = false;
                        i.last_error = None;
                        i.state = ItemState::Ready;
                    }),
                )
                .await?
            else {
                return Ok(());
            };
            item = written;
        }

        if item.state != ItemState::Ready {
            // Resumed with everything already in place
            let Some(written) = self
                .write_result(&item, Box::new(|i| i.state = ItemState::Ready))
                .await?
            else {
                return Ok(());
            };
            item = written;
        }

        info!(gen_attempt = item.gen_attempt, "item ready");
        self.scheduler.admit(item).await?;
        Ok(())
    }

    /// Call the backend for one step until it succeeds or the item fails.
    ///
    /// Returns `None` when the item failed or moved on without us; the
    /// returned item is the version the successful attempt was claimed at.
    async fn run_step(
        &self,
        mut item: ContentItem,
        step: Step,
    ) -> Result<Option<(ContentItem, Output)>, StoreError> {
        let policy = &self.config.retry;
        let mut backoff = policy.backoff();
        let mut retries = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            let recorded = last_error.take();
            item = match self
                .store
                .compare_and_swap(
                    &item.id,
                    item.version,
                    Box::new(move |i| {
                        i.gen_attempt += 1;
                        if recorded.is_some() {
                            i.last_error = recorded;
                        }
                    }),
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) if e.is_conflict() => {
                    debug!(?step, "item changed during generation, abandoning");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            let message = match self.call(&item, step).await {
                Ok(output) => return Ok(Some((item, output))),
                Err(BackendError::Permanent(message)) => {
                    self.record_failed(&item, FailureReason::GenerationRejected, message)
                        .await?;
                    return Ok(None);
                }
                Err(err @ BackendError::Transient(_)) => err.to_string(),
            };

            if retries >= policy.max_retries {
                self.record_failed(&item, FailureReason::GenerationExhausted, message)
                    .await?;
                return Ok(None);
            }
            retries += 1;

            let delay = backoff.next_backoff().unwrap_or(policy.max_delay);
            warn!(
                ?step,
                gen_attempt = item.gen_attempt,
                retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "generation attempt failed, retrying"
            );
            last_error = Some(message);

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!("shutdown during generation backoff");
                    return Ok(None);
                }
            }
        }
    }

    /// One backend call under the per-call timeout.
    async fn call(&self, item: &ContentItem, step: Step) -> Result<Output, BackendError> {
        let call = async {
            match step {
                Step::Media => {
                    let prompt = item.generation_prompt.as_deref().unwrap_or_default();
                    self.backend.generate_media(prompt).await.map(Output::Media)
                }
                Step::Caption => {
                    let context = CaptionContext::for_item(item);
                    self.backend
                        .generate_caption(&context)
                        .await
                        .map(Output::Caption)
                }
            }
        };

        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Transient(format!(
                "generation timed out after {}ms",
                self.config.call_timeout.as_millis()
            ))),
        }
    }

    /// Write a backend result if the item is still where the call left it.
    async fn write_result(
        &self,
        item: &ContentItem,
        mutator: crate::Mutator<'static>,
    ) -> Result<Option<ContentItem>, StoreError> {
        match self
            .store
            .compare_and_swap(&item.id, item.version, mutator)
            .await
        {
            Ok(written) => Ok(Some(written)),
            Err(e) if e.is_conflict() => {
                debug!("item left its generating state, discarding result");
                Ok(None)
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
        let written = self
            .write_result(
                item,
                Box::new(move |i| {
                    i.state = ItemState::Failed;
                    i.failure = Some(reason);
                    i.last_error = Some(message);
                }),
            )
            .await?;

        if let Some(failed) = written {
            error!(
                reason = ?reason,
                gen_attempt = failed.gen_attempt,
                error = %logged,
                "generation failed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_context_from_item() {
        let mut item = ContentItem::from_prompt(ItemId::generate(), "acct", "neon city at night");
        item.media_ref = Some(MediaRef::from("generated://1"));
        item.hashtags = vec!["city".to_string()];

        let context = CaptionContext::for_item(&item);
        assert_eq!(context.prompt.as_deref(), Some("neon city at night"));
        assert_eq!(context.media_ref, Some(MediaRef::from("generated://1")));
        assert!(context.caption.is_empty());
        assert_eq!(context.hashtags, vec!["city"]);
    }
}
