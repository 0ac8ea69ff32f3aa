//! Orchestrator facade.
//!
//! The only entry point for the UI/API layer. It turns intake requests into
//! drafts, routes them to the generation pool or straight to the publish
//! path, and exposes query, cancel, edit and retry operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    ContentItem, DEFAULT_ACCOUNT, FailureReason, GenerationBackend, GenerationDispatcher,
    ItemEvent, ItemId, ItemState, ItemStore, MediaRef, OrchestratorConfig, OrchestratorError,
    PublishDispatcher, PublishScheduler, Publisher, SchedulerHandle, normalize_hashtags,
};

/// Where an item's media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// Media the user already uploaded.
    Upload(MediaRef),
    /// Media to generate from a text prompt.
    Prompt(String),
}

/// A request to add one item.
#[derive(Debug, Clone, PartialEq)]
pub struct IntakeRequest {
    pub source: MediaSource,
    pub account: Option<String>,
    pub caption: Option<String>,
    pub hashtags: Vec<String>,
    pub request_caption: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl IntakeRequest {
    /// Request for uploaded media.
    pub fn upload(media_ref: MediaRef) -> Self {
        Self::new(MediaSource::Upload(media_ref))
    }

    /// Request for media generated from `prompt`.
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self::new(MediaSource::Prompt(prompt.into()))
    }

    fn new(source: MediaSource) -> Self {
        Self {
            source,
            account: None,
            caption: None,
            hashtags: Vec::new(),
            request_caption: false,
            scheduled_at: None,
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_hashtags<I, S>(mut self, hashtags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hashtags = hashtags.into_iter().map(Into::into).collect();
        self
    }

    /// Ask the backend to write the caption and hashtags.
    pub fn with_generated_caption(mut self) -> Self {
        self.request_caption = true;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Build the draft this request describes.
    pub(crate) fn into_item(
        self,
        id: ItemId,
        default_caption: &str,
    ) -> Result<ContentItem, OrchestratorError> {
        let account = match self.account {
            Some(account) if account.trim().is_empty() => {
                return Err(OrchestratorError::InvalidRequest(
                    "account must not be blank".to_string(),
                ));
            }
            Some(account) => account.trim().to_string(),
            None => DEFAULT_ACCOUNT.to_string(),
        };

        let caption = self
            .caption
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        let mut item = match self.source {
            MediaSource::Upload(media_ref) => {
                if media_ref.0.trim().is_empty() {
                    return Err(OrchestratorError::InvalidRequest(
                        "media reference must not be empty".to_string(),
                    ));
                }
                let mut item = ContentItem::uploaded(id, account, media_ref);
                if caption.is_none() && !self.request_caption {
                    item.caption = default_caption.to_string();
                }
                item
            }
            // Blank prompts are left for the backend to reject
            MediaSource::Prompt(prompt) => ContentItem::from_prompt(id, account, prompt),
        };

        if let Some(caption) = caption {
            item.caption = caption;
        }
        item.hashtags = normalize_hashtags(&self.hashtags);
        item.request_caption = self.request_caption;
        item.scheduled_at = self.scheduled_at;
        Ok(item)
    }
}

/// Wires the store, dispatchers and scheduler together.
pub struct Orchestrator {
    store: Arc<dyn ItemStore>,
    generation: Arc<GenerationDispatcher>,
    publish: Arc<PublishDispatcher>,
    scheduler: SchedulerHandle,
    default_caption: String,
    shutdown_tx: watch::Sender<bool>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Start every background task. Must be called inside a tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        store: Arc<dyn ItemStore>,
        backend: Arc<dyn GenerationBackend>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let publish = PublishDispatcher::new(
            Arc::clone(&store),
            publisher,
            config.publish,
            shutdown_rx.clone(),
        );
        let (scheduler, handle) =
            PublishScheduler::new(Arc::clone(&store), Arc::clone(&publish), config.scheduler);
        let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
        let generation = GenerationDispatcher::start(
            Arc::clone(&store),
            backend,
            handle.clone(),
            config.generation,
            shutdown_rx,
        );

        info!("orchestrator started");
        Self {
            store,
            generation,
            publish,
            scheduler: handle,
            default_caption: config.default_caption,
            shutdown_tx,
            scheduler_task: Mutex::new(Some(scheduler_task)),
        }
    }

    /// Accept a new item and start it down its lifecycle.
    #[tracing::instrument(skip(self, request))]
    pub async fn intake(&self, request: IntakeRequest) -> Result<ItemId, OrchestratorError> {
        let item = request.into_item(ItemId::generate(), &self.default_caption)?;
        let id = item.id.clone();

        self.store.put(item.clone()).await?;
        info!(
            id = %id,
            account = %item.account,
            prompt = item.generation_prompt.is_some(),
            scheduled_at = ?item.scheduled_at,
            "item accepted"
        );

        self.route_draft(item).await?;
        Ok(id)
    }

    /// Snapshot of one item.
    pub async fn get(&self, id: &ItemId) -> Result<ContentItem, OrchestratorError> {
        Ok(self.store.get(id).await?)
    }

    /// Snapshots of every item, oldest first, optionally in one state.
    pub async fn list_queue(
        &self,
        state: Option<ItemState>,
    ) -> Result<Vec<ContentItem>, OrchestratorError> {
        Ok(self.store.list(state).await?)
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.store.subscribe()
    }

    /// Move a non-terminal item to `Failed` with reason `Cancelled`.
    ///
    /// Work already in flight for the item finds its claim gone and
    /// discards its result.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn cancel(&self, id: &ItemId) -> Result<ContentItem, OrchestratorError> {
        loop {
            let item = self.store.get(id).await?;
            if item.state.is_terminal() {
                return Err(OrchestratorError::AlreadyTerminal {
                    id: id.clone(),
                    state: item.state,
                });
            }

            let cancelled = self
                .store
                .compare_and_swap(
                    id,
                    item.version,
                    Box::new(|i| {
                        i.state = ItemState::Failed;
                        i.failure = Some(FailureReason::Cancelled);
                        i.last_error = Some("cancelled".to_string());
                    }),
                )
                .await;

            match cancelled {
                Ok(written) => {
                    info!(from = %item.state, "item cancelled");
                    return Ok(written);
                }
                Err(e) if e.is_conflict() => debug!("item moved during cancel, retrying"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a failed item back through the pipeline.
    ///
    /// Resets both attempt counters and the failure reason, then routes the
    /// draft exactly like a fresh intake.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn retry_failed(&self, id: &ItemId) -> Result<ContentItem, OrchestratorError> {
        let draft = loop {
            let item = self.store.get(id).await?;
            if item.state != ItemState::Failed {
                return Err(OrchestratorError::NotFailed {
                    id: id.clone(),
                    state: item.state,
                });
            }

            let reset = self
                .store
                .compare_and_swap(
                    id,
                    item.version,
                    Box::new(|i| {
                        i.state = ItemState::Draft;
                        i.attempt = 0;
                        i.gen_attempt = 0;
                        i.failure = None;
                    }),
                )
                .await;

            match reset {
                Ok(written) => break written,
                Err(e) if e.is_conflict() => debug!("item moved during retry, retrying"),
                Err(e) => return Err(e.into()),
            }
        };

        info!(last_error = ?draft.last_error, "retrying failed item");
        self.route_draft(draft.clone()).await?;
        Ok(draft)
    }

    /// Replace the caption and/or hashtags of a scheduled item.
    #[tracing::instrument(skip(self, caption, hashtags), fields(id = %id))]
    pub async fn edit(
        &self,
        id: &ItemId,
        caption: Option<String>,
        hashtags: Option<Vec<String>>,
    ) -> Result<ContentItem, OrchestratorError> {
        let hashtags = hashtags.map(normalize_hashtags);

        loop {
            let item = self.store.get(id).await?;
            if item.state.is_terminal() {
                return Err(OrchestratorError::AlreadyTerminal {
                    id: id.clone(),
                    state: item.state,
                });
            }
            if item.state != ItemState::Scheduled {
                return Err(OrchestratorError::NotEditable {
                    id: id.clone(),
                    state: item.state,
                });
            }

            let caption = caption.clone();
            let hashtags = hashtags.clone();
            let edited = self
                .store
                .compare_and_swap(
                    id,
                    item.version,
                    Box::new(move |i| {
                        if let Some(caption) = caption {
                            i.caption = caption;
                        }
                        if let Some(hashtags) = hashtags {
                            i.hashtags = hashtags;
                        }
                    }),
                )
                .await;

            match edited {
                Ok(written) => {
                    info!("item edited");
                    return Ok(written);
                }
                Err(e) if e.is_conflict() => debug!("item moved during edit, retrying"),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pick up every non-terminal item left over from a previous run.
    ///
    /// Returns how many items were resumed.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let items = self.store.list(None).await?;
        let mut resumed = 0;

        for item in items.into_iter().filter(|i| !i.state.is_terminal()) {
            resumed += 1;
            debug!(id = %item.id, state = %item.state, "resuming item");

            match item.state {
                ItemState::Draft => self.route_draft(item).await?,
                ItemState::GeneratingCaption | ItemState::GeneratingMedia => {
                    self.generation.enqueue(item.id).await;
                }
                ItemState::Ready => {
                    self.scheduler.admit(item).await?;
                }
                ItemState::Scheduled => match item.scheduled_at {
                    Some(at) => self.scheduler.track(item.id, at),
                    None => warn!(id = %item.id, "scheduled item has no publish time"),
                },
                ItemState::Publishing => {
                    // Safe to repeat: the idempotency token is stable per item
                    self.publish.submit(item.id).await?;
                }
                ItemState::Published | ItemState::Failed => {}
            }
        }

        info!(resumed, "recovery complete");
        Ok(resumed)
    }

    /// Stop all background work and wait for it to finish.
    ///
    /// Items mid-flight keep their state and are picked up by
    /// [`Orchestrator::recover`] on the next start.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        let _ = self.shutdown_tx.send(true);

        self.generation.join().await;
        if let Some(task) = self.scheduler_task.lock().await.take() {
            let _ = task.await;
        }
        self.publish.join().await;

        info!("orchestrator shut down gracefully");
    }

    /// Send a draft to generation, or straight on to the publish path.
    async fn route_draft(&self, item: ContentItem) -> Result<(), OrchestratorError> {
        if item.generation_target().is_some() {
            self.generation.enqueue(item.id).await;
            return Ok(());
        }

        let ready = self
            .store
            .compare_and_swap(
                &item.id,
                item.version,
                Box::new(|i| {
                    i.state = ItemState::Ready;
                    i.last_error = None;
                }),
            )
            .await;

        match ready {
            Ok(ready) => {
                self.scheduler.admit(ready).await?;
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!(id = %item.id, "draft moved before routing");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
