//! Publish scheduler.
//!
//! Keeps a min-heap of known due times and a single timer armed for the
//! earliest one. Newly scheduled items arrive over a channel and interrupt
//! the timer, so an earlier deadline re-arms it at once. The store is also
//! polled every tick to pick up items the heap never heard about.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use crate::{
    ContentItem, ItemId, ItemState, ItemStore, PublishDispatcher, SchedulerConfig, StoreError,
};

/// Lower bound on the polling tick.
const MIN_TICK: Duration = Duration::from_millis(10);

type Due = Reverse<(DateTime<Utc>, ItemId)>;

/// The scheduling loop. Owned by the task running [`PublishScheduler::run`].
pub struct PublishScheduler {
    store: Arc<dyn ItemStore>,
    publish: Arc<PublishDispatcher>,
    config: SchedulerConfig,
    track_rx: mpsc::UnboundedReceiver<(DateTime<Utc>, ItemId)>,
    pending: BinaryHeap<Due>,
}

/// Cheap handle for feeding the scheduler and routing ready items.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn ItemStore>,
    publish: Arc<PublishDispatcher>,
    track_tx: mpsc::UnboundedSender<(DateTime<Utc>, ItemId)>,
}

impl PublishScheduler {
    /// Create the scheduler and a handle to it.
    pub fn new(
        store: Arc<dyn ItemStore>,
        publish: Arc<PublishDispatcher>,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (track_tx, track_rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            store: Arc::clone(&store),
            publish: Arc::clone(&publish),
            track_tx,
        };
        let scheduler = Self {
            store,
            publish,
            config,
            track_rx,
            pending: BinaryHeap::new(),
        };
        (scheduler, handle)
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let tick = self.config.tick_interval.max(MIN_TICK);
        info!(tick_ms = tick.as_millis() as u64, "publish scheduler starting");

        let mut next_poll = Instant::now();
        let mut tracking = true;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let poll = Instant::now() >= next_poll;
            if poll {
                next_poll = Instant::now() + tick;
            }
            self.fire_due(poll).await;

            let wake = self.next_wake(next_poll);
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                tracked = self.track_rx.recv(), if tracking => match tracked {
                    Some(due) => {
                        self.push(due);
                        while let Ok(due) = self.track_rx.try_recv() {
                            self.push(due);
                        }
                    }
                    None => {
                        // Every handle is gone; polling still covers the store
                        debug!("scheduler handles dropped, polling only");
                        tracking = false;
                    }
                },
                _ = sleep_until(wake) => {}
            }
        }

        info!(pending = self.pending.len(), "publish scheduler shut down");
    }

    fn push(&mut self, (at, id): (DateTime<Utc>, ItemId)) {
        debug!(id = %id, scheduled_at = %at, "tracking scheduled item");
        self.pending.push(Reverse((at, id)));
    }

    /// The earlier of the next poll and the earliest known due time.
    fn next_wake(&self, next_poll: Instant) -> Instant {
        match self.pending.peek() {
            Some(Reverse((at, _))) => {
                let until = (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                next_poll.min(Instant::now() + until)
            }
            None => next_poll,
        }
    }

    /// Claim every item whose time has come.
    async fn fire_due(&mut self, poll: bool) {
        let now = Utc::now();
        let mut due = Vec::new();

        while self
            .pending
            .peek()
            .is_some_and(|Reverse((at, _))| *at <= now)
        {
            if let Some(Reverse((_, id))) = self.pending.pop() {
                due.push(id);
            }
        }

        if poll {
            match self.store.query_due_for_publish(now).await {
                Ok(ids) => due.extend(ids),
                Err(e) => warn!(error = %e, "failed to query due items"),
            }
        }

        let mut seen = HashSet::new();
        due.retain(|id| seen.insert(id.clone()));

        for id in due {
            self.claim(id).await;
        }
    }

    /// Move one due item from `Scheduled` to `Publishing` and submit it.
    async fn claim(&mut self, id: ItemId) {
        let item = match self.store.get(&id).await {
            Ok(item) => item,
            Err(e) => {
                warn!(id = %id, error = %e, "scheduled item vanished");
                return;
            }
        };

        if item.state != ItemState::Scheduled {
            debug!(id = %id, state = %item.state, "item no longer scheduled, dropping");
            return;
        }

        let now = Utc::now();
        if !item.is_due(now) {
            // Woke a little early; try again at the real due time
            if let Some(at) = item.scheduled_at {
                self.pending.push(Reverse((at, id)));
            }
            return;
        }

        let claimed = self
            .store
            .compare_and_swap(
                &id,
                item.version,
                Box::new(|i| {
                    i.state = ItemState::Publishing;
                    i.last_error = None;
                }),
            )
            .await;

        match claimed {
            Ok(claimed) => {
                let late_ms = claimed
                    .scheduled_at
                    .map(|at| (now - at).num_milliseconds())
                    .unwrap_or(0);
                info!(id = %id, late_ms, "claimed due item for publishing");
                if let Err(e) = self.publish.submit(id.clone()).await {
                    error!(id = %id, error = %e, "failed to submit claimed item");
                }
            }
            Err(e) if e.is_conflict() => {
                debug!(id = %id, "due item claimed elsewhere, dropping");
            }
            Err(e) => {
                error!(id = %id, error = %e, "failed to claim due item");
            }
        }
    }
}

impl SchedulerHandle {
    /// Make sure the scheduler wakes for `id` at `at`.
    pub fn track(&self, id: ItemId, at: DateTime<Utc>) {
        if self.track_tx.send((at, id)).is_err() {
            debug!("scheduler stopped, relying on store polling");
        }
    }

    /// Route a `Ready` item: schedule it if it has a publish time,
    /// otherwise claim it for publishing straight away.
    ///
    /// Returns the written item, or `None` if it was not `Ready` or
    /// someone else moved it first.
    #[tracing::instrument(skip(self, item), fields(id = %item.id))]
    pub async fn admit(&self, item: ContentItem) -> Result<Option<ContentItem>, StoreError> {
        if item.state != ItemState::Ready {
            return Ok(None);
        }

        let target = if item.scheduled_at.is_some() {
            ItemState::Scheduled
        } else {
            ItemState::Publishing
        };

        let written = match self
            .store
            .compare_and_swap(
                &item.id,
                item.version,
                Box::new(move |i| {
                    i.state = target;
                    i.last_error = None;
                }),
            )
            .await
        {
            Ok(written) => written,
            Err(e) if e.is_conflict() => {
                debug!("ready item moved before admission");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match (target, written.scheduled_at) {
            (ItemState::Scheduled, Some(at)) => {
                info!(scheduled_at = %at, "item scheduled");
                self.track(written.id.clone(), at);
            }
            _ => {
                info!("item publishing immediately");
                self.publish.submit(written.id.clone()).await?;
            }
        }

        Ok(Some(written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        IdempotencyToken, MediaRef, MemoryStore, PublishConfig, PublishError, PublishReceipt,
        Publisher,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        calls: Mutex<Vec<(ItemId, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            item: &ContentItem,
            _token: &IdempotencyToken,
        ) -> Result<PublishReceipt, PublishError> {
            self.calls.lock().unwrap().push((item.id.clone(), Utc::now()));
            Ok(PublishReceipt {
                post_id: format!("post-{}", item.id),
            })
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        publisher: Arc<RecordingPublisher>,
        handle: SchedulerHandle,
        shutdown_tx: watch::Sender<bool>,
    }

    fn start(tick: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = PublishDispatcher::new(
            store.clone(),
            publisher.clone(),
            PublishConfig::default(),
            shutdown_rx.clone(),
        );
        let (scheduler, handle) = PublishScheduler::new(
            store.clone(),
            dispatcher,
            SchedulerConfig {
                tick_interval: tick,
            },
        );
        tokio::spawn(scheduler.run(shutdown_rx));

        Harness {
            store,
            publisher,
            handle,
            shutdown_tx,
        }
    }

    async fn ready_item(store: &MemoryStore, at: Option<DateTime<Utc>>) -> ContentItem {
        let mut item = ContentItem::uploaded(ItemId::generate(), "acct", MediaRef::from("m"));
        item.caption = "hello".to_string();
        item.scheduled_at = at;
        store.put(item.clone()).await.unwrap();
        store
            .compare_and_swap(&item.id, 0, Box::new(|i| i.state = ItemState::Ready))
            .await
            .unwrap()
    }

    async fn wait_for(
        store: &MemoryStore,
        id: &ItemId,
        state: ItemState,
        within: Duration,
    ) -> ContentItem {
        let deadline = Instant::now() + within;
        loop {
            let item = store.get(id).await.unwrap();
            if item.state == state {
                return item;
            }
            assert!(
                Instant::now() < deadline,
                "item stuck in {} waiting for {}",
                item.state,
                state
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_admit_without_time_publishes_immediately() {
        let h = start(Duration::from_secs(60));
        let item = ready_item(&h.store, None).await;

        let written = h.handle.admit(item.clone()).await.unwrap().unwrap();
        assert_eq!(written.state, ItemState::Publishing);

        let done = wait_for(&h.store, &item.id, ItemState::Published, Duration::from_secs(2)).await;
        assert_eq!(done.post_id, Some(format!("post-{}", item.id)));
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_admit_ignores_non_ready_and_stale() {
        let h = start(Duration::from_secs(60));
        let item = ready_item(&h.store, None).await;

        // Stale version
        let mut stale = item.clone();
        stale.version = 0;
        assert!(h.handle.admit(stale).await.unwrap().is_none());

        let mut draft = item.clone();
        draft.state = ItemState::Draft;
        assert!(h.handle.admit(draft).await.unwrap().is_none());

        assert_eq!(h.store.get(&item.id).await.unwrap().state, ItemState::Ready);
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_item_not_published_early() {
        let h = start(Duration::from_millis(20));
        let at = Utc::now() + chrono::Duration::milliseconds(300);
        let item = ready_item(&h.store, Some(at)).await;

        let written = h.handle.admit(item.clone()).await.unwrap().unwrap();
        assert_eq!(written.state, ItemState::Scheduled);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.get(&item.id).await.unwrap().state, ItemState::Scheduled);

        wait_for(&h.store, &item.id, ItemState::Published, Duration::from_secs(2)).await;
        let calls = h.publisher.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1 >= at, "published before its time");
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_earlier_item_wakes_scheduler_before_tick() {
        // The tick alone would never fire within the test
        let h = start(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let at = Utc::now() + chrono::Duration::milliseconds(100);
        let item = ready_item(&h.store, Some(at)).await;
        h.handle.admit(item.clone()).await.unwrap();

        wait_for(&h.store, &item.id, ItemState::Published, Duration::from_secs(2)).await;
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_polling_finds_untracked_items() {
        let h = start(Duration::from_millis(20));

        // Scheduled directly in the store, never announced to the scheduler
        let mut item = ContentItem::uploaded(ItemId::generate(), "acct", MediaRef::from("m"));
        item.state = ItemState::Scheduled;
        item.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(5));
        h.store.put(item.clone()).await.unwrap();

        wait_for(&h.store, &item.id, ItemState::Published, Duration::from_secs(2)).await;
        h.shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_item_is_not_claimed() {
        let h = start(Duration::from_millis(20));
        let at = Utc::now() + chrono::Duration::milliseconds(100);
        let item = ready_item(&h.store, Some(at)).await;
        let scheduled = h.handle.admit(item.clone()).await.unwrap().unwrap();

        h.store
            .compare_and_swap(
                &item.id,
                scheduled.version,
                Box::new(|i| i.state = ItemState::Failed),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.store.get(&item.id).await.unwrap().state, ItemState::Failed);
        assert!(h.publisher.calls.lock().unwrap().is_empty());
        h.shutdown_tx.send(true).unwrap();
    }
}
