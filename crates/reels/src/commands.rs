//! One-shot commands that work on the item store directly.
//!
//! `post` and `retry` run an in-process orchestrator until their item is
//! scheduled or settled. Scheduled items are published by the daemon, so
//! these commands must not run while a daemon holds the same store.

use std::path::Path;

use chrono::{DateTime, Utc};
use miette::Result;
use tokio::sync::broadcast;
use tracing::info;

use reels_scheduler::{
    ContentItem, IntakeRequest, ItemEvent, ItemId, ItemState, ItemStore, MediaRef, Orchestrator,
    parse_hashtags,
};

use crate::Tuning;
use crate::daemon::{open_store, start_orchestrator};

/// Arguments of the `post` command.
pub struct PostArgs {
    pub media: Option<String>,
    pub prompt: Option<String>,
    pub caption: Option<String>,
    pub hashtags: Option<String>,
    pub generate_caption: bool,
    pub account: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl PostArgs {
    fn into_request(self) -> Result<IntakeRequest> {
        let mut request = match (self.media, self.prompt) {
            (Some(media), _) => IntakeRequest::upload(MediaRef(media)),
            (None, Some(prompt)) => IntakeRequest::prompt(prompt),
            (None, None) => {
                return Err(miette::miette!("either --media or --prompt is required"));
            }
        };

        if let Some(account) = self.account {
            request = request.with_account(account);
        }
        if let Some(caption) = self.caption {
            request = request.with_caption(caption);
        }
        if let Some(hashtags) = self.hashtags {
            request = request.with_hashtags(parse_hashtags(&hashtags));
        }
        if self.generate_caption {
            request = request.with_generated_caption();
        }
        if let Some(at) = self.scheduled_at {
            request = request.scheduled_at(at);
        }
        Ok(request)
    }
}

/// Add one item and follow it until it is scheduled or settled.
pub async fn post(store_path: &Path, tuning: &Tuning, args: PostArgs) -> Result<()> {
    let request = args.into_request()?;
    let store = open_store(store_path).await?;
    let orchestrator = start_orchestrator(store, tuning.to_config(), tuning.demo_latency());

    let events = orchestrator.subscribe();
    let outcome = match orchestrator.intake(request).await {
        Ok(id) => {
            info!(id = %id, "item accepted");
            wait_until_settled(&orchestrator, &id, events).await
        }
        Err(e) => Err(miette::miette!("{}", e)),
    };

    orchestrator.shutdown().await;
    print_item(&outcome?)
}

/// Print stored items as a table or as JSON.
pub async fn list(store_path: &Path, state: Option<ItemState>, json: bool) -> Result<()> {
    let store = open_store(store_path).await?;
    let items = store
        .list(state)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if json {
        let out = serde_json::to_string_pretty(&items).map_err(|e| miette::miette!("{}", e))?;
        println!("{}", out);
        return Ok(());
    }

    if items.is_empty() {
        println!("No items.");
        return Ok(());
    }

    println!(
        "{:<13}  {:<18}  {:<12}  {:<20}  CAPTION",
        "ID", "STATE", "ACCOUNT", "SCHEDULED"
    );
    for item in &items {
        let when = item
            .scheduled_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "now".to_string());
        println!(
            "{:<13}  {:<18}  {:<12}  {:<20}  {}",
            item.id.as_str(),
            item.state.as_str(),
            item.account,
            when,
            summarize(&item.caption, 40)
        );
    }
    Ok(())
}

/// Cancel a pending item.
pub async fn cancel(store_path: &Path, id: &str) -> Result<()> {
    let store = open_store(store_path).await?;
    let orchestrator = start_orchestrator(store, Default::default(), Default::default());

    let result = orchestrator.cancel(&ItemId::from(id)).await;
    orchestrator.shutdown().await;

    let item = result.map_err(|e| miette::miette!("{}", e))?;
    print_item(&item)
}

/// Replace the caption and/or hashtags of a scheduled item.
pub async fn edit(
    store_path: &Path,
    id: &str,
    caption: Option<String>,
    hashtags: Option<String>,
) -> Result<()> {
    if caption.is_none() && hashtags.is_none() {
        return Err(miette::miette!("nothing to edit: pass --caption and/or --hashtags"));
    }

    let store = open_store(store_path).await?;
    let orchestrator = start_orchestrator(store, Default::default(), Default::default());

    let hashtags = hashtags.as_deref().map(parse_hashtags);
    let result = orchestrator.edit(&ItemId::from(id), caption, hashtags).await;
    orchestrator.shutdown().await;

    let item = result.map_err(|e| miette::miette!("{}", e))?;
    print_item(&item)
}

/// Send a failed item back through the pipeline and follow it.
pub async fn retry(store_path: &Path, tuning: &Tuning, id: &str) -> Result<()> {
    let store = open_store(store_path).await?;
    let orchestrator = start_orchestrator(store, tuning.to_config(), tuning.demo_latency());
    let id = ItemId::from(id);

    let events = orchestrator.subscribe();
    let outcome = match orchestrator.retry_failed(&id).await {
        Ok(_) => wait_until_settled(&orchestrator, &id, events).await,
        Err(e) => Err(miette::miette!("{}", e)),
    };

    orchestrator.shutdown().await;
    print_item(&outcome?)
}

/// Wait until the item is scheduled or terminal, or the user interrupts.
async fn wait_until_settled(
    orchestrator: &Orchestrator,
    id: &ItemId,
    mut events: broadcast::Receiver<ItemEvent>,
) -> Result<ContentItem> {
    loop {
        let item = orchestrator
            .get(id)
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        if settled(item.state) {
            return Ok(item);
        }

        tokio::select! {
            event = events.recv() => {
                if let Err(broadcast::error::RecvError::Closed) = event {
                    return Ok(item);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(state = %item.state, "interrupted, item resumes on next daemon start");
                return Ok(item);
            }
        }
    }
}

fn settled(state: ItemState) -> bool {
    state.is_terminal() || state == ItemState::Scheduled
}

fn print_item(item: &ContentItem) -> Result<()> {
    let out = serde_json::to_string_pretty(item).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", out);
    Ok(())
}

/// First line of `text`, cut to `max` characters.
fn summarize(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    } else {
        line.to_string()
    }
}
