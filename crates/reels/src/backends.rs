//! Offline stand-ins for the AI backend and the social platform.
//!
//! The daemon ships with these so the whole pipeline can run without
//! credentials. Both simulate latency and log what a real integration
//! would send.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use reels_scheduler::{
    BackendError, CaptionContext, ContentItem, GeneratedCaption, GenerationBackend,
    IdempotencyToken, MediaRef, PublishError, PublishReceipt, Publisher, parse_hashtags,
};

const CAPTIONS: [&str; 5] = [
    "✨ Living my best life! Can't stop, won't stop 💪",
    "🔥 When the vibe is just right... #blessed",
    "💫 Creating memories one reel at a time",
    "🌟 This is your sign to chase your dreams!",
    "🎬 Behind the scenes of something amazing",
];

const HASHTAG_SETS: [&str; 4] = [
    "#reels #viral #trending #instagood #instagram",
    "#explore #fyp #reelsinstagram #viralreels #trendingreels",
    "#contentcreator #creator #lifestyle #motivation #inspiration",
    "#video #reelsvideo #instareels #reelitfeelit #reelkarofeelkaro",
];

const PROMPT_HASHTAGS: [&str; 5] = ["aiart", "generated", "reels", "viral", "creative"];

/// FNV-1a, so the same input always picks the same canned text.
fn pick(seed: &str, len: usize) -> usize {
    let hash = seed.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    });
    (hash % len as u64) as usize
}

/// Lowercase the prompt into a short url-safe slug.
fn slug(prompt: &str) -> String {
    let words: Vec<String> = prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    words.join("-").chars().take(40).collect()
}

/// Canned captions and placeholder media.
pub struct CannedBackend {
    latency: Duration,
}

impl CannedBackend {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl GenerationBackend for CannedBackend {
    async fn generate_caption(
        &self,
        context: &CaptionContext,
    ) -> Result<GeneratedCaption, BackendError> {
        tokio::time::sleep(self.latency).await;

        if let Some(prompt) = context.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            return Ok(GeneratedCaption {
                caption: format!("🎬 {} ✨", prompt.trim()),
                hashtags: PROMPT_HASHTAGS.iter().map(|t| t.to_string()).collect(),
            });
        }

        let seed = context
            .media_ref
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_default();
        Ok(GeneratedCaption {
            caption: CAPTIONS[pick(&seed, CAPTIONS.len())].to_string(),
            hashtags: parse_hashtags(HASHTAG_SETS[pick(&seed, HASHTAG_SETS.len())]),
        })
    }

    async fn generate_media(&self, prompt: &str) -> Result<MediaRef, BackendError> {
        let slug = slug(prompt);
        if slug.is_empty() {
            return Err(BackendError::Permanent(
                "prompt has nothing to generate from".to_string(),
            ));
        }

        // Video takes longer than text
        tokio::time::sleep(self.latency * 2).await;
        Ok(MediaRef(format!("generated://{}", slug)))
    }
}

/// Logs each post instead of sending it.
pub struct DryRunPublisher {
    latency: Duration,
}

impl DryRunPublisher {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(
        &self,
        item: &ContentItem,
        token: &IdempotencyToken,
    ) -> Result<PublishReceipt, PublishError> {
        tokio::time::sleep(self.latency).await;

        let media = item
            .media_ref
            .as_ref()
            .ok_or_else(|| PublishError::Permanent("item has no media".to_string()))?;

        info!(
            id = %item.id,
            account = %item.account,
            media = %media,
            caption = %item.caption,
            hashtags = %item.hashtags.join(" "),
            token = %token,
            "dry run: would publish"
        );

        Ok(PublishReceipt {
            post_id: format!("dry-run-{}", token),
        })
    }
}
