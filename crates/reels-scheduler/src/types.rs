//! Content item types.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last raw id value handed out in this process.
static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a content item.
///
/// Ids are 63-bit values rendered as 13 sortable base32 characters:
/// - Upper 53 bits: microseconds since Unix epoch
/// - Lower 10 bits: sequence within the microsecond
///
/// Generation is strictly monotonic within a process, so an id is never
/// handed out twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        let micros = Utc::now().timestamp_micros().max(0) as u64;
        let candidate = micros << 10;

        let previous = LAST_ID
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let raw = candidate.max(previous + 1);

        Self::from_u64(raw)
    }

    fn from_u64(val: u64) -> Self {
        // Base32-sortable encoding (uses digits 2-7 and a-z)
        const CHARSET: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";
        let mut id = String::with_capacity(13);

        let mut v = val;
        for _ in 0..13 {
            id.push(CHARSET[(v & 0x1f) as usize] as char);
            v >>= 5;
        }

        Self(id.chars().rev().collect())
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque reference to media owned by the media store.
///
/// The core never reads the bytes behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub String);

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MediaRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Accepted at intake, not yet routed.
    Draft,
    /// A worker holds the claim and is writing caption/hashtags.
    GeneratingCaption,
    /// A worker holds the claim and is generating the video.
    GeneratingMedia,
    /// Media and caption are in place.
    Ready,
    /// Waiting for `scheduled_at`.
    Scheduled,
    /// Claimed for the publish call.
    Publishing,
    /// Posted. Terminal.
    Published,
    /// Cancelled or out of retries. Terminal.
    Failed,
}

impl ItemState {
    /// All states, in lifecycle order.
    pub const ALL: [ItemState; 8] = [
        ItemState::Draft,
        ItemState::GeneratingCaption,
        ItemState::GeneratingMedia,
        ItemState::Ready,
        ItemState::Scheduled,
        ItemState::Publishing,
        ItemState::Published,
        ItemState::Failed,
    ];

    /// `Published` and `Failed` accept no further core-driven mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Published | ItemState::Failed)
    }

    /// Whether a generation worker owns the item.
    pub fn is_generating(self) -> bool {
        matches!(
            self,
            ItemState::GeneratingCaption | ItemState::GeneratingMedia
        )
    }

    /// Check an edge against the lifecycle table.
    ///
    /// Besides the forward edges, every non-terminal state may fail
    /// (cancellation or exhausted retries) and `Failed` may return to
    /// `Draft` through an explicit retry.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;

        match (self, next) {
            (Draft, Ready | GeneratingCaption | GeneratingMedia) => true,
            (GeneratingCaption | GeneratingMedia, Ready) => true,
            (Ready, Scheduled | Publishing) => true,
            (Scheduled, Publishing) => true,
            (Publishing, Published) => true,
            (Failed, Draft) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Snake-case name, as used in JSON and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Draft => "draft",
            ItemState::GeneratingCaption => "generating_caption",
            ItemState::GeneratingMedia => "generating_media",
            ItemState::Ready => "ready",
            ItemState::Scheduled => "scheduled",
            ItemState::Publishing => "publishing",
            ItemState::Published => "published",
            ItemState::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        ItemState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown item state '{}'", s))
    }
}

/// Why an item ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Cancelled by the user.
    Cancelled,
    /// The generation backend rejected the input.
    GenerationRejected,
    /// Generation kept failing transiently until retries ran out.
    GenerationExhausted,
    /// The platform rejected the post.
    PublishRejected,
    /// Publishing kept failing until retries ran out.
    PublishExhausted,
}

/// A content item. The only persistent entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Assigned at intake, immutable.
    pub id: ItemId,
    /// Social account the item will be posted to.
    pub account: String,
    /// Uploaded or generated media. Absent until generation finishes.
    pub media_ref: Option<MediaRef>,
    pub caption: String,
    pub hashtags: Vec<String>,
    /// Set only when the media must be generated.
    pub generation_prompt: Option<String>,
    /// The user asked for an AI-written caption.
    #[serde(default)]
    pub request_caption: bool,
    /// Absent means publish as soon as the item is ready.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub state: ItemState,
    /// Publish attempts.
    pub attempt: u32,
    /// Generation attempts.
    pub gen_attempt: u32,
    /// Last recorded failure, cleared on a successful transition.
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    /// Bumped on every write.
    pub version: u64,
    /// Platform post id once published.
    #[serde(default)]
    pub post_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    fn draft(id: ItemId, account: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            account,
            media_ref: None,
            caption: String::new(),
            hashtags: Vec::new(),
            generation_prompt: None,
            request_caption: false,
            scheduled_at: None,
            state: ItemState::Draft,
            attempt: 0,
            gen_attempt: 0,
            last_error: None,
            failure: None,
            version: 0,
            post_id: None,
            created_at: now,
            updated_at: now,
            published_at: None,
        }
    }

    /// Create a draft around already-uploaded media.
    pub fn uploaded(id: ItemId, account: impl Into<String>, media_ref: MediaRef) -> Self {
        Self {
            media_ref: Some(media_ref),
            ..Self::draft(id, account.into())
        }
    }

    /// Create a draft whose media will be generated from a prompt.
    pub fn from_prompt(id: ItemId, account: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            generation_prompt: Some(prompt.into()),
            ..Self::draft(id, account.into())
        }
    }

    /// Whether the caption still has to come from the backend.
    ///
    /// Explicit requests always count; generated reels without a caption
    /// get one written from their prompt.
    pub fn needs_caption(&self) -> bool {
        self.request_caption || (self.generation_prompt.is_some() && self.caption.is_empty())
    }

    /// The generating state a draft must pass through, if any.
    pub fn generation_target(&self) -> Option<ItemState> {
        if self.media_ref.is_none() && self.generation_prompt.is_some() {
            Some(ItemState::GeneratingMedia)
        } else if self.media_ref.is_some() && self.needs_caption() {
            Some(ItemState::GeneratingCaption)
        } else {
            None
        }
    }

    /// Check if this item is waiting to publish and its time has come.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == ItemState::Scheduled && self.scheduled_at.is_some_and(|at| at <= now)
    }
}

/// Stable token identifying every publish attempt for one item.
///
/// The publisher hands it to the platform so that a repeat after a crash
/// does not create a second post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Derive the token for an item.
    pub fn for_item(id: &ItemId) -> Self {
        Self(format!("reels-publish-{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A state change observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemEvent {
    pub id: ItemId,
    pub from: ItemState,
    pub to: ItemState,
    /// Version after the write.
    pub version: u64,
}

/// Normalize user hashtags: trim, drop a leading `#`, skip empties.
pub fn normalize_hashtags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().trim_start_matches('#').trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Parse a comma or whitespace separated hashtag field.
pub fn parse_hashtags(input: &str) -> Vec<String> {
    normalize_hashtags(input.split(|c: char| c == ',' || c.is_whitespace()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // === Unit Tests ===

    #[test]
    fn test_forward_edges() {
        use ItemState::*;

        assert!(Draft.can_transition_to(Ready));
        assert!(Draft.can_transition_to(GeneratingMedia));
        assert!(Draft.can_transition_to(GeneratingCaption));
        assert!(GeneratingCaption.can_transition_to(Ready));
        assert!(GeneratingMedia.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Scheduled));
        assert!(Ready.can_transition_to(Publishing));
        assert!(Scheduled.can_transition_to(Publishing));
        assert!(Publishing.can_transition_to(Published));
    }

    #[test]
    fn test_skipping_edges_rejected() {
        use ItemState::*;

        assert!(!Draft.can_transition_to(Publishing));
        assert!(!Draft.can_transition_to(Published));
        assert!(!Ready.can_transition_to(Published));
        assert!(!Scheduled.can_transition_to(Ready));
        assert!(!GeneratingMedia.can_transition_to(GeneratingCaption));
        assert!(!Publishing.can_transition_to(Scheduled));
    }

    #[test]
    fn test_terminal_states() {
        use ItemState::*;

        assert!(Published.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Published.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Published.can_transition_to(Draft));
        // Explicit retry is the one way out of Failed
        assert!(Failed.can_transition_to(Draft));
    }

    #[test]
    fn test_generation_target() {
        let upload = ContentItem::uploaded(ItemId::generate(), "acct", MediaRef::from("m1"));
        assert_eq!(upload.generation_target(), None);

        let mut wants_caption = upload.clone();
        wants_caption.request_caption = true;
        assert_eq!(
            wants_caption.generation_target(),
            Some(ItemState::GeneratingCaption)
        );

        let prompt = ContentItem::from_prompt(ItemId::generate(), "acct", "sunset timelapse");
        assert_eq!(prompt.generation_target(), Some(ItemState::GeneratingMedia));

        // Media generated, caption still missing
        let mut half_done = prompt.clone();
        half_done.media_ref = Some(MediaRef::from("generated"));
        assert_eq!(
            half_done.generation_target(),
            Some(ItemState::GeneratingCaption)
        );

        half_done.caption = "done".to_string();
        assert_eq!(half_done.generation_target(), None);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut item = ContentItem::uploaded(ItemId::generate(), "acct", MediaRef::from("m"));
        item.scheduled_at = Some(now - chrono::Duration::seconds(1));

        // Only scheduled items are due
        assert!(!item.is_due(now));

        item.state = ItemState::Scheduled;
        assert!(item.is_due(now));

        item.scheduled_at = Some(now + chrono::Duration::seconds(1));
        assert!(!item.is_due(now));
    }

    #[test]
    fn test_ids_unique_and_sorted() {
        let ids: Vec<ItemId> = (0..1000).map(|_| ItemId::generate()).collect();

        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert!(ids.iter().all(|id| id.as_str().len() == 13));
    }

    #[test]
    fn test_idempotency_token_stable() {
        let id = ItemId::from("3kabc2def4ghi");
        assert_eq!(IdempotencyToken::for_item(&id), IdempotencyToken::for_item(&id));
        assert_eq!(
            IdempotencyToken::for_item(&id).as_str(),
            "reels-publish-3kabc2def4ghi"
        );
    }

    #[test]
    fn test_parse_hashtags() {
        assert_eq!(
            parse_hashtags("#reels, viral ,, #fyp #foryou"),
            vec!["reels", "viral", "fyp", "foryou"]
        );
        assert!(parse_hashtags(" , # ,").is_empty());
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!("scheduled".parse::<ItemState>(), Ok(ItemState::Scheduled));
        assert_eq!(
            "generating-media".parse::<ItemState>(),
            Ok(ItemState::GeneratingMedia)
        );
        assert!("sideways".parse::<ItemState>().is_err());
    }

    // === Property-Based Tests ===

    fn any_state() -> impl Strategy<Value = ItemState> {
        prop::sample::select(ItemState::ALL.to_vec())
    }

    proptest! {
        // Nothing leaves Published, and Failed only goes back to Draft
        #[test]
        fn terminal_states_are_sinks(next in any_state()) {
            prop_assert!(!ItemState::Published.can_transition_to(next));
            prop_assert_eq!(
                ItemState::Failed.can_transition_to(next),
                next == ItemState::Draft
            );
        }

        // Every non-terminal state can be cancelled
        #[test]
        fn non_terminal_states_can_fail(from in any_state()) {
            prop_assert_eq!(
                from.can_transition_to(ItemState::Failed),
                !from.is_terminal()
            );
        }

        // Publishing is only ever entered from Ready or Scheduled
        #[test]
        fn publishing_has_two_entry_points(from in any_state()) {
            let allowed = matches!(from, ItemState::Ready | ItemState::Scheduled);
            prop_assert_eq!(from.can_transition_to(ItemState::Publishing), allowed);
        }

        // Display and FromStr agree
        #[test]
        fn state_name_roundtrip(state in any_state()) {
            prop_assert_eq!(state.to_string().parse::<ItemState>(), Ok(state));
        }

        // Normalized hashtags are trimmed and never empty or prefixed
        #[test]
        fn normalized_hashtags_are_clean(
            tags in prop::collection::vec("[ #]{0,2}[a-z0-9]{0,8}[ ]{0,2}", 0..10)
        ) {
            for tag in normalize_hashtags(&tags) {
                prop_assert!(!tag.is_empty());
                prop_assert!(!tag.starts_with('#'));
                prop_assert_eq!(tag.trim(), tag.as_str());
            }
        }
    }
}
