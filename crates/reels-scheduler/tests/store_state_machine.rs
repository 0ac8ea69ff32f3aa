//! Stateful property testing for the item store.
//!
//! Uses proptest-state-machine to drive a `MemoryStore` with random puts
//! and compare-and-swaps against a reference model. The model tracks:
//!
//! - Which slots hold an item
//! - Each item's lifecycle state and version
//!
//! After every step the store must agree with the model, and every state
//! change it broadcast must be an edge the lifecycle allows.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;
use tokio::sync::broadcast;

use reels_scheduler::{
    ContentItem, ItemEvent, ItemId, ItemState, ItemStore, MediaRef, MemoryStore, Mutator,
    StoreError,
};

/// Number of distinct ids the test plays with.
const SLOTS: usize = 3;

fn slot_id(slot: usize) -> ItemId {
    ItemId::from(format!("item-{}", slot))
}

/// Operations that can be performed on the store.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Insert a fresh draft.
    Put { slot: usize },
    /// Move the item to `to`, optionally with an outdated version.
    Swap {
        slot: usize,
        to: ItemState,
        stale: bool,
    },
    /// Rewrite the caption without changing state.
    Edit { slot: usize, stale: bool },
}

/// Reference model: slot -> (state, version).
#[derive(Clone, Debug, Default)]
pub struct StoreModel {
    pub items: BTreeMap<usize, (ItemState, u64)>,
}

/// Whether a write from `from` to `to` is allowed.
fn write_allowed(from: ItemState, to: ItemState) -> bool {
    if from == to {
        !from.is_terminal()
    } else {
        from.can_transition_to(to)
    }
}

impl ReferenceStateMachine for StoreModel {
    type State = Self;
    type Transition = StoreOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let states = prop::sample::select(ItemState::ALL.to_vec());
        prop_oneof![
            1 => (0..SLOTS).prop_map(|slot| StoreOperation::Put { slot }),
            5 => (0..SLOTS, states, prop::bool::weighted(0.2))
                .prop_map(|(slot, to, stale)| StoreOperation::Swap { slot, to, stale }),
            2 => (0..SLOTS, prop::bool::weighted(0.2))
                .prop_map(|(slot, stale)| StoreOperation::Edit { slot, stale }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            StoreOperation::Put { slot } => {
                state.items.entry(*slot).or_insert((ItemState::Draft, 0));
            }
            StoreOperation::Swap { slot, to, stale } => {
                if let Some((current, version)) = state.items.get_mut(slot)
                    && !*stale
                    && write_allowed(*current, *to)
                {
                    *current = *to;
                    *version += 1;
                }
            }
            StoreOperation::Edit { slot, stale } => {
                if let Some((current, version)) = state.items.get_mut(slot)
                    && !*stale
                    && write_allowed(*current, *current)
                {
                    *version += 1;
                }
            }
        }
        state
    }
}

/// Test harness that wraps a real MemoryStore with a tokio runtime.
pub struct StoreTestHarness {
    runtime: Runtime,
    store: Arc<MemoryStore>,
    events: broadcast::Receiver<ItemEvent>,
}

impl StoreTestHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let store = Arc::new(MemoryStore::new());
        let events = store.subscribe();
        Self {
            runtime,
            store,
            events,
        }
    }

    fn apply_operation(&self, op: &StoreOperation) {
        self.runtime.block_on(async {
            match op {
                StoreOperation::Put { slot } => {
                    let existed = self.store.get(&slot_id(*slot)).await.is_ok();
                    let item = ContentItem::uploaded(slot_id(*slot), "acct", MediaRef::from("m"));
                    let result = self.store.put(item).await;

                    if existed {
                        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
                    } else {
                        assert!(result.is_ok(), "put failed: {:?}", result);
                    }
                }
                StoreOperation::Swap { slot, to, stale } => {
                    let to = *to;
                    self.swap(*slot, *stale, to, Box::new(move |i| i.state = to))
                        .await;
                }
                StoreOperation::Edit { slot, stale } => {
                    let current = self.store.get(&slot_id(*slot)).await.map(|i| i.state);
                    let to = current.unwrap_or(ItemState::Draft);
                    self.swap(
                        *slot,
                        *stale,
                        to,
                        Box::new(|i| i.caption.push_str(" edited")),
                    )
                    .await;
                }
            }
        });
    }

    async fn swap(
        &self,
        slot: usize,
        stale: bool,
        to: ItemState,
        mutator: Mutator<'static>,
    ) {
        let id = slot_id(slot);
        let before = self.store.get(&id).await.ok();
        let expected = match &before {
            Some(item) if stale => item.version + 1,
            Some(item) => item.version,
            None => 0,
        };

        let result = self.store.compare_and_swap(&id, expected, mutator).await;

        match before {
            None => assert!(matches!(result, Err(StoreError::NotFound(_)))),
            Some(_) if stale => {
                assert!(result.as_ref().is_err_and(|e| e.is_conflict()), "{:?}", result)
            }
            Some(item) if write_allowed(item.state, to) => {
                let written = result.expect("allowed write rejected");
                assert_eq!(written.version, item.version + 1);
                assert_eq!(written.state, to);
            }
            Some(_) => {
                assert!(
                    matches!(result, Err(StoreError::IllegalTransition { .. })),
                    "{:?}",
                    result
                )
            }
        }
    }

    fn verify_invariants(&mut self, model: &StoreModel) {
        let Self {
            runtime,
            store,
            events,
        } = self;

        runtime.block_on(async {
            // Invariant 1: store contents match model
            for slot in 0..SLOTS {
                let actual = store.get(&slot_id(slot)).await.ok();
                let actual = actual.map(|i| (i.state, i.version));
                assert_eq!(
                    actual,
                    model.items.get(&slot).copied(),
                    "slot {} mismatch",
                    slot
                );
            }

            // Invariant 2: every broadcast transition is legal
            while let Ok(event) = events.try_recv() {
                assert!(
                    event.from.can_transition_to(event.to),
                    "illegal transition observed: {:?}",
                    event
                );
                assert!(event.version > 0);
            }
        });
    }
}

impl StateMachineTest for StoreTestHarness {
    type SystemUnderTest = Self;
    type Reference = StoreModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn store_state_machine_test(sequential 1..60 => StoreTestHarness);
}

// Additional targeted tests

#[test]
fn test_write_allowed_matches_lifecycle() {
    assert!(write_allowed(ItemState::Draft, ItemState::Draft));
    assert!(write_allowed(ItemState::Scheduled, ItemState::Publishing));
    assert!(write_allowed(ItemState::Failed, ItemState::Draft));
    assert!(!write_allowed(ItemState::Failed, ItemState::Failed));
    assert!(!write_allowed(ItemState::Published, ItemState::Published));
    assert!(!write_allowed(ItemState::Ready, ItemState::Published));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claims_are_sequential_per_version() {
    let store = Arc::new(MemoryStore::new());
    let id = ItemId::generate();
    store
        .put(ContentItem::uploaded(id.clone(), "acct", MediaRef::from("m")))
        .await
        .unwrap();

    // Each round, many workers race for the same version; exactly one wins
    for version in 0..5u64 {
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap(&id, version, Box::new(|i| i.attempt += 1))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
            }
        }
        assert_eq!(wins, 1, "round {}", version);
    }

    let item = store.get(&id).await.unwrap();
    assert_eq!(item.version, 5);
    assert_eq!(item.attempt, 5);
}
