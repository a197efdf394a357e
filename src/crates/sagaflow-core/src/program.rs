//! Typed program trees for the flow DSL
//!
//! A program is an immutable tree of [`Step`] nodes interpreted by the
//! executor against a typed state object. Step payloads carry their
//! delegates as `Arc<dyn Fn>` closures over the state, so a program is
//! built once at startup and shared by every flow instance of its type.
//!
//! # Step kinds
//!
//! | Kind | Behavior |
//! |---|---|
//! | `Send` / `Query` | Dispatch through the mediator, synchronous with the executor's task; `Query` maps a typed result back into state |
//! | `Publish` | Fire-and-forget event; never fails the flow unless configured |
//! | `If` / `Switch` | Select exactly one branch; the taken branch index is encoded into the position so resume never re-evaluates the predicate |
//! | `ForEach` | Batched, bounded-parallel iteration with durable progress |
//! | `WhenAll` / `WhenAny` | Spawn child flows and suspend on a wait condition |
//! | `Delay` | Persist a wakeup marker and suspend |
//!
//! # Branch slots
//!
//! Branches get stable integer slots from declaration order: `then` is 0,
//! else-if *i* is *i*+1, `else` is the last slot; switch cases are numbered
//! in declaration order with the default after them. The encoding is
//! injective, so a stored position always resolves to the same branch
//! across restarts.
//!
//! Programs are constructed through [`Program::build`] and the
//! [`FlowBuilder`](crate::builder::FlowBuilder); see that module for the
//! fluent surface.

use crate::message::Message;
use crate::state::FlowState;
use chrono::{DateTime, Utc};
use sagaflow_store::FlowPosition;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Builds a message from the current state
pub type MessageFactory<S> = Arc<dyn Fn(&S) -> Message + Send + Sync>;

/// Guard predicate over the current state
pub type Predicate<S> = Arc<dyn Fn(&S) -> bool + Send + Sync>;

/// Selects the switch key from the current state
pub type SwitchSelector<S> = Arc<dyn Fn(&S) -> Option<String> + Send + Sync>;

/// Maps a dispatch result value back into the state
pub type IntoMapper<S> = Arc<dyn Fn(&mut S, &Value) + Send + Sync>;

/// Mutates state at a step-lifecycle hook
pub type StateHook<S> = Arc<dyn Fn(&mut S) + Send + Sync>;

/// Materializes the loop collection from the current state
pub type CollectionSelector<S> = Arc<dyn Fn(&S) -> Option<Vec<Value>> + Send + Sync>;

/// Builds a message from the state and one collection item
pub type ItemMessageFactory<S> = Arc<dyn Fn(&S, &Value) -> Message + Send + Sync>;

/// Guard predicate over the state and one collection item
pub type ItemPredicate<S> = Arc<dyn Fn(&S, &Value) -> bool + Send + Sync>;

/// Hook invoked after an item succeeds; serialized over the state
pub type ItemSuccessHook<S> = Arc<dyn Fn(&mut S, usize, &Value) + Send + Sync>;

/// Hook invoked after an item fails; serialized over the state
pub type ItemFailHook<S> = Arc<dyn Fn(&mut S, usize, &str) + Send + Sync>;

/// Per-item failure policy of a ForEach loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the loop and fail the flow on the first item failure; items
    /// beyond the failure are not dispatched
    StopOnFirstFailure,
    /// Keep iterating; the loop succeeds regardless of item failures
    ContinueOnFailure,
    /// Keep iterating; the loop succeeds and every failure is recorded
    /// into state through
    /// [`FlowState::record_item_error`](crate::FlowState::record_item_error)
    CollectErrors,
}

/// Payload shared by Send and Query steps
pub struct DispatchStep<S> {
    /// Step name, used in traces and errors
    pub name: String,
    /// Builds the outgoing message
    pub message: MessageFactory<S>,
    /// Skip the step entirely when this predicate is false
    pub only_when: Option<Predicate<S>>,
    /// Advance past a handler failure instead of failing the flow
    pub optional: bool,
    /// Free-form tags
    pub tags: Vec<String>,
    /// Per-dispatch time budget; elapsing counts as handler failure
    pub timeout: Option<Duration>,
    /// Compensation message dispatched on handler failure; the flow then
    /// advances instead of failing
    pub if_fail: Option<MessageFactory<S>>,
    /// Maps the result value into state (Query)
    pub into: Option<IntoMapper<S>>,
    /// Invoked after a successful dispatch
    pub on_completed: Option<StateHook<S>>,
    /// Invoked after a failed dispatch
    pub on_failed: Option<StateHook<S>>,
}

impl<S> DispatchStep<S> {
    pub(crate) fn new(name: impl Into<String>, message: MessageFactory<S>) -> Self {
        Self {
            name: name.into(),
            message,
            only_when: None,
            optional: false,
            tags: Vec::new(),
            timeout: None,
            if_fail: None,
            into: None,
            on_completed: None,
            on_failed: None,
        }
    }
}

/// Payload of a Publish step
pub struct PublishStep<S> {
    /// Step name
    pub name: String,
    /// Builds the outgoing event
    pub event: MessageFactory<S>,
    /// Skip when false
    pub only_when: Option<Predicate<S>>,
    /// Fail the flow when publishing fails (off by default)
    pub fails_flow: bool,
}

/// Payload of an If step
pub struct IfStep<S> {
    /// Condition for the then branch; a missing condition fails the flow
    pub condition: Option<Predicate<S>>,
    /// Branch slot 0
    pub then_branch: Vec<Step<S>>,
    /// Branch slots 1..=N in declaration order
    pub else_ifs: Vec<(Predicate<S>, Vec<Step<S>>)>,
    /// Last branch slot
    pub else_branch: Option<Vec<Step<S>>>,
}

/// Payload of a Switch step
pub struct SwitchStep<S> {
    /// Produces the switch key; `None` (or a missing key) routes to default
    pub selector: Option<SwitchSelector<S>>,
    /// Cases in declaration order; first key match wins
    pub cases: Vec<(String, Vec<Step<S>>)>,
    /// Default branch, slot `cases.len()`
    pub default: Option<Vec<Step<S>>>,
}

/// Payload of a ForEach step
pub struct ForEachStep<S> {
    /// Step name
    pub name: String,
    /// Materializes the collection once at loop entry; `None` is empty
    pub collection: CollectionSelector<S>,
    /// Per-item sub-program
    pub body: Vec<ItemStep<S>>,
    /// Items per durable batch
    pub batch_size: usize,
    /// Concurrent items within a batch
    pub parallelism: usize,
    /// What an item failure does to the loop
    pub policy: FailurePolicy,
    /// Invoked per successful item, serialized over the state
    pub on_item_success: Option<ItemSuccessHook<S>>,
    /// Invoked per failed item, serialized over the state
    pub on_item_fail: Option<ItemFailHook<S>>,
    /// Invoked once after the loop completes
    pub on_complete: Option<StateHook<S>>,
}

/// Per-item dispatch inside a ForEach body
pub struct ItemDispatch<S> {
    /// Step name
    pub name: String,
    /// Builds the outgoing message from state and item
    pub message: ItemMessageFactory<S>,
    /// Skip for this item when false
    pub only_when: Option<ItemPredicate<S>>,
}

/// Steps allowed inside a ForEach body
///
/// Item sub-programs run inside one durable batch, so kinds that suspend
/// the flow (waits, delays) are not expressible here.
pub enum ItemStep<S> {
    /// Dispatch a command for the item
    Send(ItemDispatch<S>),
    /// Dispatch a request for the item
    Query(ItemDispatch<S>),
    /// Publish an event for the item; failures fail the item only
    Publish(ItemDispatch<S>),
}

impl<S> ItemStep<S> {
    /// The dispatch payload regardless of kind
    pub fn dispatch(&self) -> &ItemDispatch<S> {
        match self {
            Self::Send(d) | Self::Query(d) | Self::Publish(d) => d,
        }
    }
}

/// Payload of a WhenAll step
pub struct WhenAllStep<S> {
    /// Step name
    pub name: String,
    /// One start-message factory per child to spawn
    pub children: Vec<MessageFactory<S>>,
    /// Wait expiry measured from spawn
    pub timeout: Duration,
    /// Compensation dispatched when any child fails or the wait times out
    pub on_any_fail: Option<MessageFactory<S>>,
}

/// Payload of a WhenAny step
pub struct WhenAnyStep<S> {
    /// Step name
    pub name: String,
    /// One start-message factory per child to spawn
    pub children: Vec<MessageFactory<S>>,
    /// Wait expiry measured from spawn
    pub timeout: Duration,
    /// Cancel the losers once a child wins (default true)
    pub cancel_others: bool,
    /// Maps the first successful child's result into state
    pub into: Option<IntoMapper<S>>,
}

/// Wakeup specification of a Delay step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySpec {
    /// Relative to the moment the step executes
    For(Duration),
    /// Absolute instant
    Until(DateTime<Utc>),
}

/// Payload of a Delay step
#[derive(Debug, Clone)]
pub struct DelayStep {
    /// Step name
    pub name: String,
    /// When the flow wakes up
    pub until: DelaySpec,
}

/// One node of a program tree
pub enum Step<S> {
    Send(DispatchStep<S>),
    Query(DispatchStep<S>),
    Publish(PublishStep<S>),
    If(IfStep<S>),
    Switch(SwitchStep<S>),
    ForEach(ForEachStep<S>),
    WhenAll(WhenAllStep<S>),
    WhenAny(WhenAnyStep<S>),
    Delay(DelayStep),
}

impl<S> Step<S> {
    /// Discriminator name for traces
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Send(_) => "send",
            Self::Query(_) => "query",
            Self::Publish(_) => "publish",
            Self::If(_) => "if",
            Self::Switch(_) => "switch",
            Self::ForEach(_) => "foreach",
            Self::WhenAll(_) => "when_all",
            Self::WhenAny(_) => "when_any",
            Self::Delay(_) => "delay",
        }
    }

    /// Step name where one was given
    pub fn name(&self) -> &str {
        match self {
            Self::Send(s) | Self::Query(s) => &s.name,
            Self::Publish(s) => &s.name,
            Self::ForEach(s) => &s.name,
            Self::WhenAll(s) => &s.name,
            Self::WhenAny(s) => &s.name,
            Self::Delay(s) => &s.name,
            Self::If(_) => "if",
            Self::Switch(_) => "switch",
        }
    }

    /// Resolve a branch slot to its step list, for If/Switch nodes
    pub fn branch(&self, slot: u32) -> Option<&[Step<S>]> {
        let slot = slot as usize;
        match self {
            Self::If(s) => {
                if slot == 0 {
                    Some(&s.then_branch)
                } else if slot <= s.else_ifs.len() {
                    Some(&s.else_ifs[slot - 1].1)
                } else if slot == s.else_ifs.len() + 1 {
                    s.else_branch.as_deref()
                } else {
                    None
                }
            }
            Self::Switch(s) => {
                if slot < s.cases.len() {
                    Some(&s.cases[slot].1)
                } else if slot == s.cases.len() {
                    s.default.as_deref()
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl<S> std::fmt::Debug for Step<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Step::{}({})", self.kind(), self.name())
    }
}

/// Immutable program tree, shared by every flow instance of its type
pub struct Program<S> {
    flow_type: String,
    steps: Arc<Vec<Step<S>>>,
}

impl<S> Clone for Program<S> {
    fn clone(&self) -> Self {
        Self {
            flow_type: self.flow_type.clone(),
            steps: Arc::clone(&self.steps),
        }
    }
}

impl<S: FlowState> Program<S> {
    pub(crate) fn from_steps(flow_type: impl Into<String>, steps: Vec<Step<S>>) -> Self {
        Self {
            flow_type: flow_type.into(),
            steps: Arc::new(steps),
        }
    }

    /// The program identity recorded on snapshots
    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    /// Top-level steps
    pub fn steps(&self) -> &[Step<S>] {
        &self.steps
    }

    /// The branch containing the position's cursor
    ///
    /// A path alternates `[cursor, slot, cursor, slot, …, cursor]`; every
    /// (cursor, slot) pair descends through one If/Switch node. `None`
    /// means the path does not address this tree.
    pub fn branch_at(&self, path: &[u32]) -> Option<&[Step<S>]> {
        let (_, prefix) = path.split_last()?;
        if prefix.len() % 2 != 0 {
            return None;
        }
        let mut branch: &[Step<S>] = &self.steps;
        for pair in prefix.chunks(2) {
            let step = branch.get(pair[0] as usize)?;
            branch = step.branch(pair[1])?;
        }
        Some(branch)
    }

    /// The step addressed by a position, or `None` past the branch end
    pub fn step_at(&self, position: &FlowPosition) -> Option<&Step<S>> {
        let path = position.path();
        let branch = self.branch_at(path)?;
        branch.get(*path.last()? as usize)
    }
}
