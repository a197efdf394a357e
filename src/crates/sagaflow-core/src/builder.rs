//! Fluent builder for flow programs
//!
//! Programs are declared once, validated, and frozen into an immutable
//! [`Program`]. The builder surfaces every step kind of the DSL and
//! rejects malformed trees at build time: modifiers applied to the wrong
//! step kind, switch cases after the default, empty fan-outs, empty loop
//! bodies. An `else_if` after `else` is unrepresentable - `else_` consumes
//! the chain.
//!
//! # Example
//!
//! ```rust
//! use sagaflow_core::{FailurePolicy, FlowState, Message, Program};
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct OrderState {
//!     total: i64,
//!     items: Vec<String>,
//! }
//! impl FlowState for OrderState {}
//!
//! let program = Program::<OrderState>::build("order-flow", |flow| {
//!     flow.send("create-order", |s| Message::new("order.create", json!({"total": s.total})))
//!         .if_(
//!             |s: &OrderState| s.total > 100,
//!             |then| then.send("flag-review", |_| Message::new("review.flag", json!({}))),
//!         )
//!         .else_(|els| els.publish("small-order", |_| Message::new("order.small", json!({}))))
//!         .for_each(
//!             "ship-items",
//!             |s: &OrderState| Some(s.items.iter().map(|i| json!(i)).collect()),
//!             |fe| {
//!                 fe.batch_size(2)
//!                     .policy(FailurePolicy::ContinueOnFailure)
//!                     .send("ship", |_, item| Message::new("item.ship", item.clone()))
//!             },
//!         )
//! })
//! .unwrap();
//!
//! assert_eq!(program.flow_type(), "order-flow");
//! assert_eq!(program.steps().len(), 3);
//! ```

use crate::error::{FlowError, Result};
use crate::message::Message;
use crate::program::{
    CollectionSelector, DelaySpec, DelayStep, DispatchStep, FailurePolicy, ForEachStep, IfStep,
    ItemDispatch, ItemStep, Program, PublishStep, Step, SwitchStep, WhenAllStep, WhenAnyStep,
};
use crate::state::FlowState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

impl<S: FlowState> Program<S> {
    /// Build and validate a program
    ///
    /// The closure receives the root [`FlowBuilder`]; nested branches
    /// receive their own builders. Validation failures surface as
    /// [`FlowError::Configuration`] listing every problem found.
    pub fn build(
        flow_type: impl Into<String>,
        f: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Result<Program<S>> {
        let builder = f(FlowBuilder::new());
        let (steps, mut errors) = builder.into_parts();
        if steps.is_empty() {
            errors.push("program has no steps".to_string());
        }
        if !errors.is_empty() {
            return Err(FlowError::Configuration(errors.join("; ")));
        }
        Ok(Program::from_steps(flow_type, steps))
    }
}

/// Builder for one branch of a program (the root is just another branch)
pub struct FlowBuilder<S: FlowState> {
    steps: Vec<Step<S>>,
    errors: Vec<String>,
}

impl<S: FlowState> FlowBuilder<S> {
    pub(crate) fn new() -> Self {
        Self {
            steps: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<Step<S>>, Vec<String>) {
        (self.steps, self.errors)
    }

    // --- dispatch steps --------------------------------------------------

    /// Append a Send step
    pub fn send(
        mut self,
        name: impl Into<String>,
        message: impl Fn(&S) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.steps
            .push(Step::Send(DispatchStep::new(name, Arc::new(message))));
        self
    }

    /// Append a Query step
    pub fn query(
        mut self,
        name: impl Into<String>,
        message: impl Fn(&S) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.steps
            .push(Step::Query(DispatchStep::new(name, Arc::new(message))));
        self
    }

    /// Append a Publish step
    pub fn publish(
        mut self,
        name: impl Into<String>,
        event: impl Fn(&S) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.steps.push(Step::Publish(PublishStep {
            name: name.into(),
            event: Arc::new(event),
            only_when: None,
            fails_flow: false,
        }));
        self
    }

    // --- modifiers on the most recent step -------------------------------

    /// Guard the previous step with a predicate
    pub fn only_when(mut self, predicate: impl Fn(&S) -> bool + Send + Sync + 'static) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.only_when = Some(Arc::new(predicate)),
            Some(Step::Publish(p)) => p.only_when = Some(Arc::new(predicate)),
            _ => self.errors.push("only_when requires a preceding send/query/publish".into()),
        }
        self
    }

    /// Mark the previous dispatch as optional (failure advances the flow)
    pub fn optional(mut self) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.optional = true,
            _ => self.errors.push("optional requires a preceding send/query".into()),
        }
        self
    }

    /// Dispatch a compensation message on failure of the previous dispatch,
    /// then advance
    pub fn if_fail(
        mut self,
        message: impl Fn(&S) -> Message + Send + Sync + 'static,
    ) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.if_fail = Some(Arc::new(message)),
            _ => self.errors.push("if_fail requires a preceding send/query".into()),
        }
        self
    }

    /// Map the previous dispatch's result value into state
    pub fn into_state(
        mut self,
        mapper: impl Fn(&mut S, &serde_json::Value) + Send + Sync + 'static,
    ) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.into = Some(Arc::new(mapper)),
            Some(Step::WhenAny(w)) => w.into = Some(Arc::new(mapper)),
            _ => self.errors.push("into_state requires a preceding send/query/when_any".into()),
        }
        self
    }

    /// Give the previous dispatch a time budget
    pub fn timeout(mut self, timeout: Duration) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.timeout = Some(timeout),
            _ => self.errors.push("timeout requires a preceding send/query".into()),
        }
        self
    }

    /// Tag the previous dispatch
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.tags.push(tag.into()),
            _ => self.errors.push("tag requires a preceding send/query".into()),
        }
        self
    }

    /// Run a hook after the previous dispatch succeeds
    pub fn on_completed(mut self, hook: impl Fn(&mut S) + Send + Sync + 'static) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.on_completed = Some(Arc::new(hook)),
            _ => self.errors.push("on_completed requires a preceding send/query".into()),
        }
        self
    }

    /// Run a hook after the previous dispatch fails
    pub fn on_failed(mut self, hook: impl Fn(&mut S) + Send + Sync + 'static) -> Self {
        match self.steps.last_mut() {
            Some(Step::Send(d)) | Some(Step::Query(d)) => d.on_failed = Some(Arc::new(hook)),
            _ => self.errors.push("on_failed requires a preceding send/query".into()),
        }
        self
    }

    /// Make the previous publish step fail the flow on publish errors
    pub fn fails_flow(mut self) -> Self {
        match self.steps.last_mut() {
            Some(Step::Publish(p)) => p.fails_flow = true,
            _ => self.errors.push("fails_flow requires a preceding publish".into()),
        }
        self
    }

    // --- control steps ---------------------------------------------------

    /// Start an If chain; continue with `else_if`/`else_` or `end_if`
    pub fn if_(
        self,
        condition: impl Fn(&S) -> bool + Send + Sync + 'static,
        then: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> IfChain<S> {
        let (then_branch, branch_errors) = then(FlowBuilder::new()).into_parts();
        let mut chain = IfChain {
            parent: self,
            condition: Some(Arc::new(condition)),
            then_branch,
            else_ifs: Vec::new(),
        };
        chain.parent.errors.extend(branch_errors);
        chain
    }

    /// Append a Switch step
    pub fn switch(
        mut self,
        selector: impl Fn(&S) -> Option<String> + Send + Sync + 'static,
        f: impl FnOnce(SwitchBuilder<S>) -> SwitchBuilder<S>,
    ) -> Self {
        let built = f(SwitchBuilder::new());
        self.errors.extend(built.errors);
        self.steps.push(Step::Switch(SwitchStep {
            selector: Some(Arc::new(selector)),
            cases: built.cases,
            default: built.default,
        }));
        self
    }

    /// Append a ForEach step
    pub fn for_each(
        mut self,
        name: impl Into<String>,
        collection: impl Fn(&S) -> Option<Vec<serde_json::Value>> + Send + Sync + 'static,
        f: impl FnOnce(ForEachBuilder<S>) -> ForEachBuilder<S>,
    ) -> Self {
        let name = name.into();
        let built = f(ForEachBuilder::new());
        self.errors.extend(built.errors);
        if built.body.is_empty() {
            self.errors
                .push(format!("for_each '{}' has an empty body", name));
        }
        if built.batch_size == 0 || built.parallelism == 0 {
            self.errors.push(format!(
                "for_each '{}' requires batch_size and parallelism >= 1",
                name
            ));
        }
        self.steps.push(Step::ForEach(ForEachStep {
            name,
            collection: Arc::new(collection) as CollectionSelector<S>,
            body: built.body,
            batch_size: built.batch_size,
            parallelism: built.parallelism,
            policy: built.policy,
            on_item_success: built.on_item_success,
            on_item_fail: built.on_item_fail,
            on_complete: built.on_complete,
        }));
        self
    }

    /// Append a WhenAll fan-out step
    pub fn when_all(
        mut self,
        name: impl Into<String>,
        timeout: Duration,
        f: impl FnOnce(WhenAllBuilder<S>) -> WhenAllBuilder<S>,
    ) -> Self {
        let name = name.into();
        let built = f(WhenAllBuilder::new());
        if built.children.is_empty() {
            self.errors
                .push(format!("when_all '{}' spawns no children", name));
        }
        self.steps.push(Step::WhenAll(WhenAllStep {
            name,
            children: built.children,
            timeout,
            on_any_fail: built.on_any_fail,
        }));
        self
    }

    /// Append a WhenAny fan-out step
    pub fn when_any(
        mut self,
        name: impl Into<String>,
        timeout: Duration,
        f: impl FnOnce(WhenAnyBuilder<S>) -> WhenAnyBuilder<S>,
    ) -> Self {
        let name = name.into();
        let built = f(WhenAnyBuilder::new());
        if built.children.is_empty() {
            self.errors
                .push(format!("when_any '{}' spawns no children", name));
        }
        self.steps.push(Step::WhenAny(WhenAnyStep {
            name,
            children: built.children,
            timeout,
            cancel_others: built.cancel_others,
            into: built.into,
        }));
        self
    }

    /// Append a relative Delay step
    pub fn delay(mut self, name: impl Into<String>, duration: Duration) -> Self {
        self.steps.push(Step::Delay(DelayStep {
            name: name.into(),
            until: DelaySpec::For(duration),
        }));
        self
    }

    /// Append an absolute Delay step
    pub fn delay_until(mut self, name: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.steps.push(Step::Delay(DelayStep {
            name: name.into(),
            until: DelaySpec::Until(at),
        }));
        self
    }
}

/// In-progress If step; terminated by `else_`, `end_if`, or further `else_if`s
pub struct IfChain<S: FlowState> {
    parent: FlowBuilder<S>,
    condition: Option<crate::program::Predicate<S>>,
    then_branch: Vec<Step<S>>,
    else_ifs: Vec<(crate::program::Predicate<S>, Vec<Step<S>>)>,
}

impl<S: FlowState> IfChain<S> {
    /// Add an else-if branch
    pub fn else_if(
        mut self,
        condition: impl Fn(&S) -> bool + Send + Sync + 'static,
        branch: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        let (steps, errors) = branch(FlowBuilder::new()).into_parts();
        self.parent.errors.extend(errors);
        self.else_ifs.push((Arc::new(condition), steps));
        self
    }

    /// Terminate the chain with an else branch
    pub fn else_(
        mut self,
        branch: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> FlowBuilder<S> {
        let (steps, errors) = branch(FlowBuilder::new()).into_parts();
        self.parent.errors.extend(errors);
        self.finish(Some(steps))
    }

    /// Terminate the chain without an else branch
    pub fn end_if(self) -> FlowBuilder<S> {
        self.finish(None)
    }

    fn finish(self, else_branch: Option<Vec<Step<S>>>) -> FlowBuilder<S> {
        let mut parent = self.parent;
        parent.steps.push(Step::If(IfStep {
            condition: self.condition,
            then_branch: self.then_branch,
            else_ifs: self.else_ifs,
            else_branch,
        }));
        parent
    }
}

/// Builder for Switch cases
pub struct SwitchBuilder<S: FlowState> {
    cases: Vec<(String, Vec<Step<S>>)>,
    default: Option<Vec<Step<S>>>,
    errors: Vec<String>,
}

impl<S: FlowState> SwitchBuilder<S> {
    fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
            errors: Vec::new(),
        }
    }

    /// Add a case; first key match wins at runtime
    pub fn case(
        mut self,
        key: impl Into<String>,
        branch: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        if self.default.is_some() {
            self.errors.push("switch case added after default".into());
        }
        let (steps, errors) = branch(FlowBuilder::new()).into_parts();
        self.errors.extend(errors);
        self.cases.push((key.into(), steps));
        self
    }

    /// Set the default branch
    pub fn default(
        mut self,
        branch: impl FnOnce(FlowBuilder<S>) -> FlowBuilder<S>,
    ) -> Self {
        if self.default.is_some() {
            self.errors.push("switch has two default branches".into());
        }
        let (steps, errors) = branch(FlowBuilder::new()).into_parts();
        self.errors.extend(errors);
        self.default = Some(steps);
        self
    }
}

/// Builder for a ForEach loop body and configuration
pub struct ForEachBuilder<S: FlowState> {
    body: Vec<ItemStep<S>>,
    batch_size: usize,
    parallelism: usize,
    policy: FailurePolicy,
    on_item_success: Option<crate::program::ItemSuccessHook<S>>,
    on_item_fail: Option<crate::program::ItemFailHook<S>>,
    on_complete: Option<crate::program::StateHook<S>>,
    errors: Vec<String>,
}

impl<S: FlowState> ForEachBuilder<S> {
    fn new() -> Self {
        Self {
            body: Vec::new(),
            batch_size: 16,
            parallelism: 1,
            policy: FailurePolicy::StopOnFirstFailure,
            on_item_success: None,
            on_item_fail: None,
            on_complete: None,
            errors: Vec::new(),
        }
    }

    /// Items per durable batch
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Concurrent items within a batch
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Per-item failure policy
    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Dispatch a command per item
    pub fn send(
        mut self,
        name: impl Into<String>,
        message: impl Fn(&S, &serde_json::Value) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.body.push(ItemStep::Send(ItemDispatch {
            name: name.into(),
            message: Arc::new(message),
            only_when: None,
        }));
        self
    }

    /// Dispatch a request per item
    pub fn query(
        mut self,
        name: impl Into<String>,
        message: impl Fn(&S, &serde_json::Value) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.body.push(ItemStep::Query(ItemDispatch {
            name: name.into(),
            message: Arc::new(message),
            only_when: None,
        }));
        self
    }

    /// Publish an event per item
    pub fn publish(
        mut self,
        name: impl Into<String>,
        message: impl Fn(&S, &serde_json::Value) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.body.push(ItemStep::Publish(ItemDispatch {
            name: name.into(),
            message: Arc::new(message),
            only_when: None,
        }));
        self
    }

    /// Guard the previous body step for each item
    pub fn only_when(
        mut self,
        predicate: impl Fn(&S, &serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        match self.body.last_mut() {
            Some(ItemStep::Send(d)) | Some(ItemStep::Query(d)) | Some(ItemStep::Publish(d)) => {
                d.only_when = Some(Arc::new(predicate));
            }
            None => self
                .errors
                .push("only_when requires a preceding body step".into()),
        }
        self
    }

    /// Hook invoked per successful item
    pub fn on_item_success(
        mut self,
        hook: impl Fn(&mut S, usize, &serde_json::Value) + Send + Sync + 'static,
    ) -> Self {
        self.on_item_success = Some(Arc::new(hook));
        self
    }

    /// Hook invoked per failed item
    pub fn on_item_fail(
        mut self,
        hook: impl Fn(&mut S, usize, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_item_fail = Some(Arc::new(hook));
        self
    }

    /// Hook invoked once after the loop completes
    pub fn on_complete(mut self, hook: impl Fn(&mut S) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }
}

/// Builder for WhenAll children
pub struct WhenAllBuilder<S: FlowState> {
    children: Vec<crate::program::MessageFactory<S>>,
    on_any_fail: Option<crate::program::MessageFactory<S>>,
}

impl<S: FlowState> WhenAllBuilder<S> {
    fn new() -> Self {
        Self {
            children: Vec::new(),
            on_any_fail: None,
        }
    }

    /// Spawn a child flow with this start message
    pub fn child(mut self, start: impl Fn(&S) -> Message + Send + Sync + 'static) -> Self {
        self.children.push(Arc::new(start));
        self
    }

    /// Compensation dispatched when any child fails or the wait times out
    pub fn on_any_fail(mut self, message: impl Fn(&S) -> Message + Send + Sync + 'static) -> Self {
        self.on_any_fail = Some(Arc::new(message));
        self
    }
}

/// Builder for WhenAny children
pub struct WhenAnyBuilder<S: FlowState> {
    children: Vec<crate::program::MessageFactory<S>>,
    cancel_others: bool,
    into: Option<crate::program::IntoMapper<S>>,
}

impl<S: FlowState> WhenAnyBuilder<S> {
    fn new() -> Self {
        Self {
            children: Vec::new(),
            cancel_others: true,
            into: None,
        }
    }

    /// Spawn a child flow with this start message
    pub fn child(mut self, start: impl Fn(&S) -> Message + Send + Sync + 'static) -> Self {
        self.children.push(Arc::new(start));
        self
    }

    /// Whether to cancel the losers once a child wins (default true)
    pub fn cancel_others(mut self, cancel_others: bool) -> Self {
        self.cancel_others = cancel_others;
        self
    }

    /// Map the winning child's result into state
    pub fn into_state(
        mut self,
        mapper: impl Fn(&mut S, &serde_json::Value) + Send + Sync + 'static,
    ) -> Self {
        self.into = Some(Arc::new(mapper));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn msg(name: &'static str) -> impl Fn(&Value) -> Message + Send + Sync + 'static {
        move |_| Message::new(name, json!({}))
    }

    #[test]
    fn test_build_simple_program() {
        let program = Program::<Value>::build("demo", |flow| {
            flow.send("a", msg("a")).query("b", msg("b")).publish("c", msg("c"))
        })
        .unwrap();
        assert_eq!(program.steps().len(), 3);
        assert_eq!(program.steps()[1].kind(), "query");
    }

    #[test]
    fn test_empty_program_rejected() {
        let result = Program::<Value>::build("demo", |flow| flow);
        assert!(matches!(result, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_if_chain_slots() {
        let program = Program::<Value>::build("demo", |flow| {
            flow.if_(|_: &Value| true, |t| t.send("t", msg("t")))
                .else_if(|_: &Value| false, |b| b.send("ei", msg("ei")))
                .else_(|e| e.send("e", msg("e")))
        })
        .unwrap();

        let step = &program.steps()[0];
        assert_eq!(step.branch(0).unwrap()[0].name(), "t");
        assert_eq!(step.branch(1).unwrap()[0].name(), "ei");
        assert_eq!(step.branch(2).unwrap()[0].name(), "e");
        assert!(step.branch(3).is_none());
    }

    #[test]
    fn test_switch_case_after_default_rejected() {
        let result = Program::<Value>::build("demo", |flow| {
            flow.switch(
                |_| Some("x".to_string()),
                |sw| {
                    sw.default(|b| b.send("d", msg("d")))
                        .case("x", |b| b.send("x", msg("x")))
                },
            )
        });
        assert!(matches!(result, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_modifier_without_dispatch_rejected() {
        let result = Program::<Value>::build("demo", |flow| {
            flow.delay("wait", Duration::from_secs(1)).optional()
        });
        assert!(matches!(result, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_empty_when_all_rejected() {
        let result = Program::<Value>::build("demo", |flow| {
            flow.when_all("fan", Duration::from_secs(5), |w| w)
        });
        assert!(matches!(result, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_empty_foreach_body_rejected() {
        let result = Program::<Value>::build("demo", |flow| {
            flow.for_each("loop", |_| None, |fe| fe.batch_size(4))
        });
        assert!(matches!(result, Err(FlowError::Configuration(_))));
    }

    #[test]
    fn test_foreach_configuration_applied() {
        let program = Program::<Value>::build("demo", |flow| {
            flow.for_each(
                "loop",
                |_| Some(vec![json!(1)]),
                |fe| {
                    fe.batch_size(2)
                        .parallelism(4)
                        .policy(FailurePolicy::CollectErrors)
                        .send("per-item", |_, item| Message::new("item", item.clone()))
                        .only_when(|_, item| !item.is_null())
                },
            )
        })
        .unwrap();

        if let Step::ForEach(fe) = &program.steps()[0] {
            assert_eq!(fe.batch_size, 2);
            assert_eq!(fe.parallelism, 4);
            assert_eq!(fe.policy, FailurePolicy::CollectErrors);
            assert!(fe.body[0].dispatch().only_when.is_some());
        } else {
            panic!("expected foreach step");
        }
    }
}
