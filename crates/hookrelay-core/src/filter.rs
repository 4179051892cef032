//! Filter pipeline deciding which events are forwarded.
//!
//! The pipeline is an ordered list of predicates. Each predicate wraps one
//! [`Stage`] and an `enabled` flag; a disabled predicate is skipped, so a rule
//! can be switched on from configuration without touching the chain. The
//! first failing predicate short-circuits with a [`SkipReason`].

use crate::event::InboundEvent;
use crate::message::OutboundMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event kind forwarded by the standard pipeline.
pub const WORK_ITEM_UPDATED: &str = "workitem.updated";

/// Ordered set of assignee identities (`name <email>`), matched exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowList(Vec<String>);

impl AllowList {
    /// Create an allow-list, dropping duplicate entries but keeping order.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut list: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.into();
            if !list.contains(&entry) {
                list.push(entry);
            }
        }
        Self(list)
    }

    /// Exact, case-sensitive membership test.
    #[must_use]
    pub fn contains(&self, identity: &str) -> bool {
        self.0.iter().any(|entry| entry == identity)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// A single filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// `eventType` must equal the given kind.
    EventType(String),
    /// The update must set a non-blank new assignee.
    AssigneeChanged,
    /// The new assignee must be on the allow-list.
    AssigneeAllowed(AllowList),
    /// The revision's work item type must be one of the given types.
    WorkItemType(Vec<String>),
}

impl Stage {
    /// Stable name used in configuration and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::EventType(_) => "event_type",
            Self::AssigneeChanged => "assignee_changed",
            Self::AssigneeAllowed(_) => "assignee_allowed",
            Self::WorkItemType(_) => "work_item_type",
        }
    }

    fn check(&self, event: &InboundEvent) -> Result<(), SkipReason> {
        match self {
            Self::EventType(expected) => {
                if event.event_type == *expected {
                    Ok(())
                } else {
                    Err(SkipReason::EventType(event.event_type.clone()))
                }
            }
            Self::AssigneeChanged => match event.new_assignee() {
                Some(assignee) if !assignee.trim().is_empty() => Ok(()),
                _ => Err(SkipReason::NoAssigneeChange),
            },
            Self::AssigneeAllowed(allow_list) => {
                let assignee = event.new_assignee().unwrap_or_default();
                if allow_list.contains(assignee) {
                    Ok(())
                } else {
                    Err(SkipReason::AssigneeNotAllowed(assignee.to_string()))
                }
            }
            Self::WorkItemType(allowed) => match event.work_item_type() {
                Some(kind) if allowed.iter().any(|a| a == kind) => Ok(()),
                other => Err(SkipReason::WorkItemType(other.map(str::to_string))),
            },
        }
    }
}

/// A stage together with its on/off switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub stage: Stage,
    pub enabled: bool,
}

impl Predicate {
    /// An enabled predicate.
    #[must_use]
    pub const fn enabled(stage: Stage) -> Self {
        Self {
            stage,
            enabled: true,
        }
    }

    /// A predicate that is carried in the chain but not evaluated.
    #[must_use]
    pub const fn disabled(stage: Stage) -> Self {
        Self {
            stage,
            enabled: false,
        }
    }
}

/// Why an event was not forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Event kind is not forwarded.
    EventType(String),
    /// The update did not set an assignee.
    NoAssigneeChange,
    /// The new assignee is not on the allow-list.
    AssigneeNotAllowed(String),
    /// Work item type is not forwarded.
    WorkItemType(Option<String>),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventType(kind) => write!(f, "ignored event type '{kind}'"),
            Self::NoAssigneeChange => write!(f, "no modified assignee"),
            Self::AssigneeNotAllowed(who) => write!(f, "assignee '{who}' is not on the allow-list"),
            Self::WorkItemType(Some(kind)) => write!(f, "ignored work item type '{kind}'"),
            Self::WorkItemType(None) => write!(f, "work item type missing"),
        }
    }
}

/// Outcome of running the pipeline on one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Forward(OutboundMessage),
    Skip(SkipReason),
}

impl Decision {
    /// The message to publish, if the event passed.
    #[must_use]
    pub fn into_forward(self) -> Option<OutboundMessage> {
        match self {
            Self::Forward(message) => Some(message),
            Self::Skip(_) => None,
        }
    }
}

/// Ordered chain of predicates followed by the projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    predicates: Vec<Predicate>,
}

impl Pipeline {
    /// Create a pipeline from an explicit predicate list.
    #[must_use]
    pub const fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    /// The standard chain: event kind, assignee changed, assignee allowed,
    /// and a disabled work item type rule restricted to bugs.
    #[must_use]
    pub fn standard(allow_list: AllowList) -> Self {
        Self::with_rules(WORK_ITEM_UPDATED, allow_list, vec!["Bug".to_string()])
    }

    /// The standard chain with its event kind and work item types replaced.
    ///
    /// The work item type rule starts disabled; switch it on with
    /// [`Self::set_enabled`] under the name `work_item_type`.
    #[must_use]
    pub fn with_rules(
        event_type: impl Into<String>,
        allow_list: AllowList,
        work_item_types: Vec<String>,
    ) -> Self {
        Self::new(vec![
            Predicate::enabled(Stage::EventType(event_type.into())),
            Predicate::enabled(Stage::AssigneeChanged),
            Predicate::enabled(Stage::AssigneeAllowed(allow_list)),
            Predicate::disabled(Stage::WorkItemType(work_item_types)),
        ])
    }

    /// Predicates in evaluation order.
    #[must_use]
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Switch every predicate with the given stage name on or off.
    ///
    /// Returns `false` if no predicate has that name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for predicate in &mut self.predicates {
            if predicate.stage.name() == name {
                predicate.enabled = enabled;
                found = true;
            }
        }
        found
    }

    /// Run every enabled predicate in order and project on success.
    #[must_use]
    pub fn decide(&self, event: &InboundEvent) -> Decision {
        for predicate in self.predicates.iter().filter(|p| p.enabled) {
            if let Err(reason) = predicate.stage.check(event) {
                return Decision::Skip(reason);
            }
        }
        Decision::Forward(OutboundMessage::project(event))
    }

    /// The message to publish for this event, or `None` if it is filtered out.
    #[must_use]
    pub fn evaluate(&self, event: &InboundEvent) -> Option<OutboundMessage> {
        self.decide(event).into_forward()
    }
}
