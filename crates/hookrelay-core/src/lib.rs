//! hookrelay-core: Event model and filter pipeline for work item forwarding.
//!
//! This crate provides:
//! - `InboundEvent`: The work item change notification as received from the webhook
//! - `OutboundMessage`: The reduced projection that is published to the broker
//! - `Pipeline`: An ordered chain of toggleable predicates deciding what gets forwarded

pub mod error;
pub mod event;
pub mod filter;
pub mod message;

pub use error::{CoreError, Result};
pub use event::{FieldChange, InboundEvent, Resource, Revision, fields};
pub use filter::{AllowList, Decision, Pipeline, Predicate, SkipReason, Stage, WORK_ITEM_UPDATED};
pub use message::OutboundMessage;
