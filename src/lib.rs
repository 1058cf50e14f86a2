#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_wraps
)]

//! Request/reply over at-least-once message queues.
//!
//! A caller attaches a [`ReplyQueue`] to a [`RequestMessage`], sends it with
//! any [`Publisher`], and waits on [`RequestMessage::get_response`]. A
//! responder runs a [`MessagePoller`] whose handler output is routed back to
//! the caller's reply queue. Abandoned reply queues are reclaimed by the
//! [`IdleQueueSweeper`] protocol without a coordinator.

pub mod config;
pub mod error;
pub mod message;
pub mod observability;
pub mod publisher;
pub mod reply_queue;
pub mod subscriber;
pub mod sweeper;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{Message, MessageBatch, RequestMessage, REPLY_TO, REQUEST_MESSAGE_ID};
pub use observability::{Observer, ObserverEvent, ObserverMetric};
pub use publisher::{
    Delivery, JsonlOutbox, MemoryOutbox, Outbox, Publisher, QueuePublisher, RetryingPublisher,
};
pub use reply_queue::{ReplyQueue, ReplyQueueState};
pub use subscriber::{EchoResponseBuilder, MessageHandler, MessagePoller, ResponseBuilder, Subscriber};
pub use sweeper::IdleQueueSweeper;
pub use transport::{InMemoryTransport, Transport};
