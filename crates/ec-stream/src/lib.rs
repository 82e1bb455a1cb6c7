//! Downstream consumers of `published` outbox rows.
//!
//! Both the projection processor and the subscriber dispatcher re-scan
//! published rows and track their own progress through the inbox and
//! retry-state tables; neither mutates outbox status, and neither depends
//! on the other's completion.

pub mod dispatcher;
pub mod projection;

pub use dispatcher::{
    DispatcherConfig, DispatchSummary, Subscriber, SubscriberDispatcher, SubscriberRegistration,
};
pub use projection::{ProjectionConfig, ProjectionHandler, ProjectionProcessor, ProjectionSummary};
