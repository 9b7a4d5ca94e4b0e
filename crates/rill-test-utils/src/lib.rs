//! Reusable test fixtures for rill.

#![forbid(unsafe_code)]

mod fixtures;

pub use fixtures::{CollectingSubscriber, CountingDispatcher, FailingSubscriber, ManualProducer};
