//! Server-side feature flag SDK: flags are evaluated locally against a copy of the environment's
//! flag and segment definitions, kept fresh in the background.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that evaluates feature flags for [`Target`]s, where each
//! target has a stable identifier and key-value attributes associated with it. Evaluation is
//! local and deterministic: percentage rollouts hash the target with MurmurHash3, so every SDK
//! implementation assigns the same target to the same bucket.
//!
//! Definitions are held in a versioned [`Repository`]. A [`Poller`] refreshes it periodically and
//! a [`Streamer`] applies push updates as they happen; while the stream is connected polling is
//! paused, and it resumes as soon as the stream drops.
//!
//! # Error Handling
//!
//! Evaluation never fails: a missing flag, a kind mismatch or an undecodable value resolve to the
//! default passed by the caller, and a warning is logged. Errors are represented by the [`Error`]
//! enum and surface only from lifecycle calls such as [`Client::wait_for_initialization`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, all
//! under the `ff` target. Lifecycle messages carry a stable [`SdkCode`]. Consider integrating a
//! `log`-compatible logger implementation for better visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod api;
mod backoff;
mod cache;
mod clause;
mod client;
mod config;
mod coordinator;
mod distribution;
mod error;
mod evaluator;
mod event_bus;
mod http_api;
mod metrics;
mod models;
mod poller;
mod repository;
mod sdk_codes;
mod streamer;
mod target;
#[cfg(test)]
mod testing;

pub use api::{ByteStream, ClientApi};
pub use cache::{AsyncKeyValueStore, CacheValue, InMemoryCache, InMemoryStore, KeyValueCache};
pub use client::Client;
pub use config::ClientConfig;
pub use coordinator::InitState;
pub use error::{Error, Result};
pub use evaluator::{Evaluator, OnEvaluation};
pub use event_bus::{EventBus, SdkEvent};
pub use http_api::{AuthInfo, HttpClientApi};
pub use metrics::MetricsProcessor;
pub use models::{
    Clause, Distribution, FeatureConfig, FeatureKind, FeatureState, Operator, Prerequisite,
    Segment, Serve, ServingRule, TargetRef, Variation, VariationMap, WeightedVariation,
};
pub use poller::{Poller, PollerConfig, PollerState};
pub use repository::Repository;
pub use sdk_codes::SdkCode;
pub use streamer::{StreamState, Streamer, StreamerConfig};
pub use target::{AttributeValue, Attributes, Target};
