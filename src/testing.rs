//! Fixtures and fakes shared by unit tests.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};

use crate::{
    api::{ByteStream, ClientApi},
    models::{
        Clause, FeatureKind, FeatureState, Operator, Serve, ServingRule, Variation,
    },
    Error, FeatureConfig, Result, Segment,
};

pub(crate) fn variation(identifier: &str, value: &str) -> Variation {
    Variation {
        identifier: identifier.to_owned(),
        value: value.to_owned(),
        name: None,
    }
}

/// Boolean flag, on, serving `true` by default and `false` when off.
pub(crate) fn bool_flag(identifier: &str, version: i64) -> FeatureConfig {
    FeatureConfig {
        feature: identifier.to_owned(),
        project: "demo".to_owned(),
        environment: "dev".to_owned(),
        kind: FeatureKind::Boolean,
        state: FeatureState::On,
        variations: vec![variation("true", "true"), variation("false", "false")],
        rules: vec![],
        default_serve: serve("true"),
        off_variation: "false".to_owned(),
        prerequisites: vec![],
        variation_to_target_map: vec![],
        version,
    }
}

pub(crate) fn segment(identifier: &str, version: i64) -> Segment {
    Segment {
        identifier: identifier.to_owned(),
        name: identifier.to_owned(),
        included: vec![],
        excluded: vec![],
        rules: vec![],
        version,
    }
}

pub(crate) fn serve(variation: &str) -> Serve {
    Serve {
        distribution: None,
        variation: Some(variation.to_owned()),
    }
}

pub(crate) fn clause(attribute: &str, op: Operator, values: &[&str]) -> Clause {
    Clause {
        id: None,
        attribute: attribute.to_owned(),
        op,
        values: values.iter().map(|v| v.to_string()).collect(),
        negate: false,
    }
}

pub(crate) fn rule(priority: i64, clauses: Vec<Clause>, variation: &str) -> ServingRule {
    ServingRule {
        rule_id: Some(format!("rule-{priority}")),
        priority,
        clauses,
        serve: serve(variation),
    }
}

/// Rule serving `variation` to members of any of `segments`.
pub(crate) fn segment_rule(priority: i64, segments: &[&str], variation: &str) -> ServingRule {
    rule(
        priority,
        vec![clause("", Operator::SegmentMatch, segments)],
        variation,
    )
}

/// Scripted behavior of one stream connection.
pub(crate) enum FakeConnection {
    /// Deliver the chunks, then stay open.
    Open(Vec<String>),
    /// Deliver the chunks, then end the stream.
    Closing(Vec<String>),
    /// Fail to connect.
    Fail(Error),
}

/// In-memory [`ClientApi`].
#[derive(Default)]
pub(crate) struct FakeApi {
    pub flags: Mutex<Vec<FeatureConfig>>,
    pub segments: Mutex<Vec<Segment>>,
    /// Error returned by bulk fetches while set.
    pub fail_with: Mutex<Option<Error>>,
    pub connections: Mutex<VecDeque<FakeConnection>>,
    /// Delay applied to bulk flag fetches.
    pub latency: Mutex<Option<Duration>>,
    pub bulk_calls: AtomicUsize,
    pub single_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> FakeApi {
        FakeApi::default()
    }

    pub fn with_flags(self, flags: Vec<FeatureConfig>) -> FakeApi {
        *self.flags.lock().unwrap() = flags;
        self
    }

    pub fn with_segments(self, segments: Vec<Segment>) -> FakeApi {
        *self.segments.lock().unwrap() = segments;
        self
    }

    pub fn with_connection(self, connection: FakeConnection) -> FakeApi {
        self.connections.lock().unwrap().push_back(connection);
        self
    }

    pub fn with_latency(self, latency: Duration) -> FakeApi {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    pub fn fail_with(&self, error: Option<Error>) {
        *self.fail_with.lock().unwrap() = error;
    }

    pub fn put_flag(&self, flag: FeatureConfig) {
        let mut flags = self.flags.lock().unwrap();
        flags.retain(|f| f.feature != flag.feature);
        flags.push(flag);
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        match self.fail_with.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn chunks(lines: Vec<String>) -> stream::Iter<std::vec::IntoIter<Result<Bytes>>> {
    stream::iter(
        lines
            .into_iter()
            .map(|line| Ok(Bytes::from(line)))
            .collect::<Vec<_>>(),
    )
}

#[async_trait]
impl ClientApi for FakeApi {
    async fn get_feature_configs(&self, _environment: &str) -> Result<Vec<FeatureConfig>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.check_failure()?;
        Ok(self.flags.lock().unwrap().clone())
    }

    async fn get_segments(&self, _environment: &str) -> Result<Vec<Segment>> {
        self.check_failure()?;
        Ok(self.segments.lock().unwrap().clone())
    }

    async fn get_feature_config(
        &self,
        identifier: &str,
        _environment: &str,
    ) -> Result<FeatureConfig> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.flags
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.feature == identifier)
            .cloned()
            .ok_or_else(|| Error::NotFound(identifier.to_owned()))
    }

    async fn get_segment(&self, identifier: &str, _environment: &str) -> Result<Segment> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        self.segments
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.identifier == identifier)
            .cloned()
            .ok_or_else(|| Error::NotFound(identifier.to_owned()))
    }

    async fn open_stream(&self) -> Result<ByteStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let connection = self
            .connections
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeConnection::Open(vec![]));
        match connection {
            FakeConnection::Open(lines) => Ok(chunks(lines).chain(stream::pending()).boxed()),
            FakeConnection::Closing(lines) => Ok(chunks(lines).boxed()),
            FakeConnection::Fail(err) => Err(err),
        }
    }
}
