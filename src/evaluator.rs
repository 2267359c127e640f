//! Flag evaluation engine.
//!
//! The evaluator is a read-only view over the [`Repository`]. Evaluation is deterministic: for the
//! same stored definitions and target it always yields the same variation. Every miss (unknown
//! flag, kind mismatch, undecodable value) resolves to the caller-supplied default.
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    distribution::bucket,
    models::{
        Distribution, FeatureConfig, FeatureKind, FeatureState, Operator, Serve, ServingRule,
        Variation,
    },
    sdk_codes::SdkCode,
    Repository, Result, Target,
};

/// Callback invoked with the flag, the target and the served variation after every successful
/// evaluation.
pub type OnEvaluation<'a> = &'a (dyn Fn(&FeatureConfig, &Target, &Variation) + Send + Sync);

/// Evaluates flags stored in a [`Repository`].
pub struct Evaluator {
    repository: Arc<Repository>,
    /// Missing `bucketBy` attribute is only reported once per evaluator.
    bucket_by_warned: AtomicBool,
}

impl Evaluator {
    /// Create an evaluator reading from `repository`.
    pub fn new(repository: Arc<Repository>) -> Evaluator {
        Evaluator {
            repository,
            bucket_by_warned: AtomicBool::new(false),
        }
    }

    /// Evaluate a boolean flag. Variation values are matched against `true`/`false`
    /// case-insensitively.
    pub async fn bool_variation(
        &self,
        identifier: &str,
        target: &Target,
        default: bool,
        on_success: Option<OnEvaluation<'_>>,
    ) -> bool {
        self.variation(identifier, target, FeatureKind::Boolean, default, on_success, |value| {
            if value.eq_ignore_ascii_case("true") {
                Some(true)
            } else if value.eq_ignore_ascii_case("false") {
                Some(false)
            } else {
                None
            }
        })
        .await
    }

    /// Evaluate a string flag.
    pub async fn string_variation(
        &self,
        identifier: &str,
        target: &Target,
        default: String,
        on_success: Option<OnEvaluation<'_>>,
    ) -> String {
        self.variation(identifier, target, FeatureKind::String, default, on_success, |value| {
            Some(value.to_owned())
        })
        .await
    }

    /// Evaluate a number (`int` kind) flag.
    pub async fn number_variation(
        &self,
        identifier: &str,
        target: &Target,
        default: f64,
        on_success: Option<OnEvaluation<'_>>,
    ) -> f64 {
        self.variation(identifier, target, FeatureKind::Int, default, on_success, |value| {
            value.trim().parse().ok()
        })
        .await
    }

    /// Evaluate a JSON flag.
    pub async fn json_variation(
        &self,
        identifier: &str,
        target: &Target,
        default: serde_json::Value,
        on_success: Option<OnEvaluation<'_>>,
    ) -> serde_json::Value {
        self.variation(identifier, target, FeatureKind::Json, default, on_success, |value| {
            serde_json::from_str(value).ok()
        })
        .await
    }

    async fn variation<T>(
        &self,
        identifier: &str,
        target: &Target,
        kind: FeatureKind,
        default: T,
        on_success: Option<OnEvaluation<'_>>,
        decode: impl FnOnce(&str) -> Option<T>,
    ) -> T {
        let Some((flag, variation)) = self.evaluate(identifier, target, kind).await else {
            return default;
        };

        let Some(value) = decode(&variation.value) else {
            log::warn!(target: "ff",
                       flag_identifier = identifier,
                       target_identifier = target.identifier.as_str(),
                       value = variation.value.as_str();
                       "{} malformed {kind:?} value", SdkCode::DefaultServed);
            return default;
        };

        log::trace!(target: "ff",
                    flag_identifier = identifier,
                    target_identifier = target.identifier.as_str(),
                    variation = variation.identifier.as_str();
                    "evaluated a flag");

        if let Some(on_success) = on_success {
            on_success(&flag, target, &variation);
        }

        value
    }

    /// Resolve the variation served for `identifier` to `target`, or `None` if the flag is
    /// missing, has a different kind, or does not resolve to one of its variations.
    pub async fn evaluate(
        &self,
        identifier: &str,
        target: &Target,
        kind: FeatureKind,
    ) -> Option<(Arc<FeatureConfig>, Variation)> {
        let flag = match self.repository.get_flag(identifier, true).await {
            Ok(Some(flag)) => flag,
            Ok(None) => {
                log::warn!(target: "ff",
                           flag_identifier = identifier,
                           target_identifier = target.identifier.as_str();
                           "{} flag not found", SdkCode::DefaultServed);
                return None;
            }
            Err(err) => {
                log::warn!(target: "ff",
                           flag_identifier = identifier;
                           "{} error reading flag: {err}", SdkCode::DefaultServed);
                return None;
            }
        };

        if flag.kind != kind {
            log::warn!(target: "ff",
                       flag_identifier = identifier;
                       "{} requested {kind:?} but flag is {:?}", SdkCode::DefaultServed, flag.kind);
            return None;
        }

        let mut visited = HashSet::new();
        let resolved = match self.evaluate_flag(&flag, target, &mut visited).await {
            Ok(resolved) => resolved,
            Err(err) => {
                log::warn!(target: "ff",
                           flag_identifier = identifier;
                           "{} error evaluating flag: {err}", SdkCode::DefaultServed);
                return None;
            }
        };

        let Some(variation_identifier) = resolved else {
            log::warn!(target: "ff",
                       flag_identifier = identifier;
                       "{} no variation resolved", SdkCode::DefaultServed);
            return None;
        };
        let Some(variation) = flag.variation(&variation_identifier).cloned() else {
            log::warn!(target: "ff",
                       flag_identifier = identifier,
                       variation = variation_identifier.as_str();
                       "{} variation not found in flag", SdkCode::DefaultServed);
            return None;
        };

        Some((flag, variation))
    }

    /// Resolve the identifier of the served variation.
    ///
    /// `visited` holds the flags on the current prerequisite path. Reaching a flag that is already
    /// on the path resolves to `None`, which fails the dependent prerequisite check.
    fn evaluate_flag<'a>(
        &'a self,
        flag: &'a FeatureConfig,
        target: &'a Target,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        async move {
            if !visited.insert(flag.feature.clone()) {
                log::warn!(target: "ff",
                           flag_identifier = flag.feature.as_str();
                           "prerequisite cycle detected");
                return Ok(None);
            }
            let result = self.resolve_variation(flag, target, visited).await;
            visited.remove(&flag.feature);
            result
        }
        .boxed()
    }

    async fn resolve_variation(
        &self,
        flag: &FeatureConfig,
        target: &Target,
        visited: &mut HashSet<String>,
    ) -> Result<Option<String>> {
        if !self.check_prerequisites(flag, target, visited).await? {
            return Ok(Some(flag.off_variation.clone()));
        }

        if flag.state == FeatureState::Off {
            return Ok(Some(flag.off_variation.clone()));
        }

        if let Some(variation) = self.evaluate_target_map(flag, target).await? {
            return Ok(Some(variation));
        }

        if let Some(rule) = self.find_matching_rule(&flag.rules, target).await? {
            if let Some(variation) = self.evaluate_serve(&rule.serve, target) {
                return Ok(Some(variation));
            }
        }

        Ok(self.evaluate_serve(&flag.default_serve, target))
    }

    async fn check_prerequisites(
        &self,
        flag: &FeatureConfig,
        target: &Target,
        visited: &mut HashSet<String>,
    ) -> Result<bool> {
        for prerequisite in &flag.prerequisites {
            let Some(parent) = self.repository.get_flag(&prerequisite.feature, true).await? else {
                log::debug!(target: "ff",
                            flag_identifier = flag.feature.as_str(),
                            prerequisite = prerequisite.feature.as_str();
                            "prerequisite flag not found");
                return Ok(false);
            };

            let resolved = self.evaluate_flag(&parent, target, visited).await?;
            let passed = resolved.is_some_and(|variation| prerequisite.variations.contains(&variation));
            if !passed {
                log::debug!(target: "ff",
                            flag_identifier = flag.feature.as_str(),
                            prerequisite = prerequisite.feature.as_str(),
                            target_identifier = target.identifier.as_str();
                            "prerequisite not satisfied");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn evaluate_target_map(
        &self,
        flag: &FeatureConfig,
        target: &Target,
    ) -> Result<Option<String>> {
        for map in &flag.variation_to_target_map {
            if map.targets.iter().any(|t| t.identifier == target.identifier) {
                return Ok(Some(map.variation.clone()));
            }
            if !map.target_segments.is_empty()
                && self.is_in_segments(&map.target_segments, target).await?
            {
                return Ok(Some(map.variation.clone()));
            }
        }
        Ok(None)
    }

    /// First rule, in ascending priority, whose clauses all match.
    async fn find_matching_rule<'r>(
        &self,
        rules: &'r [ServingRule],
        target: &Target,
    ) -> Result<Option<&'r ServingRule>> {
        let mut ordered: Vec<&ServingRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| rule.priority);

        for rule in ordered {
            if self.rule_matches(rule, target).await? {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    async fn rule_matches(&self, rule: &ServingRule, target: &Target) -> Result<bool> {
        for clause in &rule.clauses {
            let matched = if clause.op == Operator::SegmentMatch {
                self.is_in_segments(&clause.values, target).await? != clause.negate
            } else {
                clause.eval(target)
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Segment membership over a list of segment identifiers. The first segment that decides
    /// (excluded or included) wins; unknown segments are skipped.
    async fn is_in_segments(&self, segments: &[String], target: &Target) -> Result<bool> {
        for identifier in segments {
            let Some(segment) = self.repository.get_segment(identifier, true).await? else {
                continue;
            };

            if segment.excludes(&target.identifier) {
                return Ok(false);
            }
            if segment.includes(&target.identifier) {
                return Ok(true);
            }
            if segment.rules.iter().any(|clause| clause.eval(target)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn evaluate_serve(&self, serve: &Serve, target: &Target) -> Option<String> {
        if let Some(variation) = &serve.variation {
            return Some(variation.clone());
        }
        serve
            .distribution
            .as_ref()
            .and_then(|distribution| self.evaluate_distribution(distribution, target))
    }

    fn evaluate_distribution(&self, distribution: &Distribution, target: &Target) -> Option<String> {
        let attribute = target
            .get_attr_value(&distribution.bucket_by)
            .and_then(|value| value.to_bucket_key());

        let (bucket_by, value) = match attribute {
            Some(value) => (distribution.bucket_by.as_str(), value),
            None => {
                if !self.bucket_by_warned.swap(true, Ordering::Relaxed) {
                    log::warn!(target: "ff",
                               bucket_by = distribution.bucket_by.as_str(),
                               target_identifier = target.identifier.as_str();
                               "bucketBy attribute not found in target, falling back to identifier");
                }
                ("identifier", target.identifier.clone())
            }
        };

        distribution
            .select(bucket(bucket_by, &value))
            .map(str::to_owned)
    }
}
