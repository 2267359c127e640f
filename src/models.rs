//! Flag and segment definitions as served by the remote service.
use serde::{Deserialize, Deserializer, Serialize};

/// Definition of a feature flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FeatureConfig {
    /// Flag identifier.
    pub feature: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub environment: String,
    pub kind: FeatureKind,
    pub state: FeatureState,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variations: Vec<Variation>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<ServingRule>,
    pub default_serve: Serve,
    pub off_variation: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variation_to_target_map: Vec<VariationMap>,
    #[serde(default)]
    pub version: i64,
}

impl FeatureConfig {
    /// Find variation by its identifier.
    pub fn variation(&self, identifier: &str) -> Option<&Variation> {
        self.variations
            .iter()
            .find(|variation| variation.identifier == identifier)
    }

    /// Returns `true` if any rule or target map entry of this flag depends on `segment`.
    pub fn references_segment(&self, segment: &str) -> bool {
        let in_rules = self.rules.iter().any(|rule| {
            rule.clauses.iter().any(|clause| {
                clause.op == Operator::SegmentMatch && clause.values.iter().any(|v| v == segment)
            })
        });
        in_rules
            || self
                .variation_to_target_map
                .iter()
                .any(|map| map.target_segments.iter().any(|s| s == segment))
    }
}

/// Type of flag variations.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum FeatureKind {
    Boolean,
    Int,
    String,
    Json,
}

/// Whether the flag is switched on.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum FeatureState {
    On,
    Off,
}

/// One possible output of a flag. The value is always stored as a string and decoded according to
/// the flag's [`FeatureKind`] at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variation {
    pub identifier: String,
    pub value: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Prioritized rule: serve `serve` when all `clauses` match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct ServingRule {
    #[serde(default)]
    pub rule_id: Option<String>,
    /// Rules are evaluated in ascending priority.
    #[serde(default)]
    pub priority: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub clauses: Vec<Clause>,
    pub serve: Serve,
}

/// What to serve: either a literal variation or a percentage rollout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Serve {
    #[serde(default)]
    pub distribution: Option<Distribution>,
    #[serde(default)]
    pub variation: Option<String>,
}

/// Weighted percentage rollout across variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Distribution {
    /// Target attribute the rollout is bucketed by.
    pub bucket_by: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variations: Vec<WeightedVariation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct WeightedVariation {
    pub variation: String,
    pub weight: i64,
}

/// A single attribute-operator-values predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Clause {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub attribute: String,
    pub op: Operator,
    #[serde(default, deserialize_with = "null_as_default")]
    pub values: Vec<String>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause operators.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum Operator {
    /// Case-insensitive string equality.
    #[serde(rename = "equal")]
    Equal,
    /// Case-sensitive string equality.
    #[serde(rename = "equal_sensitive")]
    EqualSensitive,
    /// Attribute is one of the clause values.
    #[serde(rename = "in")]
    In,
    #[serde(rename = "starts_with")]
    #[allow(missing_docs)]
    StartsWith,
    #[serde(rename = "ends_with")]
    #[allow(missing_docs)]
    EndsWith,
    #[serde(rename = "contains")]
    #[allow(missing_docs)]
    Contains,
    /// Greater than: numeric for numbers, lexicographic for strings.
    #[serde(rename = "gt")]
    Gt,
    /// Target is a member of one of the segments listed in clause values.
    #[serde(rename = "segmentMatch", alias = "segment_match")]
    SegmentMatch,
    /// Operator unknown to this SDK version. Never matches.
    #[serde(other)]
    Unsupported,
}

/// Flag dependency: `feature` must evaluate to one of `variations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Prerequisite {
    pub feature: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub variations: Vec<String>,
}

/// Explicit override: serve `variation` to the listed targets and members of listed segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct VariationMap {
    pub variation: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub targets: Vec<TargetRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub target_segments: Vec<String>,
}

/// Reference to a target in explicit target lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct TargetRef {
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl From<&str> for TargetRef {
    fn from(identifier: &str) -> Self {
        TargetRef {
            identifier: identifier.to_owned(),
            name: None,
        }
    }
}

/// Named, reusable target-membership predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Segment {
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub included: Vec<TargetRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub excluded: Vec<TargetRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<Clause>,
    #[serde(default)]
    pub version: i64,
}

impl Segment {
    pub(crate) fn includes(&self, identifier: &str) -> bool {
        self.included.iter().any(|t| t.identifier == identifier)
    }

    pub(crate) fn excludes(&self, identifier: &str) -> bool {
        self.excluded.iter().any(|t| t.identifier == identifier)
    }
}

// The server sends `null` for empty lists.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::{FeatureConfig, FeatureKind, FeatureState, Operator, Segment};

    #[test]
    fn parse_feature_config_with_nulls() {
        let flag: FeatureConfig = serde_json::from_str(
            r#"{
                "feature": "bool-flag",
                "project": "demo",
                "environment": "dev",
                "kind": "boolean",
                "state": "on",
                "variations": [
                    {"identifier": "true", "value": "true", "name": "True"},
                    {"identifier": "false", "value": "false", "name": "False"}
                ],
                "rules": null,
                "defaultServe": {"variation": "true"},
                "offVariation": "false",
                "prerequisites": null,
                "variationToTargetMap": null,
                "version": 3
            }"#,
        )
        .unwrap();

        assert_eq!(flag.kind, FeatureKind::Boolean);
        assert_eq!(flag.state, FeatureState::On);
        assert!(flag.rules.is_empty());
        assert!(flag.prerequisites.is_empty());
        assert_eq!(flag.variation("false").map(|v| v.value.as_str()), Some("false"));
        assert_eq!(flag.version, 3);
    }

    #[test]
    fn unknown_operator_is_unsupported() {
        let op: Operator = serde_json::from_str(r#""match_regex""#).unwrap();
        assert_eq!(op, Operator::Unsupported);

        let op: Operator = serde_json::from_str(r#""segmentMatch""#).unwrap();
        assert_eq!(op, Operator::SegmentMatch);
        let op: Operator = serde_json::from_str(r#""segment_match""#).unwrap();
        assert_eq!(op, Operator::SegmentMatch);
    }

    #[test]
    fn references_segment_via_rules_and_target_map() {
        let flag: FeatureConfig = serde_json::from_str(
            r#"{
                "feature": "f",
                "kind": "string",
                "state": "on",
                "variations": [{"identifier": "a", "value": "a"}],
                "rules": [{
                    "priority": 1,
                    "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["beta"]}],
                    "serve": {"variation": "a"}
                }],
                "variationToTargetMap": [{"variation": "a", "targets": [], "targetSegments": ["qa"]}],
                "defaultServe": {"variation": "a"},
                "offVariation": "a"
            }"#,
        )
        .unwrap();

        assert!(flag.references_segment("beta"));
        assert!(flag.references_segment("qa"));
        assert!(!flag.references_segment("other"));
    }

    #[test]
    fn segment_membership_lists() {
        let segment: Segment = serde_json::from_str(
            r#"{
                "identifier": "beta",
                "name": "Beta users",
                "included": [{"identifier": "alice"}],
                "excluded": [{"identifier": "bob", "name": "Bob"}],
                "rules": null,
                "version": 1
            }"#,
        )
        .unwrap();

        assert!(segment.includes("alice"));
        assert!(segment.excludes("bob"));
        assert!(!segment.includes("bob"));
    }
}
