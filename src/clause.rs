use crate::{
    models::{Clause, Operator},
    AttributeValue, Target,
};

impl Clause {
    /// Evaluate an attribute clause against the target.
    ///
    /// `segmentMatch` clauses need repository access and are resolved by the evaluator; here they
    /// never match.
    pub(crate) fn eval(&self, target: &Target) -> bool {
        if matches!(self.op, Operator::SegmentMatch | Operator::Unsupported) {
            return false;
        }
        let attribute = target.get_attr_value(&self.attribute);
        self.op.eval(attribute.as_deref(), &self.values) != self.negate
    }
}

impl Operator {
    /// Applying `Operator` to the values. Returns `false` if the operator cannot be applied to the
    /// attribute type or the attribute is missing.
    fn eval(&self, attribute: Option<&AttributeValue>, values: &[String]) -> bool {
        self.try_eval(attribute, values).unwrap_or(false)
    }

    /// Try applying `Operator` to the values, returning `None` if the operator cannot be applied.
    fn try_eval(&self, attribute: Option<&AttributeValue>, values: &[String]) -> Option<bool> {
        match attribute? {
            AttributeValue::String(s) => self.eval_string(s, values),
            AttributeValue::Number(n) => self.eval_number(*n, values),
            AttributeValue::Boolean(b) => self.eval_boolean(*b, values),
            AttributeValue::Null | AttributeValue::Json(_) => None,
        }
    }

    fn eval_string(&self, s: &str, values: &[String]) -> Option<bool> {
        if *self == Self::In {
            return Some(values.iter().any(|v| v == s));
        }
        let value = values.first()?;
        Some(match self {
            Self::Equal => s.to_lowercase() == value.to_lowercase(),
            Self::EqualSensitive => s == value,
            Self::StartsWith => s.starts_with(value.as_str()),
            Self::EndsWith => s.ends_with(value.as_str()),
            Self::Contains => s.contains(value.as_str()),
            Self::Gt => s > value.as_str(),
            _ => return None,
        })
    }

    fn eval_number(&self, n: f64, values: &[String]) -> Option<bool> {
        match self {
            Self::In => Some(
                values
                    .iter()
                    .filter_map(|v| v.trim().parse::<f64>().ok())
                    .any(|v| v == n),
            ),
            Self::Equal | Self::Gt => {
                let value: f64 = values.first()?.trim().parse().ok()?;
                Some(if *self == Self::Equal {
                    n == value
                } else {
                    n > value
                })
            }
            _ => None,
        }
    }

    fn eval_boolean(&self, b: bool, values: &[String]) -> Option<bool> {
        match self {
            Self::Equal => Some(b == values.first()?.eq_ignore_ascii_case("true")),
            Self::In => Some(values.iter().any(|v| v.eq_ignore_ascii_case(&b.to_string()))),
            _ => None,
        }
    }
}
