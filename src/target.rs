use std::{borrow::Cow, collections::HashMap};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing key-value pairs of target attributes.
///
/// # Examples
/// ```
/// # use ff_server_sdk::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("beta".to_owned(), true.into()),
///     ("email".to_owned(), "john@example.com".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Value of a target attribute.
///
/// Clause operators dispatch on the variant: strings support every string operator, numbers and
/// booleans a subset, and objects/null never match.
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A boolean value.
    Boolean(bool),
    /// A numerical value.
    Number(f64),
    /// A string value.
    String(String),
    /// A null value or absence of value.
    Null,
    /// An object or array value.
    Json(serde_json::Value),
}

impl AttributeValue {
    /// Returns the string value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// String form used as input to the bucketing hash. `None` for values that cannot be bucketed.
    pub(crate) fn to_bucket_key(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) if !s.is_empty() => Some(s.clone()),
            AttributeValue::Number(n) => Some(n.to_string()),
            AttributeValue::Boolean(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

/// The evaluation context: an end-user or session the flag is evaluated for.
///
/// `identifier` must be stable for the same user, as it is used for explicit targeting and as the
/// fallback bucketing key of percentage rollouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Unique identifier of the target.
    pub identifier: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Whether the target is anonymous.
    #[serde(default)]
    pub anonymous: bool,
    /// Free-form attributes used by clauses and rollouts.
    #[serde(default)]
    pub attributes: Attributes,
}

impl Target {
    /// Create a target with the given identifier and no attributes.
    pub fn new(identifier: impl Into<String>) -> Target {
        Target {
            identifier: identifier.into(),
            name: None,
            anonymous: false,
            attributes: Attributes::new(),
        }
    }

    /// Set target name.
    pub fn with_name(mut self, name: impl Into<String>) -> Target {
        self.name = Some(name.into());
        self
    }

    /// Mark target as anonymous.
    pub fn with_anonymous(mut self, anonymous: bool) -> Target {
        self.anonymous = anonymous;
        self
    }

    /// Add an attribute.
    ///
    /// ```
    /// # use ff_server_sdk::Target;
    /// let target = Target::new("user-1")
    ///     .with_attribute("email", "user@example.com")
    ///     .with_attribute("age", 42.0);
    /// ```
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Target {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Resolve an attribute by name. Built-in fields (`identifier`, `name`, `anonymous`) take
    /// precedence over custom attributes with the same name.
    pub(crate) fn get_attr_value(&self, attribute: &str) -> Option<Cow<'_, AttributeValue>> {
        match attribute {
            "identifier" => Some(Cow::Owned(AttributeValue::String(self.identifier.clone()))),
            "name" if self.name.is_some() => self
                .name
                .as_ref()
                .map(|name| Cow::Owned(AttributeValue::String(name.clone()))),
            "anonymous" => Some(Cow::Owned(AttributeValue::Boolean(self.anonymous))),
            _ => self.attributes.get(attribute).map(Cow::Borrowed),
        }
    }
}
