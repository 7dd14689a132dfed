//! Secondary indexes over the session region.
//!
//! Two kinds of index exist:
//!
//! - the principal-name index (`principalNameIndex`), always present, over the
//!   principal name cached on each stored session;
//! - the session-attributes index (`sessionAttributesIndex`), present when
//!   indexable attributes are configured, over the values of those attributes.
//!
//! Indexes are created once when the repository starts and live as long as
//! the region. Lookups against attributes that are not indexed still work; the
//! region answers them by scanning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::record::{AttributeValue, SessionState};
use crate::region::Region;

/// Index name callers use to look sessions up by principal name.
pub const PRINCIPAL_NAME_INDEX_NAME: &str = "PRINCIPAL_NAME_INDEX_NAME";

/// Name of the region index over principal names.
pub const PRINCIPAL_NAME_INDEX: &str = "principalNameIndex";

/// Name of the region index over indexable session attributes.
pub const SESSION_ATTRIBUTES_INDEX: &str = "sessionAttributesIndex";

/// JSON pointer to the principal name inside a security context attribute.
const SECURITY_CONTEXT_PRINCIPAL_POINTER: &str = "/authentication/name";

/// A queryable field of a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryField {
    PrincipalName,
    Attribute(String),
}

impl QueryField {
    /// Indexed value of this field on `state`, if present.
    pub fn extract(&self, state: &SessionState) -> Option<String> {
        match self {
            QueryField::PrincipalName => state.principal_name.clone(),
            QueryField::Attribute(key) => state.attributes.get(key).map(index_value),
        }
    }
}

impl std::fmt::Display for QueryField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryField::PrincipalName => write!(f, "principalName"),
            QueryField::Attribute(key) => write!(f, "attributes['{key}']"),
        }
    }
}

/// Canonical string form of an attribute value for index keys.
///
/// Strings index as themselves, everything else as its JSON text.
pub fn index_value(value: &AttributeValue) -> String {
    match value {
        AttributeValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What an index covers, in its textual query form.
///
/// ```text
/// principalName
/// attributes['firstName','lastName']
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexExpression {
    PrincipalName,
    Attributes(Vec<String>),
}

impl IndexExpression {
    /// Parse the textual form.
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        let text = text.trim();
        if text == "principalName" {
            return Ok(IndexExpression::PrincipalName);
        }

        let keys = text
            .strip_prefix("attributes[")
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| format!("unrecognized index expression \"{text}\""))?;

        let mut parsed = Vec::new();
        for key in keys.split(',') {
            let key = key
                .trim()
                .strip_prefix('\'')
                .and_then(|k| k.strip_suffix('\''))
                .ok_or_else(|| format!("attribute key must be quoted in \"{text}\""))?;
            parsed.push(key.to_string());
        }

        let expression = IndexExpression::Attributes(parsed);
        expression.validate()?;
        Ok(expression)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let IndexExpression::Attributes(keys) = self else {
            return Ok(());
        };
        if keys.is_empty() {
            return Err("attribute index needs at least one attribute".to_string());
        }
        for key in keys {
            validate_attribute_key(key)?;
        }
        Ok(())
    }

    /// Fields this expression indexes.
    pub fn fields(&self) -> Vec<QueryField> {
        match self {
            IndexExpression::PrincipalName => vec![QueryField::PrincipalName],
            IndexExpression::Attributes(keys) => {
                keys.iter().cloned().map(QueryField::Attribute).collect()
            }
        }
    }

    /// Whether lookups on `field` can use this index.
    pub fn covers(&self, field: &QueryField) -> bool {
        match (self, field) {
            (IndexExpression::PrincipalName, QueryField::PrincipalName) => true,
            (IndexExpression::Attributes(keys), QueryField::Attribute(key)) => keys.contains(key),
            _ => false,
        }
    }
}

impl std::fmt::Display for IndexExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexExpression::PrincipalName => write!(f, "principalName"),
            IndexExpression::Attributes(keys) => {
                let quoted: Vec<String> = keys.iter().map(|k| format!("'{k}'")).collect();
                write!(f, "attributes[{}]", quoted.join(","))
            }
        }
    }
}

fn validate_attribute_key(key: &str) -> std::result::Result<(), String> {
    if key.trim().is_empty() {
        return Err("attribute key is blank".to_string());
    }
    if key.trim() != key {
        return Err(format!("attribute key \"{key}\" has surrounding whitespace"));
    }
    if let Some(c) = key
        .chars()
        .find(|c| matches!(c, '\'' | '"' | '[' | ']' | ',') || c.is_control())
    {
        return Err(format!("attribute key \"{key}\" contains illegal character {c:?}"));
    }
    Ok(())
}

/// A named index over the session region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    pub name: String,
    pub expression: IndexExpression,
}

impl IndexDefinition {
    /// Build a definition, rejecting malformed names or expressions.
    pub fn new(name: impl Into<String>, expression: IndexExpression) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::IndexCreation {
                name,
                reason: "index names must be non-empty and alphanumeric".to_string(),
            });
        }
        expression
            .validate()
            .map_err(|reason| Error::IndexCreation {
                name: name.clone(),
                reason,
            })?;
        Ok(Self { name, expression })
    }

    /// Build a definition from the textual expression form.
    pub fn parse(name: impl Into<String>, expression: &str) -> Result<Self> {
        let name = name.into();
        let expression = IndexExpression::parse(expression).map_err(|reason| {
            Error::IndexCreation {
                name: name.clone(),
                reason,
            }
        })?;
        Self::new(name, expression)
    }

    /// The always-present principal name index.
    pub fn principal_name() -> Self {
        Self {
            name: PRINCIPAL_NAME_INDEX.to_string(),
            expression: IndexExpression::PrincipalName,
        }
    }
}

/// Derives the principal name cached on each session for the principal index.
///
/// The principal attribute wins when it holds a string. Otherwise the
/// security context attribute, if configured, is searched for
/// `/authentication/name`.
#[derive(Debug, Clone)]
pub struct PrincipalNameResolver {
    principal_attribute: String,
    security_context_attribute: Option<String>,
}

impl PrincipalNameResolver {
    pub fn new(
        principal_attribute: impl Into<String>,
        security_context_attribute: Option<String>,
    ) -> Self {
        Self {
            principal_attribute: principal_attribute.into(),
            security_context_attribute,
        }
    }

    /// Resolver for the configured principal and security context attributes.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.principal_name_attribute.clone(),
            config.security_context_attribute.clone(),
        )
    }

    /// Attribute read first for the principal name.
    pub fn principal_attribute(&self) -> &str {
        &self.principal_attribute
    }

    /// Principal name of a session with `attributes`, if any.
    pub fn resolve(&self, attributes: &HashMap<String, AttributeValue>) -> Option<String> {
        if let Some(AttributeValue::String(name)) = attributes.get(&self.principal_attribute) {
            return Some(name.clone());
        }

        self.security_context_attribute
            .as_ref()
            .and_then(|key| attributes.get(key))
            .and_then(|ctx| ctx.pointer(SECURITY_CONTEXT_PRINCIPAL_POINTER))
            .and_then(AttributeValue::as_str)
            .map(str::to_string)
    }
}

/// Owns the configured index set and answers index-name lookups.
#[derive(Debug)]
pub struct IndexManager {
    definitions: Vec<IndexDefinition>,
    principal_attribute: String,
    ready: AtomicBool,
}

impl IndexManager {
    /// Validate and build the index set for `config`.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let mut definitions = vec![IndexDefinition::principal_name()];
        if !config.indexable_attributes.is_empty() {
            definitions.push(IndexDefinition::new(
                SESSION_ATTRIBUTES_INDEX,
                IndexExpression::Attributes(config.indexable_attributes.clone()),
            )?);
        }

        Ok(Self {
            definitions,
            principal_attribute: config.principal_name_attribute.clone(),
            ready: AtomicBool::new(false),
        })
    }

    /// Indexes created at startup.
    pub fn definitions(&self) -> &[IndexDefinition] {
        &self.definitions
    }

    /// Whether every index was created.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Create every index on `region`. Safe to call more than once.
    pub async fn initialize(&self, region: &dyn Region) -> Result<()> {
        for definition in &self.definitions {
            let created = region.create_index(definition).await?;
            debug!(
                region = %region.name(),
                index = %definition.name,
                expression = %definition.expression,
                created,
                "Session index ready"
            );
        }
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Field queried for a caller-facing index name.
    pub fn resolve(&self, index_name: &str) -> QueryField {
        if index_name == PRINCIPAL_NAME_INDEX_NAME || index_name == self.principal_attribute {
            QueryField::PrincipalName
        } else {
            QueryField::Attribute(index_name.to_string())
        }
    }

    /// Stored sessions whose `index_name` field equals `value`.
    pub async fn find(
        &self,
        region: &dyn Region,
        index_name: &str,
        value: &str,
    ) -> Result<Vec<SessionState>> {
        if !self.is_ready() {
            return Err(Error::IndexNotReady(index_name.to_string()));
        }
        region.query(&self.resolve(index_name), value).await
    }
}
