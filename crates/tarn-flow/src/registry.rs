//! Registered request constructs.
//!
//! Archives, processors, and responders are pluggable: each registers a
//! type name, the operations it supports, a first-level attribute schema
//! per operation, and (implicitly, by naming convention) the event target
//! its workers listen on. The orchestration core validates instruction
//! bodies against these registrations before submitting anything.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The three construct categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstructType {
    /// Answers lookup instructions with content entries.
    Archive,
    /// Transforms aggregated lookup results.
    Processor,
    /// Reduces processed entries to a single response.
    Responder,
}

impl ConstructType {
    /// The instruction-body attribute naming a construct of this type.
    #[must_use]
    pub const fn body_attribute(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Processor => "processor",
            Self::Responder => "responder",
        }
    }

    /// The operation every construct of this type must support.
    #[must_use]
    pub const fn required_operation(&self) -> ConstructOperation {
        match self {
            Self::Archive => ConstructOperation::Lookup,
            Self::Processor => ConstructOperation::Process,
            Self::Responder => ConstructOperation::Respond,
        }
    }
}

impl fmt::Display for ConstructType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive => write!(f, "ARCHIVE"),
            Self::Processor => write!(f, "PROCESSOR"),
            Self::Responder => write!(f, "RESPONDER"),
        }
    }
}

/// Operations a construct can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstructOperation {
    /// Archive lookup.
    Lookup,
    /// Processing pass.
    Process,
    /// Responding pass.
    Respond,
}

impl fmt::Display for ConstructOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lookup => write!(f, "lookup"),
            Self::Process => write!(f, "process"),
            Self::Respond => write!(f, "respond"),
        }
    }
}

/// First-level attribute schema for one operation's instruction body.
///
/// Bodies are flat JSON objects at the level the core inspects; a schema
/// names the attributes that must be present (and non-null). Deeper
/// structure is the construct worker's business.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstructSchema {
    /// Attributes the body must carry.
    pub required_attributes: BTreeSet<String>,
}

impl ConstructSchema {
    /// Creates a schema requiring the given attributes.
    #[must_use]
    pub fn requiring<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks a body against this schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] naming the construct and step when the
    /// body is not an object or a required attribute is missing or null.
    pub fn validate(&self, construct: &str, step: &str, body: &Value) -> Result<()> {
        let schema_err = |message: String| Error::Schema {
            construct: construct.to_string(),
            step: step.to_string(),
            message,
        };

        let Some(map) = body.as_object() else {
            return Err(schema_err("instruction body is not an object".into()));
        };

        for attribute in &self.required_attributes {
            match map.get(attribute) {
                None | Some(Value::Null) => {
                    return Err(schema_err(format!(
                        "missing required attribute '{attribute}'"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// One registered construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredConstruct {
    /// The construct category.
    pub construct_type: ConstructType,
    /// The registered type name (e.g. `VECTOR`, `SUMMARIZE`, `DIRECT`).
    pub type_name: String,
    /// Operations supported beyond the category's required one.
    pub additional_operations: BTreeSet<ConstructOperation>,
    /// Per-operation body schemas.
    pub schemas: BTreeMap<ConstructOperation, ConstructSchema>,
    /// When the construct was registered.
    pub registered_on: DateTime<Utc>,
}

impl RegisteredConstruct {
    /// Creates a registration with the category's required operation and
    /// no schemas.
    #[must_use]
    pub fn new(construct_type: ConstructType, type_name: impl Into<String>) -> Self {
        Self {
            construct_type,
            type_name: type_name.into(),
            additional_operations: BTreeSet::new(),
            schemas: BTreeMap::new(),
            registered_on: Utc::now(),
        }
    }

    /// Attaches a schema for an operation.
    #[must_use]
    pub fn with_schema(mut self, operation: ConstructOperation, schema: ConstructSchema) -> Self {
        self.schemas.insert(operation, schema);
        self
    }

    /// Returns true if the construct serves the operation.
    #[must_use]
    pub fn supports(&self, operation: ConstructOperation) -> bool {
        self.construct_type.required_operation() == operation
            || self.additional_operations.contains(&operation)
    }

    /// Returns the event target construct workers for this operation
    /// subscribe to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedOperation`] when the construct does not
    /// serve the operation.
    pub fn event_target(&self, operation: ConstructOperation) -> Result<String> {
        if !self.supports(operation) {
            return Err(Error::UnsupportedOperation {
                operation: operation.to_string(),
                construct: self.type_name.clone(),
                construct_type: self.construct_type.to_string(),
            });
        }
        Ok(format!(
            "tarn_{}_{}_{operation}",
            self.construct_type.to_string().to_lowercase(),
            self.type_name.to_lowercase(),
        ))
    }

    /// Validates an instruction body against the operation's schema.
    ///
    /// A construct registered without a schema for the operation accepts
    /// any object body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedOperation`] or [`Error::Schema`].
    pub fn validate_body(
        &self,
        operation: ConstructOperation,
        step: &str,
        body: &Value,
    ) -> Result<()> {
        if !self.supports(operation) {
            return Err(Error::UnsupportedOperation {
                operation: operation.to_string(),
                construct: self.type_name.clone(),
                construct_type: self.construct_type.to_string(),
            });
        }
        match self.schemas.get(&operation) {
            Some(schema) => schema.validate(&self.type_name, step, body),
            None => Ok(()),
        }
    }
}

/// Extracts the construct type name an instruction body names.
///
/// # Errors
///
/// Returns [`Error::Schema`] when the body is not an object or lacks the
/// category's naming attribute.
pub fn named_construct(construct_type: ConstructType, step: &str, body: &Value) -> Result<String> {
    let attribute = construct_type.body_attribute();
    body.get(attribute)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| Error::Schema {
            construct: construct_type.to_string(),
            step: step.to_string(),
            message: format!("instruction body missing '{attribute}' attribute"),
        })
}

/// Lookup of registered constructs.
#[async_trait]
pub trait ConstructRegistry: Send + Sync {
    /// Fetches a registration by category and type name.
    async fn get(
        &self,
        construct_type: ConstructType,
        type_name: &str,
    ) -> Result<Option<RegisteredConstruct>>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory registry for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryConstructRegistry {
    constructs: RwLock<BTreeMap<(ConstructType, String), RegisteredConstruct>>,
}

impl InMemoryConstructRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a construct, replacing any previous registration of the
    /// same category and name.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register(&self, construct: RegisteredConstruct) -> Result<()> {
        let mut constructs = self.constructs.write().map_err(poison_err)?;
        constructs.insert(
            (construct.construct_type, construct.type_name.clone()),
            construct,
        );
        Ok(())
    }
}

#[async_trait]
impl ConstructRegistry for InMemoryConstructRegistry {
    async fn get(
        &self,
        construct_type: ConstructType,
        type_name: &str,
    ) -> Result<Option<RegisteredConstruct>> {
        let constructs = self.constructs.read().map_err(poison_err)?;
        Ok(constructs
            .get(&(construct_type, type_name.to_string()))
            .cloned())
    }
}
