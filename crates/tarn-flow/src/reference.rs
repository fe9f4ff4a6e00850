//! Reference syntax linking chain steps to earlier steps' results.
//!
//! A string attribute of the form `REF:<step_name>.<selector>` is replaced
//! before submission: selector `id` yields the referenced step's request
//! ID, selector `content` yields the referenced step's result content.
//! Anything not starting with the prefix passes through untouched, so
//! ordinary instruction values never collide with the syntax.
//!
//! Scanning (no resolution) feeds the chain graph builder; resolution runs
//! in the coordinator's dereference-before-submit pass, by which point
//! every referenced step has already completed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use tarn_core::{ContentStore, RequestId};

use crate::error::{Error, Result};
use crate::request::RequestBody;
use crate::store::FlowStore;

/// The marker prefix for reference-shaped string values.
pub const REFERENCE_PREFIX: &str = "REF:";

/// What part of a referenced step's outcome to substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// The request ID the step's submission produced.
    Id,
    /// The bytes of the step's single result entry.
    Content,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id => write!(f, "id"),
            Self::Content => write!(f, "content"),
        }
    }
}

/// A parsed `REF:<step_name>.<selector>` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReference {
    /// The referenced step name.
    pub step: String,
    /// The selected projection.
    pub selector: Selector,
}

/// Parses a string value, returning `None` when it is not reference-shaped.
///
/// # Errors
///
/// Returns [`Error::MalformedReference`] when the value carries the prefix
/// but does not split into a non-empty step name and a known selector on
/// exactly one `.`.
pub fn parse(raw: &str) -> Result<Option<ParsedReference>> {
    let Some(rest) = raw.strip_prefix(REFERENCE_PREFIX) else {
        return Ok(None);
    };

    let malformed = |message: &str| Error::MalformedReference {
        raw: raw.to_string(),
        message: message.to_string(),
    };

    let mut parts = rest.split('.');
    let (Some(step), Some(selector), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed(
            "expected exactly one '.' separating step name and selector",
        ));
    };

    if step.is_empty() {
        return Err(malformed("step name is empty"));
    }

    let selector = match selector {
        "id" => Selector::Id,
        "content" => Selector::Content,
        other => {
            return Err(Error::MalformedReference {
                raw: raw.to_string(),
                message: format!("unknown selector '{other}', expected 'id' or 'content'"),
            })
        }
    };

    Ok(Some(ParsedReference {
        step: step.to_string(),
        selector,
    }))
}

/// Collects the step names referenced by the first-level string attributes
/// of an instruction object. Non-object instructions reference nothing.
fn scan_object(value: &Value, out: &mut BTreeSet<String>) -> Result<()> {
    let Some(map) = value.as_object() else {
        return Ok(());
    };
    for attr in map.values() {
        if let Some(raw) = attr.as_str() {
            if let Some(parsed) = parse(raw)? {
                out.insert(parsed.step);
            }
        }
    }
    Ok(())
}

/// Returns the set of step names a request body references.
///
/// Only first-level string attributes of each lookup instruction, the
/// processing instructions, and the response config are scanned; nested
/// structures are opaque to the reference syntax.
///
/// # Errors
///
/// Returns [`Error::MalformedReference`] for prefixed values that do not
/// parse.
pub fn scan_references(body: &RequestBody) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for instruction in &body.lookup_instructions {
        scan_object(instruction, &mut out)?;
    }
    scan_object(&body.processing_instructions, &mut out)?;
    scan_object(&body.response_config, &mut out)?;
    Ok(out)
}

/// Resolves reference values against a chain's executed-step map.
#[derive(Clone)]
pub struct ReferenceResolver {
    store: Arc<dyn FlowStore>,
    content: Arc<dyn ContentStore>,
}

impl ReferenceResolver {
    /// Creates a resolver over the given stores.
    #[must_use]
    pub fn new(store: Arc<dyn FlowStore>, content: Arc<dyn ContentStore>) -> Self {
        Self { store, content }
    }

    /// Resolves one string value.
    ///
    /// Non-reference-shaped values come back unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedReference`] for unparseable references and
    /// [`Error::UnresolvedReference`] when the referenced step has no entry
    /// in `executed` or no recorded result. The latter is an internal
    /// invariant violation: the coordinator only submits a step after its
    /// dependencies completed.
    pub async fn resolve(
        &self,
        raw: &str,
        executed: &BTreeMap<String, RequestId>,
    ) -> Result<Value> {
        let Some(parsed) = parse(raw)? else {
            return Ok(Value::String(raw.to_string()));
        };

        let request_id = executed
            .get(&parsed.step)
            .ok_or_else(|| Error::UnresolvedReference {
                step: parsed.step.clone(),
            })?;

        match parsed.selector {
            Selector::Id => Ok(Value::String(request_id.to_string())),
            Selector::Content => {
                let request = self.store.get_request(request_id).await?.ok_or(
                    Error::RequestNotFound {
                        request_id: *request_id,
                    },
                )?;
                let content_id =
                    request
                        .result_content_id
                        .ok_or_else(|| Error::UnresolvedReference {
                            step: parsed.step.clone(),
                        })?;
                let bytes = self.content.get(&content_id).await?;
                Ok(Value::String(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))
            }
        }
    }

    /// Rewrites every reference-shaped first-level string attribute of a
    /// request body, returning the dereferenced copy.
    ///
    /// # Errors
    ///
    /// Propagates [`resolve`](Self::resolve) errors.
    pub async fn dereference_body(
        &self,
        body: &RequestBody,
        executed: &BTreeMap<String, RequestId>,
    ) -> Result<RequestBody> {
        let mut out = body.clone();
        for instruction in &mut out.lookup_instructions {
            self.dereference_object(instruction, executed).await?;
        }
        self.dereference_object(&mut out.processing_instructions, executed)
            .await?;
        self.dereference_object(&mut out.response_config, executed)
            .await?;
        Ok(out)
    }

    async fn dereference_object(
        &self,
        value: &mut Value,
        executed: &BTreeMap<String, RequestId>,
    ) -> Result<()> {
        let Some(map) = value.as_object_mut() else {
            return Ok(());
        };
        for attr in map.values_mut() {
            if let Some(raw) = attr.as_str() {
                if raw.starts_with(REFERENCE_PREFIX) {
                    *attr = self.resolve(raw, executed).await?;
                }
            }
        }
        Ok(())
    }
}
