//! Model-backed validation of step results.
//!
//! A chain step may attach validation instructions; after the step's
//! request completes, its result content is classified SUCCESS or FAILURE
//! by a model, and the step's declared branch for that polarity decides
//! what happens next. The model seam is the [`ModelValidator`] trait; the
//! core owns prompt construction and output parsing.

use std::sync::Arc;

use async_trait::async_trait;

use tarn_core::{ContentId, ContentStore};

use crate::chain::ValidationStatus;
use crate::error::{Error, Result};

/// Fixed preamble prepended to every classification prompt.
pub const BASE_PROMPT: &str = "Given validation instructions, followed by content to review, \
analyze the content against the validation criteria. Determine if ALL validation criteria are met.

Respond ONLY with:
- \"SUCCESS\" if content meets ALL validation criteria
- \"FAILURE\" if content fails ANY validation criteria";

/// A classification prompt: preamble + instructions + content.
#[derive(Debug, Clone)]
pub struct ValidationPrompt {
    /// The operator-written validation instructions.
    pub instructions: String,
    /// The step result content under review.
    pub content: String,
}

impl ValidationPrompt {
    /// Creates a prompt for the given instructions and content.
    #[must_use]
    pub fn new(instructions: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            content: content.into(),
        }
    }

    /// Renders the full prompt text.
    #[must_use]
    pub fn render(&self) -> String {
        [
            BASE_PROMPT,
            "VALIDATION INSTRUCTIONS:",
            &self.instructions,
            "CONTENT TO VALIDATE:",
            &self.content,
        ]
        .join("\n\n")
    }
}

/// Parses raw model output into a classification.
///
/// # Errors
///
/// Returns [`Error::ValidationExecution`] when the trimmed, uppercased
/// output is neither `SUCCESS` nor `FAILURE`.
pub fn parse_classification(raw: &str) -> Result<ValidationStatus> {
    match raw.trim().to_uppercase().as_str() {
        "SUCCESS" => Ok(ValidationStatus::Success),
        "FAILURE" => Ok(ValidationStatus::Failure),
        other => Err(Error::ValidationExecution {
            message: format!("model returned '{other}', expected SUCCESS or FAILURE"),
        }),
    }
}

/// The model invocation seam.
#[async_trait]
pub trait ModelValidator: Send + Sync {
    /// Invokes the model with a rendered prompt, returning its raw text.
    ///
    /// `model_id` overrides the implementation's default model.
    async fn invoke(
        &self,
        prompt: &str,
        max_tokens: u32,
        model_id: Option<&str>,
    ) -> Result<String>;
}

/// Validates step results end to end: fetch content, build the prompt,
/// invoke the model, parse the classification.
#[derive(Clone)]
pub struct ResponseValidator {
    model: Arc<dyn ModelValidator>,
    content: Arc<dyn ContentStore>,
}

impl ResponseValidator {
    /// Creates a validator over the given model and content store.
    #[must_use]
    pub fn new(model: Arc<dyn ModelValidator>, content: Arc<dyn ContentStore>) -> Self {
        Self { model, content }
    }

    /// Classifies a step's result content against validation instructions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationExecution`] for empty content or
    /// unclassifiable model output; content-store and model errors
    /// propagate.
    #[tracing::instrument(skip(self, instructions), fields(content_id = %content_id))]
    pub async fn validate(
        &self,
        content_id: &ContentId,
        instructions: &str,
        model_id: Option<&str>,
        max_tokens: u32,
    ) -> Result<ValidationStatus> {
        let bytes = self.content.get(content_id).await?;
        let content = String::from_utf8_lossy(&bytes);
        if content.trim().is_empty() {
            return Err(Error::ValidationExecution {
                message: format!("no content to validate for entry {content_id}"),
            });
        }

        let prompt = ValidationPrompt::new(instructions, content.into_owned()).render();
        let raw = self.model.invoke(&prompt, max_tokens, model_id).await?;
        let status = parse_classification(&raw)?;

        tracing::debug!(status = ?status, "validation classified");
        Ok(status)
    }
}

/// A validator that always returns a fixed response. Test helper.
#[derive(Debug, Clone)]
pub struct StaticModelValidator {
    response: String,
}

impl StaticModelValidator {
    /// Creates a validator returning the given response verbatim.
    #[must_use]
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl ModelValidator for StaticModelValidator {
    async fn invoke(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _model_id: Option<&str>,
    ) -> Result<String> {
        Ok(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tarn_core::{JobId, MemoryContentStore, Provenance};

    #[test]
    fn prompt_orders_sections() {
        let prompt = ValidationPrompt::new("must mention revenue", "revenue grew 4%").render();
        let instructions_at = prompt.find("VALIDATION INSTRUCTIONS:").unwrap();
        let content_at = prompt.find("CONTENT TO VALIDATE:").unwrap();
        assert!(prompt.starts_with(BASE_PROMPT));
        assert!(instructions_at < content_at);
        assert!(prompt.contains("revenue grew 4%"));
    }

    #[test]
    fn classification_parsing_is_lenient_on_whitespace_and_case() {
        assert_eq!(
            parse_classification("  success\n").unwrap(),
            ValidationStatus::Success
        );
        assert_eq!(
            parse_classification("FAILURE").unwrap(),
            ValidationStatus::Failure
        );
        assert!(matches!(
            parse_classification("the content looks fine to me"),
            Err(Error::ValidationExecution { .. })
        ));
    }

    #[tokio::test]
    async fn validate_end_to_end() -> Result<()> {
        let content = Arc::new(MemoryContentStore::new());
        let content_id = ContentId::generate();
        content.insert(
            content_id,
            Bytes::from_static(b"revenue grew 4% year over year"),
            Provenance::new(JobId::generate(), "DIRECT"),
        )?;

        let validator = ResponseValidator::new(
            Arc::new(StaticModelValidator::new("SUCCESS")),
            content,
        );
        let status = validator
            .validate(&content_id, "must mention revenue", None, 100)
            .await?;
        assert_eq!(status, ValidationStatus::Success);
        Ok(())
    }

    #[tokio::test]
    async fn empty_content_is_a_validation_error() {
        let content = Arc::new(MemoryContentStore::new());
        let content_id = ContentId::generate();
        content
            .insert(
                content_id,
                Bytes::from_static(b"   "),
                Provenance::new(JobId::generate(), "DIRECT"),
            )
            .unwrap();

        let validator = ResponseValidator::new(
            Arc::new(StaticModelValidator::new("SUCCESS")),
            content,
        );
        let result = validator.validate(&content_id, "anything", None, 100).await;
        assert!(matches!(result, Err(Error::ValidationExecution { .. })));
    }
}
