//! `{{path}}` prompt templates rendered against a record.

use serde_json::Value;

use crate::error::AppError;
use crate::models::Record;
use crate::traits::PromptBuilder;

/// Prompt template with `{{dotted.path}}` placeholders.
///
/// Strings are inserted verbatim, other values as compact JSON. Missing
/// values render as an empty string. `{{id}}` resolves to the record ID when
/// the document has no `id` field.
#[derive(Debug, Clone)]
pub struct TemplatePrompt {
    template: String,
}

impl TemplatePrompt {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Placeholder paths in order of appearance.
    pub fn placeholders(&self) -> Result<Vec<&str>, AppError> {
        let mut found = Vec::new();
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                AppError::ConfigError("Unclosed '{{' in prompt template".to_string())
            })?;
            found.push(after[..end].trim());
            rest = &after[end + 2..];
        }
        Ok(found)
    }

    fn resolve(record: &Record, path: &str) -> String {
        match record.get(path) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None if path == "id" => record.id.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

impl PromptBuilder for TemplatePrompt {
    fn build(&self, record: &Record) -> Result<String, AppError> {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                AppError::ConfigError("Unclosed '{{' in prompt template".to_string())
            })?;
            out.push_str(&Self::resolve(record, after[..end].trim()));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
