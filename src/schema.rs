use std::{fs, path::Path};

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{NestError, Result};

/// Filter applied to every document body before it is admitted into a
/// container. The store treats the validator as immutable after
/// construction and shares it freely across request handlers.
pub trait BodyValidator: Send + Sync {
    fn validate(&self, body: &[u8]) -> Result<()>;
}

/// Validator backed by a compiled JSON Schema document.
pub struct SchemaValidator {
    schema: JSONSchema,
}

impl SchemaValidator {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let raw: Value = serde_json::from_str(&contents)
            .map_err(|err| NestError::InvalidSchema(err.to_string()))?;
        Self::compile(&raw)
    }

    pub fn compile(raw: &Value) -> Result<Self> {
        let schema = JSONSchema::compile(raw)
            .map_err(|err| NestError::InvalidSchema(err.to_string()))?;
        Ok(Self { schema })
    }
}

impl BodyValidator for SchemaValidator {
    fn validate(&self, body: &[u8]) -> Result<()> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|err| NestError::SchemaViolation(err.to_string()))?;
        if let Err(errors) = self.schema.validate(&value) {
            let details = errors
                .map(|err| err.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(NestError::SchemaViolation(details));
        }
        Ok(())
    }
}

/// Pass-through validator used when no schema file is configured.
pub struct AcceptAll;

impl BodyValidator for AcceptAll {
    fn validate(&self, _body: &[u8]) -> Result<()> {
        Ok(())
    }
}
