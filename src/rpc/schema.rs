//! Schema validation for RPC payloads.
//!
//! Each method that cares about its wire shape registers a compiled JSON
//! Schema once, at [`RpcClient`](super::RpcClient) construction, mirroring
//! how the upstream SDK compiles its zod schemas once rather than per call.
//! Methods with no registered schema are passed through unchecked — not
//! every payload in this protocol has a schema worth enforcing (e.g. opaque
//! render instructions), and that is a deliberate scope choice, not an
//! oversight.

use std::collections::HashMap;

use jsonschema::Validator;
use serde_json::Value;

use crate::error::{HostError, Result};

/// Which side of a call a schema applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// A registry of compiled schemas, keyed by method name and direction.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<(&'static str, Direction), Validator>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a schema for `method`/`direction`.
    ///
    /// # Errors
    /// Returns [`HostError::Fatal`] if `schema` is not a valid JSON Schema
    /// document.
    pub fn register(&mut self, method: &'static str, direction: Direction, schema: &Value) -> Result<()> {
        let compiled = jsonschema::validator_for(schema)
            .map_err(|e| HostError::Fatal(format!("invalid schema for {method}: {e}")))?;
        self.schemas.insert((method, direction), compiled);
        Ok(())
    }

    /// Validate `value` against the schema registered for `method`/
    /// `direction`, if any. Methods with no registered schema always pass.
    ///
    /// # Errors
    /// Returns [`HostError::SchemaInvalid`] describing the first mismatch.
    pub fn validate(&self, method: &str, direction: Direction, value: &Value) -> Result<()> {
        let Some(validator) = self.schemas.get(&(method, direction)) else {
            return Ok(());
        };
        if let Err(error) = validator.validate(value) {
            return Err(HostError::SchemaInvalid(error.to_string()));
        }
        Ok(())
    }
}

/// Build the registry of schemas the core itself cares about enforcing.
///
/// # Errors
/// Propagates [`SchemaRegistry::register`] failures (never expected for
/// these fixed literal schemas).
pub fn default_registry() -> Result<SchemaRegistry> {
    let mut registry = SchemaRegistry::new();

    registry.register(
        "START_TRANSACTION",
        Direction::Input,
        &serde_json::json!({
            "type": "object",
            "required": ["transactionId", "action", "environment"],
            "properties": {
                "transactionId": {"type": "string", "minLength": 1},
                "action": {"type": "object", "required": ["slug"]},
                "environment": {"type": "string", "enum": ["development", "production"]},
            },
        }),
    )?;

    registry.register(
        "OPEN_PAGE",
        Direction::Input,
        &serde_json::json!({
            "type": "object",
            "required": ["pageKey", "page", "environment"],
            "properties": {
                "pageKey": {"type": "string", "minLength": 1},
                "page": {"type": "object", "required": ["slug"]},
            },
        }),
    )?;

    registry.register(
        "INITIALIZE_HOST",
        Direction::Output,
        &serde_json::json!({
            "type": "object",
            "required": ["type"],
            "properties": {
                "type": {"type": "string", "enum": ["success", "error"]},
                "invalidSlugs": {"type": "array", "items": {"type": "string"}},
            },
        }),
    )?;

    Ok(registry)
}
