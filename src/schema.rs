// Schema context.
//
// `schema::SchemaContext` is an out-of-scope collaborator: the real
// implementation loads and validates against YANG modules. This crate only
// needs a narrow seam other components can call through, so the trait stays
// small and a permissive textual stand-in backs it for tests and standalone
// use.

use crate::common::DataTree;
use crate::error::EngineResult;

pub trait SchemaContext: Send + Sync {
    /// Confirms `path` resolves against a loaded schema node. The textual
    /// stand-in never rejects a syntactically well-formed path.
    fn validate_path(&self, path: &str) -> EngineResult<()>;

    /// True if the schema node named by `path` is a YANG list or
    /// leaf-list — used by the operational composer to decide whether a
    /// provider's result should be merged as a keyed collection.
    /// `path` names the node itself, with or without a trailing instance
    /// predicate (a provider's own registered path never carries one; a
    /// request addressed at one particular instance does).
    fn is_list_node(&self, path: &str) -> bool;

    /// Validates a provider-returned value against the schema node named by
    /// `path`. A real implementation would run `value` through full YANG
    /// type/constraint checking; callers must treat a failure here the same
    /// as any other `validation` error and fail the read.
    fn validate_subtree(&self, path: &str, value: &DataTree) -> EngineResult<()>;
}

/// Accepts any path whose segments are non-empty; treats the schema node
/// named `list` (or ending `-list`), predicate or not, as a YANG list.
/// Adequate for engine-level testing where the real schema is not the thing
/// under test.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveSchemaContext;

impl SchemaContext for PermissiveSchemaContext {
    fn validate_path(&self, path: &str) -> EngineResult<()> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(crate::error::EngineError::InvalidArgument(format!(
                "malformed xpath: {path}"
            )));
        }
        Ok(())
    }

    fn is_list_node(&self, path: &str) -> bool {
        path.rsplit('/')
            .next()
            .map(|seg| {
                let name = seg.split('[').next().unwrap_or(seg);
                name == "list" || name.ends_with("-list")
            })
            .unwrap_or(false)
    }

    fn validate_subtree(&self, path: &str, value: &DataTree) -> EngineResult<()> {
        if self.is_list_node(path) {
            if !value.is_array() {
                return Err(crate::error::EngineError::Validation(format!(
                    "{path} is a list node but the provider returned a non-array value"
                )));
            }
        } else if value.is_null() {
            return Err(crate::error::EngineError::Validation(format!(
                "{path} provider returned null"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_path() {
        let schema = PermissiveSchemaContext;
        assert!(schema.validate_path("m:x").is_err());
        assert!(schema.validate_path("/m:x").is_ok());
    }

    #[test]
    fn detects_list_instance() {
        let schema = PermissiveSchemaContext;
        assert!(schema.is_list_node("/m:c/list[key='a']"));
        assert!(!schema.is_list_node("/m:c/leaf"));
    }

    #[test]
    fn validate_subtree_rejects_non_array_list() {
        let schema = PermissiveSchemaContext;
        assert!(schema.validate_subtree("/m:c/list", &serde_json::json!({"not": "a list"})).is_err());
        assert!(schema.validate_subtree("/m:c/list", &serde_json::json!([])).is_ok());
    }

    #[test]
    fn validate_subtree_rejects_null_leaf() {
        let schema = PermissiveSchemaContext;
        assert!(schema.validate_subtree("/m:c/leaf", &serde_json::Value::Null).is_err());
        assert!(schema.validate_subtree("/m:c/leaf", &serde_json::json!(1)).is_ok());
    }
}
