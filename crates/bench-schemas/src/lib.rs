use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::Path;

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub const TASK_CATALOG_SCHEMA: &str = "task_catalog_v1.json";
pub const RESULT_REPORT_SCHEMA: &str = "result_report_v1.json";

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Dev fallback: allow newly added schema files before this crate is rebuilt.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)?;
    Ok(compiled)
}

/// Validates `value` against the named schema, flattening validation errors
/// into a single message listing every failing instance path.
pub fn validate_against(name: &str, value: &Value) -> Result<()> {
    let schema = compile_schema(name)?;
    if let Err(errors) = schema.validate(value) {
        let mut msgs = Vec::new();
        for e in errors {
            msgs.push(format!("{} at {}", e, e.instance_path));
        }
        return Err(anyhow!("{} validation failed: {}", name, msgs.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_schemas_are_present_and_compile() {
        let names = schema_names();
        assert!(names.contains(&TASK_CATALOG_SCHEMA.to_string()));
        assert!(names.contains(&RESULT_REPORT_SCHEMA.to_string()));
        compile_schema(TASK_CATALOG_SCHEMA).expect("task catalog schema should compile");
        compile_schema(RESULT_REPORT_SCHEMA).expect("report schema should compile");
    }

    #[test]
    fn catalog_missing_domain_is_rejected() {
        let doc = json!({
            "tasks": [{"id": "t1", "user": {"script": ["hi"]}}]
        });
        let err = validate_against(TASK_CATALOG_SCHEMA, &doc)
            .expect_err("catalog without domain should fail");
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn minimal_catalog_validates() {
        let doc = json!({
            "domain": "retail",
            "tasks": [{"id": "t1", "user": {"script": ["hi"]}}]
        });
        validate_against(TASK_CATALOG_SCHEMA, &doc).expect("minimal catalog should validate");
    }

    #[test]
    fn unknown_schema_name_errors() {
        let err = load_schema("missing.json").expect_err("unknown schema should error");
        assert!(err.to_string().contains("schema not found"));
    }
}
