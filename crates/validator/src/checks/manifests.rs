//! Static validation of manifest files before deploying them.
//!
//! Every `.yaml`, `.yml`, and `.json` file under the configured paths must
//! parse, and every non-empty document in it must carry `apiVersion`, `kind`,
//! and `metadata.name`.

use super::{Check, CheckContext, CheckVerdict};
use common::error::ValidationError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MANIFESTS_PARSE: &str = "config.manifests-parse";

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Parses manifest files named by the `paths` parameter (files or
/// directories, searched recursively).
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestsParse;

#[async_trait::async_trait]
impl Check for ManifestsParse {
    fn description(&self) -> &str {
        "manifest files parse and name their kind"
    }

    async fn execute(&self, ctx: &CheckContext) -> Result<CheckVerdict, ValidationError> {
        let roots = ctx.param_strings("paths");
        if roots.is_empty() {
            return Err(ValidationError::Configuration(format!(
                "{} needs a 'paths' parameter",
                ctx.check_name
            )));
        }

        let mut errors: BTreeMap<String, String> = BTreeMap::new();
        let mut files = Vec::new();
        for root in &roots {
            if let Err(e) = collect_manifests(Path::new(root), &mut files).await {
                errors.insert(root.clone(), e);
            }
        }

        let mut documents = 0usize;
        for file in &files {
            let display = file.display().to_string();
            let content = match tokio::fs::read_to_string(file).await {
                Ok(content) => content,
                Err(e) => {
                    errors.insert(display, format!("unreadable: {e}"));
                    continue;
                }
            };
            match validate_manifest(&content, is_json(file)) {
                Ok(count) => documents += count,
                Err(e) => {
                    errors.insert(display, e);
                }
            }
        }

        let invalid: Vec<String> = errors.keys().cloned().collect();
        let verdict = if invalid.is_empty() {
            CheckVerdict::pass(format!("{documents} documents in {} files parse", files.len()))
        } else {
            CheckVerdict::fail(format!("{} invalid configuration files", invalid.len()))
                .with_detail(
                    "errors",
                    serde_json::Value::Object(
                        errors
                            .into_iter()
                            .map(|(k, v)| (k, serde_json::Value::String(v)))
                            .collect(),
                    ),
                )
        };
        Ok(verdict
            .with_detail("files", files.len())
            .with_detail("documents", documents)
            .with_detail("invalid_files", invalid))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MANIFEST_EXTENSIONS.contains(&e))
}

/// Gather manifest files below `root` in sorted order.
async fn collect_manifests(root: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let metadata = tokio::fs::metadata(root)
        .await
        .map_err(|e| format!("cannot access: {e}"))?;
    if metadata.is_file() {
        out.push(root.to_path_buf());
        return Ok(());
    }

    let mut pending = vec![root.to_path_buf()];
    let mut found = Vec::new();
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| format!("cannot list {}: {e}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("cannot list {}: {e}", dir.display()))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| format!("cannot stat {}: {e}", path.display()))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if is_manifest(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    out.extend(found);
    Ok(())
}

/// Validate every document in a manifest file. Returns the number of
/// non-empty documents.
fn validate_manifest(content: &str, json: bool) -> Result<usize, String> {
    let documents: Vec<serde_json::Value> = if json {
        let value: serde_json::Value =
            serde_json::from_str(content).map_err(|e| format!("invalid JSON: {e}"))?;
        vec![value]
    } else {
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = serde_json::Value::deserialize(document)
                .map_err(|e| format!("invalid YAML: {e}"))?;
            documents.push(value);
        }
        documents
    };

    let mut count = 0;
    for (index, document) in documents.iter().enumerate() {
        if document.is_null() {
            continue;
        }
        check_document(document).map_err(|e| format!("document {}: {e}", index + 1))?;
        count += 1;
    }
    Ok(count)
}

fn check_document(document: &serde_json::Value) -> Result<(), String> {
    if !document.is_object() {
        return Err("not a mapping".to_string());
    }
    // A List wraps other manifests.
    if let Some(items) = document.get("items").and_then(serde_json::Value::as_array) {
        if document.get("kind").and_then(serde_json::Value::as_str) == Some("List") {
            for item in items {
                check_document(item)?;
            }
            return Ok(());
        }
    }
    for field in ["apiVersion", "kind"] {
        match document.get(field).and_then(serde_json::Value::as_str) {
            Some(s) if !s.is_empty() => {}
            _ => return Err(format!("missing {field}")),
        }
    }
    match document.pointer("/metadata/name").and_then(serde_json::Value::as_str) {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err("missing metadata.name".to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n";

    #[test]
    fn test_multi_document_yaml() {
        let content = format!("{DEPLOYMENT}---\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n---\n");
        assert_eq!(validate_manifest(&content, false).unwrap(), 2);
    }

    #[test]
    fn test_missing_fields_reported_with_document_index() {
        let content = format!("{DEPLOYMENT}---\napiVersion: v1\nmetadata:\n  name: x\n");
        let err = validate_manifest(&content, false).unwrap_err();
        assert_eq!(err, "document 2: missing kind");

        let err = validate_manifest("apiVersion: v1\nkind: ConfigMap\n", false).unwrap_err();
        assert!(err.contains("metadata.name"));
    }

    #[test]
    fn test_invalid_syntax() {
        assert!(validate_manifest("kind: [unclosed", false)
            .unwrap_err()
            .starts_with("invalid YAML"));
        assert!(validate_manifest("{\"kind\":", true)
            .unwrap_err()
            .starts_with("invalid JSON"));
    }

    #[test]
    fn test_json_list() {
        let content = r#"{"apiVersion":"v1","kind":"List","items":[
            {"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"a"}}]}"#;
        assert_eq!(validate_manifest(content, true).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collects_manifests_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.yaml"), DEPLOYMENT).unwrap();
        std::fs::write(dir.path().join("nested/b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("README.md"), "# docs").unwrap();

        let mut files = Vec::new();
        collect_manifests(dir.path(), &mut files).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| is_manifest(f)));

        let mut missing = Vec::new();
        assert!(collect_manifests(&dir.path().join("nope"), &mut missing)
            .await
            .is_err());
    }
}
