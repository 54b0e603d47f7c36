use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{NestError, Result},
    index::SkipList,
    schema::BodyValidator,
    store::Document,
};

/// One structural edit, routed by a JSON-Pointer-like path.
#[derive(Debug, Clone, Deserialize)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Value,
}

/// Per-batch outcome reported to the client. A failed batch is not a
/// transport error; the document simply kept its previous body.
#[derive(Debug, Serialize)]
pub struct PatchReport {
    pub uri: String,
    #[serde(rename = "patchFailed")]
    pub patch_failed: bool,
    pub message: String,
}

impl PatchReport {
    pub fn applied(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            patch_failed: false,
            message: "patch applied".to_string(),
        }
    }

    pub fn failed(uri: &str, message: String) -> Self {
        Self {
            uri: uri.to_string(),
            patch_failed: true,
            message,
        }
    }
}

/// Apply a batch to the named document atomically: the read, every edit,
/// the schema recheck, and the write-back all happen inside the document's
/// exclusive upsert section. Any failure leaves the stored body untouched.
///
/// A failing edit surfaces as [`NestError::PatchFailed`]; callers report
/// it in the batch outcome rather than as a request failure.
pub fn patch_document(
    documents: &SkipList<String, Document>,
    name: &str,
    user: &str,
    operations: &[PatchOperation],
    validator: &dyn BodyValidator,
) -> Result<Document> {
    let now = Utc::now().timestamp();
    let mut patched: Option<Document> = None;

    documents.upsert(name.to_string(), |_, current| {
        let existing = current.ok_or(NestError::DocumentNotFound)?;

        let mut working = existing.body.as_ref().clone();
        apply_ops(&mut working, operations).map_err(NestError::PatchFailed)?;

        let bytes = serde_json::to_vec(&working)?;
        validator.validate(&bytes)?;

        let doc = Document {
            name: existing.name.clone(),
            path: existing.path.clone(),
            body: Arc::new(working),
            metadata: existing.metadata.touched(user, now),
            collections: Arc::clone(&existing.collections),
        };
        patched = Some(doc.clone());
        Ok(doc)
    })?;

    patched.ok_or(NestError::DocumentNotFound)
}

/// Run the edits in list order against `body`; the first failure aborts
/// the whole batch with its description.
pub fn apply_ops(body: &mut Value, operations: &[PatchOperation]) -> std::result::Result<(), String> {
    // Stage against a scratch copy so a mid-batch failure cannot leave a
    // partially edited body behind.
    let mut staged = body.clone();
    for operation in operations {
        apply_op(&mut staged, operation)?;
    }
    *body = staged;
    Ok(())
}

fn apply_op(body: &mut Value, operation: &PatchOperation) -> std::result::Result<(), String> {
    let tokens: Vec<String> = operation
        .path
        .trim_start_matches('/')
        .split('/')
        .map(decode_pointer_token)
        .collect();
    let (last, parents) = tokens
        .split_last()
        .expect("split of a string always yields at least one token");

    let mut current: &mut Value = body;
    for token in parents {
        current = descend(current, token)
            .map_err(|reason| format!("path {} {reason}", operation.path))?;
    }

    match operation.op.as_str() {
        "ObjectAdd" => {
            let object = current.as_object_mut().ok_or_else(|| {
                format!("path {} does not resolve to an object", operation.path)
            })?;
            object.insert(last.clone(), operation.value.clone());
            Ok(())
        }
        "ArrayAdd" => {
            let target = descend(current, last)
                .map_err(|reason| format!("path {} {reason}", operation.path))?;
            let array = target.as_array_mut().ok_or_else(|| {
                format!("value at path {} is not an array", operation.path)
            })?;
            array.push(operation.value.clone());
            Ok(())
        }
        "ArrayRemove" => {
            let target = descend(current, last)
                .map_err(|reason| format!("path {} {reason}", operation.path))?;
            let array = target.as_array_mut().ok_or_else(|| {
                format!("value at path {} is not an array", operation.path)
            })?;
            let position = array
                .iter()
                .position(|element| element == &operation.value)
                .ok_or_else(|| {
                    format!("value not found in array at path {}", operation.path)
                })?;
            array.remove(position);
            Ok(())
        }
        other => Err(format!("unsupported patch operation: {other}")),
    }
}

/// One traversal step: objects descend by member name, arrays by in-range
/// decimal index. Anything else fails the operation.
fn descend<'a>(
    current: &'a mut Value,
    token: &str,
) -> std::result::Result<&'a mut Value, &'static str> {
    match current {
        Value::Object(map) => map.get_mut(token).ok_or("does not resolve"),
        Value::Array(items) => {
            let index: usize = token.parse().map_err(|_| "has an invalid array index")?;
            items.get_mut(index).ok_or("has an out-of-range array index")
        }
        _ => Err("does not resolve to an object or array"),
    }
}

/// JSON Pointer unescaping: `~1` -> `/`, then `~0` -> `~`.
fn decode_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}
