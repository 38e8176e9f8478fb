//! Conditional JSON rewriting applied to request bodies before they are
//! forwarded upstream.
//!
//! Two program shapes are accepted. The legacy shape is a flat object merged
//! at the top level of the body. The structured shape carries an ordered
//! `operations` list; each operation may be gated by path-value conditions
//! and runs against the document as previous operations left it.

mod condition;
mod ops;
mod path;

#[cfg(test)]
mod tests;

pub use condition::{check_conditions, ConditionOperation};
pub use ops::{apply_operations, ParamOperation};
pub use path::{get, parse_path, remove, resolve, set, Segment};

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("request body is not valid JSON: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("unsupported comparison mode: {0}")]
    UnsupportedConditionMode(String),
    #[error("source path does not exist: {0}")]
    MissingSource(String),
    #[error("operation {mode} not supported for value at {path}")]
    UnsupportedTarget { mode: String, path: String },
}

/// Apply a channel's param-override program to a request body.
///
/// The program is structured when it carries an `operations` key holding a
/// list; otherwise the legacy top-level merge applies. Errors abort the whole
/// program; the caller must discard the intermediate body.
pub fn apply_param_override(
    body: &[u8],
    program: &Map<String, Value>,
) -> Result<Vec<u8>, RewriteError> {
    if program.is_empty() {
        return Ok(body.to_vec());
    }

    if let Some(operations) = parse_operations(program) {
        let mut doc: Value = serde_json::from_slice(body)?;
        apply_operations(&mut doc, &operations)?;
        return Ok(serde_json::to_vec(&doc)?);
    }

    let mut doc: Map<String, Value> = serde_json::from_slice(body)?;
    for (key, value) in program {
        doc.insert(key.clone(), value.clone());
    }
    Ok(serde_json::to_vec(&doc)?)
}

/// Structured programs are recognised by an `operations` key holding a list
/// whose entries all decode as operations.
fn parse_operations(program: &Map<String, Value>) -> Option<Vec<ParamOperation>> {
    let entries = program.get("operations")?.as_array()?;
    entries
        .iter()
        .map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect()
}
