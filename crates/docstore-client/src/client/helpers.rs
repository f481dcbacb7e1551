//! Pure helpers: result shaping, no I/O.

use serde_json::{Map, Value};

use crate::error::{ClientError, ClientResult};
use crate::types::{document_id, ByIdsOutcome, Document, PartialResults};

/// Split per-id outcomes into documents and failures, keeping request order.
pub(crate) fn partition(outcomes: Vec<(String, ClientResult<Document>)>) -> ByIdsOutcome {
    let mut result = ByIdsOutcome::default();
    for (id, outcome) in outcomes {
        match outcome {
            Ok(doc) => result.documents.push(doc),
            Err(e) => result.failures.push((id, e)),
        }
    }
    result
}

/// Apply the partial-results policy to a multi-id outcome.
///
/// `Drop`: found documents win; fail with the last error only when nothing
/// was found. `Fail`: the first failure fails the call.
pub(crate) fn apply_policy(
    outcome: ByIdsOutcome,
    policy: PartialResults,
) -> ClientResult<Vec<Document>> {
    match policy {
        PartialResults::Fail => match outcome.failures.into_iter().next() {
            Some((_, error)) => Err(error),
            None => Ok(outcome.documents),
        },
        PartialResults::Drop => {
            if outcome.documents.is_empty() {
                if let Some((_, error)) = outcome.failures.into_iter().last() {
                    return Err(error);
                }
            }
            Ok(outcome.documents)
        }
    }
}

/// `_id`s of a list of documents, skipping those without one.
pub(crate) fn ids_of(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .filter_map(document_id)
        .map(str::to_string)
        .collect()
}

/// Whether search params restrict the returned fields.
pub(crate) fn restricts_fields(params: &Map<String, Value>) -> bool {
    params.contains_key("fields")
}

pub(crate) fn expect_list(body: Value, what: &str) -> ClientResult<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(ClientError::InvalidResponse {
            message: format!(
                "expected a list from {}, got {}",
                what,
                crate::types::kind_of(&other)
            ),
        }),
    }
}
