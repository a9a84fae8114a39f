//! Bulk API body encoding and response decoding.
//!
//! The request body is NDJSON: one action line followed by one source line per document. The
//! response carries one item per action, in the same order as the actions were sent.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use crate::client::DocWriteResult;

#[derive(Serialize)]
struct IndexAction<'a> {
    index: ActionMeta<'a>,
}

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
}

/// Returns `source` as a single NDJSON line. Sources spanning several lines are parsed and
/// re-serialized compactly, which may reorder object keys. Fails when such a source is not JSON.
pub fn single_line_source(source: &[u8]) -> Result<Cow<'_, [u8]>> {
    let source = source.trim_ascii();
    if !source.iter().any(|b| matches!(b, b'\n' | b'\r')) {
        return Ok(Cow::Borrowed(source));
    }

    let value: serde_json::Value = serde_json::from_slice(source)
        .map_err(|e| Error::InvalidDocument(format!("multi-line source is not JSON: {e}")))?;
    Ok(Cow::Owned(serde_json::to_vec(&value)?))
}

/// Encodes `(index, source)` pairs into an NDJSON bulk body, one action line and one source line
/// per document. Every source goes through [single_line_source], so a document can never add
/// entries to the body.
pub fn encode_body<'a, I>(documents: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut body = Vec::new();
    for (index, source) in documents {
        serde_json::to_writer(&mut body, &IndexAction {
            index: ActionMeta { index },
        })?;
        body.push(b'\n');
        body.extend_from_slice(&single_line_source(source)?);
        body.push(b'\n');
    }
    Ok(body)
}

/// Response of `POST /_bulk`.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
    /// Time the cluster spent on the whole request, in milliseconds.
    pub took: u64,
    /// Time spent in ingest pipelines, in milliseconds. Absent when no pipeline ran.
    #[serde(default)]
    pub ingest_took: Option<u64>,
    /// `true` when at least one item failed.
    #[serde(default)]
    pub errors: bool,
    pub items: Vec<BulkItem>,
}

/// One entry of [BulkResponse::items]; keyed by the operation type in the wire format.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkItem {
    #[serde(
        rename = "index",
        alias = "create",
        alias = "update",
        alias = "delete"
    )]
    pub result: BulkItemResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkItemResult {
    #[serde(rename = "_index", default)]
    pub index: String,
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub status: u16,
    #[serde(default)]
    pub result: Option<DocWriteResult>,
    #[serde(default)]
    pub error: Option<ErrorCause>,
}

impl BulkItem {
    pub fn is_failed(&self) -> bool {
        self.result.error.is_some() || self.result.status >= 300
    }

    /// Human readable reason of a failed item.
    pub fn failure_message(&self) -> String {
        match &self.result.error {
            Some(cause) => cause.to_string(),
            None => format!("status {}", self.result.status),
        }
    }
}

/// Error object returned by Elasticsearch for a failed item.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorCause {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl std::fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}: {}", self.kind, reason),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_body() {
        let docs = [
            ("logs", br#"{"a":1}"#.as_slice()),
            ("logs", b"{\"b\":2}\n".as_slice()),
        ];
        let body = encode_body(docs).unwrap();
        let expected = concat!(
            "{\"index\":{\"_index\":\"logs\"}}\n",
            "{\"a\":1}\n",
            "{\"index\":{\"_index\":\"logs\"}}\n",
            "{\"b\":2}\n",
        );
        assert_eq!(String::from_utf8(body).unwrap(), expected);
    }

    #[test]
    fn test_encode_body_keeps_one_line_per_source() {
        let docs = [
            ("logs", b"{\n  \"a\": 1\n}".as_slice()),
            (
                "logs",
                b"{\"b\":2}\n{\"index\":{\"_index\":\"other\"}}\n{\"c\":3}".as_slice(),
            ),
        ];
        // the second source is three JSON values, not one document
        let err = encode_body(docs).unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));

        let body = encode_body([("logs", b"{\n  \"a\": \"x\\ny\"\r\n}\n".as_slice())]).unwrap();
        let body = String::from_utf8(body).unwrap();
        assert_eq!(body.lines().count(), 2);
        assert_eq!(
            body,
            "{\"index\":{\"_index\":\"logs\"}}\n{\"a\":\"x\\ny\"}\n"
        );
    }

    #[test]
    fn test_single_line_source() {
        let source = br#"{"b":2,"a":1}"#;
        assert!(matches!(
            single_line_source(source).unwrap(),
            Cow::Borrowed(s) if s == source.as_slice()
        ));
        assert_eq!(
            single_line_source(b"{\n\"a\": [1,\n 2]\n}").unwrap().as_ref(),
            br#"{"a":[1,2]}"#
        );
        assert!(single_line_source(b"not\njson").is_err());
    }

    #[test]
    fn test_encode_empty_body() {
        let body = encode_body(std::iter::empty()).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_decode_bulk_response_with_failures() {
        let raw = r#"{
            "took": 30,
            "errors": true,
            "items": [
                {"index": {"_index": "logs", "_id": "1", "status": 201, "result": "created"}},
                {"create": {"_index": "logs", "_id": "2", "status": 409,
                    "error": {"type": "version_conflict_engine_exception", "reason": "document already exists"}}},
                {"index": {"_index": "logs", "status": 429}}
            ]
        }"#;
        let response: BulkResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.took, 30);
        assert_eq!(response.ingest_took, None);
        assert!(response.errors);
        assert_eq!(response.items.len(), 3);

        let first = &response.items[0];
        assert!(!first.is_failed());
        assert_eq!(first.result.result, Some(DocWriteResult::Created));

        let second = &response.items[1];
        assert!(second.is_failed());
        assert_eq!(
            second.failure_message(),
            "version_conflict_engine_exception: document already exists"
        );

        let third = &response.items[2];
        assert!(third.is_failed());
        assert_eq!(third.failure_message(), "status 429");
    }

    #[test]
    fn test_decode_ingest_took() {
        let raw = r#"{"took": 3, "ingest_took": 7, "errors": false, "items": []}"#;
        let response: BulkResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.ingest_took, Some(7));
        assert!(response.items.is_empty());
    }
}
