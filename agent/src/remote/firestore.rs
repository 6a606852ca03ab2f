//! Firestore backend over the v1 REST API.
//!
//! Documents live at
//! `https://firestore.googleapis.com/v1/projects/{project}/databases/(default)/documents/{collection}/{id}`.
//! Field values travel as typed Firestore values (`stringValue`,
//! `integerValue`, `mapValue`, ...); [`encode_value`] and [`decode_value`]
//! convert between those and plain JSON.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Number, Value};
use stockroom_engine::Timestamp;

use super::{RemoteDocument, RemoteStore};
use crate::error::RemoteError;

type Result<T> = std::result::Result<T, RemoteError>;

const API_ROOT: &str = "https://firestore.googleapis.com/v1";

/// Firestore REST client for one project's default database.
#[derive(Clone)]
pub struct FirestoreStore {
    client: reqwest::Client,
    /// `.../databases/(default)/documents`
    base_url: String,
    id_token: Option<String>,
    request_timeout: Duration,
}

impl FirestoreStore {
    pub fn new(project_id: &str, id_token: Option<String>, request_timeout: Duration) -> Self {
        let base_url = format!("{API_ROOT}/projects/{project_id}/databases/(default)/documents");
        Self::with_base_url(base_url, id_token, request_timeout)
    }

    /// Point at another endpoint, e.g. the Firestore emulator.
    pub fn with_base_url(
        base_url: impl Into<String>,
        id_token: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            id_token,
            request_timeout,
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .timeout(self.request_timeout);
        match &self.id_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request. A 404 yields `None` when `missing_ok` is set.
    async fn send(&self, request: RequestBuilder, missing_ok: bool) -> Result<Option<Response>> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();

        if status.is_success() {
            return Ok(Some(response));
        }
        if status == StatusCode::NOT_FOUND && missing_ok {
            return Ok(None);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::debug!(status = %status, body = %body, "Firestore request failed");
        Err(classify_status(status, &body))
    }

    async fn read_json(&self, response: Response) -> Result<Value> {
        response.json().await.map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.request_timeout)
        } else if err.is_decode() {
            RemoteError::Rejected(format!("malformed response: {err}"))
        } else {
            RemoteError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteStore for FirestoreStore {
    async fn create(&self, collection: &str, fields: Map<String, Value>) -> Result<RemoteDocument> {
        let request = self
            .request(Method::POST, self.collection_url(collection))
            .json(&json!({ "fields": encode_fields(&fields) }));

        let response = self.send(request, false).await?;
        match response {
            Some(response) => decode_document(&self.read_json(response).await?),
            None => Err(RemoteError::Rejected(format!("create in {collection} returned nothing"))),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>> {
        let request = self.request(Method::GET, self.document_url(collection, id));
        match self.send(request, true).await? {
            Some(response) => decode_document(&self.read_json(response).await?).map(Some),
            None => Ok(None),
        }
    }

    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut params: Vec<(&str, String)> = fields
            .keys()
            .map(|key| ("updateMask.fieldPaths", field_path(key)))
            .collect();
        params.push(("currentDocument.exists", "true".to_string()));

        let request = self
            .request(Method::PATCH, self.document_url(collection, id))
            .query(&params)
            .json(&json!({ "fields": encode_fields(&fields) }));

        self.send(request, false).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let request = self.request(Method::DELETE, self.document_url(collection, id));
        self.send(request, true).await?;
        Ok(())
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<RemoteDocument>> {
        let body = json!({
            "structuredQuery": {
                "from": [{ "collectionId": collection }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": field_path(field) },
                        "op": "EQUAL",
                        "value": encode_value(value),
                    }
                }
            }
        });
        let request = self
            .request(Method::POST, format!("{}:runQuery", self.base_url))
            .json(&body);

        let response = self.send(request, false).await?;
        let rows = match response {
            Some(response) => self.read_json(response).await?,
            None => return Ok(Vec::new()),
        };

        rows.as_array()
            .map(|rows| rows.iter().filter_map(|row| row.get("document")).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .map(decode_document)
            .collect()
    }
}

/// Map an HTTP failure onto the remote error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = format!("{status}: {body}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RemoteError::Unavailable(message)
    } else {
        RemoteError::Rejected(message)
    }
}

/// Quote a field name for use in a field path when needed.
pub fn field_path(name: &str) -> String {
    let simple = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

pub fn encode_fields(fields: &Map<String, Value>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

/// Plain JSON to a typed Firestore value.
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Typed Firestore value to plain JSON. Timestamps and references become
/// strings; unknown kinds become null.
pub fn decode_value(value: &Value) -> Value {
    let Some(object) = value.as_object() else {
        return Value::Null;
    };
    let Some((kind, inner)) = object.iter().next() else {
        return Value::Null;
    };

    match kind.as_str() {
        "stringValue" | "timestampValue" | "referenceValue" | "booleanValue" | "geoPointValue" => {
            inner.clone()
        }
        "integerValue" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| inner.as_i64())
            .map(|i| Value::Number(i.into()))
            .unwrap_or(Value::Null),
        "doubleValue" => inner
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|values| values.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        "mapValue" => Value::Object(decode_fields(inner.get("fields"))),
        _ => Value::Null,
    }
}

fn decode_fields(fields: Option<&Value>) -> Map<String, Value> {
    fields
        .and_then(Value::as_object)
        .map(|fields| {
            fields
                .iter()
                .map(|(k, v)| (k.clone(), decode_value(v)))
                .collect()
        })
        .unwrap_or_default()
}

/// Decode a Firestore document resource.
pub fn decode_document(doc: &Value) -> Result<RemoteDocument> {
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::Rejected("document without a name".into()))?;
    let id = name.rsplit('/').next().unwrap_or(name).to_string();

    Ok(RemoteDocument {
        id,
        fields: decode_fields(doc.get("fields")),
        create_time: time_field(doc, "createTime"),
        update_time: time_field(doc, "updateTime"),
    })
}

fn time_field(doc: &Value, key: &str) -> Option<Timestamp> {
    let raw = doc.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_every_json_kind() {
        let value = json!({
            "name": "Widget",
            "qty": 3,
            "price": 9.5,
            "active": true,
            "note": null,
            "tags": ["a", 1],
        });

        assert_eq!(
            encode_value(&value),
            json!({"mapValue": {"fields": {
                "name": {"stringValue": "Widget"},
                "qty": {"integerValue": "3"},
                "price": {"doubleValue": 9.5},
                "active": {"booleanValue": true},
                "note": {"nullValue": null},
                "tags": {"arrayValue": {"values": [
                    {"stringValue": "a"},
                    {"integerValue": "1"},
                ]}},
            }}})
        );
    }

    #[test]
    fn decode_reverses_encode() {
        let value = json!({"a": {"b": [1, 2.5, "x", false, null]}, "c": "d"});
        assert_eq!(decode_value(&encode_value(&value)), value);
    }

    #[test]
    fn decodes_server_only_kinds() {
        assert_eq!(
            decode_value(&json!({"timestampValue": "2024-01-01T00:00:00Z"})),
            json!("2024-01-01T00:00:00Z")
        );
        assert_eq!(decode_value(&json!({"arrayValue": {}})), json!([]));
        assert_eq!(decode_value(&json!({"mapValue": {}})), json!({}));
        assert_eq!(decode_value(&json!({"bytesValue": "AA=="})), Value::Null);
    }

    #[test]
    fn decodes_document_resource() {
        let doc = json!({
            "name": "projects/p/databases/(default)/documents/products/Xk2aPq9LmN0bR7sT",
            "fields": {"sku": {"stringValue": "A1"}, "owner_id": {"stringValue": "u1"}},
            "createTime": "2024-01-01T00:00:00.123456Z",
            "updateTime": "2024-01-02T00:00:00Z",
        });

        let doc = decode_document(&doc).unwrap();
        assert_eq!(doc.id, "Xk2aPq9LmN0bR7sT");
        assert_eq!(doc.fields["sku"], "A1");
        assert!(doc.create_time.is_some());
        assert_eq!(doc.update_time.unwrap().to_rfc3339(), "2024-01-02T00:00:00+00:00");

        assert!(decode_document(&json!({"fields": {}})).is_err());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            RemoteError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            RemoteError::Unavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "PERMISSION_DENIED"),
            RemoteError::Rejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            RemoteError::Rejected(_)
        ));
    }

    #[test]
    fn field_paths_are_quoted_when_needed() {
        assert_eq!(field_path("owner_id"), "owner_id");
        assert_eq!(field_path("unit price"), "`unit price`");
        assert_eq!(field_path("9lives"), "`9lives`");
    }

    #[test]
    fn urls() {
        let store = FirestoreStore::new("shop-1", None, Duration::from_secs(3));
        assert_eq!(
            store.document_url("products", "abc"),
            "https://firestore.googleapis.com/v1/projects/shop-1/databases/(default)/documents/products/abc"
        );
    }
}
