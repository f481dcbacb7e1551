//! URL layout of the document-store API. Pure helpers, no I/O.

use serde_json::{json, Map, Value};

use crate::transport::{Method, Request};

/// Builds requests against one base URL.
#[derive(Debug, Clone)]
pub struct Routes {
    base_url: String,
}

impl Routes {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection(&self, entity_type: &str) -> String {
        format!("{}/{}", self.base_url, entity_type)
    }

    fn object(&self, entity_type: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, entity_type, id)
    }

    pub fn get_by_id(&self, entity_type: &str, id: &str) -> Request {
        Request::new(Method::Get, self.object(entity_type, id))
    }

    pub fn get_fields(&self, entity_type: &str, id: &str, fields: &[String]) -> Request {
        self.get_by_id(entity_type, id)
            .with_query("fields", fields.join(","))
    }

    pub fn get_version(&self, entity_type: &str, id: &str, version: &str) -> Request {
        Request::new(
            Method::Get,
            format!("{}/history/{}", self.object(entity_type, id), version),
        )
    }

    pub fn history(&self, entity_type: &str, id: &str) -> Request {
        Request::new(
            Method::Get,
            format!("{}/history", self.object(entity_type, id)),
        )
    }

    pub fn get_all(&self, entity_type: &str) -> Request {
        Request::new(Method::Get, self.collection(entity_type))
    }

    /// Search: `params` members are merged next to `selector`.
    pub fn search(&self, entity_type: &str, selector: &Value, params: &Map<String, Value>) -> Request {
        let mut body = params.clone();
        body.insert("selector".to_string(), selector.clone());
        Request::new(
            Method::Post,
            format!("{}/search", self.collection(entity_type)),
        )
        .with_body(Value::Object(body))
    }

    /// Multi-get expressed as a search on `_id`.
    pub fn get_many(&self, entity_type: &str, ids: &[String]) -> Request {
        self.search(entity_type, &id_selector(ids), &Map::new())
    }

    pub fn aggregate(&self, entity_type: &str, pipeline: &[Value]) -> Request {
        Request::new(
            Method::Post,
            format!("{}/aggregate", self.collection(entity_type)),
        )
        .with_body(json!({ "pipeline": pipeline }))
    }

    pub fn create(&self, entity_type: &str, doc: &Value) -> Request {
        Request::new(Method::Post, self.collection(entity_type)).with_body(doc.clone())
    }

    pub fn update(&self, entity_type: &str, id: &str, doc: &Value) -> Request {
        Request::new(Method::Put, self.object(entity_type, id)).with_body(doc.clone())
    }

    pub fn destroy(&self, entity_type: &str, id: &str) -> Request {
        Request::new(Method::Delete, self.object(entity_type, id))
    }
}

/// Selector matching any of `ids`.
pub fn id_selector(ids: &[String]) -> Value {
    json!({ "_id": { "$in": ids } })
}
