//! Per-request key/value storage shared between handlers, filters, and
//! script bindings. Lives exactly as long as the request.

use dashmap::DashMap;
use std::collections::HashMap;
use uuid::Uuid;

pub struct RequestScope {
    pub request_id: String,
    pub method: String,
    pub path: String,
    values: DashMap<String, String>,
}

impl RequestScope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let method = method.into();
        let path = path.into();
        let scope = Self {
            request_id: Uuid::new_v4().to_string(),
            method: method.clone(),
            path: path.clone(),
            values: DashMap::new(),
        };
        scope.set("request.method", method);
        scope.set("request.path", path);
        scope
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn list(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
