//! In-memory remote store for tests and local development.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};

use super::{RemoteDocument, RemoteStore};
use crate::error::RemoteError;

/// Length of server-assigned document ids.
const DOCUMENT_ID_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Get,
    Update,
    Delete,
    Query,
}

/// One call received by the store, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub kind: CallKind,
    pub collection: String,
    /// Document id, or the queried value for queries
    pub target: Option<String>,
    /// Fields sent with creates and updates
    pub body: Option<Map<String, Value>>,
}

/// Document store held in memory, with call recording and fault injection.
#[derive(Default)]
pub struct MemoryRemoteStore {
    documents: DashMap<(String, String), RemoteDocument>,
    calls: Mutex<Vec<RemoteCall>>,
    fail_next: Mutex<VecDeque<RemoteError>>,
    failing: Mutex<Option<RemoteError>>,
    failing_collections: DashMap<String, RemoteError>,
    latency: Mutex<Duration>,
    query_latency: Mutex<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call with `error`. Queued failures are used in order.
    pub fn fail_next(&self, error: RemoteError) {
        lock(&self.fail_next).push_back(error);
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn set_failing(&self, error: Option<RemoteError>) {
        *lock(&self.failing) = error;
    }

    /// Fail every call on `collection` with `error` until cleared with `None`.
    pub fn set_collection_failing(&self, collection: &str, error: Option<RemoteError>) {
        match error {
            Some(error) => {
                self.failing_collections.insert(collection.to_string(), error);
            }
            None => {
                self.failing_collections.remove(collection);
            }
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Answer queries `latency` after they arrive, with the documents as
    /// they were on arrival.
    pub fn set_query_latency(&self, latency: Duration) {
        *lock(&self.query_latency) = latency;
    }

    /// Seed a document as if another device had written it.
    pub fn insert_document(&self, collection: &str, id: &str, fields: Map<String, Value>) {
        let now = Utc::now();
        self.documents.insert(
            (collection.to_string(), id.to_string()),
            RemoteDocument {
                id: id.to_string(),
                fields,
                create_time: Some(now),
                update_time: Some(now),
            },
        );
    }

    pub fn remove_document(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        self.documents
            .remove(&(collection.to_string(), id.to_string()))
            .map(|(_, doc)| doc)
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<RemoteDocument> {
        self.documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|d| d.value().clone())
    }

    /// Documents of a collection, oldest first.
    pub fn documents(&self, collection: &str) -> Vec<RemoteDocument> {
        let mut docs: Vec<RemoteDocument> = self
            .documents
            .iter()
            .filter(|e| e.key().0 == collection)
            .map(|e| e.value().clone())
            .collect();
        docs.sort_by(|a, b| a.create_time.cmp(&b.create_time).then(a.id.cmp(&b.id)));
        docs
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_of(&self, kind: CallKind) -> Vec<RemoteCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Record the call, wait out the latency and apply injected faults.
    async fn enter(
        &self,
        kind: CallKind,
        collection: &str,
        target: Option<&str>,
        body: Option<&Map<String, Value>>,
    ) -> Result<(), RemoteError> {
        lock(&self.calls).push(RemoteCall {
            kind,
            collection: collection.to_string(),
            target: target.map(str::to_string),
            body: body.cloned(),
        });

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = lock(&self.fail_next).pop_front() {
            return Err(error);
        }
        if let Some(error) = self.failing_collections.get(collection) {
            return Err(error.value().clone());
        }
        match lock(&self.failing).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn server_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DOCUMENT_ID_LEN)
        .map(char::from)
        .collect()
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create(&self, collection: &str, fields: Map<String, Value>) -> Result<RemoteDocument, RemoteError> {
        self.enter(CallKind::Create, collection, None, Some(&fields)).await?;

        let now = Utc::now();
        let doc = RemoteDocument {
            id: server_id(),
            fields,
            create_time: Some(now),
            update_time: Some(now),
        };
        self.documents
            .insert((collection.to_string(), doc.id.clone()), doc.clone());
        Ok(doc)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>, RemoteError> {
        self.enter(CallKind::Get, collection, Some(id), None).await?;
        Ok(self.document(collection, id))
    }

    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<(), RemoteError> {
        self.enter(CallKind::Update, collection, Some(id), Some(&fields)).await?;

        let mut doc = self
            .documents
            .get_mut(&(collection.to_string(), id.to_string()))
            .ok_or_else(|| RemoteError::Rejected(format!("no document {collection}/{id}")))?;
        doc.fields.extend(fields);
        doc.update_time = Some(Utc::now());
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.enter(CallKind::Delete, collection, Some(id), None).await?;
        self.remove_document(collection, id);
        Ok(())
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<RemoteDocument>, RemoteError> {
        let target = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        self.enter(CallKind::Query, collection, Some(&target), None).await?;

        let docs: Vec<RemoteDocument> = self
            .documents(collection)
            .into_iter()
            .filter(|d| d.fields.get(field) == Some(value))
            .collect();
        let latency = *lock(&self.query_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(docs)
    }
}
