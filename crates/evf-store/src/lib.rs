//! Document store seam for opportunities: the upsert contract, an in-memory
//! backend, and the Firestore REST backend.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use evf_core::{Opportunity, OPPORTUNITIES_COLLECTION};
use thiserror::Error;
use tokio::sync::Mutex;

mod firestore;

pub use firestore::{
    decode_document, encode_document, FirestoreConfig, FirestoreStore, ServiceAccount,
    DEFAULT_CREDENTIALS_PATH,
};

pub const CRATE_NAME: &str = "evf-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opportunity has a blank id; refusing to write a document without a key")]
    MissingDocumentKey,
    #[error("encoding document {id}: {source}")]
    Encode {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decoding document {id}: {message}")]
    Decode { id: String, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("loading credentials from {}: {message}", path.display())]
    Credentials { path: PathBuf, message: String },
    #[error("store configuration: {0}")]
    Config(String),
}

/// Upsert target for opportunities, keyed by `Opportunity::id`.
///
/// `save` replaces the whole document: fields present in an earlier write but
/// absent from the new record do not survive.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn collection(&self) -> &str;

    async fn save(&self, opportunity: &Opportunity) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Opportunity>, StoreError>;

    /// Every document in the collection, ordered by document id.
    async fn list(&self) -> Result<Vec<Opportunity>, StoreError>;
}

/// Process-local store holding each document as the JSON body that would be
/// written to Firestore.
#[derive(Debug)]
pub struct MemoryStore {
    collection: String,
    documents: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_collection(OPPORTUNITIES_COLLECTION)
    }

    pub fn with_collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            documents: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }

    /// Raw stored body, nulls included.
    pub async fn document(&self, id: &str) -> Option<serde_json::Value> {
        self.documents.lock().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.documents.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn save(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        if !opportunity.has_document_key() {
            return Err(StoreError::MissingDocumentKey);
        }
        let body = serde_json::to_value(opportunity).map_err(|source| StoreError::Encode {
            id: opportunity.id.clone(),
            source,
        })?;
        self.documents
            .lock()
            .await
            .insert(opportunity.id.clone(), body);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Opportunity>, StoreError> {
        let Some(body) = self.document(id).await else {
            return Ok(None);
        };
        decode_stored(id, body).map(Some)
    }

    async fn list(&self) -> Result<Vec<Opportunity>, StoreError> {
        let documents = self.documents.lock().await.clone();
        documents
            .into_iter()
            .map(|(id, body)| decode_stored(&id, body))
            .collect()
    }
}

fn decode_stored(id: &str, body: serde_json::Value) -> Result<Opportunity, StoreError> {
    serde_json::from_value(body).map_err(|err| StoreError::Decode {
        id: id.to_string(),
        message: err.to_string(),
    })
}
