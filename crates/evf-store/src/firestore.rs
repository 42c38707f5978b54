//! Firestore REST backend.
//!
//! Documents are written with `PATCH .../documents/{collection}/{id}` and no
//! update mask, which replaces the stored document wholesale.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evf_core::{Opportunity, OPPORTUNITIES_COLLECTION};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info_span, Instrument};

use crate::{DocumentStore, StoreError};

pub const DEFAULT_CREDENTIALS_PATH: &str = "firebase/serviceAccountKey.json";

const PRODUCTION_BASE_URL: &str = "https://firestore.googleapis.com/v1";
const DEFAULT_DATABASE: &str = "(default)";
const EMULATOR_TOKEN: &str = "owner";
const DEFAULT_EMULATOR_PROJECT: &str = "demo-eventfetcher";
const LIST_PAGE_SIZE: usize = 300;

/// The parts of a Google service-account key file the store needs.
/// The private key is never read into memory.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    #[serde(rename = "type", default)]
    pub account_type: Option<String>,
    pub project_id: String,
    pub client_email: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccount {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let credentials_error = |message: String| StoreError::Credentials {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|err| credentials_error(err.to_string()))?;
        let account: ServiceAccount =
            serde_json::from_str(&text).map_err(|err| credentials_error(err.to_string()))?;
        if account.project_id.trim().is_empty() {
            return Err(credentials_error("project_id is empty".to_string()));
        }
        Ok(account)
    }
}

#[derive(Clone)]
pub struct FirestoreConfig {
    pub base_url: String,
    pub project_id: String,
    pub database_id: String,
    pub collection: String,
    pub access_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl fmt::Debug for FirestoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirestoreConfig")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("database_id", &self.database_id)
            .field("collection", &self.collection)
            .field("access_token", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: PRODUCTION_BASE_URL.to_string(),
            project_id: project_id.into(),
            database_id: DEFAULT_DATABASE.to_string(),
            collection: OPPORTUNITIES_COLLECTION.to_string(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("evf/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    /// Local emulator; it accepts the fixed `owner` bearer token.
    pub fn emulator(host: &str, project_id: impl Into<String>) -> Self {
        Self {
            base_url: format!("http://{}/v1", host.trim_end_matches('/')),
            ..Self::new(project_id, EMULATOR_TOKEN)
        }
    }

    pub fn from_env() -> Result<Self, StoreError> {
        let mut config = if let Ok(host) = std::env::var("FIRESTORE_EMULATOR_HOST") {
            let project = std::env::var("FIRESTORE_PROJECT_ID")
                .unwrap_or_else(|_| DEFAULT_EMULATOR_PROJECT.to_string());
            Self::emulator(&host, project)
        } else {
            let path = std::env::var("EVF_CREDENTIALS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CREDENTIALS_PATH));
            let account = ServiceAccount::from_file(&path)?;
            let token = std::env::var("FIRESTORE_ACCESS_TOKEN").map_err(|_| StoreError::Credentials {
                path: path.clone(),
                message: "FIRESTORE_ACCESS_TOKEN is not set".to_string(),
            })?;
            Self::new(account.project_id, token)
        };

        if let Ok(database) = std::env::var("FIRESTORE_DATABASE") {
            config.database_id = database;
        }
        if let Some(secs) = std::env::var("EVF_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[derive(Debug)]
pub struct FirestoreStore {
    client: reqwest::Client,
    config: FirestoreConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<DocumentResponse>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    update_time: Option<DateTime<Utc>>,
}

impl FirestoreStore {
    pub fn new(config: FirestoreConfig) -> Result<Self, StoreError> {
        parse_base_url(&config.base_url)?;
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FirestoreConfig {
        &self.config
    }

    pub fn collection_url(&self) -> Result<Url, StoreError> {
        self.url_with_segments(&[])
    }

    /// Each part is pushed as a single path segment, so ids containing `/`
    /// are escaped instead of addressing a subcollection.
    pub fn document_url(&self, id: &str) -> Result<Url, StoreError> {
        self.url_with_segments(&[id])
    }

    fn url_with_segments(&self, extra: &[&str]) -> Result<Url, StoreError> {
        let mut url = parse_base_url(&self.config.base_url)?;
        url.path_segments_mut()
            .map_err(|_| {
                StoreError::Config(format!("base url {} cannot carry a path", self.config.base_url))
            })?
            .pop_if_empty()
            .extend([
                "projects",
                self.config.project_id.as_str(),
                "databases",
                self.config.database_id.as_str(),
                "documents",
                self.config.collection.as_str(),
            ])
            .extend(extra);
        Ok(url)
    }

    async fn error_for_status(resp: reqwest::Response, url: &Url) -> StoreError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        StoreError::HttpStatus {
            status,
            url: url.to_string(),
            body,
        }
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    fn collection(&self) -> &str {
        &self.config.collection
    }

    async fn save(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
        if !opportunity.has_document_key() {
            return Err(StoreError::MissingDocumentKey);
        }
        let url = self.document_url(&opportunity.id)?;
        let body = encode_document(opportunity)?;
        let span = info_span!(
            "firestore_write",
            collection = %self.config.collection,
            id = %opportunity.id
        );

        async move {
            let resp = self
                .client
                .patch(url.clone())
                .bearer_auth(&self.config.access_token)
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::error_for_status(resp, &url).await);
            }
            let written = resp.json::<DocumentResponse>().await.ok();
            debug!(
                name = ?written.as_ref().and_then(|w| w.name.as_deref()),
                update_time = ?written.as_ref().and_then(|w| w.update_time),
                "document written"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Opportunity>, StoreError> {
        let url = self.document_url(id)?;
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::error_for_status(resp, &url).await);
        }
        let document: DocumentResponse = resp.json().await?;
        decode_document(id, &document.fields).map(Some)
    }

    async fn list(&self) -> Result<Vec<Opportunity>, StoreError> {
        let mut opportunities = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let mut url = self.collection_url()?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("pageSize", &LIST_PAGE_SIZE.to_string());
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let resp = self
                .client
                .get(url.clone())
                .bearer_auth(&self.config.access_token)
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(Self::error_for_status(resp, &url).await);
            }
            let page: ListDocumentsResponse = resp.json().await?;
            pages += 1;
            for document in &page.documents {
                let id = document
                    .name
                    .as_deref()
                    .and_then(|name| name.rsplit('/').next())
                    .unwrap_or_default();
                opportunities.push(decode_document(id, &document.fields)?);
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(
            collection = %self.config.collection,
            count = opportunities.len(),
            pages,
            "listed documents"
        );
        Ok(opportunities)
    }
}

fn parse_base_url(base_url: &str) -> Result<Url, StoreError> {
    Url::parse(base_url).map_err(|err| StoreError::Config(format!("invalid base url {base_url}: {err}")))
}

/// Full Firestore document body (`{"fields": ...}`) for an opportunity.
pub fn encode_document(opportunity: &Opportunity) -> Result<Value, StoreError> {
    let plain = serde_json::to_value(opportunity).map_err(|source| StoreError::Encode {
        id: opportunity.id.clone(),
        source,
    })?;
    let fields = match plain {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| (key.clone(), encode_value(value)))
            .collect::<Map<_, _>>(),
        other => {
            return Err(StoreError::Decode {
                id: opportunity.id.clone(),
                message: format!("expected a JSON object, got {other}"),
            })
        }
    };
    Ok(json!({ "fields": fields }))
}

pub fn decode_document(id: &str, fields: &Map<String, Value>) -> Result<Opportunity, StoreError> {
    let decode_error = |message: String| StoreError::Decode {
        id: id.to_string(),
        message,
    };
    let mut plain = decode_fields(fields).map_err(decode_error)?;
    plain
        .entry("id")
        .or_insert_with(|| Value::String(id.to_string()));
    serde_json::from_value(Value::Object(plain)).map_err(|err| decode_error(err.to_string()))
}

fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            // int64 travels as a decimal string in the REST encoding
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({
            "mapValue": {
                "fields": map
                    .iter()
                    .map(|(key, value)| (key.clone(), encode_value(value)))
                    .collect::<Map<_, _>>()
            }
        }),
    }
}

fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>, String> {
    fields
        .iter()
        .map(|(key, value)| {
            decode_value(value)
                .map(|plain| (key.clone(), plain))
                .map_err(|err| format!("field {key}: {err}"))
        })
        .collect()
}

fn decode_value(value: &Value) -> Result<Value, String> {
    let Some((kind, inner)) = value.as_object().and_then(|obj| obj.iter().next()) else {
        return Err(format!("expected a typed value, got {value}"));
    };
    let mismatch = || format!("malformed {kind}: {inner}");
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner.as_bool().map(Value::Bool).ok_or_else(mismatch),
        "integerValue" => match inner {
            Value::String(s) => s.parse::<i64>().map(Value::from).map_err(|err| err.to_string()),
            Value::Number(n) => Ok(Value::Number(n.clone())),
            _ => Err(mismatch()),
        },
        "doubleValue" => inner.as_f64().map(Value::from).ok_or_else(mismatch),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(mismatch),
        "arrayValue" => match inner.get("values") {
            None => Ok(Value::Array(Vec::new())),
            Some(Value::Array(values)) => values
                .iter()
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Some(_) => Err(mismatch()),
        },
        "mapValue" => match inner.get("fields") {
            None => Ok(Value::Object(Map::new())),
            Some(Value::Object(fields)) => decode_fields(fields).map(Value::Object),
            Some(_) => Err(mismatch()),
        },
        other => Err(format!("unsupported value type {other}")),
    }
}
