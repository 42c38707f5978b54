//! Fixture ingestion: one loader parameterized by category, reading a JSON
//! array of opportunities and upserting each record into the document store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use evf_core::{Category, Opportunity};
use evf_store::{DocumentStore, FirestoreConfig, FirestoreStore, MemoryStore, StoreError};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evf-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Firestore,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub resources_dir: PathBuf,
    pub web_port: u16,
    pub store_backend: StoreBackend,
    pub log_json: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            resources_dir: std::env::var("EVF_RESOURCES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("resources")),
            web_port: std::env::var("EVF_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            store_backend: match std::env::var("EVF_STORE").as_deref() {
                Ok("memory") => StoreBackend::Memory,
                _ => StoreBackend::Firestore,
            },
            log_json: std::env::var("EVF_LOG_JSON")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    /// Builds the configured store. Credential problems surface here, once,
    /// at startup.
    pub fn open_store(&self) -> Result<Arc<dyn DocumentStore>, StoreError> {
        match self.store_backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Firestore => {
                let config = FirestoreConfig::from_env()?;
                info!(
                    project_id = %config.project_id,
                    database_id = %config.database_id,
                    base_url = %config.base_url,
                    "firestore client initialized"
                );
                Ok(Arc::new(FirestoreStore::new(config)?))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedRecord {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub run_id: Uuid,
    pub category: Category,
    pub path: String,
    pub parsed: usize,
    pub written: usize,
    pub skipped: Vec<SkippedRecord>,
    pub fixture_sha256: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("fixture not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "writing record {index} (id {id}) from {}: {source}; {written} records were written before the failure",
        path.display()
    )]
    Store {
        path: PathBuf,
        index: usize,
        id: String,
        written: usize,
        #[source]
        source: StoreError,
    },
}

impl LoadError {
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::NotFound { .. } => "not_found",
            LoadError::Read { .. } => "read",
            LoadError::Parse { .. } => "parse",
            LoadError::Store { .. } => "store",
        }
    }
}

/// Parses a fixture body: a JSON array of opportunities, unknown keys ignored.
pub fn parse_fixture(bytes: &[u8]) -> Result<Vec<Opportunity>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct CategoryLoader {
    category: Category,
    resources_root: PathBuf,
    store: Arc<dyn DocumentStore>,
}

impl CategoryLoader {
    pub fn new(
        category: Category,
        resources_root: impl Into<PathBuf>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            category,
            resources_root: resources_root.into(),
            store,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn fixture_path(&self) -> PathBuf {
        self.resources_root.join(self.category.resource_path())
    }

    /// Reads the category fixture and saves every record in document order.
    ///
    /// Records with a blank id are skipped and listed in the report. The
    /// first store failure ends the run; records before it stay written.
    pub async fn load_all(&self) -> Result<LoadReport, LoadError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("load_all", %run_id, category = self.category.tag());
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<LoadReport, LoadError> {
        let started_at = Utc::now();
        let path = self.fixture_path();

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "fixture not found");
                return Err(LoadError::NotFound { path });
            }
            Err(source) => {
                error!(path = %path.display(), error = %source, "failed to read fixture");
                return Err(LoadError::Read { path, source });
            }
        };

        let records = match parse_fixture(&bytes) {
            Ok(records) => records,
            Err(source) => {
                error!(path = %path.display(), error = %source, "failed to parse fixture");
                return Err(LoadError::Parse { path, source });
            }
        };

        let mut written = 0usize;
        let mut skipped = Vec::new();
        for (index, record) in records.iter().enumerate() {
            if !record.has_document_key() {
                warn!(index, "skipping record without an id");
                skipped.push(SkippedRecord {
                    index,
                    reason: "blank id".to_string(),
                });
                continue;
            }
            if let Err(source) = self.store.save(record).await {
                error!(index, id = %record.id, written, error = %source, "store write failed; stopping run");
                return Err(LoadError::Store {
                    path,
                    index,
                    id: record.id.clone(),
                    written,
                    source,
                });
            }
            written += 1;
        }

        info!(
            label = self.category.label(),
            path = %path.display(),
            count = records.len(),
            written,
            skipped = skipped.len(),
            "loaded {} fixture",
            self.category.label()
        );

        Ok(LoadReport {
            run_id,
            category: self.category,
            path: path.display().to_string(),
            parsed: records.len(),
            written,
            skipped,
            fixture_sha256: sha256_hex(&bytes),
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Shared handle over the four category loaders.
#[derive(Clone)]
pub struct SyncService {
    resources_root: PathBuf,
    store: Arc<dyn DocumentStore>,
}

impl SyncService {
    pub fn new(resources_root: impl Into<PathBuf>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            resources_root: resources_root.into(),
            store,
        }
    }

    pub fn resources_root(&self) -> &Path {
        &self.resources_root
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn loader(&self, category: Category) -> CategoryLoader {
        CategoryLoader::new(category, self.resources_root.clone(), self.store.clone())
    }

    pub async fn sync(&self, category: Category) -> Result<LoadReport, LoadError> {
        self.loader(category).load_all().await
    }

    /// Runs every category in turn; one category failing does not stop the rest.
    pub async fn sync_all(&self) -> Vec<(Category, Result<LoadReport, LoadError>)> {
        let mut results = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            results.push((category, self.sync(category).await));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};

    fn write_fixture(root: &Path, category: Category, body: &str) {
        let path = root.join(category.resource_path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn setup() -> (TempDir, Arc<MemoryStore>, SyncService) {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let service = SyncService::new(dir.path(), store.clone());
        (dir, store, service)
    }

    /// Delegates to a memory store but refuses to write the id `boom`.
    struct FlakyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        fn collection(&self) -> &str {
            self.inner.collection()
        }

        async fn save(&self, opportunity: &Opportunity) -> Result<(), StoreError> {
            if opportunity.id == "boom" {
                return Err(StoreError::HttpStatus {
                    status: 403,
                    url: "memory://opportunities/boom".into(),
                    body: "PERMISSION_DENIED".into(),
                });
            }
            self.inner.save(opportunity).await
        }

        async fn get(&self, id: &str) -> Result<Option<Opportunity>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(&self) -> Result<Vec<Opportunity>, StoreError> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn writes_every_record_keyed_by_id() {
        let (dir, store, service) = setup();
        write_fixture(
            dir.path(),
            Category::Events,
            r#"[
                {"id":"e1","title":"RustConf","type":"conference","isRemote":false},
                {"id":"e2","title":"Cloud Meetup","location":"Pune"},
                {"id":"e3","title":"AI Webinar","isRemote":true,"domains":["ai"]}
            ]"#,
        );

        let report = service.sync(Category::Events).await.expect("load");
        assert_eq!(report.parsed, 3);
        assert_eq!(report.written, 3);
        assert!(report.skipped.is_empty());
        assert_eq!(store.ids().await, vec!["e1", "e2", "e3"]);

        let e3 = store.get("e3").await.unwrap().unwrap();
        assert!(e3.remote);
        assert_eq!(e3.domains, Some(vec!["ai".to_string()]));
        let e2 = store.get("e2").await.unwrap().unwrap();
        assert!(!e2.remote);
        assert_eq!(e2.location.as_deref(), Some("Pune"));
    }

    #[tokio::test]
    async fn single_hackathon_document_has_only_given_fields() {
        let (dir, store, service) = setup();
        write_fixture(
            dir.path(),
            Category::Hackathons,
            r#"[{"id":"h1","title":"HackX","reward":"$500"}]"#,
        );

        service.sync(Category::Hackathons).await.expect("load");

        let body = store.document("h1").await.expect("h1 stored");
        assert_eq!(body["title"], "HackX");
        assert_eq!(body["reward"], "$500");
        for absent in ["organization", "type", "location", "deadline", "stipend", "duration", "source", "createdAt"] {
            assert_eq!(body[absent], serde_json::Value::Null, "{absent} should be null");
        }
        assert_eq!(body["isRemote"], false);
    }

    #[tokio::test]
    async fn loading_twice_converges_to_same_state() {
        let (dir, store, service) = setup();
        write_fixture(
            dir.path(),
            Category::Jobs,
            r#"[{"id":"j1","title":"Backend Engineer","stipend":"40k"},{"id":"j2","title":"SRE"}]"#,
        );

        let first = service.sync(Category::Jobs).await.expect("first");
        let after_first = (store.ids().await, store.document("j1").await);
        let second = service.sync(Category::Jobs).await.expect("second");

        assert_eq!(store.len().await, 2);
        assert_eq!((store.ids().await, store.document("j1").await), after_first);
        assert_eq!(first.fixture_sha256, second.fixture_sha256);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn missing_fixture_leaves_store_untouched() {
        let (_dir, store, service) = setup();

        let err = service.sync(Category::Internships).await.unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }));
        assert_eq!(err.kind(), "not_found");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn object_instead_of_array_is_a_parse_error() {
        let (dir, store, service) = setup();
        write_fixture(dir.path(), Category::Events, r#"{"id":"e1","title":"Solo"}"#);

        let err = service.sync(Category::Events).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn type_mismatch_writes_nothing() {
        let (dir, store, service) = setup();
        write_fixture(
            dir.path(),
            Category::Events,
            r#"[{"id":"e1"},{"id":"e2","isRemote":"yes"}]"#,
        );

        let err = service.sync(Category::Events).await.unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn null_is_remote_loads_as_onsite() {
        let (dir, store, service) = setup();
        write_fixture(
            dir.path(),
            Category::Events,
            r#"[{"id":"e1","title":"A","isRemote":null},{"id":"e2"}]"#,
        );

        let report = service.sync(Category::Events).await.expect("load");
        assert_eq!(report.written, 2);
        let body = store.document("e1").await.expect("e1 stored");
        assert_eq!(body["isRemote"], false);
        assert_eq!(body["title"], "A");
    }

    #[tokio::test]
    async fn later_fixture_fully_overwrites_shared_id() {
        let (dir, store, service) = setup();
        write_fixture(
            dir.path(),
            Category::Events,
            r#"[{"id":"e1","title":"Old Title","organization":"ACM"}]"#,
        );
        service.sync(Category::Events).await.expect("first load");

        write_fixture(dir.path(), Category::Events, r#"[{"id":"e1","title":"New Title"}]"#);
        service.sync(Category::Events).await.expect("second load");

        let e1 = store.get("e1").await.unwrap().unwrap();
        assert_eq!(e1.title.as_deref(), Some("New Title"));
        assert_eq!(e1.organization, None);
    }

    #[tokio::test]
    async fn records_without_id_are_skipped_and_reported() {
        let (dir, store, service) = setup();
        write_fixture(
            dir.path(),
            Category::Internships,
            r#"[{"id":"i1","duration":"3 months"},{"title":"No id"},{"id":"","title":"Blank"},{"id":null,"title":"Null"},{"id":"i2"}]"#,
        );

        let report = service.sync(Category::Internships).await.expect("load");
        assert_eq!(report.parsed, 5);
        assert_eq!(report.written, 2);
        assert_eq!(
            report.skipped.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(store.ids().await, vec!["i1", "i2"]);
    }

    #[tokio::test]
    async fn store_failure_stops_the_run() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
        });
        write_fixture(
            dir.path(),
            Category::Hackathons,
            r#"[{"id":"h1"},{"id":"boom"},{"id":"h3"}]"#,
        );
        let loader = CategoryLoader::new(Category::Hackathons, dir.path(), store.clone());

        let err = loader.load_all().await.unwrap_err();
        match err {
            LoadError::Store { index, id, written, .. } => {
                assert_eq!(index, 1);
                assert_eq!(id, "boom");
                assert_eq!(written, 1);
            }
            other => panic!("expected store error, got {other:?}"),
        }
        assert_eq!(store.inner.ids().await, vec!["h1"]);
    }

    #[tokio::test]
    async fn sync_all_reports_each_category() {
        let (dir, store, service) = setup();
        write_fixture(dir.path(), Category::Events, r#"[{"id":"e1"}]"#);
        write_fixture(dir.path(), Category::Jobs, r#"[{"id":"j1"},{"id":"j2"}]"#);
        write_fixture(dir.path(), Category::Hackathons, "not json");

        let results = service.sync_all().await;
        let kinds = results
            .iter()
            .map(|(category, result)| {
                (*category, result.as_ref().map(|r| r.written).map_err(|e| e.kind()))
            })
            .collect::<Vec<_>>();

        assert_eq!(
            kinds,
            vec![
                (Category::Events, Ok(1)),
                (Category::Hackathons, Err("parse")),
                (Category::Internships, Err("not_found")),
                (Category::Jobs, Ok(2)),
            ]
        );
        assert_eq!(store.len().await, 3);
    }

    #[test]
    fn fixture_path_joins_category_resource() {
        let loader = CategoryLoader::new(
            Category::Jobs,
            "/srv/resources",
            Arc::new(MemoryStore::new()),
        );
        assert_eq!(loader.fixture_path(), PathBuf::from("/srv/resources/data/jobs.json"));
    }

    #[tokio::test]
    async fn report_serializes_for_json_output() {
        let (dir, _store, service) = setup();
        write_fixture(dir.path(), Category::Jobs, r#"[{"id":"j1"},{"title":"no id"}]"#);

        let report = service.sync(Category::Jobs).await.expect("load");
        let value = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(value["category"], "jobs");
        assert_eq!(value["written"], 1);
        assert_eq!(value["skipped"][0]["index"], 1);
        assert_eq!(value["run_id"], report.run_id.to_string());
        assert!(value["started_at"].as_str().is_some());
    }

    #[test]
    fn fixture_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
