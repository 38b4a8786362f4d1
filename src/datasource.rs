//! Request handling: settings validation, query execution, table shaping
//! and health checks, with panics contained per query.
use serde::Deserialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{
    execute_timed, ConnectError, ConnectOptions, DocumentBackend, ExecuteError, ListError,
};
use crate::frame::{build_table, Table};

/// Key of the credential blob in the decrypted secure settings.
pub const SERVICE_ACCOUNT_KEY: &str = "serviceAccount";

pub const HEALTHY_MESSAGE: &str = "Data source is working";

const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Per-instance configuration handed over by the host.
#[derive(Clone, Default)]
pub struct InstanceSettings {
    /// Raw JSON of the non-secret settings.
    pub json_data: String,
    pub decrypted_secure_json_data: HashMap<String, String>,
}

impl InstanceSettings {
    pub fn new(json_data: impl Into<String>) -> Self {
        Self {
            json_data: json_data.into(),
            decrypted_secure_json_data: HashMap::new(),
        }
    }

    /// Settings for a project, with an optional database and credential blob.
    pub fn from_options(options: &ConnectOptions) -> Self {
        let json_data = serde_json::json!({
            "projectId": options.project_id,
            "database": options.database,
        })
        .to_string();
        let mut settings = Self::new(json_data);
        if let Some(blob) = &options.service_account {
            settings
                .decrypted_secure_json_data
                .insert(SERVICE_ACCOUNT_KEY.to_string(), blob.clone());
        }
        settings
    }

    pub fn with_secure(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.decrypted_secure_json_data.insert(key.into(), value.into());
        self
    }

    fn service_account(&self) -> Option<&str> {
        self.decrypted_secure_json_data
            .get(SERVICE_ACCOUNT_KEY)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

impl fmt::Debug for InstanceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.decrypted_secure_json_data.keys().collect();
        keys.sort();
        f.debug_struct("InstanceSettings")
            .field("json_data", &self.json_data)
            .field("secure_keys", &keys)
            .finish()
    }
}

/// Non-secret data source settings. Keys are accepted in the casings hosts
/// have been seen to send; `null` counts as unset.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataSourceSettings {
    #[serde(
        rename = "projectId",
        alias = "ProjectId",
        alias = "ProjectID",
        alias = "projectid",
        alias = "projectID"
    )]
    pub project_id: Option<String>,
    #[serde(alias = "Database", alias = "DATABASE")]
    pub database: Option<String>,
}

impl DataSourceSettings {
    pub fn parse(json: &str) -> Result<Self, DataSourceError> {
        serde_json::from_str(json).map_err(DataSourceError::Settings)
    }
}

/// The per-query model sent by the host.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryModel {
    #[serde(alias = "Query")]
    pub query: String,
}

impl QueryModel {
    pub fn parse(json: &str) -> Result<Self, DataSourceError> {
        serde_json::from_str(json).map_err(DataSourceError::QueryModel)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataQuery {
    pub ref_id: String,
    /// Raw JSON of the [`QueryModel`].
    pub json: String,
}

impl DataQuery {
    pub fn new(ref_id: impl Into<String>, json: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            json: json.into(),
        }
    }

    /// A query whose model carries only the query text.
    pub fn text(ref_id: impl Into<String>, query: &str) -> Self {
        Self::new(ref_id, serde_json::json!({ "query": query }).to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryDataRequest {
    pub settings: InstanceSettings,
    pub queries: Vec<DataQuery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Internal,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataResponse {
    pub frames: Vec<Table>,
    pub status: Status,
    pub error: Option<String>,
}

impl DataResponse {
    pub fn ok(frames: Vec<Table>) -> Self {
        Self {
            frames,
            status: Status::Ok,
            error: None,
        }
    }

    pub fn error(status: Status, message: impl Into<String>) -> Self {
        Self {
            frames: vec![],
            status,
            error: Some(message.into()),
        }
    }

    pub fn internal_error() -> Self {
        Self::error(Status::Internal, INTERNAL_ERROR_MESSAGE)
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryDataResponse {
    /// Responses keyed by query ref id.
    pub responses: BTreeMap<String, DataResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckHealthResult {
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("json unmarshal: {0}")]
    QueryModel(#[source] serde_json::Error),
    #[error("ProjectID: {0}")]
    Settings(#[source] serde_json::Error),
    #[error("ProjectID is required")]
    MissingProjectId,
    #[error("invalid service account, it is expected to be a JSON")]
    InvalidServiceAccount,
    #[error("connect: {0}")]
    Connect(#[from] ConnectError),
    #[error("execute: {0}")]
    Execute(#[from] ExecuteError),
    #[error("list collections: {0}")]
    List(#[from] ListError),
}

impl DataSourceError {
    pub fn status(&self) -> Status {
        Status::BadRequest
    }
}

/// Validate the instance settings and turn them into connection options.
pub fn connect_options(settings: &InstanceSettings) -> Result<ConnectOptions, DataSourceError> {
    let parsed = DataSourceSettings::parse(&settings.json_data)?;
    let project_id = match parsed.project_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => return Err(DataSourceError::MissingProjectId),
    };

    let service_account = match settings.service_account() {
        Some(blob) => {
            if serde_json::from_str::<serde_json::Value>(blob).is_err() {
                return Err(DataSourceError::InvalidServiceAccount);
            }
            Some(blob.to_string())
        }
        None => None,
    };

    Ok(ConnectOptions {
        project_id,
        database: parsed.database.filter(|d| !d.is_empty()),
        service_account,
    })
}

/// Serves queries and health checks against one document backend.
#[derive(Clone)]
pub struct DataSource {
    backend: Arc<dyn DocumentBackend>,
}

impl DataSource {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }

    /// Handle every query of a request. Queries run concurrently on the
    /// blocking pool and share nothing but the settings.
    pub async fn query_data(&self, request: QueryDataRequest) -> QueryDataResponse {
        tracing::debug!(queries = request.queries.len(), "query data called");

        let settings = Arc::new(request.settings);
        let handles: Vec<_> = request
            .queries
            .into_iter()
            .map(|query| {
                let backend = Arc::clone(&self.backend);
                let settings = Arc::clone(&settings);
                let ref_id = query.ref_id.clone();
                let handle = tokio::task::spawn_blocking(move || {
                    run_guarded(backend.as_ref(), &settings, &query)
                });
                (ref_id, handle)
            })
            .collect();

        let mut response = QueryDataResponse::default();
        for (ref_id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(ref_id = %ref_id, error = %err, "query task failed");
                    DataResponse::internal_error()
                }
            };
            response.responses.insert(ref_id, result);
        }
        response
    }

    /// Handle a single query on the calling thread.
    pub fn query(&self, settings: &InstanceSettings, query: &DataQuery) -> DataResponse {
        run_guarded(self.backend.as_ref(), settings, query)
    }

    pub fn check_health(&self, settings: &InstanceSettings) -> CheckHealthResult {
        tracing::debug!(backend = self.backend.name(), "check health called");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            probe_store(self.backend.as_ref(), settings)
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "health check failed");
                Some(err.to_string())
            }
            Err(payload) => {
                tracing::error!(panic = panic_message(payload.as_ref()), "health check panicked");
                Some(INTERNAL_ERROR_MESSAGE.to_string())
            }
        };

        match failure {
            None => CheckHealthResult {
                status: HealthStatus::Ok,
                message: HEALTHY_MESSAGE.to_string(),
            },
            Some(message) => CheckHealthResult {
                status: HealthStatus::Error,
                message,
            },
        }
    }
}

fn probe_store(
    backend: &dyn DocumentBackend,
    settings: &InstanceSettings,
) -> Result<(), DataSourceError> {
    let options = connect_options(settings)?;
    let store = backend.store(&options)?;
    match store.first_collection()? {
        Some(collection) => tracing::debug!(collection = %collection, "first collection"),
        None => tracing::debug!("store has no collections"),
    }
    Ok(())
}

fn run_guarded(
    backend: &dyn DocumentBackend,
    settings: &InstanceSettings,
    query: &DataQuery,
) -> DataResponse {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_query(backend, settings, query)));
    match outcome {
        Ok(Ok(frames)) => DataResponse::ok(frames),
        Ok(Err(err)) => {
            tracing::warn!(ref_id = %query.ref_id, error = %err, "query failed");
            DataResponse::error(err.status(), err.to_string())
        }
        Err(payload) => {
            tracing::error!(
                ref_id = %query.ref_id,
                panic = panic_message(payload.as_ref()),
                "panic while running query"
            );
            DataResponse::internal_error()
        }
    }
}

fn run_query(
    backend: &dyn DocumentBackend,
    settings: &InstanceSettings,
    query: &DataQuery,
) -> Result<Vec<Table>, DataSourceError> {
    let model = QueryModel::parse(&query.json)?;
    let options = connect_options(settings)?;
    let executor = backend.executor(&options)?;
    tracing::debug!(datasource = %options.display_string(), backend = backend.name(), "executor ready");

    if model.query.trim().is_empty() {
        return Ok(vec![]);
    }

    tracing::info!(ref_id = %query.ref_id, "executing query");
    let (result, elapsed) = execute_timed(executor.as_ref(), &model.query);
    let result = result?;
    tracing::debug!(
        ref_id = %query.ref_id,
        rows = result.row_count(),
        elapsed_ms = duration_ms(elapsed),
        "query executed"
    );

    Ok(vec![build_table(&result)])
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DocumentStore, QueryExecutor, RawValue, ResultSet};
    use crate::frame::{ColumnData, FieldType};

    /// Backend whose behavior is picked by the query text.
    struct ScriptedBackend {
        collections: Vec<String>,
        list_error: Option<ListError>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                collections: vec!["users".into()],
                list_error: None,
            }
        }
    }

    struct ScriptedExecutor;

    impl QueryExecutor for ScriptedExecutor {
        fn execute(&self, query: &str) -> Result<ResultSet, ExecuteError> {
            match query {
                "boom" => panic!("executor exploded"),
                "bad" => Err(ExecuteError::Syntax("unexpected token".into())),
                _ => Ok(ResultSet::new(
                    vec!["__name__".into(), "n".into()],
                    vec![
                        vec![RawValue::from("projects/p/documents/col/doc1"), RawValue::Int64(5)],
                        vec![RawValue::from("projects/p/documents/col/doc2"), RawValue::from("x")],
                    ],
                )),
            }
        }
    }

    struct ScriptedStore {
        collections: Vec<String>,
        error: Option<ListError>,
    }

    impl DocumentStore for ScriptedStore {
        fn first_collection(&self) -> Result<Option<String>, ListError> {
            match &self.error {
                Some(err) => Err(err.clone()),
                None => Ok(self.collections.first().cloned()),
            }
        }
    }

    impl DocumentBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn executor(
            &self,
            options: &ConnectOptions,
        ) -> Result<Box<dyn QueryExecutor>, ConnectError> {
            if options.project_id == "offline" {
                return Err(ConnectError::Unavailable("no route".into()));
            }
            Ok(Box::new(ScriptedExecutor))
        }

        fn store(&self, _options: &ConnectOptions) -> Result<Box<dyn DocumentStore>, ConnectError> {
            Ok(Box::new(ScriptedStore {
                collections: self.collections.clone(),
                error: self.list_error.clone(),
            }))
        }
    }

    fn datasource() -> DataSource {
        DataSource::new(Arc::new(ScriptedBackend::new()))
    }

    fn settings() -> InstanceSettings {
        InstanceSettings::new(r#"{"projectId":"proj"}"#)
    }

    #[test]
    fn test_connect_options_requires_project() {
        let err = connect_options(&InstanceSettings::new("{}")).unwrap_err();
        assert!(matches!(err, DataSourceError::MissingProjectId));
        let err = connect_options(&InstanceSettings::new(r#"{"projectId":"  "}"#)).unwrap_err();
        assert!(matches!(err, DataSourceError::MissingProjectId));
    }

    #[test]
    fn test_connect_options_malformed_settings() {
        let err = connect_options(&InstanceSettings::new("{not json")).unwrap_err();
        assert!(matches!(err, DataSourceError::Settings(_)));
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[test]
    fn test_connect_options_legacy_keys() {
        let opts =
            connect_options(&InstanceSettings::new(r#"{"ProjectId":"old","database":""}"#))
                .unwrap();
        assert_eq!(opts.project_id, "old");
        assert!(opts.database.is_none());

        let opts = connect_options(&InstanceSettings::new(
            r#"{"projectid":"lower","Database":"orders"}"#,
        ))
        .unwrap();
        assert_eq!(opts.project_id, "lower");
        assert_eq!(opts.database.as_deref(), Some("orders"));
    }

    #[test]
    fn test_connect_options_null_project_is_missing() {
        let err = connect_options(&InstanceSettings::new(r#"{"projectId":null}"#)).unwrap_err();
        assert!(matches!(err, DataSourceError::MissingProjectId));
        assert_eq!(err.to_string(), "ProjectID is required");
    }

    #[test]
    fn test_connect_options_service_account_must_be_json() {
        let bad = settings().with_secure(SERVICE_ACCOUNT_KEY, "not-json");
        assert!(matches!(
            connect_options(&bad).unwrap_err(),
            DataSourceError::InvalidServiceAccount
        ));

        let good = settings().with_secure(SERVICE_ACCOUNT_KEY, r#"{"type":"service_account"}"#);
        let opts = connect_options(&good).unwrap();
        assert!(opts.service_account.is_some());

        let empty = settings().with_secure(SERVICE_ACCOUNT_KEY, "");
        assert!(connect_options(&empty).unwrap().service_account.is_none());
    }

    #[test]
    fn test_from_options_roundtrip() {
        let options = ConnectOptions::new("proj")
            .with_database("db")
            .with_service_account("{}");
        let parsed = connect_options(&InstanceSettings::from_options(&options)).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_debug_hides_secure_values() {
        let s = settings().with_secure(SERVICE_ACCOUNT_KEY, r#"{"private_key":"s3cret"}"#);
        let debug = format!("{:?}", s);
        assert!(debug.contains(SERVICE_ACCOUNT_KEY));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_query_builds_table() {
        let response = datasource().query(&settings(), &DataQuery::text("A", "select"));
        assert!(response.is_ok());
        assert_eq!(response.frames.len(), 1);
        let table = &response.frames[0];
        assert_eq!(
            table.id.data,
            ColumnData::String(vec![Some("doc1".into()), Some("doc2".into())])
        );
        assert_eq!(table.field("n").unwrap().field_type(), FieldType::String);
    }

    #[test]
    fn test_empty_query_returns_no_frames() {
        let response = datasource().query(&settings(), &DataQuery::text("A", "  "));
        assert!(response.is_ok());
        assert!(response.frames.is_empty());
        assert!(response.error.is_none());

        let response = datasource().query(&settings(), &DataQuery::new("A", "{}"));
        assert!(response.is_ok());
        assert!(response.frames.is_empty());
    }

    #[test]
    fn test_legacy_query_key() {
        let response = datasource().query(&settings(), &DataQuery::new("A", r#"{"Query":"q"}"#));
        assert_eq!(response.frames.len(), 1);
    }

    #[test]
    fn test_malformed_query_json_is_bad_request() {
        let response = datasource().query(&settings(), &DataQuery::new("A", "{"));
        assert_eq!(response.status, Status::BadRequest);
        assert!(response.error.unwrap().starts_with("json unmarshal:"));
    }

    #[test]
    fn test_execution_error_is_bad_request_with_cause() {
        let response = datasource().query(&settings(), &DataQuery::text("A", "bad"));
        assert_eq!(response.status, Status::BadRequest);
        assert_eq!(
            response.error.as_deref(),
            Some("execute: syntax error: unexpected token")
        );
    }

    #[test]
    fn test_connect_error_is_bad_request() {
        let settings = InstanceSettings::new(r#"{"projectId":"offline"}"#);
        let response = datasource().query(&settings, &DataQuery::text("A", "q"));
        assert_eq!(response.status, Status::BadRequest);
        assert_eq!(response.error.as_deref(), Some("connect: no route"));
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let response = datasource().query(&settings(), &DataQuery::text("A", "boom"));
        assert_eq!(response.status, Status::Internal);
        assert_eq!(response.error.as_deref(), Some("internal error"));
        assert_eq!(response.status.code(), 500);
    }

    #[tokio::test]
    async fn test_query_data_runs_every_query() {
        let request = QueryDataRequest {
            settings: settings(),
            queries: vec![
                DataQuery::text("A", "select"),
                DataQuery::text("B", "boom"),
                DataQuery::text("C", "bad"),
                DataQuery::text("D", ""),
            ],
        };
        let response = datasource().query_data(request).await;
        assert_eq!(response.responses.len(), 4);
        assert_eq!(response.responses["A"].frames.len(), 1);
        assert_eq!(response.responses["B"].status, Status::Internal);
        assert_eq!(response.responses["C"].status, Status::BadRequest);
        assert!(response.responses["D"].is_ok());
        assert!(response.responses["D"].frames.is_empty());
    }

    #[test]
    fn test_health_ok() {
        let result = datasource().check_health(&settings());
        assert_eq!(result.status, HealthStatus::Ok);
        assert_eq!(result.message, HEALTHY_MESSAGE);
    }

    #[test]
    fn test_health_ok_when_store_is_empty() {
        let backend = ScriptedBackend {
            collections: vec![],
            list_error: None,
        };
        let result = DataSource::new(Arc::new(backend)).check_health(&settings());
        assert_eq!(result.status, HealthStatus::Ok);
    }

    #[test]
    fn test_health_reports_list_error() {
        let backend = ScriptedBackend {
            collections: vec![],
            list_error: Some(ListError::PermissionDenied("missing role".into())),
        };
        let result = DataSource::new(Arc::new(backend)).check_health(&settings());
        assert_eq!(result.status, HealthStatus::Error);
        assert_eq!(
            result.message,
            "list collections: permission denied: missing role"
        );
    }

    #[test]
    fn test_health_reports_settings_error() {
        let result = datasource().check_health(&InstanceSettings::new("{}"));
        assert_eq!(result.status, HealthStatus::Error);
        assert_eq!(result.message, "ProjectID is required");
    }
}
