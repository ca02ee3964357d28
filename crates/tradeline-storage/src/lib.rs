//! External boundaries of the tradeline pipeline: the report blob fetcher and
//! the record sources that list `(identifier, report reference)` pairs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, QueryBuilder, Row};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use tradeline_core::SourceRecord;

pub const CRATE_NAME: &str = "tradeline-storage";

pub type RawReport = JsonValue;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {reference} failed: {source}")]
    Request {
        reference: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {reference} ({url})")]
    HttpStatus {
        reference: String,
        status: u16,
        url: String,
    },
    #[error("report {reference} is not valid json: {source}")]
    Decode {
        reference: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("report {reference} unavailable: {message}")]
    Unavailable { reference: String, message: String },
}

impl FetchError {
    pub fn reference(&self) -> &str {
        match self {
            FetchError::Request { reference, .. }
            | FetchError::HttpStatus { reference, .. }
            | FetchError::Decode { reference, .. }
            | FetchError::Unavailable { reference, .. } => reference,
        }
    }
}

#[async_trait]
pub trait ReportFetcher: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<RawReport, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpReportFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReportFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }

    pub fn url_for(&self, reference: &str) -> String {
        format!("{}{}", self.base_url, reference)
    }
}

#[async_trait]
impl ReportFetcher for HttpReportFetcher {
    async fn fetch(&self, reference: &str) -> Result<RawReport, FetchError> {
        let url = self.url_for(reference);
        let span = info_span!("report_fetch", reference, url = %url);

        async {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    reference: reference.to_string(),
                    source,
                })?;

            let status = resp.status();
            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus {
                    reference: reference.to_string(),
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.bytes().await.map_err(|source| FetchError::Request {
                reference: reference.to_string(),
                source,
            })?;
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                reference: reference.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot connect to record source: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("record query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("invalid source table name {0:?}")]
    InvalidTable(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Lists source records most recent first. `allow_list` restricts the result
/// to the given identifiers; an empty allow-list matches nothing.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_records(
        &self,
        allow_list: Option<&[String]>,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct MySqlRecordSource {
    database_url: String,
    table: String,
    connect_timeout: Duration,
}

impl MySqlRecordSource {
    pub fn new(database_url: impl Into<String>, table: impl Into<String>) -> Result<Self, SourceError> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(SourceError::InvalidTable(table));
        }
        Ok(Self {
            database_url: database_url.into(),
            table,
            connect_timeout: Duration::from_secs(15),
        })
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn build_query(&self, allow_list: Option<&[String]>) -> QueryBuilder<'static, MySql> {
        let mut query = QueryBuilder::new(format!(
            "SELECT pancardNumber, recommendationJsonFile FROM {}",
            self.table
        ));
        if let Some(identifiers) = allow_list {
            query.push(" WHERE pancardNumber IN (");
            let mut values = query.separated(", ");
            for identifier in identifiers {
                values.push_bind(identifier.clone());
            }
            values.push_unseparated(")");
        }
        query.push(" ORDER BY createdAt DESC");
        query
    }
}

#[async_trait]
impl RecordSource for MySqlRecordSource {
    async fn fetch_records(
        &self,
        allow_list: Option<&[String]>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        if allow_list.is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.database_url)
            .await
            .map_err(SourceError::Connect)?;

        let mut query = self.build_query(allow_list);
        let rows = query.build().fetch_all(&pool).await;
        pool.close().await;
        let rows = rows.map_err(SourceError::Query)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let identifier: Option<String> =
                row.try_get("pancardNumber").map_err(SourceError::Query)?;
            let report_reference: Option<String> =
                row.try_get("recommendationJsonFile").map_err(SourceError::Query)?;
            records.push(SourceRecord {
                identifier: identifier.unwrap_or_default(),
                report_reference,
            });
        }
        info!(table = %self.table, records = records.len(), "fetched source records");
        Ok(records)
    }

    fn describe(&self) -> String {
        format!("mysql table {}", self.table)
    }
}

fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

#[derive(Debug, Clone)]
pub struct CsvRecordSource {
    path: PathBuf,
}

impl CsvRecordSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSource for CsvRecordSource {
    async fn fetch_records(
        &self,
        allow_list: Option<&[String]>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes.as_slice());

        let mut records = Vec::new();
        for result in reader.records() {
            let record = result.map_err(|source| SourceError::Csv {
                path: self.path.clone(),
                source,
            })?;
            let identifier = record.get(0).unwrap_or_default().to_string();
            let report_reference = record
                .get(1)
                .filter(|r| !r.is_empty())
                .map(str::to_string);
            records.push(SourceRecord {
                identifier,
                report_reference,
            });
        }
        Ok(filter_by_allow_list(records, allow_list))
    }

    fn describe(&self) -> String {
        format!("csv file {}", self.path.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRecordSource {
    records: Vec<SourceRecord>,
}

impl StaticRecordSource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    async fn fetch_records(
        &self,
        allow_list: Option<&[String]>,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        Ok(filter_by_allow_list(self.records.clone(), allow_list))
    }

    fn describe(&self) -> String {
        format!("{} in-memory records", self.records.len())
    }
}

fn filter_by_allow_list(records: Vec<SourceRecord>, allow_list: Option<&[String]>) -> Vec<SourceRecord> {
    match allow_list {
        None => records,
        Some(ids) => records
            .into_iter()
            .filter(|r| ids.iter().any(|id| id == &r.identifier))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/bucket/")
    }

    fn fetcher(base_url: String) -> HttpReportFetcher {
        HttpReportFetcher::new(HttpClientConfig {
            base_url,
            timeout: Duration::from_secs(5),
            user_agent: Some("tradeline-test".into()),
        })
        .expect("client")
    }

    #[test]
    fn url_is_base_plus_reference() {
        let f = fetcher("https://store.example/prod/".into());
        assert_eq!(f.url_for("abc.json"), "https://store.example/prod/abc.json");
    }

    #[tokio::test]
    async fn fetch_returns_json_on_200() {
        let base = serve_once("200 OK", r#"{"data":{"reportData":{}}}"#).await;
        let report = fetcher(base).fetch("r1.json").await.expect("report");
        assert!(report.get("data").is_some());
    }

    #[tokio::test]
    async fn non_200_is_http_status_error() {
        let base = serve_once("404 Not Found", "{}").await;
        let err = fetcher(base).fetch("missing.json").await.unwrap_err();
        match err {
            FetchError::HttpStatus { status, reference, .. } => {
                assert_eq!(status, 404);
                assert_eq!(reference, "missing.json");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn invalid_body_is_decode_error() {
        let base = serve_once("200 OK", "not json").await;
        let err = fetcher(base).fetch("broken.json").await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
        assert_eq!(err.reference(), "broken.json");
    }

    #[tokio::test]
    async fn silent_server_hits_the_fetch_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        let fetcher = HttpReportFetcher::new(HttpClientConfig {
            base_url: format!("http://{addr}/"),
            timeout: Duration::from_millis(200),
            user_agent: None,
        })
        .expect("client");

        let result = tokio::time::timeout(Duration::from_secs(2), fetcher.fetch("slow.json"))
            .await
            .expect("fetch must give up before the outer deadline");
        match result {
            Err(FetchError::Request { reference, source }) => {
                assert_eq!(reference, "slow.json");
                assert!(source.is_timeout());
            }
            other => panic!("expected request timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = fetcher(format!("http://{addr}/"))
            .fetch("gone.json")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }));
    }

    #[tokio::test]
    async fn csv_source_reads_rows_and_filters() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "identifier,report_reference").unwrap();
        writeln!(file, "ABCDE1234F,a-new.json").unwrap();
        writeln!(file, "ABCDE1234F,a-old.json").unwrap();
        writeln!(file, "PQRST6789Z,").unwrap();
        writeln!(file, "LMNOP1111Q,c.json").unwrap();

        let source = CsvRecordSource::new(file.path());
        let all = source.fetch_records(None).await.expect("records");
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], SourceRecord::new("ABCDE1234F", Some("a-new.json")));
        assert_eq!(all[2].report_reference, None);

        let allow = vec!["LMNOP1111Q".to_string()];
        let filtered = source.fetch_records(Some(&allow)).await.expect("records");
        assert_eq!(filtered, vec![SourceRecord::new("LMNOP1111Q", Some("c.json"))]);
    }

    #[tokio::test]
    async fn missing_csv_is_io_error() {
        let source = CsvRecordSource::new("/nonexistent/records.csv");
        let err = source.fetch_records(None).await.unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[tokio::test]
    async fn empty_allow_list_matches_nothing() {
        let source = StaticRecordSource::new(vec![SourceRecord::new("A", Some("a.json"))]);
        let empty: Vec<String> = Vec::new();
        assert!(source.fetch_records(Some(&empty)).await.unwrap().is_empty());
        assert_eq!(source.fetch_records(None).await.unwrap().len(), 1);
    }

    #[test]
    fn table_names_are_validated() {
        assert!(MySqlRecordSource::new("mysql://localhost/db", "qfinance.q_report").is_ok());
        assert!(matches!(
            MySqlRecordSource::new("mysql://localhost/db", "q_report; DROP TABLE x"),
            Err(SourceError::InvalidTable(_))
        ));
        assert!(MySqlRecordSource::new("mysql://localhost/db", "qfinance.").is_err());
    }

    #[test]
    fn query_binds_allow_list() {
        let source = MySqlRecordSource::new("mysql://localhost/db", "qfinance.q_report").unwrap();
        let ids = vec!["ABCDE1234F".to_string(), "PQRST6789Z".to_string()];
        let query = source.build_query(Some(&ids));
        assert_eq!(
            query.sql(),
            "SELECT pancardNumber, recommendationJsonFile FROM qfinance.q_report WHERE pancardNumber IN (?, ?) ORDER BY createdAt DESC"
        );
        let query = source.build_query(None);
        assert!(!query.sql().contains("WHERE"));
    }
}
