//! Store client for a JSON action gateway in front of the wide-column
//! service.
//!
//! The gateway protocol is not the service's native protobuf API with
//! HMAC request signing, so `end_point` must point at a gateway, not at
//! the service's public endpoint. Every call is a `POST {end_point}/{Action}`
//! with a JSON body naming the table and rows, signed with the headers
//! described in [`RequestSigner`]. Binary attributes travel
//! base64-encoded. Batch calls are split at the service's documented
//! per-request limits; nothing is retried here.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ConfigError, NodeStoreConfig};

use super::client::StoreClient;
use super::error::{BatchFailure, StoreError};
use super::signing::RequestSigner;
use super::types::{
    PrimaryKeyColumn, ReservedThroughput, Row, RowValue, TableOptions, TableSchema,
};
use super::{BATCH_GET_LIMIT, BATCH_WRITE_LIMIT, DATA_COLUMN, FLAGS_COLUMN, ID_COLUMN};

const CONDITION_IGNORE: &str = "IGNORE";

/// Error codes the service uses when it wants the caller to back off.
const THROTTLE_CODES: &[&str] = &[
    "OTSServerBusy",
    "OTSQuotaExhausted",
    "OTSCapacityUnitExhausted",
    "OTSRowOperationConflict",
    "OTSTooFrequentReservedThroughputAdjustment",
];

const AUTH_CODES: &[&str] = &["OTSAuthFailed", "OTSNoPermissionAccess"];

const NOT_EXIST_CODE: &str = "OTSObjectNotExist";

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyColumn {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColumnValue {
    Binary(String),
    Integer(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Column {
    name: String,
    value: ColumnValue,
    /// Server write time in milliseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRow {
    primary_key: Vec<KeyColumn>,
    #[serde(default)]
    attribute_columns: Vec<Column>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Serialize)]
struct PutRowRequest<'a> {
    table_name: &'a str,
    row: WireRow,
    condition: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_to_live: Option<u64>,
}

#[derive(Serialize)]
struct GetRowRequest<'a> {
    table_name: &'a str,
    primary_key: Vec<KeyColumn>,
    max_versions: u32,
}

#[derive(Deserialize)]
struct GetRowResponse {
    #[serde(default)]
    row: Option<WireRow>,
}

#[derive(Serialize)]
struct DeleteRowRequest<'a> {
    table_name: &'a str,
    primary_key: Vec<KeyColumn>,
    condition: &'static str,
}

#[derive(Serialize)]
struct BatchGetRowRequest<'a> {
    tables: [BatchGetTable<'a>; 1],
}

#[derive(Serialize)]
struct BatchGetTable<'a> {
    table_name: &'a str,
    primary_keys: Vec<Vec<KeyColumn>>,
    max_versions: u32,
}

#[derive(Serialize)]
struct BatchWriteRowRequest<'a> {
    tables: [BatchWriteTable<'a>; 1],
}

#[derive(Serialize)]
struct BatchWriteTable<'a> {
    table_name: &'a str,
    rows: Vec<BatchWriteItem>,
}

#[derive(Serialize)]
struct BatchWriteItem {
    #[serde(rename = "type")]
    op: &'static str,
    primary_key: Vec<KeyColumn>,
    condition: &'static str,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    tables: Vec<BatchTableResult>,
}

#[derive(Deserialize)]
struct BatchTableResult {
    #[serde(default)]
    rows: Vec<BatchRowResult>,
}

#[derive(Deserialize)]
struct BatchRowResult {
    is_ok: bool,
    #[serde(default)]
    row: Option<WireRow>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Serialize, Deserialize)]
struct TableMeta {
    table_name: String,
    schema_of_primary_key: Vec<PrimaryKeyColumn>,
}

#[derive(Serialize, Deserialize)]
struct WireTableOptions {
    time_to_live: i64,
    max_versions: u32,
}

impl From<TableOptions> for WireTableOptions {
    fn from(options: TableOptions) -> Self {
        Self {
            time_to_live: options.ttl_seconds(),
            max_versions: options.max_versions,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireThroughput {
    capacity_unit: ReservedThroughput,
}

#[derive(Serialize)]
struct TableNameRequest<'a> {
    table_name: &'a str,
}

#[derive(Deserialize)]
struct DescribeTableResponse {
    table_meta: TableMeta,
    table_options: WireTableOptions,
    reserved_throughput_details: WireThroughput,
}

#[derive(Serialize)]
struct CreateTableRequest {
    table_meta: TableMeta,
    table_options: WireTableOptions,
    reserved_throughput: WireThroughput,
}

#[derive(Serialize)]
struct UpdateTableRequest<'a> {
    table_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    table_options: Option<WireTableOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reserved_throughput: Option<WireThroughput>,
}

fn primary_key(id: &str) -> Vec<KeyColumn> {
    vec![KeyColumn {
        name: ID_COLUMN.to_string(),
        value: id.to_string(),
    }]
}

impl WireRow {
    fn from_value(id: &str, value: RowValue) -> Self {
        let mut attribute_columns = vec![Column {
            name: DATA_COLUMN.to_string(),
            value: ColumnValue::Binary(BASE64.encode(&value.data)),
            timestamp: None,
        }];
        // Only write the flags column at all if any flags are set
        if value.flags != 0 {
            attribute_columns.push(Column {
                name: FLAGS_COLUMN.to_string(),
                value: ColumnValue::Integer(i64::from(value.flags)),
                timestamp: None,
            });
        }

        Self {
            primary_key: primary_key(id),
            attribute_columns,
        }
    }

    fn id(&self) -> Option<&str> {
        self.primary_key
            .iter()
            .find(|column| column.name == ID_COLUMN)
            .map(|column| column.value.as_str())
    }

    /// Converts a returned row. Rows without a data column are logged and
    /// treated as absent.
    fn into_row(self, id: &str) -> Result<Option<Row>, StoreError> {
        let mut data = None;
        let mut flags = 0u8;

        for column in self.attribute_columns {
            match (column.name.as_str(), column.value) {
                (DATA_COLUMN, ColumnValue::Binary(encoded)) => {
                    let bytes = BASE64.decode(encoded).map_err(|e| {
                        StoreError::service("OTSMalformedResponse", format!("row '{id}': {e}"))
                    })?;
                    data = Some((bytes, column.timestamp));
                },
                (FLAGS_COLUMN, ColumnValue::Integer(value)) => {
                    // Out-of-range markers surface as unknown flags on decode
                    flags = u8::try_from(value).unwrap_or(u8::MAX);
                },
                _ => {},
            }
        }

        let Some((data, timestamp)) = data else {
            warn!(id, "Retrieved row which does not contain a data column");
            return Ok(None);
        };

        let written_at = timestamp
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(Some(Row {
            value: RowValue { data, flags },
            written_at,
        }))
    }
}

// =============================================================================
// Client
// =============================================================================

/// Store client speaking the JSON gateway protocol.
///
/// `HttpStore` is `Clone`; clones share one connection pool.
#[derive(Clone, Debug)]
pub struct HttpStore {
    client: reqwest::Client,
    base: Url,
    table: String,
    signer: RequestSigner,
}

impl HttpStore {
    /// Creates a client from the backend configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `end_point` is not an absolute `http(s)` URL or
    /// the HTTP client cannot be built.
    pub fn new(config: &NodeStoreConfig) -> Result<Self, ConfigError> {
        let mut base = Url::parse(&config.end_point).map_err(|e| ConfigError::Invalid {
            field: "end_point",
            reason: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "end_point",
                reason: format!("unsupported scheme '{}'", base.scheme()),
            });
        }
        // Url::join replaces the last segment unless the path ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "end_point",
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base,
            table: config.table.clone(),
            signer: RequestSigner::new(
                config.access_key_id.clone(),
                &config.access_key_secret,
                config.instance.clone(),
            ),
        })
    }

    async fn call<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp, StoreError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = self
            .base
            .join(action)
            .map_err(|e| StoreError::Transport(format!("invalid action URL '{action}': {e}")))?;
        let body = serde_json::to_vec(request)
            .map_err(|e| StoreError::service("OTSClientError", e.to_string()))?;
        let signed = self.signer.sign(action, &body);

        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in signed.pairs() {
            builder = builder.header(name, value);
        }

        let response = builder.body(body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let err = self.error_from_response(status, &bytes);
            debug!(action, %status, error = %err, "Store call failed");
            return Err(err);
        }

        let payload: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(payload).map_err(|e| {
            StoreError::service(
                "OTSMalformedResponse",
                format!("{action} returned an unreadable body: {e}"),
            )
        })
    }

    fn error_from_response(&self, status: StatusCode, body: &[u8]) -> StoreError {
        let WireError { code, message } =
            serde_json::from_slice(body).unwrap_or_else(|_| WireError {
                code: String::new(),
                message: String::from_utf8_lossy(body).into_owned(),
            });
        let code = if code.is_empty() {
            status.to_string()
        } else {
            code
        };

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
            || AUTH_CODES.contains(&code.as_str())
        {
            StoreError::Auth(format!("{code}: {message}"))
        } else if matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
        ) || THROTTLE_CODES.contains(&code.as_str())
        {
            StoreError::Throttled(format!("{code}: {message}"))
        } else if code == NOT_EXIST_CODE {
            StoreError::TableNotFound(self.table.clone())
        } else {
            StoreError::Service { code, message }
        }
    }
}

fn batch_failure(id: &str, error: Option<WireError>) -> BatchFailure {
    let error = error.unwrap_or(WireError {
        code: "OTSUnknownError".to_string(),
        message: String::new(),
    });
    BatchFailure {
        id: id.to_string(),
        code: error.code,
        message: error.message,
    }
}

fn check_batch_len(action: &str, sent: usize, received: usize) -> Result<(), StoreError> {
    if sent == received {
        Ok(())
    } else {
        Err(StoreError::service(
            "OTSMalformedResponse",
            format!("{action} answered {received} rows for {sent} requested"),
        ))
    }
}

#[async_trait]
impl StoreClient for HttpStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn put(
        &self,
        id: &str,
        value: RowValue,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let request = PutRowRequest {
            table_name: &self.table,
            row: WireRow::from_value(id, value),
            condition: CONDITION_IGNORE,
            time_to_live: ttl.map(|ttl| ttl.as_secs()),
        };
        let _: Empty = self.call("PutRow", &request).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Row>, StoreError> {
        let request = GetRowRequest {
            table_name: &self.table,
            primary_key: primary_key(id),
            max_versions: 1,
        };
        let response: GetRowResponse = self.call("GetRow", &request).await?;
        match response.row {
            Some(row) => row.into_row(id),
            None => Ok(None),
        }
    }

    async fn get_multi(&self, ids: &[String]) -> Result<HashMap<String, Row>, StoreError> {
        let mut rows = HashMap::with_capacity(ids.len());
        let mut failed = Vec::new();
        let mut finished = 0;

        for chunk in ids.chunks(BATCH_GET_LIMIT) {
            let request = BatchGetRowRequest {
                tables: [BatchGetTable {
                    table_name: &self.table,
                    primary_keys: chunk.iter().map(|id| primary_key(id)).collect(),
                    max_versions: 1,
                }],
            };
            let response: BatchResponse = self.call("BatchGetRow", &request).await?;
            let results = response
                .tables
                .into_iter()
                .next()
                .map(|table| table.rows)
                .unwrap_or_default();
            check_batch_len("BatchGetRow", chunk.len(), results.len())?;

            for (id, result) in chunk.iter().zip(results) {
                if !result.is_ok {
                    let failure = batch_failure(id, result.error);
                    debug!(id = %id, code = %failure.code, message = %failure.message, "Failed to get row");
                    failed.push(failure);
                    continue;
                }
                let Some(wire) = result.row else { continue };
                // Misses come back as empty rows
                if wire.id().is_none() && wire.attribute_columns.is_empty() {
                    continue;
                }
                if let Some(row) = wire.into_row(id)? {
                    rows.insert(id.clone(), row);
                }
            }

            finished += chunk.len();
            debug!(
                total = ids.len(),
                finished,
                failed = failed.len(),
                "Batch getting rows"
            );
        }

        if failed.is_empty() {
            Ok(rows)
        } else {
            Err(StoreError::BatchFailed { failed })
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let request = DeleteRowRequest {
            table_name: &self.table,
            primary_key: primary_key(id),
            condition: CONDITION_IGNORE,
        };
        let _: Empty = self.call("DeleteRow", &request).await?;
        debug!(id, "Row has been deleted");
        Ok(())
    }

    async fn delete_multi(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut failed = Vec::new();
        let mut finished = 0;

        for chunk in ids.chunks(BATCH_WRITE_LIMIT) {
            let request = BatchWriteRowRequest {
                tables: [BatchWriteTable {
                    table_name: &self.table,
                    rows: chunk
                        .iter()
                        .map(|id| BatchWriteItem {
                            op: "DELETE",
                            primary_key: primary_key(id),
                            condition: CONDITION_IGNORE,
                        })
                        .collect(),
                }],
            };
            let response: BatchResponse = self.call("BatchWriteRow", &request).await?;
            let results = response
                .tables
                .into_iter()
                .next()
                .map(|table| table.rows)
                .unwrap_or_default();
            check_batch_len("BatchWriteRow", chunk.len(), results.len())?;

            failed.extend(
                chunk
                    .iter()
                    .zip(results)
                    .filter(|(_, result)| !result.is_ok)
                    .map(|(id, result)| batch_failure(id, result.error)),
            );

            finished += chunk.len();
            debug!(
                total = ids.len(),
                finished,
                failed = failed.len(),
                "Batch deleting rows"
            );
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(StoreError::BatchFailed { failed })
        }
    }

    async fn describe_table(&self) -> Result<Option<TableSchema>, StoreError> {
        let request = TableNameRequest {
            table_name: &self.table,
        };
        let response: DescribeTableResponse = match self.call("DescribeTable", &request).await {
            Ok(response) => response,
            Err(StoreError::TableNotFound(_)) => {
                debug!(table = %self.table, "Table does not exist");
                return Ok(None);
            },
            Err(e) => return Err(e),
        };

        Ok(Some(TableSchema {
            name: response.table_meta.table_name,
            primary_key: response.table_meta.schema_of_primary_key,
            options: TableOptions::from_ttl_seconds(
                response.table_options.time_to_live,
                response.table_options.max_versions,
            ),
            reserved_throughput: response.reserved_throughput_details.capacity_unit,
        }))
    }

    async fn create_table(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let request = CreateTableRequest {
            table_meta: TableMeta {
                table_name: schema.name.clone(),
                schema_of_primary_key: schema.primary_key.clone(),
            },
            table_options: schema.options.into(),
            reserved_throughput: WireThroughput {
                capacity_unit: schema.reserved_throughput,
            },
        };
        let _: Empty = self.call("CreateTable", &request).await?;
        Ok(())
    }

    async fn update_table(
        &self,
        options: Option<TableOptions>,
        reserved_throughput: Option<ReservedThroughput>,
    ) -> Result<(), StoreError> {
        let request = UpdateTableRequest {
            table_name: &self.table,
            table_options: options.map(Into::into),
            reserved_throughput: reserved_throughput
                .map(|capacity_unit| WireThroughput { capacity_unit }),
        };
        let _: Empty = self.call("UpdateTable", &request).await?;
        Ok(())
    }

    async fn drop_table(&self) -> Result<(), StoreError> {
        let request = TableNameRequest {
            table_name: &self.table,
        };
        let _: Empty = self.call("DeleteTable", &request).await?;
        Ok(())
    }
}
