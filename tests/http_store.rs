//! End-to-end tests for the managed-service client against a fake service.
//!
//! The fake speaks the JSON action API, checks every request signature and
//! keeps its table in memory.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use tablestore_nodestore::store::{RequestSigner, SignedHeaders};
use tablestore_nodestore::{
    Compression, ConfigError, Error, NodeStore, NodeStoreConfig, ReservedThroughput, StoreClient,
    StoreError,
};

const KEY_ID: &str = "test-key";
const SECRET: &str = "test-secret";

#[derive(Default)]
struct State {
    /// (ttl seconds, read, write) of the table, if it exists
    table: Option<(i64, u32, u32)>,
    /// id -> (base64 data, flags, write time ms)
    rows: HashMap<String, (String, Option<i64>, i64)>,
    failing: HashSet<String>,
    actions: Vec<String>,
}

#[derive(Clone)]
struct FakeService {
    signer: RequestSigner,
    state: Arc<Mutex<State>>,
}

impl FakeService {
    fn new() -> Self {
        Self {
            signer: RequestSigner::new(KEY_ID, SECRET, "sentry"),
            state: Arc::default(),
        }
    }

    async fn start(&self) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(self.clone())
            .mount(&server)
            .await;
        server
    }

    fn calls(&self, action: &str) -> usize {
        self.state
            .lock()
            .actions
            .iter()
            .filter(|a| *a == action)
            .count()
    }

    fn backdate(&self, id: &str, age: Duration) {
        if let Some(row) = self.state.lock().rows.get_mut(id) {
            row.2 -= i64::try_from(age.as_millis()).unwrap();
        }
    }

    fn verify(&self, action: &str, request: &Request) -> bool {
        let header = |name: &str| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        let (
            Some(access_key_id),
            Some(instance),
            Some(date),
            Some(content_digest),
            Some(signature),
        ) = (
            header("x-ots-accesskeyid"),
            header("x-ots-instancename"),
            header("x-ots-date"),
            header("x-ots-contentdigest"),
            header("x-ots-signature"),
        ) else {
            return false;
        };
        access_key_id == KEY_ID
            && instance == "sentry"
            && blake3::hash(&request.body).to_hex().as_str() == content_digest
            && self.signer.verify(
                action,
                &SignedHeaders {
                    access_key_id,
                    instance,
                    date,
                    content_digest,
                    signature,
                },
            )
    }

    fn handle(&self, action: &str, body: &Value) -> ResponseTemplate {
        let mut state = self.state.lock();
        state.actions.push(action.to_string());

        let needs_table = !matches!(action, "DescribeTable" | "CreateTable");
        if needs_table && state.table.is_none() {
            return error(404, "OTSObjectNotExist", "Requested table does not exist.");
        }

        match action {
            "DescribeTable" => {
                let Some((ttl, read, write)) = state.table else {
                    return error(404, "OTSObjectNotExist", "Requested table does not exist.");
                };
                ok(json!({
                    "table_meta": {
                        "table_name": body["table_name"],
                        "schema_of_primary_key": [{"name": "id", "type": "STRING"}],
                    },
                    "table_options": {"time_to_live": ttl, "max_versions": 1},
                    "reserved_throughput_details": {
                        "capacity_unit": {"read": read, "write": write},
                    },
                }))
            },
            "CreateTable" => {
                if state.table.is_some() {
                    return error(409, "OTSObjectAlreadyExist", "Requested table already exists.");
                }
                let cu = &body["reserved_throughput"]["capacity_unit"];
                state.table = Some((
                    body["table_options"]["time_to_live"].as_i64().unwrap(),
                    cu["read"].as_u64().unwrap() as u32,
                    cu["write"].as_u64().unwrap() as u32,
                ));
                ResponseTemplate::new(200)
            },
            "UpdateTable" => {
                let table = state.table.as_mut().unwrap();
                if let Some(ttl) = body["table_options"]["time_to_live"].as_i64() {
                    table.0 = ttl;
                }
                let cu = &body["reserved_throughput"]["capacity_unit"];
                if let (Some(read), Some(write)) = (cu["read"].as_u64(), cu["write"].as_u64()) {
                    table.1 = read as u32;
                    table.2 = write as u32;
                }
                ResponseTemplate::new(200)
            },
            "DeleteTable" => {
                state.table = None;
                state.rows.clear();
                ResponseTemplate::new(200)
            },
            "PutRow" => {
                let row = &body["row"];
                let id = key(&row["primary_key"]);
                let mut data = String::new();
                let mut flags = None;
                for column in row["attribute_columns"].as_array().unwrap() {
                    match column["name"].as_str().unwrap() {
                        "data" => data = column["value"]["binary"].as_str().unwrap().to_string(),
                        "flags" => flags = column["value"]["integer"].as_i64(),
                        _ => {},
                    }
                }
                state
                    .rows
                    .insert(id, (data, flags, Utc::now().timestamp_millis()));
                ResponseTemplate::new(200)
            },
            "GetRow" => {
                let id = key(&body["primary_key"]);
                match state.rows.get(&id) {
                    Some(row) => ok(json!({"row": wire_row(&id, row)})),
                    None => ok(json!({})),
                }
            },
            "DeleteRow" => {
                let id = key(&body["primary_key"]);
                state.rows.remove(&id);
                ResponseTemplate::new(200)
            },
            "BatchGetRow" => {
                let keys = body["tables"][0]["primary_keys"].as_array().unwrap();
                let rows: Vec<Value> = keys
                    .iter()
                    .map(|pk| {
                        let id = key(pk);
                        if state.failing.contains(&id) {
                            json!({"is_ok": false, "error": {"code": "OTSInternalServerError", "message": "boom"}})
                        } else {
                            match state.rows.get(&id) {
                                Some(row) => json!({"is_ok": true, "row": wire_row(&id, row)}),
                                None => json!({"is_ok": true}),
                            }
                        }
                    })
                    .collect();
                ok(json!({"tables": [{"rows": rows}]}))
            },
            "BatchWriteRow" => {
                let items = body["tables"][0]["rows"].as_array().unwrap().clone();
                let mut rows = Vec::with_capacity(items.len());
                for item in &items {
                    let id = key(&item["primary_key"]);
                    if state.failing.contains(&id) {
                        rows.push(json!({"is_ok": false, "error": {"code": "OTSInternalServerError", "message": "boom"}}));
                    } else {
                        state.rows.remove(&id);
                        rows.push(json!({"is_ok": true}));
                    }
                }
                ok(json!({"tables": [{"rows": rows}]}))
            },
            other => error(400, "OTSUnsupportedOperation", &format!("unknown action {other}")),
        }
    }
}

impl Respond for FakeService {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let action = request.url.path().trim_start_matches('/').to_string();
        if !self.verify(&action, request) {
            return error(403, "OTSAuthFailed", "Signature mismatch.");
        }
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        self.handle(&action, &body)
    }
}

fn ok(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

fn error(status: u16, code: &str, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({"code": code, "message": message}))
}

fn key(primary_key: &Value) -> String {
    primary_key[0]["value"].as_str().unwrap().to_string()
}

fn wire_row(id: &str, (data, flags, timestamp): &(String, Option<i64>, i64)) -> Value {
    let mut columns = vec![json!({
        "name": "data",
        "value": {"binary": data},
        "timestamp": timestamp,
    })];
    if let Some(flags) = flags {
        columns.push(json!({"name": "flags", "value": {"integer": flags}, "timestamp": timestamp}));
    }
    json!({
        "primary_key": [{"name": "id", "value": id}],
        "attribute_columns": columns,
    })
}

fn config(server: &MockServer) -> NodeStoreConfig {
    NodeStoreConfig::new(server.uri(), KEY_ID, SECRET)
}

fn ids(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("node-{i}")).collect()
}

#[tokio::test]
async fn test_bootstrap_creates_then_reconciles() {
    let fake = FakeService::new();
    let server = fake.start().await;

    let nodes = NodeStore::from_config(
        config(&server)
            .with_default_ttl(Duration::from_secs(86_400))
            .with_automatic_expiry(true),
    )
    .unwrap();
    nodes.bootstrap().await.unwrap();
    nodes.bootstrap().await.unwrap();
    assert_eq!(fake.calls("CreateTable"), 1);
    assert_eq!(fake.calls("UpdateTable"), 0);
    assert_eq!(fake.state.lock().table, Some((86_400, 0, 0)));

    // New policy: no native expiry, reserved throughput
    let nodes = NodeStore::from_config(
        config(&server)
            .with_default_ttl(Duration::from_secs(86_400))
            .with_reserved_throughput(ReservedThroughput::new(1, 2)),
    )
    .unwrap();
    nodes.bootstrap().await.unwrap();
    assert_eq!(fake.calls("UpdateTable"), 2);
    assert_eq!(fake.state.lock().table, Some((-1, 1, 2)));
}

#[tokio::test]
async fn test_fractional_ttl_never_reaches_the_table() {
    let fake = FakeService::new();
    let server = fake.start().await;

    let err = NodeStore::from_config(
        config(&server)
            .with_default_ttl(Duration::from_millis(1500))
            .with_automatic_expiry(true),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::Invalid {
            field: "default_ttl",
            ..
        })
    ));

    let nodes = NodeStore::from_config(
        config(&server)
            .with_default_ttl(Duration::from_secs(2))
            .with_automatic_expiry(true),
    )
    .unwrap();
    for _ in 0..3 {
        nodes.bootstrap().await.unwrap();
    }
    assert_eq!(fake.calls("CreateTable"), 1);
    assert_eq!(fake.calls("UpdateTable"), 0);
    assert_eq!(fake.state.lock().table, Some((2, 0, 0)));
}

#[tokio::test]
async fn test_set_get_delete_over_http() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes =
        NodeStore::from_config(config(&server).with_compression(Compression::Zstd)).unwrap();
    nodes.bootstrap().await.unwrap();

    nodes.set("a", b"hello over http").await.unwrap();
    assert_eq!(
        nodes.get("a").await.unwrap(),
        Some(b"hello over http".to_vec())
    );

    // Stored compressed, with the zstd marker
    let (data, flags, _) = fake.state.lock().rows["a"].clone();
    assert_eq!(flags, Some(2));
    assert_ne!(BASE64.decode(data).unwrap(), b"hello over http");

    nodes.delete("a").await.unwrap();
    nodes.delete("a").await.unwrap();
    assert_eq!(nodes.get("a").await.unwrap(), None);
}

#[tokio::test]
async fn test_uncompressed_rows_omit_flags() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes = NodeStore::from_config(config(&server)).unwrap();
    nodes.bootstrap().await.unwrap();

    nodes.set("a", b"raw").await.unwrap();
    let (data, flags, _) = fake.state.lock().rows["a"].clone();
    assert_eq!(flags, None);
    assert_eq!(BASE64.decode(data).unwrap(), b"raw");
}

#[tokio::test]
async fn test_batches_are_chunked() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes = NodeStore::from_config(config(&server)).unwrap();
    nodes.bootstrap().await.unwrap();

    let all = ids(0..250);
    for id in all.iter().step_by(2) {
        nodes.set(id, id.as_bytes()).await.unwrap();
    }

    let found = nodes.get_multi(&all[..150]).await.unwrap();
    assert_eq!(fake.calls("BatchGetRow"), 2);
    assert_eq!(found.len(), 75);
    assert_eq!(found["node-148"], b"node-148");
    assert!(!found.contains_key("node-149"));

    nodes.delete_multi(&all).await.unwrap();
    assert_eq!(fake.calls("BatchWriteRow"), 2);
    assert!(fake.state.lock().rows.is_empty());
}

#[tokio::test]
async fn test_batch_failures_are_reported() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes = NodeStore::from_config(config(&server)).unwrap();
    nodes.bootstrap().await.unwrap();

    for id in ["a", "b", "c"] {
        nodes.set(id, b"v").await.unwrap();
    }
    fake.state.lock().failing.insert("b".to_string());

    let batch = ["a", "b", "c"].map(String::from);
    let err = nodes.get_multi(&batch).await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::BatchFailed { ref failed }) if failed[0].id == "b"));
    assert!(err.is_transient());

    let err = nodes.delete_multi(&batch).await.unwrap_err();
    match err {
        Error::Store(StoreError::BatchFailed { failed }) => {
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].id, "b");
            assert_eq!(failed[0].code, "OTSInternalServerError");
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fake.state.lock().rows.len(), 1);

    fake.state.lock().failing.clear();
    nodes.delete_multi(&batch).await.unwrap();
    assert!(fake.state.lock().rows.is_empty());
}

#[tokio::test]
async fn test_lazy_expiry_uses_cell_timestamp() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes = NodeStore::from_config(config(&server).with_default_ttl(Duration::from_secs(3600)))
        .unwrap();
    nodes.bootstrap().await.unwrap();

    nodes.set("old", b"v").await.unwrap();
    nodes.set("new", b"v").await.unwrap();
    fake.backdate("old", Duration::from_secs(7200));

    assert_eq!(nodes.get("old").await.unwrap(), None);
    let found = nodes
        .get_multi(&["old".to_string(), "new".to_string()])
        .await
        .unwrap();
    assert_eq!(found.keys().collect::<Vec<_>>(), vec!["new"]);
}

#[tokio::test]
async fn test_wrong_secret_is_auth_error() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes = NodeStore::from_config(NodeStoreConfig::new(server.uri(), KEY_ID, "wrong"))
        .unwrap();

    let err = nodes.get("a").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Auth(_))));
    assert!(!err.is_transient());
    assert!(fake.state.lock().actions.is_empty());
}

#[tokio::test]
async fn test_missing_table() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes = NodeStore::from_config(config(&server)).unwrap();

    let err = nodes.set("a", b"v").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::TableNotFound(ref t)) if t == "nodestore"));

    // Destroy skips a missing table
    nodes.destroy().await.unwrap();
    assert_eq!(fake.calls("DeleteTable"), 0);

    nodes.bootstrap().await.unwrap();
    nodes.destroy().await.unwrap();
    assert_eq!(fake.calls("DeleteTable"), 1);
    assert!(fake.state.lock().table.is_none());
}

#[tokio::test]
async fn test_throttling_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/GetRow"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "code": "OTSServerBusy",
            "message": "Server is busy.",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let nodes = NodeStore::from_config(config(&server)).unwrap();
    let err = nodes.get("a").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Throttled(_))));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_slow_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let nodes =
        NodeStore::from_config(config(&server).with_request_timeout(Duration::from_millis(200)))
            .unwrap();
    let err = nodes.delete("a").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Timeout)));
}

#[tokio::test]
async fn test_store_client_directly() {
    let fake = FakeService::new();
    let server = fake.start().await;
    let nodes = NodeStore::from_config(config(&server)).unwrap();
    nodes.bootstrap().await.unwrap();

    let store = tablestore_nodestore::HttpStore::new(&config(&server)).unwrap();
    let schema = store.describe_table().await.unwrap().unwrap();
    assert_eq!(schema, nodes.table_schema());
}
