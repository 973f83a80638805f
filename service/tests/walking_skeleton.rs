#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Walking-skeleton end-to-end test.
//!
//! Proves the full pipeline over the socket:
//!   1. Start the service on a temp socket with file-backed ports
//!   2. Handshake on an encrypted link
//!   3. Plain write, read back, check the published tag payload
//!   4. Prepared write in two chunks + execute
//!   5. Unencrypted link is refused
//!   6. Restart over the same directory restores every field

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bizcard_core::ndef::decode_text_records;
use bizcard_core::{CardContext, LogIndicator};
use bizcard_service::PROTOCOL_VERSION;
use bizcard_service::emulator::FileTagEmulator;
use bizcard_service::gatt::{ProtocolServer, ServerOptions};
use bizcard_service::store::FileStore;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

/// Stateful client that keeps a single connection + buffered reader.
struct TestClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

impl TestClient {
    fn connect(socket_path: &Path) -> Self {
        let stream = UnixStream::connect(socket_path).expect("Failed to connect to card service");
        let writer = stream.try_clone().expect("clone stream");
        let reader = BufReader::new(stream);
        Self { writer, reader }
    }

    fn rpc(&mut self, msg: serde_json::Value) -> serde_json::Value {
        let mut bytes = serde_json::to_vec(&msg).expect("serialize");
        bytes.push(b'\n');
        self.writer.write_all(&bytes).expect("write");
        self.writer.flush().expect("flush");

        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response");
        serde_json::from_str(&line).unwrap_or_else(|e| panic!("parse response: {e}\nraw: {line}"))
    }

    fn handshake(&mut self, encrypted: bool) {
        let resp = self.rpc(serde_json::json!({
            "id": 0,
            "method": "hello",
            "params": {
                "protocol_version": PROTOCOL_VERSION,
                "client_version": "test-0.1.0",
                "encrypted": encrypted
            }
        }));
        assert!(resp.get("result").is_some(), "Hello should succeed: {resp}");
    }
}

struct RunningService {
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningService {
    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap();
    }
}

/// Start the service in the background over `dir`.
async fn start_service(dir: &Path, socket_name: &str) -> RunningService {
    let store = FileStore::with_base_dir(dir.join("settings")).unwrap();
    let emulator = FileTagEmulator::new(dir.join("tag.ndef"));
    let ctx = Arc::new(CardContext::new(
        Box::new(store),
        Box::new(emulator),
        Box::new(LogIndicator),
    ));
    ctx.startup();
    let server = Arc::new(ProtocolServer::new(ctx, ServerOptions::default()));

    let socket_path = dir.join(socket_name);
    let listener = bizcard_service::ipc::bind(&socket_path).unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        bizcard_service::ipc::serve(server, listener, shutdown_rx)
            .await
            .unwrap();
    });

    // Wait for socket to be ready
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    RunningService {
        socket_path,
        shutdown,
        handle,
    }
}

fn published_texts(dir: &Path) -> Vec<String> {
    let payload = std::fs::read(dir.join("tag.ndef")).unwrap();
    decode_text_records(&payload)
        .unwrap()
        .into_iter()
        .map(|r| r.text)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn walking_skeleton_e2e() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let service = start_service(temp_dir.path(), "card-1.sock").await;

    // Defaults are published before any client shows up.
    assert_eq!(
        published_texts(temp_dir.path()),
        vec!["Name", "Last Name", "email@example.com", "Address", "0000000"]
    );

    let mut client = TestClient::connect(&service.socket_path);

    // 1. Handshake
    client.handshake(true);

    // 2. Plain write
    let write_resp = client.rpc(serde_json::json!({
        "id": 1,
        "method": "field.write",
        "params": { "field": "first_name", "offset": 0, "text": "Ada" }
    }));
    assert!(
        write_resp.get("result").is_some(),
        "field.write should succeed: {write_resp}"
    );
    assert_eq!(write_resp["result"]["refresh"].as_str().unwrap(), "activated");
    assert!(write_resp["result"]["persisted"].as_bool().unwrap());

    // 3. Read back
    let read_resp = client.rpc(serde_json::json!({
        "id": 2,
        "method": "field.read",
        "params": { "field": "first_name" }
    }));
    assert_eq!(read_resp["result"]["text"].as_str().unwrap(), "Ada");
    assert_eq!(published_texts(temp_dir.path())[0], "Ada");

    // 4. Out-of-bounds write carries the invalid-offset code
    let oob_resp = client.rpc(serde_json::json!({
        "id": 3,
        "method": "field.write",
        "params": { "field": "phone_number", "offset": 15, "text": "1" }
    }));
    assert_eq!(oob_resp["error"]["code"].as_i64().unwrap(), 0x07);

    // 5. Reliable write in two chunks
    for (id, offset, text) in [(4, 0, "Love"), (5, 4, "lace")] {
        let resp = client.rpc(serde_json::json!({
            "id": id,
            "method": "field.prepare",
            "params": { "field": "last_name", "offset": offset, "text": text }
        }));
        assert!(resp.get("result").is_some(), "field.prepare: {resp}");
    }
    let exec_resp = client.rpc(serde_json::json!({
        "id": 6,
        "method": "field.execute",
        "params": { "commit": true }
    }));
    let writes = exec_resp["result"]["writes"].as_array().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0]["written"].as_u64().unwrap(), 8);
    assert_eq!(published_texts(temp_dir.path())[1], "Lovelace");

    // 6. card.show reflects both writes
    let show_resp = client.rpc(serde_json::json!({ "id": 7, "method": "card.show" }));
    let fields = show_resp["result"]["fields"].as_array().unwrap();
    assert_eq!(fields[0]["value"].as_str().unwrap(), "Ada");
    assert_eq!(fields[1]["value"].as_str().unwrap(), "Lovelace");
    assert!(show_resp["result"]["emulating"].as_bool().unwrap());

    // 7. Service status counts the accepted and refused writes
    let status_resp = client.rpc(serde_json::json!({ "id": 8, "method": "service.status" }));
    let stats = &status_resp["result"]["stats"];
    assert_eq!(stats["writes"].as_u64().unwrap(), 2);
    assert_eq!(stats["activations"].as_u64().unwrap(), 3);
    assert!(status_resp["result"]["connections"].as_u64().unwrap() >= 1);

    // 8. A second, unencrypted link is refused
    let mut open_client = TestClient::connect(&service.socket_path);
    open_client.handshake(false);
    let refused = open_client.rpc(serde_json::json!({
        "id": 9,
        "method": "field.read",
        "params": { "field": "first_name" }
    }));
    assert_eq!(refused["error"]["code"].as_i64().unwrap(), 0x0F);

    drop(client);
    drop(open_client);
    service.stop().await;

    // 9. Restart over the same directory: fields come back from disk
    let restarted = start_service(temp_dir.path(), "card-2.sock").await;
    let mut client = TestClient::connect(&restarted.socket_path);
    client.handshake(true);
    let show_resp = client.rpc(serde_json::json!({ "id": 10, "method": "card.show" }));
    let fields = show_resp["result"]["fields"].as_array().unwrap();
    assert_eq!(fields[0]["value"].as_str().unwrap(), "Ada");
    assert_eq!(fields[1]["value"].as_str().unwrap(), "Lovelace");
    assert_eq!(
        published_texts(temp_dir.path()),
        vec!["Ada", "Lovelace", "email@example.com", "Address", "0000000"]
    );

    drop(client);
    restarted.stop().await;
}
