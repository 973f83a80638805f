//! Unix domain socket IPC listener.
//!
//! Each connection is one simulated radio link: it carries its own
//! encryption flag (declared in `hello`) and its own prepare queue. Every
//! request is dispatched to the shared [`ProtocolServer`].
//!
//! A request line longer than [`MAX_LINE_BYTES`] gets an invalid-request
//! error and the connection is closed.

use std::path::Path;
use std::sync::Arc;

use bizcard_core::{EmulationState, FieldId, FieldPresence, RefreshOutcome, WriteOutcome};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::PROTOCOL_VERSION;
use crate::gatt::{self, AttError, Link, ProtocolServer};
use crate::protocol::*;

type RpcResult = Result<serde_json::Value, (i64, String)>;

/// Longest accepted request line, newline included.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Bind the listener at `path`, replacing a stale socket file.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("card service listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until `shutdown` flips to `true`.
///
/// Reads newline-delimited JSON-RPC messages, dispatches them to the
/// server, and writes one response line per request.
pub async fn serve(
    server: Arc<ProtocolServer>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let srv = Arc::clone(&server);
                    tokio::spawn(async move {
                        srv.connection_opened();
                        if let Err(e) = handle_connection(&srv, stream).await {
                            tracing::warn!("Connection error: {e}");
                        }
                        srv.connection_closed();
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {e}");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Handle a single client connection.
async fn handle_connection(server: &ProtocolServer, stream: UnixStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut link = Link::default();

    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            break; // EOF
        }
        if n > MAX_LINE_BYTES {
            tracing::warn!(limit = MAX_LINE_BYTES, "request line too long, closing link");
            let response = error_response(
                RequestId::Integer(0),
                ERR_INVALID_REQUEST,
                format!("Request line exceeds {MAX_LINE_BYTES} bytes"),
            );
            write_response(&mut writer, &response).await?;
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request line too long",
            ));
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = dispatch_message(server, &mut link, trimmed);
        write_response(&mut writer, &response).await?;
    }

    if link.queued() > 0 {
        tracing::debug!(discarded = link.queued(), "link closed with staged writes");
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &serde_json::Value,
) -> std::io::Result<()> {
    let mut response_bytes = serde_json::to_vec(response).unwrap_or_else(|_| b"{}".to_vec());
    response_bytes.push(b'\n');
    writer.write_all(&response_bytes).await?;
    writer.flush().await
}

fn error_response(id: RequestId, code: i64, message: String) -> serde_json::Value {
    serde_json::to_value(JsonRpcError {
        id,
        error: JsonRpcErrorBody {
            code,
            message,
            data: None,
        },
    })
    .unwrap_or_default()
}

/// Parse and dispatch a single JSON-RPC message.
fn dispatch_message(server: &ProtocolServer, link: &mut Link, raw: &str) -> serde_json::Value {
    let request: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            return error_response(
                RequestId::Integer(0),
                ERR_INVALID_REQUEST,
                format!("Invalid JSON-RPC: {e}"),
            );
        }
    };

    let id = request.id.clone();
    match dispatch_method(server, link, &request.method, request.params) {
        Ok(value) => {
            serde_json::to_value(JsonRpcResponse { id, result: value }).unwrap_or_default()
        }
        Err((code, message)) => error_response(id, code, message),
    }
}

/// Dispatch to the appropriate handler based on method name.
fn dispatch_method(
    server: &ProtocolServer,
    link: &mut Link,
    method: &str,
    params: Option<serde_json::Value>,
) -> RpcResult {
    match method {
        "hello" => handle_hello(link, params),
        "field.read" => handle_field_read(server, link, params),
        "field.write" => handle_field_write(server, link, params),
        "field.prepare" => handle_field_prepare(server, link, params),
        "field.execute" => handle_field_execute(server, link, params),
        "card.show" => handle_card_show(server),
        "tag.presence" => handle_tag_presence(server, params),
        "service.status" => handle_service_status(server),
        "service.endpoints" => handle_service_endpoints(),
        _ => Err((ERR_METHOD_NOT_FOUND, format!("Unknown method: {method}"))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<T, (i64, String)> {
    params
        .ok_or_else(|| (ERR_INVALID_PARAMS, "Missing params".to_string()))
        .and_then(|v| {
            serde_json::from_value(v)
                .map_err(|e| (ERR_INVALID_PARAMS, format!("Invalid {method} params: {e}")))
        })
}

fn to_result<T: serde::Serialize>(value: T) -> RpcResult {
    serde_json::to_value(value).map_err(|e| (ERR_UNLIKELY, format!("Serialize error: {e}")))
}

/// Map an endpoint rejection to a JSON-RPC error carrying the ATT code.
fn att_error_to_rpc(err: &AttError) -> (i64, String) {
    let code = match err {
        AttError::InvalidOffset { .. } => ERR_INVALID_OFFSET,
        AttError::InsufficientEncryption => ERR_INSUFFICIENT_ENCRYPTION,
        AttError::PrepareQueueFull { .. } => ERR_PREPARE_QUEUE_FULL,
    };
    (code, err.to_string())
}

fn write_result(field: FieldId, offset: usize, outcome: WriteOutcome) -> FieldWriteResult {
    let (refresh, payload_len) = match outcome.refresh {
        RefreshOutcome::Activated { payload_len } => (RefreshStatus::Activated, Some(payload_len)),
        RefreshOutcome::EncodeFailed => (RefreshStatus::EncodeFailed, None),
        RefreshOutcome::ActivationFailed => (RefreshStatus::ActivationFailed, None),
    };
    FieldWriteResult {
        field,
        offset,
        written: outcome.written,
        persisted: outcome.persisted,
        refresh,
        payload_len,
    }
}

/// Handle the `hello` handshake. The link's encryption flag follows the
/// client's declaration.
fn handle_hello(link: &mut Link, params: Option<serde_json::Value>) -> RpcResult {
    let hello: HelloParams = parse_params("hello", params)?;

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err((
            ERR_INVALID_PARAMS,
            format!(
                "Incompatible protocol version: client={}, service={}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        ));
    }

    link.set_encrypted(hello.encrypted);
    tracing::info!(
        client = %hello.client_version,
        encrypted = hello.encrypted,
        "client connected"
    );

    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        encrypted: link.is_encrypted(),
        capabilities: vec![
            "field.read".to_string(),
            "field.write".to_string(),
            "field.prepare".to_string(),
            "field.execute".to_string(),
            "card.show".to_string(),
            "tag.presence".to_string(),
            "service.status".to_string(),
            "service.endpoints".to_string(),
        ],
    })
}

fn handle_field_read(
    server: &ProtocolServer,
    link: &Link,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: FieldReadParams = parse_params("field.read", params)?;
    let data = server
        .read(link, params.field, params.offset)
        .map_err(|e| att_error_to_rpc(&e))?;
    to_result(FieldReadResult {
        field: params.field,
        offset: params.offset,
        text: String::from_utf8_lossy(&data).into_owned(),
        data,
    })
}

fn handle_field_write(
    server: &ProtocolServer,
    link: &Link,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: FieldWriteParams = parse_params("field.write", params)?;
    let (field, offset) = (params.field, params.offset);
    let data = params.into_bytes();
    let outcome = server
        .write(link, field, offset, &data)
        .map_err(|e| att_error_to_rpc(&e))?;
    to_result(write_result(field, offset, outcome))
}

fn handle_field_prepare(
    server: &ProtocolServer,
    link: &mut Link,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: FieldWriteParams = parse_params("field.prepare", params)?;
    let (field, offset) = (params.field, params.offset);
    let queued = server
        .prepare(link, field, offset, params.into_bytes())
        .map_err(|e| att_error_to_rpc(&e))?;
    to_result(FieldPrepareResult { queued })
}

fn handle_field_execute(
    server: &ProtocolServer,
    link: &mut Link,
    params: Option<serde_json::Value>,
) -> RpcResult {
    let params: FieldExecuteParams = match params {
        Some(v) => serde_json::from_value(v)
            .map_err(|e| (ERR_INVALID_PARAMS, format!("Invalid field.execute params: {e}")))?,
        None => FieldExecuteParams { commit: true },
    };
    let executed = server
        .execute(link, params.commit)
        .map_err(|e| att_error_to_rpc(&e))?;
    to_result(FieldExecuteResult {
        committed: params.commit,
        writes: executed
            .into_iter()
            .map(|w| write_result(w.field, w.offset, w.outcome))
            .collect(),
    })
}

/// Handle `card.show`: the local view of the card, as shown on its display.
fn handle_card_show(server: &ProtocolServer) -> RpcResult {
    let ctx = server.context();
    let fields = ctx
        .snapshot()
        .into_iter()
        .map(|(field, value)| FieldView {
            field,
            label: field.label().to_string(),
            value,
            max_len: field.max_len(),
        })
        .collect();
    let payload = ctx.payload();
    let payload_hex = payload.iter().map(|b| format!("{b:02x}")).collect();
    let emulation = match ctx.emulation_state() {
        EmulationState::Stopped => EmulationStatus::Stopped,
        EmulationState::Emulating { .. } => EmulationStatus::Emulating,
        EmulationState::Unknown => EmulationStatus::Unknown,
    };
    to_result(CardShowResult {
        fields,
        payload_hex,
        payload_len: payload.len(),
        emulating: emulation == EmulationStatus::Emulating,
        emulation,
    })
}

/// Handle `tag.presence`: a reader field came or went. Only the field
/// indicator follows it; no encryption is needed since this is not a
/// field endpoint.
fn handle_tag_presence(server: &ProtocolServer, params: Option<serde_json::Value>) -> RpcResult {
    let params: TagPresenceParams = parse_params("tag.presence", params)?;
    server.context().on_field_presence(params.presence);
    to_result(TagPresenceResult {
        presence: params.presence,
        indicator: params.presence == FieldPresence::On,
    })
}

fn handle_service_status(server: &ProtocolServer) -> RpcResult {
    to_result(ServiceStatusResult {
        uptime_s: server.uptime_s(),
        connections: server.connection_count(),
        require_encryption: server.options().require_encryption,
        stats: server.context().stats(),
    })
}

fn handle_service_endpoints() -> RpcResult {
    let endpoints = gatt::ENDPOINTS
        .iter()
        .map(|ep| EndpointView {
            field: ep.field,
            uuid: ep.uuid.to_string(),
            properties: ep.properties.iter().map(|p| p.as_str().to_string()).collect(),
            permissions: ep.permissions.iter().map(|p| p.as_str().to_string()).collect(),
            reliable_write: ep.reliable_write,
            max_len: ep.field.max_len(),
        })
        .collect();
    to_result(ServiceEndpointsResult {
        service_uuid: gatt::SERVICE_UUID.to_string(),
        endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::ServerOptions;
    use bizcard_core::emulation::RecordingEmulator;
    use bizcard_core::persistence::MemoryStore;
    use bizcard_core::{CardContext, Indicator};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagIndicator(Arc<AtomicBool>);

    impl Indicator for FlagIndicator {
        fn set_field_indicator(&self, on: bool) {
            self.0.store(on, Ordering::Relaxed);
        }
    }

    fn server_with(emulator: Arc<RecordingEmulator>, led: Arc<AtomicBool>) -> ProtocolServer {
        let ctx = CardContext::new(
            Box::new(Arc::new(MemoryStore::new())),
            Box::new(emulator),
            Box::new(FlagIndicator(led)),
        );
        ctx.startup();
        ProtocolServer::new(Arc::new(ctx), ServerOptions::default())
    }

    fn server() -> ProtocolServer {
        server_with(Arc::new(RecordingEmulator::new()), Arc::default())
    }

    fn call(server: &ProtocolServer, link: &mut Link, msg: serde_json::Value) -> serde_json::Value {
        dispatch_message(server, link, &msg.to_string())
    }

    fn hello(server: &ProtocolServer, link: &mut Link, encrypted: bool) -> serde_json::Value {
        call(
            server,
            link,
            serde_json::json!({
                "id": 0,
                "method": "hello",
                "params": {
                    "protocol_version": "1.0",
                    "client_version": "0.1.0",
                    "encrypted": encrypted
                }
            }),
        )
    }

    #[test]
    fn dispatch_hello_sets_link_encryption() {
        let srv = server();
        let mut link = Link::default();
        let result = hello(&srv, &mut link, true);
        assert_eq!(result["result"]["encrypted"], serde_json::json!(true));
        assert!(link.is_encrypted());
    }

    #[test]
    fn dispatch_hello_rejects_other_versions() {
        let srv = server();
        let mut link = Link::default();
        let result = call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 0,
                "method": "hello",
                "params": { "protocol_version": "9.9", "client_version": "x" }
            }),
        );
        assert_eq!(result["error"]["code"], serde_json::json!(ERR_INVALID_PARAMS));
    }

    #[test]
    fn dispatch_unknown_method() {
        let srv = server();
        let mut link = Link::default();
        let result = call(&srv, &mut link, serde_json::json!({ "id": 1, "method": "card.erase" }));
        assert_eq!(result["error"]["code"], serde_json::json!(ERR_METHOD_NOT_FOUND));
    }

    #[test]
    fn dispatch_garbage_is_invalid_request() {
        let srv = server();
        let mut link = Link::default();
        let result = dispatch_message(&srv, &mut link, "not json");
        assert_eq!(result["error"]["code"], serde_json::json!(ERR_INVALID_REQUEST));
    }

    #[test]
    fn write_without_encryption_carries_att_code() {
        let srv = server();
        let mut link = Link::default();
        hello(&srv, &mut link, false);
        let result = call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 2,
                "method": "field.write",
                "params": { "field": "first_name", "text": "Eve" }
            }),
        );
        assert_eq!(
            result["error"]["code"],
            serde_json::json!(ERR_INSUFFICIENT_ENCRYPTION)
        );
    }

    #[test]
    fn write_then_read_round_trip() {
        let srv = server();
        let mut link = Link::default();
        hello(&srv, &mut link, true);
        let write = call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 3,
                "method": "field.write",
                "params": { "field": "first_name", "offset": 0, "text": "Ada" }
            }),
        );
        assert_eq!(write["result"]["refresh"], serde_json::json!("activated"));
        assert_eq!(write["result"]["persisted"], serde_json::json!(true));

        let read = call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 4,
                "method": "field.read",
                "params": { "field": "first_name" }
            }),
        );
        assert_eq!(read["result"]["text"], serde_json::json!("Ada"));
    }

    #[test]
    fn out_of_bounds_write_is_invalid_offset() {
        let srv = server();
        let mut link = Link::default();
        hello(&srv, &mut link, true);
        let result = call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 5,
                "method": "field.write",
                "params": { "field": "phone_number", "offset": 15, "data": [49] }
            }),
        );
        assert_eq!(result["error"]["code"], serde_json::json!(ERR_INVALID_OFFSET));
        assert_eq!(srv.context().read_field(FieldId::PhoneNumber), b"0000000".to_vec());
    }

    #[test]
    fn service_endpoints_lists_five_characteristics() {
        let srv = server();
        let mut link = Link::default();
        let result = call(
            &srv,
            &mut link,
            serde_json::json!({ "id": 6, "method": "service.endpoints" }),
        );
        let endpoints = result["result"]["endpoints"].as_array().unwrap();
        assert_eq!(endpoints.len(), 5);
        assert_eq!(endpoints[0]["uuid"], serde_json::json!("0x2A8A"));
        assert_eq!(endpoints[4]["max_len"], serde_json::json!(15));
    }

    #[test]
    fn tag_presence_drives_the_indicator() {
        let emulator = Arc::new(RecordingEmulator::new());
        let led = Arc::new(AtomicBool::new(false));
        let srv = server_with(Arc::clone(&emulator), Arc::clone(&led));
        let mut link = Link::default();
        let calls = emulator.calls().len();

        let on = call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 7,
                "method": "tag.presence",
                "params": { "presence": "on" }
            }),
        );
        assert_eq!(on["result"]["indicator"], serde_json::json!(true));
        assert!(led.load(Ordering::Relaxed));

        call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 8,
                "method": "tag.presence",
                "params": { "presence": "off" }
            }),
        );
        assert!(!led.load(Ordering::Relaxed));
        assert_eq!(emulator.calls().len(), calls);
    }

    #[test]
    fn card_show_reports_unknown_emulation_after_failed_stop() {
        let emulator = Arc::new(RecordingEmulator::new());
        let srv = server_with(Arc::clone(&emulator), Arc::default());
        let mut link = Link::default();
        hello(&srv, &mut link, true);

        emulator.set_fail_stop(true);
        emulator.set_fail_start(true);
        let write = call(
            &srv,
            &mut link,
            serde_json::json!({
                "id": 9,
                "method": "field.write",
                "params": { "field": "first_name", "text": "Ada" }
            }),
        );
        assert_eq!(write["result"]["refresh"], serde_json::json!("activation_failed"));

        let show = call(&srv, &mut link, serde_json::json!({ "id": 10, "method": "card.show" }));
        assert_eq!(show["result"]["emulation"], serde_json::json!("unknown"));
        assert_eq!(show["result"]["emulating"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn overlong_request_line_closes_the_link() {
        let srv = server();
        let (client, service_end) = UnixStream::pair().unwrap();
        let handle = tokio::spawn(async move { handle_connection(&srv, service_end).await });

        let (client_read, mut client_write) = client.into_split();
        // The service may hang up before the tail is written.
        let _ = client_write
            .write_all(&vec![b'a'; MAX_LINE_BYTES + 16])
            .await;

        let mut response = String::new();
        BufReader::new(client_read)
            .read_line(&mut response)
            .await
            .unwrap();
        let response: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(response["error"]["code"], serde_json::json!(ERR_INVALID_REQUEST));

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
