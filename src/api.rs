//! Control-plane socket server.
//!
//! Accepts connections on a pre-bound unix listener. Each connection carries
//! exactly one request and one response: the server reads a single JSON
//! command envelope, dispatches it, writes a single JSON result, and closes.
//! This one-shot call-and-disconnect protocol is the binding contract for
//! existing clients; there is no persistent session.
//!
//! Every accepted connection is handled in its own tokio task, so a slow or
//! stuck client blocks only itself. Handler failures never tear down the
//! server: they become `{"Success": false, "Error": ...}` results, and a
//! panicking handler aborts only its own connection task.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, warn};

use crate::config::Store;
use crate::machine::{ClusterClient, ClusterStatusResult};
use crate::version;

/// Requests larger than this are garbage, not commands.
const MAX_REQUEST_BYTES: usize = 1_048_576;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    #[serde(rename = "Command")]
    command: String,
    /// Raw argument payload, deserialized lazily per command.
    #[serde(rename = "Args", default)]
    args: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct VersionResult {
    crc_version: &'static str,
    commit_sha: &'static str,
    openshift_version: &'static str,
    success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SetConfigResult {
    error: String,
    properties: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetConfigResult {
    error: String,
    configs: BTreeMap<String, Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResult {
    success: bool,
    error: String,
}

impl ErrorResult {
    fn new(error: impl Into<String>) -> Self {
        Self { success: false, error: error.into() }
    }
}

#[derive(Debug, Deserialize)]
struct SetConfigArgs {
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct GetConfigArgs {
    properties: Vec<String>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Shared, concurrency-safe collaborators injected into every handler.
struct Handlers {
    client: Arc<dyn ClusterClient>,
    store: Arc<Store>,
    machine_name: String,
}

pub struct Server {
    listener: UnixListener,
    handlers: Arc<Handlers>,
}

impl Server {
    pub fn new(
        listener: UnixListener,
        client: Arc<dyn ClusterClient>,
        store: Arc<Store>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            listener,
            handlers: Arc::new(Handlers {
                client,
                store,
                machine_name: machine_name.into(),
            }),
        }
    }

    /// Accept connections until the listener is torn down, spawning one
    /// task per connection.
    pub async fn serve(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let handlers = self.handlers.clone();
                    tokio::spawn(handle_connection(stream, handlers));
                }
                Err(e) => {
                    error!(error = %e, "control socket accept error");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, handlers: Arc<Handlers>) {
    let result = match read_request(&mut stream).await {
        Ok(envelope) => {
            debug!(command = %envelope.command, "dispatching control-plane command");
            dispatch(&handlers, envelope).await
        }
        Err(e) => {
            warn!(error = %e, "rejecting malformed request");
            to_result_value(&ErrorResult::new(e.to_string()))
        }
    };

    // Exactly one JSON result per accepted connection.
    match serde_json::to_vec(&result) {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                warn!(error = %e, "failed to write response");
            }
        }
        Err(e) => error!(error = %e, "failed to serialize response"),
    }
}

// ---------------------------------------------------------------------------
// Request framing
// ---------------------------------------------------------------------------

/// Read exactly one JSON value from the stream.
///
/// Accumulates bytes and re-attempts a streaming decode after every read, so
/// a request may arrive in arbitrarily fragmented writes, surrounded by
/// arbitrary whitespace, with no fixed maximum size assumed (up to the
/// garbage cap).
async fn read_request(stream: &mut UnixStream) -> Result<CommandEnvelope> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("read from control socket")?;

        if n == 0 {
            match parse_one(&buf)? {
                Some(envelope) => return Ok(envelope),
                None => bail!("connection closed before a complete request arrived"),
            }
        }

        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            bail!("request exceeds {MAX_REQUEST_BYTES} byte limit");
        }

        if let Some(envelope) = parse_one(&buf)? {
            return Ok(envelope);
        }
    }
}

/// Attempt to decode one complete envelope from the buffer.
///
/// `Ok(None)` means the buffer holds only a prefix (or only whitespace) and
/// more bytes are needed; a decode error on complete input is a protocol
/// error.
fn parse_one(buf: &[u8]) -> Result<Option<CommandEnvelope>> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<CommandEnvelope>();
    match stream.next() {
        Some(Ok(envelope)) => Ok(Some(envelope)),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(e).context("malformed request envelope"),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(handlers: &Handlers, envelope: CommandEnvelope) -> Value {
    match envelope.command.as_str() {
        "version" => to_result_value(&VersionResult {
            crc_version: version::version(),
            commit_sha: version::commit_sha(),
            openshift_version: version::BUNDLE_VERSION,
            success: true,
        }),
        "status" => to_result_value(&handle_status(handlers).await),
        "setconfig" => to_result_value(&handle_setconfig(handlers, envelope.args)),
        "getconfig" => to_result_value(&handle_getconfig(handlers, envelope.args)),
        other => {
            warn!(command = %other, "unknown control-plane command");
            to_result_value(&ErrorResult::new(format!("unknown command: {other}")))
        }
    }
}

async fn handle_status(handlers: &Handlers) -> ClusterStatusResult {
    let failed = |error: String| ClusterStatusResult {
        error,
        success: false,
        ..Default::default()
    };

    match handlers.client.exists(&handlers.machine_name).await {
        Ok(true) => {}
        Ok(false) => return failed(format!("machine does not exist: {}", handlers.machine_name)),
        Err(e) => return failed(e.to_string()),
    }

    match handlers.client.status().await {
        Ok(status) => status,
        Err(e) => failed(e.to_string()),
    }
}

fn handle_setconfig(handlers: &Handlers, args: Option<Value>) -> SetConfigResult {
    let args: SetConfigArgs = match decode_args("setconfig", args) {
        Ok(args) => args,
        Err(error) => return SetConfigResult { error, properties: Vec::new() },
    };

    match handlers.store.set_all(&args.properties) {
        Ok(outcome) => SetConfigResult {
            error: outcome.rejected.join("; "),
            properties: outcome.changed,
        },
        Err(e) => SetConfigResult {
            error: format!("saving configuration: {e}"),
            properties: Vec::new(),
        },
    }
}

fn handle_getconfig(handlers: &Handlers, args: Option<Value>) -> GetConfigResult {
    let args: GetConfigArgs = match decode_args("getconfig", args) {
        Ok(args) => args,
        Err(error) => return GetConfigResult { error, configs: BTreeMap::new() },
    };

    let mut configs = BTreeMap::new();
    for name in &args.properties {
        match handlers.store.get(name) {
            Ok(value) => {
                configs.insert(name.clone(), Value::String(value));
            }
            // Unknown-property policy: one bad name fails the request.
            Err(error) => return GetConfigResult { error, configs: BTreeMap::new() },
        }
    }

    GetConfigResult { error: String::new(), configs }
}

fn decode_args<T: serde::de::DeserializeOwned>(
    command: &str,
    args: Option<Value>,
) -> std::result::Result<T, String> {
    let Some(args) = args else {
        return Err(format!("{command} requires arguments"));
    };
    serde_json::from_value(args).map_err(|e| format!("invalid {command} arguments: {e}"))
}

/// Serialize a handler result, falling back to a bare error object so the
/// client always receives valid JSON.
fn to_result_value<T: Serialize>(result: &T) -> Value {
    serde_json::to_value(result).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize handler result");
        serde_json::json!({"Success": false, "Error": "internal serialization failure"})
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
