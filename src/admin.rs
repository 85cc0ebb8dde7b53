//! Admin and handshake command handlers: topology discovery, build and host
//! info, catalog listings, session lifecycle, and the accept-all auth stub.

use crate::bson::{Document, Value};
use crate::connection::Connection;
use crate::server::ServerState;
use std::sync::atomic::Ordering;
use uuid::Uuid;

pub const MAX_BSON_OBJECT_SIZE: i32 = 16_777_216;
pub const MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
pub const MIN_WIRE_VERSION: i32 = 0;
pub const MAX_WIRE_VERSION: i32 = 13;
pub const LOGICAL_SESSION_TIMEOUT_MINUTES: i32 = 30;
pub const SERVER_VERSION: &str = "7.0.0";

/// MongoDB error code for an unrecognized command.
pub const ERROR_COMMAND_NOT_FOUND: i32 = 59;
pub const ERROR_NO_SUCH_TRANSACTION: i32 = 251;

pub fn error_doc(code: i32, errmsg: impl Into<String>) -> Document {
    let mut d = Document::new();
    d.insert("ok", 0.0);
    d.insert("errmsg", errmsg.into());
    d.insert("code", code);
    d
}

fn ok_doc() -> Document {
    let mut d = Document::new();
    d.insert("ok", 1.0);
    d
}

/// Session ids travel as 16 binary bytes, subtype 0x04.
pub fn session_id_value(id: Uuid) -> Value {
    Value::Binary {
        subtype: 0x04,
        bytes: id.as_bytes().to_vec(),
    }
}

/// Extract the session id from an `lsid`-shaped document (`{id: <binary>}`).
pub fn parse_session_id(lsid: &Document) -> Option<Uuid> {
    match lsid.get("id") {
        Some(Value::Binary { bytes, .. }) => Uuid::from_slice(bytes).ok(),
        _ => None,
    }
}

fn session_ids_from(value: Option<&Value>) -> Vec<Uuid> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_document().and_then(parse_session_id))
                .collect()
        })
        .unwrap_or_default()
}

pub async fn handle_admin(
    state: &ServerState,
    conn: &Connection,
    db: &str,
    cmd: &Document,
) -> Document {
    let Some(name) = cmd.first_key().map(str::to_string) else {
        return error_doc(ERROR_COMMAND_NOT_FOUND, "empty command document");
    };
    match name.as_str() {
        "isMaster" | "ismaster" | "hello" => is_master(conn),
        "ping" => ok_doc(),
        "buildInfo" | "buildinfo" => build_info(),
        "hostInfo" => host_info(),
        "connectionStatus" => connection_status(cmd),
        "getParameter" => get_parameter(cmd),
        "getLastError" => {
            let mut d = Document::new();
            d.insert("n", conn.stats.last_write_n.load(Ordering::Relaxed));
            d.insert("err", Value::Null);
            d.insert("ok", 1.0);
            d
        }
        "listDatabases" => list_databases(state, cmd).await,
        "listCollections" => list_collections(state, db).await,
        "startSession" => {
            let id = state.sessions.start_session(conn.id).await;
            let mut inner = Document::new();
            inner.insert("id", session_id_value(id));
            let mut d = Document::new();
            d.insert("id", inner);
            d.insert("timeoutMinutes", LOGICAL_SESSION_TIMEOUT_MINUTES);
            d.insert("ok", 1.0);
            d
        }
        "endSessions" => {
            let ids = session_ids_from(cmd.get("endSessions"));
            state.sessions.end_sessions(&ids).await;
            ok_doc()
        }
        "refreshSessions" => {
            let ids = session_ids_from(cmd.get("refreshSessions"));
            state.sessions.refresh_sessions(&ids).await;
            ok_doc()
        }
        "commitTransaction" | "abortTransaction" => transaction_command(state, &name, cmd).await,
        // Accept-all authentication stub.
        "authenticate" | "logout" => ok_doc(),
        "atlasVersion" => error_doc(
            ERROR_COMMAND_NOT_FOUND,
            "no such command: 'atlasVersion'",
        ),
        other => {
            tracing::debug!(command = other, "unknown command");
            error_doc(
                ERROR_COMMAND_NOT_FOUND,
                format!("no such command: '{other}'"),
            )
        }
    }
}

fn is_master(conn: &Connection) -> Document {
    let mut d = Document::new();
    d.insert("ismaster", true);
    d.insert("maxBsonObjectSize", MAX_BSON_OBJECT_SIZE);
    d.insert("maxMessageSizeBytes", MAX_MESSAGE_SIZE_BYTES);
    d.insert("maxWriteBatchSize", MAX_WRITE_BATCH_SIZE);
    d.insert("minWireVersion", MIN_WIRE_VERSION);
    d.insert("maxWireVersion", MAX_WIRE_VERSION);
    d.insert("logicalSessionTimeoutMinutes", LOGICAL_SESSION_TIMEOUT_MINUTES);
    d.insert("connectionId", conn.id as i32);
    // Advertised but never negotiated.
    d.insert("compression", ["snappy", "zlib"]);
    d.insert("ok", 1.0);
    d
}

fn build_info() -> Document {
    let mut d = Document::new();
    d.insert("version", SERVER_VERSION);
    d.insert("versionArray", [7, 0, 0, 0]);
    d.insert("maxBsonObjectSize", MAX_BSON_OBJECT_SIZE);
    d.insert("ok", 1.0);
    d
}

fn host_info() -> Document {
    let mut system = Document::new();
    system.insert(
        "hostname",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
    );
    system.insert("cpuAddrSize", 64);
    let mut os = Document::new();
    os.insert("type", std::env::consts::OS);
    let mut d = Document::new();
    d.insert("system", system);
    d.insert("os", os);
    d.insert("ok", 1.0);
    d
}

fn connection_status(cmd: &Document) -> Document {
    let mut auth_info = Document::new();
    auth_info.insert("authenticatedUsers", Value::Array(vec![]));
    auth_info.insert("authenticatedUserRoles", Value::Array(vec![]));
    // Handled, but the stub never grants privileges.
    if cmd.get_bool("showPrivileges").unwrap_or(false) {
        auth_info.insert("authenticatedUserPrivileges", Value::Array(vec![]));
    }
    let mut d = Document::new();
    d.insert("authInfo", auth_info);
    d.insert("ok", 1.0);
    d
}

fn get_parameter(cmd: &Document) -> Document {
    let all = cmd.get_str("getParameter") == Some("*");
    let mut d = Document::new();
    if all || cmd.contains_key("featureCompatibilityVersion") {
        let mut fcv = Document::new();
        fcv.insert("version", "7.0");
        d.insert("featureCompatibilityVersion", fcv);
    }
    d.insert("ok", 1.0);
    d
}

async fn list_databases(state: &ServerState, cmd: &Document) -> Document {
    let name_only = cmd.get_bool("nameOnly").unwrap_or(false);
    let names = state.store.list_databases().await;
    let mut databases = Vec::with_capacity(names.len());
    for name in names {
        let mut entry = Document::new();
        entry.insert("name", name);
        if !name_only {
            entry.insert("sizeOnDisk", 0i64);
            entry.insert("empty", false);
        }
        databases.push(Value::Document(entry));
    }
    let mut d = Document::new();
    d.insert("databases", databases);
    if !name_only {
        d.insert("totalSize", 0i64);
    }
    d.insert("ok", 1.0);
    d
}

async fn list_collections(state: &ServerState, db: &str) -> Document {
    let names = state.store.list_collections(db).await;
    let batch: Vec<Value> = names
        .into_iter()
        .map(|name| {
            let mut entry = Document::new();
            entry.insert("name", name);
            entry.insert("type", "collection");
            Value::Document(entry)
        })
        .collect();
    let mut cursor = Document::new();
    cursor.insert("id", 0i64);
    cursor.insert("ns", format!("{db}.$cmd.listCollections"));
    cursor.insert("firstBatch", batch);
    let mut d = Document::new();
    d.insert("cursor", cursor);
    d.insert("ok", 1.0);
    d
}

async fn transaction_command(state: &ServerState, name: &str, cmd: &Document) -> Document {
    let Some(lsid) = cmd.get_document("lsid").and_then(parse_session_id) else {
        return error_doc(ERROR_NO_SUCH_TRANSACTION, "command requires an lsid");
    };
    let result = if name == "commitTransaction" {
        state.sessions.commit_transaction(lsid).await
    } else {
        state.sessions.abort_transaction(lsid).await
    };
    match result {
        Ok(()) => ok_doc(),
        Err(msg) => error_doc(ERROR_NO_SUCH_TRANSACTION, msg),
    }
}
