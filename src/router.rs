//! Frame classification and dispatch: legacy opcodes route to per-opcode
//! handlers, `<db>.$cmd` queries and MSG envelopes route through the command
//! surface. Handler failures are translated to error replies here and never
//! escape into the reactor.

use crate::admin::{self, error_doc, parse_session_id};
use crate::bson::{Document, Value};
use crate::connection::{Connection, CursorEntry};
use crate::crud;
use crate::error::Error;
use crate::protocol::{
    self, HEADER_LEN, MessageHeader, MsgSection, OpMsg, REPLY_FLAG_CURSOR_NOT_FOUND, Request,
};
use crate::server::ServerState;
use std::sync::atomic::Ordering;

/// Command keys dispatched to the CRUD facade, checked in this order.
const CRUD_COMMANDS: [&str; 8] = [
    "insert",
    "find",
    "update",
    "delete",
    "aggregate",
    "count",
    "createIndexes",
    "listIndexes",
];

/// Internal error code used for protocol-level failures.
const ERROR_PROTOCOL: i32 = 1;

/// Handle one complete frame, returning the reply frame if the request
/// expects one.
pub async fn handle_frame(
    state: &ServerState,
    conn: &mut Connection,
    frame: &[u8],
) -> Option<Vec<u8>> {
    let (header, _) = MessageHeader::parse(frame)?;
    let body = &frame[HEADER_LEN..];

    let request = match protocol::parse_request(header.op_code, body) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(conn = conn.id, op_code = header.op_code, error = %e, "bad frame");
            return error_reply(conn, &header, ERROR_PROTOCOL, &e.to_string());
        }
    };

    state.stats.commands_handled.fetch_add(1, Ordering::Relaxed);
    match request {
        Request::Query(q) => {
            let (db, coll) = crud::split_namespace(&q.full_collection_name);
            if coll == "$cmd" {
                let reply = dispatch_command(state, conn, db, q.query.clone()).await;
                let request_id = conn.next_request_id();
                protocol::encode_op_reply(&[reply], 0, header.request_id, request_id).ok()
            } else {
                match crud::legacy_query(&state.store, &conn.stats, &q).await {
                    Ok(docs) => {
                        if q.number_to_return > 0 && docs.len() as i64 >= i64::from(q.number_to_return)
                        {
                            let mut options = Document::new();
                            options.insert("limit", i64::from(q.number_to_return));
                            options.insert("skip", i64::from(q.number_to_skip));
                            if q.flags & protocol::QUERY_FLAG_TAILABLE_CURSOR != 0 {
                                options.insert("tailable", true);
                            }
                            conn.register_cursor(CursorEntry {
                                namespace: q.full_collection_name.clone(),
                                query: q.query.clone(),
                                options,
                                position: i64::from(q.number_to_skip) + docs.len() as i64,
                                closed_at: None,
                            });
                        }
                        let request_id = conn.next_request_id();
                        protocol::encode_op_reply(&docs, 0, header.request_id, request_id).ok()
                    }
                    Err(e) => {
                        let doc = error_doc(ERROR_PROTOCOL, e.to_string());
                        let request_id = conn.next_request_id();
                        protocol::encode_op_reply(&[doc], 0, header.request_id, request_id).ok()
                    }
                }
            }
        }
        // Fire-and-forget: errors are logged, never surfaced on the wire.
        Request::Insert(ins) => {
            if let Err(e) = crud::legacy_insert(&state.store, &conn.stats, &ins).await {
                tracing::warn!(conn = conn.id, error = %e, "legacy insert failed");
            }
            None
        }
        Request::Update(u) => {
            if let Err(e) = crud::legacy_update(&state.store, &conn.stats, &u).await {
                tracing::warn!(conn = conn.id, error = %e, "legacy update failed");
            }
            None
        }
        Request::Delete(d) => {
            if let Err(e) = crud::legacy_delete(&state.store, &conn.stats, &d).await {
                tracing::warn!(conn = conn.id, error = %e, "legacy delete failed");
            }
            None
        }
        Request::KillCursors(k) => {
            let killed = conn.kill_cursors(&k.cursor_ids);
            tracing::debug!(conn = conn.id, killed, "kill cursors");
            None
        }
        // Cursors never span calls; every reply carries id 0, so a resumed
        // read has nothing to return.
        Request::GetMore(_) => {
            let request_id = conn.next_request_id();
            protocol::encode_op_reply(&[], REPLY_FLAG_CURSOR_NOT_FOUND, header.request_id, request_id)
                .ok()
        }
        Request::Msg(msg) => {
            let reply = match command_from_msg(&msg) {
                Some(cmd) => {
                    let db = cmd.get_str("$db").unwrap_or("admin").to_string();
                    dispatch_command(state, conn, &db, cmd).await
                }
                None => error_doc(ERROR_PROTOCOL, "MSG without a kind-0 section"),
            };
            let request_id = conn.next_request_id();
            protocol::encode_op_msg(&reply, header.request_id, request_id).ok()
        }
    }
}

/// Fold identified document sequences into the body document, the way the
/// equivalent array fields would have arrived inline.
fn command_from_msg(msg: &OpMsg) -> Option<Document> {
    let mut cmd = msg.body()?.clone();
    for section in &msg.sections {
        if let MsgSection::Sequence {
            identifier,
            documents,
        } = section
            && !cmd.contains_key(identifier)
        {
            let items: Vec<Value> = documents.iter().cloned().map(Value::Document).collect();
            cmd.insert(identifier.as_str(), items);
        }
    }
    Some(cmd)
}

/// Route a command document: CRUD keys by precedence, everything else to the
/// admin surface.
async fn dispatch_command(
    state: &ServerState,
    conn: &mut Connection,
    db: &str,
    cmd: Document,
) -> Document {
    note_session_activity(state, &cmd).await;

    let crud_key = CRUD_COMMANDS.iter().copied().find(|k| cmd.contains_key(k));
    let result = match crud_key {
        Some("insert") => crud::handle_insert(&state.store, &conn.stats, db, &cmd).await,
        Some("find") => crud::handle_find(&state.store, &conn.stats, db, &cmd).await,
        Some("update") => crud::handle_update(&state.store, &conn.stats, db, &cmd).await,
        Some("delete") => crud::handle_delete(&state.store, &conn.stats, db, &cmd).await,
        Some("aggregate") => crud::handle_aggregate(&state.store, &conn.stats, db, &cmd).await,
        Some("count") => crud::handle_count(&state.store, db, &cmd).await,
        Some("createIndexes") => crud::handle_create_indexes(&state.store, db, &cmd).await,
        Some("listIndexes") => crud::handle_list_indexes(&state.store, db, &cmd).await,
        _ => {
            let reply = admin::handle_admin(state, conn, db, &cmd).await;
            if cmd.contains_key("authenticate") && reply.get_f64("ok") == Some(1.0) {
                conn.set_state(crate::connection::ConnectionState::Authenticated);
            }
            return reply;
        }
    };
    match result {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(conn = conn.id, error = %e, "command handler failed");
            error_doc(ERROR_PROTOCOL, e.to_string())
        }
    }
}

/// Session bookkeeping shared by every command: touch the session, open a
/// transaction scope when asked, and log operations inside one.
async fn note_session_activity(state: &ServerState, cmd: &Document) {
    let Some(lsid) = cmd.get_document("lsid").and_then(parse_session_id) else {
        return;
    };
    state.sessions.touch(lsid).await;
    if cmd.get_bool("startTransaction").unwrap_or(false) {
        let number = cmd.get_i64("txnNumber").unwrap_or(0);
        if let Err(e) = state.sessions.start_transaction(lsid, number).await {
            tracing::debug!(error = %e, "startTransaction ignored");
        }
    }
    if let Some(name) = cmd.first_key()
        && state
            .sessions
            .get(lsid)
            .await
            .is_some_and(|s| s.in_transaction())
    {
        state.sessions.record_operation(lsid, name).await;
    }
}

/// Error reply for a frame that failed protocol parsing: MSG errors answer
/// in kind, everything else gets a legacy REPLY.
pub fn error_reply(
    conn: &mut Connection,
    header: &MessageHeader,
    code: i32,
    message: &str,
) -> Option<Vec<u8>> {
    let doc = error_doc(code, message);
    let request_id = conn.next_request_id();
    if header.op_code == protocol::OP_MSG {
        protocol::encode_op_msg(&doc, header.request_id, request_id).ok()
    } else {
        protocol::encode_op_reply(&[doc], 0, header.request_id, request_id).ok()
    }
}

/// Error reply when framing itself failed; the header is recovered from the
/// buffered bytes when possible.
pub fn framing_error_reply(conn: &mut Connection, buffered: &[u8], err: &Error) -> Option<Vec<u8>> {
    let header = MessageHeader::parse(buffered)
        .map(|(h, _)| h)
        .unwrap_or(MessageHeader {
            message_length: 0,
            request_id: 0,
            response_to: 0,
            op_code: protocol::OP_REPLY,
        });
    error_reply(conn, &header, ERROR_PROTOCOL, &err.to_string())
}
