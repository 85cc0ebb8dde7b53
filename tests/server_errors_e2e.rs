mod common;

use common::{read_one_op_msg, read_op_reply, start};
use mockingdb::doc;
use mockingdb::protocol::{HEADER_LEN, encode_op_msg};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn raw_header(length: i32, request_id: i32, op_code: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&op_code.to_le_bytes());
    out
}

#[tokio::test]
async fn oversize_frame_gets_error_reply_then_close() {
    let server = start().await;
    let mut stream = server.connect().await;

    // Declared total length just past the 48MB ceiling, on the legacy path.
    stream
        .write_all(&raw_header(48_000_001, 77, 2004))
        .await
        .unwrap();

    let (hdr, reply) = read_op_reply(&mut stream).await;
    assert_eq!(hdr.response_to, 77);
    let doc = &reply.documents[0];
    assert_eq!(doc.get_f64("ok"), Some(0.0));
    assert_eq!(doc.get_i32("code"), Some(1));

    // The connection is torn down after the error reply.
    let mut probe = [0u8; 1];
    let n = stream.read(&mut probe).await.unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed");
}

#[tokio::test]
async fn undersize_frame_is_fatal_and_answers_in_kind() {
    let server = start().await;
    let mut stream = server.connect().await;

    // Declared on the MSG path, so the error body comes back as an MSG.
    stream.write_all(&raw_header(8, 5, 2013)).await.unwrap();
    let (hdr, doc) = common::read_one_op_msg_with_header(&mut stream).await;
    assert_eq!(hdr.response_to, 5);
    assert_eq!(doc.get_f64("ok"), Some(0.0));
    assert_eq!(doc.get_i32("code"), Some(1));
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).await.unwrap_or(0), 0);
}

#[tokio::test]
async fn unknown_opcode_replies_and_connection_survives() {
    let server = start().await;
    let mut stream = server.connect().await;

    // OP_COMPRESSED is advertised nowhere and unsupported.
    stream
        .write_all(&raw_header(HEADER_LEN as i32, 9, 2012))
        .await
        .unwrap();
    let (hdr, reply) = read_op_reply(&mut stream).await;
    assert_eq!(hdr.response_to, 9);
    assert_eq!(reply.documents[0].get_f64("ok"), Some(0.0));
    assert_eq!(reply.documents[0].get_i32("code"), Some(1));

    // Parse errors on one frame do not poison the next.
    stream
        .write_all(&encode_op_msg(&doc! { "ping": 1, "$db": "admin" }, 0, 10).unwrap())
        .await
        .unwrap();
    let pong = read_one_op_msg(&mut stream).await;
    assert_eq!(pong.get_f64("ok"), Some(1.0));
}

#[tokio::test]
async fn partial_frame_at_close_is_truncated_and_connection_closes() {
    let server = start().await;
    let mut stream = server.connect().await;

    // Fence on a ping so the connection is registered before probing it.
    stream
        .write_all(&encode_op_msg(&doc! { "ping": 1, "$db": "admin" }, 0, 1).unwrap())
        .await
        .unwrap();
    let _ = read_one_op_msg(&mut stream).await;
    assert!(server.state.connection_stats(1).await.is_some());

    // A frame claiming 64 bytes, cut off mid-body, then the write half goes
    // away. The server raises truncated and transitions to closed.
    let mut partial = raw_header(64, 2, 2013);
    partial.extend_from_slice(&[0u8; 8]);
    stream.write_all(&partial).await.unwrap();
    stream.shutdown().await.unwrap();

    // No reply is owed for a frame that never completed; just EOF.
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).await.unwrap_or(0), 0);

    // Once closed, the connection leaves the registry.
    for _ in 0..100 {
        if server.state.connection_stats(1).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection was not closed after the truncated frame");
}

#[tokio::test]
async fn truncated_document_in_msg_is_a_protocol_error() {
    let server = start().await;
    let mut stream = server.connect().await;

    // Valid header + flags + kind byte, then a document whose declared
    // length overruns the frame.
    let mut frame = raw_header(16 + 4 + 1 + 5, 3, 2013);
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.push(0);
    frame.extend_from_slice(&[64, 0, 0, 0, 0]); // doc claims 64 bytes, has 5
    stream.write_all(&frame).await.unwrap();

    let (hdr, doc) = common::read_one_op_msg_with_header(&mut stream).await;
    assert_eq!(hdr.response_to, 3);
    assert_eq!(doc.get_f64("ok"), Some(0.0));
    assert_eq!(doc.get_i32("code"), Some(1));

    // Recoverable: the framer still finds the next frame.
    stream
        .write_all(&encode_op_msg(&doc! { "ping": 1, "$db": "admin" }, 0, 4).unwrap())
        .await
        .unwrap();
    let pong = read_one_op_msg(&mut stream).await;
    assert_eq!(pong.get_f64("ok"), Some(1.0));
}
