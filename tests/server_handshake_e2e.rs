mod common;

use common::{read_one_op_msg, read_one_op_msg_with_header, read_op_reply, start};
use mockingdb::bson::{Document, Value};
use mockingdb::doc;
use mockingdb::protocol::{OpQuery, Request, build_request, encode_op_msg};
use tokio::io::AsyncWriteExt;

fn admin_query(query: Document) -> Vec<u8> {
    build_request(
        1,
        &Request::Query(OpQuery {
            flags: 0,
            full_collection_name: "admin.$cmd".into(),
            number_to_skip: 0,
            number_to_return: -1,
            query,
            projection: None,
        }),
    )
    .unwrap()
}

#[tokio::test]
async fn legacy_ismaster_handshake() {
    let server = start().await;
    let mut stream = server.connect().await;

    stream
        .write_all(&admin_query(doc! { "ismaster": 1 }))
        .await
        .unwrap();
    let (hdr, reply) = read_op_reply(&mut stream).await;
    assert_eq!(hdr.response_to, 1);
    assert_eq!(reply.documents.len(), 1);
    let doc = &reply.documents[0];
    assert_eq!(doc.get_f64("ok"), Some(1.0));
    assert_eq!(doc.get_bool("ismaster"), Some(true));
    assert_eq!(doc.get_i32("maxWireVersion"), Some(13));
    assert_eq!(doc.get_i32("maxBsonObjectSize"), Some(16_777_216));
    assert_eq!(doc.get_i32("maxMessageSizeBytes"), Some(48_000_000));
    let compression = doc.get_array("compression").unwrap();
    assert_eq!(
        compression,
        &[Value::from("snappy"), Value::from("zlib")]
    );
}

#[tokio::test]
async fn msg_hello_and_ping() {
    let server = start().await;
    let mut stream = server.connect().await;

    let hello = doc! { "hello": 1, "$db": "admin" };
    stream
        .write_all(&encode_op_msg(&hello, 0, 1).unwrap())
        .await
        .unwrap();
    let (hdr, doc) = read_one_op_msg_with_header(&mut stream).await;
    assert_eq!(hdr.response_to, 1);
    assert_eq!(doc.get_bool("ismaster"), Some(true));
    assert_eq!(
        doc.get_i32("logicalSessionTimeoutMinutes"),
        Some(30)
    );
    assert!(doc.get_i32("connectionId").is_some());

    let ping = doc! { "ping": 1, "$db": "admin" };
    stream
        .write_all(&encode_op_msg(&ping, 0, 2).unwrap())
        .await
        .unwrap();
    let (hdr, doc) = read_one_op_msg_with_header(&mut stream).await;
    assert_eq!(hdr.response_to, 2);
    assert_eq!(doc.get_f64("ok"), Some(1.0));
}

#[tokio::test]
async fn replies_preserve_request_order() {
    let server = start().await;
    let mut stream = server.connect().await;

    // Two pipelined requests must be answered in arrival order.
    let mut both = encode_op_msg(&doc! { "ping": 1, "$db": "admin" }, 0, 41).unwrap();
    both.extend_from_slice(&encode_op_msg(&doc! { "hello": 1, "$db": "admin" }, 0, 42).unwrap());
    stream.write_all(&both).await.unwrap();

    let (first, _) = read_one_op_msg_with_header(&mut stream).await;
    let (second, _) = read_one_op_msg_with_header(&mut stream).await;
    assert_eq!(first.response_to, 41);
    assert_eq!(second.response_to, 42);
}

#[tokio::test]
async fn build_info_and_host_info() {
    let server = start().await;
    let mut stream = server.connect().await;

    stream
        .write_all(&encode_op_msg(&doc! { "buildInfo": 1, "$db": "admin" }, 0, 1).unwrap())
        .await
        .unwrap();
    let doc = read_one_op_msg(&mut stream).await;
    assert_eq!(doc.get_str("version"), Some("7.0.0"));
    let arr = doc.get_array("versionArray").unwrap();
    assert_eq!(arr[0], Value::Int32(7));
    assert_eq!(arr.len(), 4);

    stream
        .write_all(&encode_op_msg(&doc! { "hostInfo": 1, "$db": "admin" }, 0, 2).unwrap())
        .await
        .unwrap();
    let doc = read_one_op_msg(&mut stream).await;
    assert_eq!(doc.get_f64("ok"), Some(1.0));
    assert!(doc.get_document("system").is_some());
}

#[tokio::test]
async fn connection_status_and_get_parameter() {
    let server = start().await;
    let mut stream = server.connect().await;

    let cmd = doc! { "connectionStatus": 1, "showPrivileges": true, "$db": "admin" };
    stream
        .write_all(&encode_op_msg(&cmd, 0, 1).unwrap())
        .await
        .unwrap();
    let doc = read_one_op_msg(&mut stream).await;
    let auth = doc.get_document("authInfo").unwrap();
    assert_eq!(auth.get_array("authenticatedUsers").unwrap().len(), 0);
    // Privileges are reported but always empty.
    assert_eq!(
        auth.get_array("authenticatedUserPrivileges").unwrap().len(),
        0
    );

    let cmd = doc! { "getParameter": 1, "featureCompatibilityVersion": 1, "$db": "admin" };
    stream
        .write_all(&encode_op_msg(&cmd, 0, 2).unwrap())
        .await
        .unwrap();
    let doc = read_one_op_msg(&mut stream).await;
    let fcv = doc.get_document("featureCompatibilityVersion").unwrap();
    assert_eq!(fcv.get_str("version"), Some("7.0"));
}

#[tokio::test]
async fn unknown_commands_return_code_59() {
    let server = start().await;
    let mut stream = server.connect().await;

    for (i, name) in ["atlasVersion", "replSetGetStatus"].iter().enumerate() {
        let mut cmd = Document::new();
        cmd.insert(*name, 1);
        cmd.insert("$db", "admin");
        stream
            .write_all(&encode_op_msg(&cmd, 0, i as i32 + 1).unwrap())
            .await
            .unwrap();
        let doc = read_one_op_msg(&mut stream).await;
        assert_eq!(doc.get_f64("ok"), Some(0.0));
        assert_eq!(doc.get_i32("code"), Some(59));
        assert!(doc.get_str("errmsg").unwrap().contains(name));
    }
}

#[tokio::test]
async fn graceful_shutdown_drains() {
    let server = start().await;
    let mut stream = server.connect().await;

    stream
        .write_all(&encode_op_msg(&doc! { "ping": 1, "$db": "admin" }, 0, 1).unwrap())
        .await
        .unwrap();
    let _ = read_one_op_msg(&mut stream).await;

    server.shutdown.send(true).unwrap();
    server.handle.await.unwrap();
    assert_eq!(
        server
            .state
            .stats
            .connections_current
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}
