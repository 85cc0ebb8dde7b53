#![allow(dead_code)]

use mockingdb::bson::Document;
use mockingdb::config::Config;
use mockingdb::protocol::{HEADER_LEN, MessageHeader, OP_MSG, OP_REPLY, OpReply, parse_op_reply};
use mockingdb::server::{ServerState, spawn_with_shutdown};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

pub struct TestServer {
    pub state: Arc<ServerState>,
    pub addr: std::net::SocketAddr,
    pub shutdown: watch::Sender<bool>,
    pub handle: tokio::task::JoinHandle<()>,
}

pub async fn start() -> TestServer {
    start_with(Config {
        listen_addr: "127.0.0.1:0".into(),
        ..Config::default()
    })
    .await
}

pub async fn start_with(cfg: Config) -> TestServer {
    let (state, addr, shutdown, handle) = spawn_with_shutdown(cfg).await.expect("spawn server");
    TestServer {
        state,
        addr,
        shutdown,
        handle,
    }
}

impl TestServer {
    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect")
    }
}

async fn read_frame(stream: &mut TcpStream) -> (MessageHeader, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.expect("read header");
    let (hdr, _) = MessageHeader::parse(&header).expect("parse header");
    let mut body = vec![0u8; hdr.message_length as usize - HEADER_LEN];
    stream.read_exact(&mut body).await.expect("read body");
    (hdr, body)
}

/// Read one MSG reply and return its kind-0 document.
pub async fn read_one_op_msg(stream: &mut TcpStream) -> Document {
    let (hdr, doc) = read_one_op_msg_with_header(stream).await;
    assert_eq!(hdr.op_code, OP_MSG);
    doc
}

pub async fn read_one_op_msg_with_header(stream: &mut TcpStream) -> (MessageHeader, Document) {
    let (hdr, body) = read_frame(stream).await;
    assert_eq!(hdr.op_code, OP_MSG, "expected MSG reply");
    // flags (4) + section kind (1), then the body document
    let doc = mockingdb::bson::decode_document(&body[5..]).expect("decode body").0;
    (hdr, doc)
}

/// Read one legacy REPLY.
pub async fn read_op_reply(stream: &mut TcpStream) -> (MessageHeader, OpReply) {
    let (hdr, body) = read_frame(stream).await;
    assert_eq!(hdr.op_code, OP_REPLY, "expected legacy REPLY");
    let reply = parse_op_reply(&body).expect("parse reply");
    (hdr, reply)
}
