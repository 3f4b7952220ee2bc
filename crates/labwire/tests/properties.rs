use std::sync::Arc;
use std::time::Duration;

use labwire::frame::{ByteStreamBuffer, Frame, JsonObjectDecoder, LineDecoder};
use labwire::marshal::MarshalRegistry;
use labwire::peer::{
    close_connection, open_connection, Command, CommandEncoder, CommandPolicy, Connection, ConnectionConfig,
    ConnectionState, DispatchError, LineProtocol, Protocol, Reply,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

fn registry() -> Arc<MarshalRegistry> {
    Arc::new(MarshalRegistry::new())
}

fn json_pair() -> (Connection, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (open_connection(client, ConnectionConfig::json_rpc(), registry()), server)
}

async fn read_request(server: &mut DuplexStream, pending: &mut Vec<u8>) -> Value {
    loop {
        let mut stream = serde_json::Deserializer::from_slice(pending.as_slice()).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            let used = stream.byte_offset();
            pending.drain(..used);
            return value;
        }
        let mut chunk = [0u8; 1024];
        let n = server.read(&mut chunk).await.expect("server read should succeed");
        assert!(n > 0, "client closed before sending a request");
        pending.extend_from_slice(&chunk[..n]);
    }
}

fn decode_all_json(chunks: &[&[u8]]) -> Vec<Frame> {
    let mut decoder = JsonObjectDecoder::new();
    let mut buf = ByteStreamBuffer::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        buf.append(chunk);
        while let Some(frame) = decoder.decode(&mut buf).expect("decode should not fail") {
            frames.push(frame);
        }
    }
    frames
}

#[test]
fn garbage_before_an_object_is_skipped_however_it_is_chunked() {
    let garbage: &[u8] = b"\x00\xffnoise]]}} 42 \"str\" ";
    let object: &[u8] = br#"{"jsonrpc":"2.0","id":3,"result":{"nested":"}"}}"#;
    let whole = [garbage, object].concat();

    let splits: Vec<Vec<&[u8]>> = vec![
        vec![whole.as_slice()],
        vec![garbage, object],
        whole.chunks(1).collect(),
        whole.chunks(3).collect(),
        whole.chunks(7).collect(),
    ];
    for chunks in splits {
        let frames = decode_all_json(&chunks);
        let objects: Vec<&Value> = frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Object { value, .. } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(
            objects,
            vec![&json!({"jsonrpc": "2.0", "id": 3, "result": {"nested": "}"}})],
            "chunking {} pieces",
            chunks.len()
        );
    }
}

#[test]
fn garbage_containing_braces_never_eats_the_next_object() {
    let object: &[u8] = br#"{"jsonrpc":"2.0","id":4,"result":"pong"}"#;
    let garbages: [&[u8]; 4] = [b"{", b"x{y", br#"{"id":1,"#, b"{{ noise {"];

    for garbage in garbages {
        let whole = [garbage, object].concat();
        let splits: Vec<Vec<&[u8]>> = vec![
            vec![whole.as_slice()],
            vec![garbage, object],
            whole.chunks(2).collect(),
            whole.chunks(5).collect(),
            whole.chunks(1).collect(),
        ];
        for chunks in splits {
            let frames = decode_all_json(&chunks);
            let objects: Vec<&Value> = frames
                .iter()
                .filter_map(|frame| match frame {
                    Frame::Object { value, .. } => Some(value),
                    _ => None,
                })
                .collect();
            assert_eq!(
                objects,
                vec![&json!({"jsonrpc": "2.0", "id": 4, "result": "pong"})],
                "garbage {:?} in {} pieces",
                String::from_utf8_lossy(garbage),
                chunks.len()
            );
        }
    }
}

#[tokio::test]
async fn reply_after_truncated_message_still_resolves_the_caller() {
    let (connection, mut server) = json_pair();
    let handle = connection.submit(Command::new("ping")).expect("submit should succeed");

    let mut buf = Vec::new();
    let request = read_request(&mut server, &mut buf).await;
    server.write_all(br#"{"jsonrpc":"2.0","id":7,"#).await.expect("write should succeed");
    let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": "pong"});
    server.write_all(reply.to_string().as_bytes()).await.expect("write should succeed");

    assert_eq!(handle.await, Ok(Reply::Json(json!("pong"))));
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[test]
fn line_appears_only_once_terminated() {
    let mut decoder = LineDecoder::new("\r\n");
    let mut buf = ByteStreamBuffer::new();
    for piece in ["M105 T:37", ".0 C:", "36.9"] {
        buf.append(piece.as_bytes());
        assert_eq!(decoder.decode(&mut buf).expect("decode should not fail"), None);
    }
    buf.append(b"\r\n");
    assert_eq!(
        decoder.decode(&mut buf).expect("decode should not fail"),
        Some(Frame::Line("M105 T:37.0 C:36.9".into()))
    );
    assert!(buf.is_empty());
}

#[tokio::test]
async fn connection_resyncs_past_garbage() {
    let (connection, mut server) = json_pair();
    let handle = connection.submit(Command::new("ping")).expect("submit should succeed");

    let mut buf = Vec::new();
    let request = read_request(&mut server, &mut buf).await;
    server.write_all(b"#boot banner v1.2\r\n").await.expect("write should succeed");
    let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": "pong"});
    server.write_all(reply.to_string().as_bytes()).await.expect("write should succeed");

    assert_eq!(handle.await, Ok(Reply::Json(json!("pong"))));
}

#[tokio::test]
async fn interleaved_json_replies_never_swap() {
    let (connection, mut server) = json_pair();
    let handles: Vec<_> = (0..5)
        .map(|n| {
            connection
                .submit(Command::new("read").arg("n", n))
                .expect("submit should succeed")
        })
        .collect();

    let mut buf = Vec::new();
    let mut requests = Vec::new();
    for _ in 0..5 {
        requests.push(read_request(&mut server, &mut buf).await);
    }
    // Answer in reverse order in one write, echoing each request's `n`.
    let replies: String = requests
        .iter()
        .rev()
        .map(|request| json!({"jsonrpc": "2.0", "id": request["id"], "result": request["params"]["n"]}).to_string())
        .collect();
    server.write_all(replies.as_bytes()).await.expect("write should succeed");

    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await, Ok(Reply::Json(json!(n))));
    }
}

#[tokio::test]
async fn pipelined_line_replies_follow_send_order() {
    let (client, device) = tokio::io::duplex(64 * 1024);
    let protocol = LineProtocol::default().with_max_in_flight(2);
    let connection = open_connection(client, ConnectionConfig::line(protocol), registry());
    let mut device = BufReader::new(device);

    let first = connection.submit(Command::new("M114")).expect("submit should succeed");
    let second = connection.submit(Command::new("M115")).expect("submit should succeed");

    let mut lines = String::new();
    device.read_line(&mut lines).await.expect("device read should succeed");
    device.read_line(&mut lines).await.expect("device read should succeed");
    assert_eq!(lines, "M114\nM115\n");

    device
        .get_mut()
        .write_all(b"X:1 Y:2\nOK\nFW:2.1\nOK\n")
        .await
        .expect("write should succeed");
    assert_eq!(first.await, Ok(Reply::Text("X:1 Y:2".into())));
    assert_eq!(second.await, Ok(Reply::Text("FW:2.1".into())));
}

#[tokio::test]
async fn close_twice_cancels_once() {
    let (connection, mut server) = json_pair();
    let handle = connection.submit(Command::new("wait")).expect("submit should succeed");
    let mut buf = Vec::new();
    read_request(&mut server, &mut buf).await;

    let other = connection.clone();
    tokio::join!(close_connection(&connection), close_connection(&other));
    close_connection(&connection).await;
    assert_eq!(connection.state(), ConnectionState::Closed);

    assert!(matches!(handle.await, Err(DispatchError::Cancelled { .. })));
    assert!(matches!(
        connection.submit(Command::new("late")),
        Err(DispatchError::Closed)
    ));

    // The transport was shut down.
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.expect("read to end should succeed");
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_is_dropped() {
    let (connection, mut server) = json_pair();
    let handle = connection
        .submit(Command::new("slow").policy(CommandPolicy::new(Duration::from_millis(50), 0)))
        .expect("submit should succeed");

    let mut buf = Vec::new();
    let request = read_request(&mut server, &mut buf).await;
    assert!(matches!(handle.await, Err(DispatchError::Timeout { attempts: 1, .. })));

    let late = json!({"jsonrpc": "2.0", "id": request["id"], "result": "too late"});
    server.write_all(late.to_string().as_bytes()).await.expect("write should succeed");

    let next = connection.submit(Command::new("fast")).expect("submit should succeed");
    let request = read_request(&mut server, &mut buf).await;
    let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": "on time"});
    server.write_all(reply.to_string().as_bytes()).await.expect("write should succeed");

    assert_eq!(next.await, Ok(Reply::Json(json!("on time"))));
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[test]
fn default_valued_arguments_are_omitted() {
    let json = CommandEncoder::new(registry(), Protocol::JsonRpc);
    let line = CommandEncoder::new(registry(), Protocol::Line(LineProtocol::default()));

    let at_default = Command::new("SET_RPM").arg("S", 0).default(0);
    let changed = Command::new("SET_RPM").arg("S", 1337).default(0);

    let encoded = json.encode_jsonrpc(&at_default, 1).expect("encode should succeed");
    let value: Value = serde_json::from_slice(&encoded).expect("request should be json");
    assert_eq!(value["params"], json!({}));
    assert_eq!(line.encode_line(&at_default).expect("encode should succeed"), "SET_RPM\n");

    let encoded = json.encode_jsonrpc(&changed, 2).expect("encode should succeed");
    let value: Value = serde_json::from_slice(&encoded).expect("request should be json");
    assert_eq!(value["params"], json!({"S": 1337}));
    assert_eq!(line.encode_line(&changed).expect("encode should succeed"), "SET_RPM S1337\n");
}
