#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use labwire::marshal::lab::{self, Mount, Point};
use labwire::marshal::MarshalRegistry;
use labwire::peer::{
    connect, Command, ConnectionConfig, ConnectionState, DispatchError, JsonRpcServer, MethodError, MethodRegistry,
    MethodSpec, ParamSpec, Params, RemoteError, ServerConfig, ServerHandle,
};
use serde_json::json;

fn unique_temp_dir(tag: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("lwrpc-{tag}-{}-{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("scratch dir should be creatable");
    dir
}

fn marshal() -> Arc<MarshalRegistry> {
    Arc::new(lab::standard_registry().expect("standard registry should build"))
}

fn methods() -> MethodRegistry {
    let mut methods = MethodRegistry::new();
    methods
        .register(
            MethodSpec::new("move_to")
                .param(ParamSpec::required("mount").tagged(lab::MOUNT))
                .param(ParamSpec::required("target").tagged(lab::POINT))
                .param(ParamSpec::optional("speed", json!(400)))
                .returns(lab::POINT),
            |params: Params| async move {
                let mount: Mount = params.get("mount")?;
                let target: Point = params.get("target")?;
                if params.contains("speed") {
                    return Err(MethodError::invalid_params("speed is fixed in this test"));
                }
                let offset = if mount == Mount::Left { -34.0 } else { 0.0 };
                Ok::<_, MethodError>(Point::new(target.x + offset, target.y, target.z))
            },
        )
        .expect("move_to should register");
    methods
        .register(MethodSpec::new("halt"), |_params: Params| async move {
            let estop: Option<&str> = None;
            let reason = estop.expect("estop should be wired");
            Ok(json!(reason))
        })
        .expect("halt should register");
    methods
}

async fn start(tag: &str, config: ServerConfig) -> (ServerHandle, PathBuf) {
    let dir = unique_temp_dir(tag);
    let server = JsonRpcServer::new(methods(), marshal(), config);
    let handle = server.bind(dir.join("rpc.sock")).expect("server should bind");
    (handle, dir)
}

async fn wait_for_connections(handle: &ServerHandle, expected: usize) {
    for _ in 0..200 {
        if handle.connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {expected} connections, server reports {}",
        handle.connection_count()
    );
}

#[tokio::test]
async fn typed_call_round_trips_through_the_socket() {
    let (handle, dir) = start("typed", ServerConfig::default()).await;
    let registry = marshal();
    let client = connect(handle.path(), ConnectionConfig::json_rpc(), Arc::clone(&registry))
        .await
        .expect("client should connect");

    let reply = client
        .call(
            Command::new("move_to")
                .typed_arg("mount", lab::MOUNT, Mount::Left)
                .typed_arg("target", lab::POINT, Point::new(100.0, 50.0, 10.0))
                .arg("speed", 400)
                .default(400),
        )
        .await
        .expect("move_to should succeed");
    assert_eq!(reply.as_json(), Some(&json!([66.0, 50.0, 10.0])));
    let point: Point = reply
        .decode_as(&registry, lab::POINT.as_str())
        .expect("reply should decode as a point");
    assert_eq!(point, Point::new(66.0, 50.0, 10.0));

    client.close().await;
    handle.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn bad_params_and_unknown_methods_are_reported() {
    let (handle, dir) = start("errors", ServerConfig::default()).await;
    let client = connect(handle.path(), ConnectionConfig::json_rpc(), marshal())
        .await
        .expect("client should connect");

    let missing = client.call(Command::new("move_to").arg("mount", "left")).await;
    assert!(matches!(
        missing,
        Err(DispatchError::Remote(RemoteError::Rpc { code: -32602, .. }))
    ));

    let unknown = client.call(Command::new("levitate")).await;
    assert!(matches!(
        unknown,
        Err(DispatchError::Remote(RemoteError::Rpc { code: -32601, .. }))
    ));

    handle.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn panicking_method_reports_dispatch_exception() {
    let (handle, dir) = start("panic", ServerConfig::default()).await;
    let client = connect(handle.path(), ConnectionConfig::json_rpc(), marshal())
        .await
        .expect("client should connect");

    match client.call(Command::new("halt")).await {
        Err(DispatchError::Remote(RemoteError::Rpc { code, message, data })) => {
            assert_eq!(code, -32063);
            assert_eq!(message, "uncaught exception in dispatch");
            assert_eq!(data, Some(json!("estop should be wired")));
        }
        other => panic!("expected a dispatch exception, got {other:?}"),
    }

    // The same connection keeps working.
    let reply = client
        .call(
            Command::new("move_to")
                .arg("mount", "RIGHT")
                .arg("target", json!([1.0, 2.0, 3.0])),
        )
        .await
        .expect("move_to should succeed");
    assert_eq!(reply.into_value(), json!([1.0, 2.0, 3.0]));

    handle.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn connections_beyond_the_limit_are_refused() {
    let (handle, dir) = start("limit", ServerConfig::default().with_max_connections(1)).await;
    let first = connect(handle.path(), ConnectionConfig::json_rpc(), marshal())
        .await
        .expect("first client should connect");
    wait_for_connections(&handle, 1).await;

    let second = connect(handle.path(), ConnectionConfig::json_rpc(), marshal())
        .await
        .expect("second socket connect should succeed");
    second.closed().await;
    assert_eq!(second.state(), ConnectionState::Closed);
    assert_eq!(handle.connection_count(), 1);

    let reply = first
        .call(Command::new("move_to").arg("mount", "left").arg("target", json!([0, 0, 0])))
        .await
        .expect("first client should still be served");
    assert_eq!(reply.into_value(), json!([-34.0, 0.0, 0.0]));

    first.close().await;
    wait_for_connections(&handle, 0).await;
    handle.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stop_closes_clients_and_removes_the_socket() {
    let (handle, dir) = start("stop", ServerConfig::default()).await;
    let client = connect(handle.path(), ConnectionConfig::json_rpc(), marshal())
        .await
        .expect("client should connect");
    wait_for_connections(&handle, 1).await;

    handle.stop().await;
    handle.stop().await;
    client.closed().await;
    assert!(!handle.path().exists());
    assert_eq!(handle.connection_count(), 0);
    assert!(matches!(
        client.call(Command::new("move_to")).await,
        Err(DispatchError::Closed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
}
