mod common;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, MIB};
use serde_json::{Value, json};
use stord::rpc::{ClientError, RpcClient, RpcServer};

async fn serve(h: &Harness) -> (Arc<RpcServer>, RpcClient) {
    let socket = h.ctx.config.socket_path.clone();
    let server = Arc::new(RpcServer::new(h.ctx.clone(), socket.clone()));
    let running = server.clone();
    tokio::spawn(async move { running.start().await });

    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    (server, RpcClient::new(&socket))
}

#[tokio::test]
async fn status_reports_published_objects() {
    let h = Harness::new().await;
    h.sim.add_disk("sdb", 8 * MIB);
    h.block("sdb").await;
    let (server, client) = serve(&h).await;

    let status: Value = client.call("daemon.status", None).await.unwrap();
    assert_eq!(status["blocks"], 1);
    assert_eq!(status["drives"], 1);
    assert_eq!(status["simulation"], true);

    let objects: Vec<Value> = client.call("objects.list", None).await.unwrap();
    let block = objects
        .iter()
        .find(|o| o["path"] == "/block_devices/sdb")
        .expect("block not listed");
    assert_eq!(block["kind"], "block");
    assert_eq!(block["device"], "/dev/sdb");
    assert!(block["drive"].as_str().unwrap().starts_with("/drives/"));

    server.shutdown();
}

#[tokio::test]
async fn errors_carry_kind_and_step() {
    let h = Harness::new().await;
    h.sim.add_disk("sdb", 8 * MIB);
    h.block("sdb").await;
    let (server, client) = serve(&h).await;

    let err = client
        .call::<Value>(
            "block.format",
            Some(json!({ "path": "/block_devices/sdb", "type": "hfs" })),
        )
        .await
        .unwrap_err();
    let ClientError::Rpc(err) = err else {
        panic!("expected an RPC error, got {:?}", err);
    };
    assert_eq!(err.kind(), Some("not-supported"));
    assert_eq!(err.step(), Some("validate"));

    let err = client
        .call::<Value>("objects.get", Some(json!({ "path": "/block_devices/nope" })))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rpc(e) if e.kind() == Some("not-found")));

    let err = client.call::<Value>("block.frobnicate", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc(e) if e.code == -32601));

    server.shutdown();
}

#[tokio::test]
async fn open_for_backup_passes_descriptor() {
    let h = Harness::new().await;
    h.sim.add_disk("sdb", 8 * MIB);
    h.block("sdb").await;
    let (server, client) = serve(&h).await;

    let mut file = client
        .call_with_fd(
            "block.open_for_backup",
            Some(json!({ "path": "/block_devices/sdb" })),
        )
        .await
        .unwrap();

    let mut sector = [0xffu8; 512];
    file.read_exact(&mut sector).unwrap();
    assert!(sector.iter().all(|b| *b == 0));
    assert_eq!(file.metadata().unwrap().len(), 8 * MIB);

    server.shutdown();
}

#[tokio::test]
async fn benchmark_open_honours_writable_option() {
    let h = Harness::new().await;
    h.sim.add_disk("sdb", 8 * MIB);
    h.block("sdb").await;
    let (server, client) = serve(&h).await;

    let mut read_only = client
        .call_with_fd(
            "block.open_for_benchmark",
            Some(json!({ "path": "/block_devices/sdb" })),
        )
        .await
        .unwrap();
    assert!(read_only.write_all(&[0xaa; 512]).is_err());

    let mut writable = client
        .call_with_fd(
            "block.open_for_benchmark",
            Some(json!({ "path": "/block_devices/sdb", "options": { "writable": true } })),
        )
        .await
        .unwrap();
    writable.write_all(&[0xaa; 512]).unwrap();
    writable.seek(SeekFrom::Start(0)).unwrap();
    let mut sector = [0u8; 512];
    writable.read_exact(&mut sector).unwrap();
    assert!(sector.iter().all(|b| *b == 0xaa));

    server.shutdown();
}

#[tokio::test]
async fn unreachable_socket_is_a_connect_error() {
    let dir = tempfile::tempdir().unwrap();
    let client = RpcClient::new(dir.path().join("missing.sock"));

    let err = client.call::<Value>("daemon.status", None).await.unwrap_err();

    assert!(matches!(err, ClientError::Connect { .. }));
}
