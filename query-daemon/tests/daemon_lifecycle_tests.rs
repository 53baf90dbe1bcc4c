//! End-to-end tests driving an in-process daemon over its real socket.

use query_daemon::daemon::{Daemon, DaemonConfig};
use query_daemon::protocol::MAX_MESSAGE_SIZE;
use query_daemon::{pid_path, DaemonClient};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const PROGRAM: &str = "namespace N { class C { public void M(){} public void X(){ M(); } } }";

fn scratch_workspace(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("App.csproj"), "<Project Sdk=\"Microsoft.NET.Sdk\" />")
        .unwrap();
    for (name, text) in files {
        std::fs::write(dir.path().join(name), text).unwrap();
    }
    dir
}

async fn start_daemon(dir: &Path) -> Daemon {
    let mut config = DaemonConfig::new(dir.to_path_buf());
    config.idle_timeout = Duration::from_secs(30 * 60);
    Daemon::start(config).await.expect("daemon should start")
}

async fn client_for(daemon: &Daemon) -> DaemonClient {
    DaemonClient::connect(daemon.socket_path(), Duration::from_secs(5))
        .await
        .expect("connect to fresh daemon")
}

#[tokio::test]
async fn ping_round_trip() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;
    let client = client_for(&daemon).await;

    let response = client.request("ping", None).await.unwrap();
    let result = response.result.unwrap();
    assert_eq!(result["status"], json!("ok"));
    assert_eq!(result["idle_timeout_minutes"], json!(30));

    daemon.shutdown_token().cancel();
    daemon.wait().await;
}

#[tokio::test]
async fn definition_over_the_wire() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;
    let client = client_for(&daemon).await;

    let call_col = PROGRAM.find("M();").unwrap() + 1;
    let response = client
        .request(
            "definition",
            Some(json!({"file": "T.cs", "line": 1, "column": call_col})),
        )
        .await
        .unwrap();

    let result = response.result.unwrap();
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["symbol_name"], json!("M"));
    assert_eq!(result["location"]["file"], json!("T.cs"));
    assert_eq!(result["location"]["line"], json!(1));

    daemon.shutdown_token().cancel();
    daemon.wait().await;
}

#[tokio::test]
async fn shutdown_rpc_removes_rendezvous_files() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;
    let socket = daemon.socket_path().to_string();
    let pid_file = pid_path(&dir.path().join("App.csproj")).unwrap();
    assert!(pid_file.exists());

    let client = client_for(&daemon).await;
    let response = client.request("shutdown", None).await.unwrap();
    assert_eq!(
        response.result.unwrap()["status"],
        json!("shutting_down"),
        "reply must be flushed before the daemon stops"
    );

    daemon.wait().await;
    assert!(!Path::new(&socket).exists(), "socket file must be removed");
    assert!(!pid_file.exists(), "PID file must be removed");
}

#[tokio::test]
async fn responses_preserve_request_order_per_connection() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;
    let client = client_for(&daemon).await;

    for round in 0..20 {
        let response = client.request("ping", None).await.unwrap();
        // DaemonClient ids are sequential; any reordering would trip the
        // id check, so reaching here 20 times is the assertion.
        assert!(response.result.is_some(), "round {round}");
    }

    daemon.shutdown_token().cancel();
    daemon.wait().await;
}

#[tokio::test]
async fn oversized_frame_closes_connection_but_not_the_daemon() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;

    let mut raw = query_daemon::ipc::IpcStream::connect(daemon.socket_path())
        .await
        .unwrap();
    // One write; the server may hang up as soon as it sees the length.
    let bogus_len = (MAX_MESSAGE_SIZE as u32) * 2;
    let mut frame = Vec::new();
    frame.extend_from_slice(&bogus_len.to_le_bytes());
    frame.extend_from_slice(&[0u8; 1024]);
    let _ = raw.write_all(&frame).await;
    let _ = raw.flush().await;

    // Server must hang up without replying.
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
        .await
        .expect("server should close promptly")
        .unwrap_or(0);
    assert_eq!(read, 0, "no bytes, just EOF");

    // Fresh connections still work.
    let client = client_for(&daemon).await;
    let response = client.request("ping", None).await.unwrap();
    assert_eq!(response.result.unwrap()["status"], json!("ok"));

    daemon.shutdown_token().cancel();
    daemon.wait().await;
}

#[tokio::test]
async fn malformed_json_gets_parse_error_reply() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;

    let mut raw = query_daemon::ipc::IpcStream::connect(daemon.socket_path())
        .await
        .unwrap();
    let body = b"{not json";
    raw.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
    raw.write_all(body).await.unwrap();
    raw.flush().await.unwrap();

    let mut length_buf = [0u8; 4];
    raw.read_exact(&mut length_buf).await.unwrap();
    let len = u32::from_le_bytes(length_buf) as usize;
    let mut reply = vec![0u8; len];
    raw.read_exact(&mut reply).await.unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["error"]["code"], json!(-32700));

    daemon.shutdown_token().cancel();
    daemon.wait().await;
}

#[tokio::test]
async fn idle_timeout_shuts_the_daemon_down() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let mut config = DaemonConfig::new(dir.path().to_path_buf());
    config.idle_timeout = Duration::from_secs(1);
    let daemon = Daemon::start(config).await.unwrap();
    let socket = daemon.socket_path().to_string();
    let pid_file = pid_path(&dir.path().join("App.csproj")).unwrap();

    let client = client_for(&daemon).await;
    let _ = client.request("ping", None).await.unwrap();
    drop(client);

    tokio::time::timeout(Duration::from_secs(10), daemon.wait())
        .await
        .expect("daemon should shut itself down when idle");
    assert!(!Path::new(&socket).exists());
    assert!(!pid_file.exists());
}

#[tokio::test]
async fn reload_during_query_never_breaks_readers() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;
    let call_col = PROGRAM.find("M();").unwrap() + 1;

    let socket = daemon.socket_path().to_string();
    let mut query_tasks = Vec::new();
    for _ in 0..4 {
        let socket = socket.clone();
        query_tasks.push(tokio::spawn(async move {
            let client = DaemonClient::connect(&socket, Duration::from_secs(5))
                .await
                .unwrap();
            for _ in 0..25 {
                let response = client
                    .request(
                        "references",
                        Some(json!({"file": "T.cs", "line": 1, "column": call_col})),
                    )
                    .await
                    .expect("query must complete during reloads");
                let result = response.result.unwrap();
                // Valid answer from either the pre- or post-reload world.
                assert_eq!(result["success"], json!(true));
                assert!(result["locations"].as_array().unwrap().len() >= 1);
            }
        }));
    }

    // Touch the project manifest to force full reloads under the readers.
    for _ in 0..5 {
        std::fs::write(
            dir.path().join("App.csproj"),
            "<Project Sdk=\"Microsoft.NET.Sdk\" />",
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for task in query_tasks {
        task.await.unwrap();
    }

    daemon.shutdown_token().cancel();
    daemon.wait().await;
}

#[tokio::test]
async fn watcher_edit_is_visible_after_debounce() {
    let dir = scratch_workspace(&[("T.cs", PROGRAM)]);
    let daemon = start_daemon(dir.path()).await;
    let client = client_for(&daemon).await;
    assert_eq!(daemon.snapshots().current().version(), 1);

    // Rewrite the source so M moves to a new name.
    std::fs::write(
        dir.path().join("T.cs"),
        "namespace N { class C { public void Renamed(){} } }",
    )
    .unwrap();

    // Wait for the watcher to pick it up and publish a new snapshot.
    let mut updated = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if daemon.snapshots().current().version() > 1 {
            updated = true;
            break;
        }
    }
    assert!(updated, "watcher should publish a new snapshot");

    let src = "namespace N { class C { public void Renamed(){} } }";
    let col = src.find("Renamed").unwrap() + 1;
    let response = client
        .request(
            "symbol",
            Some(json!({"file": "T.cs", "line": 1, "column": col})),
        )
        .await
        .unwrap();
    let result = response.result.unwrap();
    assert_eq!(result["success"], json!(true));
    assert_eq!(result["name"], json!("Renamed"));

    daemon.shutdown_token().cancel();
    daemon.wait().await;
}
