use peerlink_ipc::{CallArgs, Client, IpcConfig, LaunchInfo};
use serde_json::json;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::tempdir;

const DAEMON: &str = env!("CARGO_BIN_EXE_echo-daemon");
const STARTUP_WINDOW: Duration = Duration::from_secs(10);

fn daemon_args(name: &str, config: &IpcConfig) -> Vec<String> {
    vec![
        "--name".to_string(),
        name.to_string(),
        "--socket-dir".to_string(),
        config.socket_dir.to_string_lossy().into_owned(),
        "--registry".to_string(),
        config.registry_path.to_string_lossy().into_owned(),
    ]
}

fn daemon_command(name: &str, config: &IpcConfig, config_dir: &Path) -> Command {
    let mut command = Command::new(DAEMON);
    command
        .args(daemon_args(name, config))
        .env("PEERLINK_CONFIG_DIR", config_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    command
}

async fn wait_for_exit(child: &mut Child) -> Option<std::process::ExitStatus> {
    for _ in 0..100 {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let _ = child.kill();
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daemon_serves_and_refuses_duplicate() {
    let dir = tempdir().unwrap();
    let config = IpcConfig::for_dirs(dir.path().join("sockets"), dir.path().join("registry.json"));
    let client = Client::new(config.clone());

    let mut first = daemon_command("EchoProc", &config, dir.path()).spawn().unwrap();
    assert!(client.wait_until_online("EchoProc", STARTUP_WINDOW).await);

    let reply = client
        .call("EchoProc", "echo", CallArgs::new().arg(json!({"k": [1, 2]})))
        .await
        .unwrap();
    assert_eq!(reply, json!({"k": [1, 2]}));

    let sum = client
        .call("EchoProc", "add", CallArgs::new().arg(1).arg(2.5))
        .await
        .unwrap();
    assert_eq!(sum, json!(3.5));

    let entry = client.registry().get("EchoProc").unwrap();
    assert_eq!(entry.pid, Some(first.id()));
    assert!(entry.command.iter().any(|arg| arg == "EchoProc"));

    // A second copy finds the name taken and leaves quietly.
    let mut second = daemon_command("EchoProc", &config, dir.path()).spawn().unwrap();
    let status = wait_for_exit(&mut second).await.unwrap();
    assert!(status.success());
    assert!(client.ping("EchoProc").await);
    assert_eq!(client.registry().get("EchoProc").unwrap().pid, Some(first.id()));

    let _ = client.call("EchoProc", "shutdown", CallArgs::new()).await;
    assert!(wait_for_exit(&mut first).await.is_some());
    assert!(!client.ping("EchoProc").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wake_launches_registered_daemon() {
    let dir = tempdir().unwrap();
    let config = IpcConfig::for_dirs(dir.path().join("sockets"), dir.path().join("registry.json"));
    let client = Client::new(config.clone());

    assert!(client.registry().register_self(
        "Sleeper",
        &LaunchInfo::binary(DAEMON, daemon_args("Sleeper", &config), dir.path()),
    ));
    assert!(!client.ping("Sleeper").await);

    assert!(client.wake("Sleeper").await);
    assert!(client.wait_until_online("Sleeper", STARTUP_WINDOW).await);

    let pid: u32 = client
        .call_as("Sleeper", "pid", CallArgs::new())
        .await
        .unwrap();
    assert_ne!(pid, std::process::id());

    let mut remote = client
        .stream("Sleeper", "count", CallArgs::new().arg(3))
        .await
        .unwrap();
    let mut items = Vec::new();
    while let Some(item) = remote.next_item().await {
        items.push(item.unwrap());
    }
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);

    let _ = client.call("Sleeper", "shutdown", CallArgs::new()).await;
    let mut gone = false;
    for _ in 0..100 {
        if !client.ping("Sleeper").await {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "woken daemon did not exit");
}
