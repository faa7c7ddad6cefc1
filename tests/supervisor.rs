//! Supervisor integration tests
//!
//! Drives a full supervisor over a real unix socket and plugin directory,
//! with plugin processes simulated by in-process socket clients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_plugin_host::plugins::Launcher;
use beacon_plugin_host::{Error, PluginStatus, PluginSupervisor, SupervisorConfig};
use serde_json::json;

mod common;
use common::{PluginClient, ScriptedLauncher, add_plugin_file, test_config, wait_until};

fn ids(supervisor: &PluginSupervisor, methods: &[&str]) -> Vec<String> {
    supervisor.plugins(methods).into_iter().map(|p| p.id).collect()
}

async fn start(config: SupervisorConfig, launcher: &Arc<ScriptedLauncher>) -> PluginSupervisor {
    let mut supervisor =
        PluginSupervisor::with_launcher(config, Arc::clone(launcher) as Arc<dyn Launcher>).unwrap();
    supervisor.start().await.unwrap();
    supervisor
}

#[tokio::test]
async fn echo_plugin_registers_and_answers_capability_queries() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    add_plugin_file(&config, "echo-plugin");
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path).plugin(
        "echo-plugin",
        "echo",
        &["echo"],
    ));

    let mut supervisor = start(config, &launcher).await;

    assert!(wait_until(|| ids(&supervisor, &["echo"]) == ["echo-1"]).await);
    assert!(ids(&supervisor, &["other"]).is_empty());
    assert_eq!(ids(&supervisor, &[]), ids(&supervisor, &["echo"]));

    let plugin = supervisor.plugin("echo-1").unwrap();
    assert_eq!(plugin.status, PluginStatus::Normal);
    assert_eq!(plugin.source_file, "echo-plugin");
    assert!(plugin.has_capability("echo"));

    supervisor.stop().await;
}

#[tokio::test]
async fn rewritten_file_replaces_its_instance() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    add_plugin_file(&config, "echo-plugin");
    let plugin_dir = config.plugin_dir.clone();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path).plugin(
        "echo-plugin",
        "echo",
        &["echo"],
    ));

    let mut supervisor = start(config, &launcher).await;
    assert!(wait_until(|| ids(&supervisor, &["echo"]) == ["echo-1"]).await);

    std::fs::write(plugin_dir.join("echo-plugin"), b"#!/bin/sh\n# v2\n").unwrap();

    // A rewrite may arrive as several modify events, each restarting the plugin
    assert!(
        wait_until(|| {
            let active = ids(&supervisor, &["echo"]);
            !active.is_empty() && !active.iter().any(|id| id == "echo-1")
        })
        .await
    );
    // The stopped instance is superseded once its replacement is running
    assert!(supervisor.plugin("echo-1").is_none());
    assert!(launcher.acknowledged_stops().contains(&"echo-1".to_string()));
    assert!(launcher.launch_count("echo-plugin") >= 2);

    supervisor.stop().await;
}

#[tokio::test]
async fn failed_launch_does_not_block_other_plugins() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    add_plugin_file(&config, "bad-plugin");
    add_plugin_file(&config, "echo-plugin");
    let launcher = Arc::new(
        ScriptedLauncher::new(&config.socket_path)
            .failing("bad-plugin")
            .plugin("echo-plugin", "echo", &["echo"]),
    );

    let mut supervisor = start(config, &launcher).await;

    assert!(wait_until(|| ids(&supervisor, &["echo"]) == ["echo-1"]).await);
    assert_eq!(launcher.launches(), vec!["bad-plugin", "echo-plugin"]);

    supervisor.stop().await;
}

#[tokio::test]
async fn boot_launches_each_file_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    for name in ["c-plugin", "a-plugin", "b-plugin"] {
        add_plugin_file(&config, name);
    }
    std::fs::create_dir(config.plugin_dir.join("not-a-plugin")).unwrap();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path));

    let mut supervisor = start(config, &launcher).await;

    // The scan is complete once start returns
    assert_eq!(launcher.launches(), vec!["a-plugin", "b-plugin", "c-plugin"]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(launcher.launches().len(), 3);

    supervisor.stop().await;
}

#[tokio::test]
async fn new_file_is_launched_after_boot() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let plugin_dir = config.plugin_dir.clone();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path).plugin(
        "late-plugin",
        "late",
        &["send"],
    ));

    let mut supervisor = start(config, &launcher).await;
    assert!(supervisor.plugins::<&str>(&[]).is_empty());

    std::fs::write(plugin_dir.join("late-plugin"), b"#!/bin/sh\n").unwrap();

    // Creation may be followed by a write event, which restarts the plugin
    assert!(wait_until(|| !ids(&supervisor, &["send"]).is_empty()).await);
    assert!(ids(&supervisor, &["send"]).iter().all(|id| id.starts_with("late-")));

    supervisor.stop().await;
}

#[tokio::test]
async fn removed_file_is_stopped_without_relaunch() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    add_plugin_file(&config, "echo-plugin");
    let plugin_dir = config.plugin_dir.clone();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path).plugin(
        "echo-plugin",
        "echo",
        &["echo"],
    ));

    let mut supervisor = start(config, &launcher).await;
    assert!(wait_until(|| ids(&supervisor, &["echo"]) == ["echo-1"]).await);

    std::fs::remove_file(plugin_dir.join("echo-plugin")).unwrap();

    assert!(
        wait_until(|| supervisor
            .plugin("echo-1")
            .is_some_and(|p| p.status == PluginStatus::Stopped))
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(launcher.launch_count("echo-plugin"), 1);
    assert!(ids(&supervisor, &["echo"]).is_empty());

    supervisor.stop().await;
}

#[tokio::test]
async fn unacknowledged_stop_completes_within_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.stop_timeout = Duration::from_millis(200);
    add_plugin_file(&config, "stuck-plugin");
    let plugin_dir = config.plugin_dir.clone();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path).stubborn(
        "stuck-plugin",
        "stuck",
        &["work"],
    ));

    let mut supervisor = start(config, &launcher).await;
    assert!(wait_until(|| ids(&supervisor, &["work"]) == ["stuck-1"]).await);

    let removed_at = Instant::now();
    std::fs::remove_file(plugin_dir.join("stuck-plugin")).unwrap();

    assert!(
        wait_until(|| supervisor
            .plugin("stuck-1")
            .is_some_and(|p| p.status == PluginStatus::Stopped))
        .await
    );
    assert!(removed_at.elapsed() < Duration::from_secs(2));
    assert!(launcher.acknowledged_stops().is_empty());

    supervisor.stop().await;
}

#[tokio::test]
async fn stop_stops_every_plugin_and_removes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    add_plugin_file(&config, "echo-plugin");
    add_plugin_file(&config, "send-plugin");
    let socket = config.socket_path.clone();
    let launcher = Arc::new(
        ScriptedLauncher::new(&config.socket_path)
            .plugin("echo-plugin", "echo", &["echo"])
            .plugin("send-plugin", "send", &["send"]),
    );

    let mut supervisor = start(config, &launcher).await;
    assert!(wait_until(|| supervisor.plugins::<&str>(&[]).len() == 2).await);

    supervisor.stop().await;

    for id in ["echo-1", "send-1"] {
        assert_eq!(supervisor.plugin(id).unwrap().status, PluginStatus::Stopped);
    }
    let mut stopped = launcher.acknowledged_stops();
    stopped.sort();
    assert_eq!(stopped, vec!["echo-1", "send-1"]);
    assert!(!socket.exists());
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    add_plugin_file(&config, "echo-plugin");
    std::fs::create_dir_all(config.socket_path.parent().unwrap()).unwrap();
    std::fs::write(&config.socket_path, b"left over").unwrap();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path).plugin(
        "echo-plugin",
        "echo",
        &["echo"],
    ));

    let mut supervisor = start(config, &launcher).await;
    assert!(wait_until(|| ids(&supervisor, &["echo"]) == ["echo-1"]).await);

    supervisor.stop().await;
}

#[tokio::test]
async fn second_host_on_same_socket_fails_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path));

    let mut first = start(config.clone(), &launcher).await;

    let launcher = Arc::clone(&launcher) as Arc<dyn Launcher>;
    let mut second = PluginSupervisor::with_launcher(config, launcher).unwrap();
    assert!(matches!(second.start().await, Err(Error::Setup(_))));
    assert!(!second.is_running());

    first.stop().await;
}

#[tokio::test]
async fn malformed_or_silent_connections_never_register() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.handshake_timeout = Duration::from_millis(200);
    let socket = config.socket_path.clone();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path));

    let mut supervisor = start(config, &launcher).await;

    let mut missing_file = PluginClient::connect(&socket).await.unwrap();
    missing_file
        .send(&json!({"type": "register", "id": "anon-1", "capabilities": ["echo"]}))
        .await;
    let reply = missing_file.recv().await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "invalid_registration");

    let mut garbage = PluginClient::connect(&socket).await.unwrap();
    garbage.send_raw("{not json").await;
    assert_eq!(garbage.recv().await.unwrap()["code"], "invalid_message");

    let mut silent = PluginClient::connect(&socket).await.unwrap();
    assert_eq!(silent.recv().await.unwrap()["code"], "handshake_timeout");
    assert!(silent.recv().await.is_none());

    assert!(supervisor.plugin("anon-1").is_none());
    assert!(supervisor.registry().is_empty());

    supervisor.stop().await;
}

#[tokio::test]
async fn invoke_forwards_calls_to_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    add_plugin_file(&config, "echo-plugin");
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path).plugin(
        "echo-plugin",
        "echo",
        &["echo"],
    ));

    let mut supervisor = start(config, &launcher).await;
    assert!(wait_until(|| ids(&supervisor, &["echo"]) == ["echo-1"]).await);

    let reply = supervisor
        .invoke("echo-1", "echo", json!({"text": "hello"}))
        .await
        .unwrap();
    assert_eq!(reply, json!({"text": "hello"}));

    let unserved = supervisor.invoke("echo-1", "send", json!({})).await;
    assert!(matches!(unserved, Err(Error::NotFound(_))));

    supervisor.stop().await;

    let after_stop = supervisor.invoke("echo-1", "echo", json!({})).await;
    assert!(matches!(after_stop, Err(Error::Connection(_))));
}

#[tokio::test]
async fn plugin_disconnect_marks_instance_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let socket = config.socket_path.clone();
    let launcher = Arc::new(ScriptedLauncher::new(&config.socket_path));

    let mut supervisor = start(config, &launcher).await;

    let mut client = PluginClient::connect(&socket).await.unwrap();
    client
        .send(&json!({
            "type": "register",
            "id": "manual-1",
            "capabilities": ["echo"],
            "source_file": "manual-plugin",
        }))
        .await;
    assert_eq!(client.recv().await.unwrap()["type"], "registered");
    assert!(wait_until(|| ids(&supervisor, &["echo"]) == ["manual-1"]).await);

    drop(client);

    assert!(
        wait_until(|| supervisor
            .plugin("manual-1")
            .is_some_and(|p| p.status == PluginStatus::Stopped))
        .await
    );
    assert!(ids(&supervisor, &["echo"]).is_empty());

    supervisor.stop().await;
}
