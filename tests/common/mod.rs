//! Shared test utilities

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_plugin_host::plugins::Launcher;
use beacon_plugin_host::{Error, Result, SupervisorConfig};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Configuration rooted in a temporary directory with short timeouts
pub fn test_config(root: &Path) -> SupervisorConfig {
    let mut config =
        SupervisorConfig::new(root.join("plugins"), root.join("run").join("plugins.sock"));
    config.stop_timeout = Duration::from_millis(500);
    config.handshake_timeout = Duration::from_secs(2);
    config.request_timeout = Duration::from_secs(2);
    // Tests add and rewrite plugin files after startup
    config.plugin_dir_mode = None;
    config
}

/// Create a file in the plugin directory
pub fn add_plugin_file(config: &SupervisorConfig, name: &str) {
    std::fs::create_dir_all(&config.plugin_dir).unwrap();
    std::fs::write(config.plugin_dir.join(name), b"#!/bin/sh\n").unwrap();
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// How a simulated plugin behaves once launched
#[derive(Debug, Clone)]
struct Script {
    id_prefix: String,
    capabilities: Vec<String>,
    answer_stop: bool,
}

/// Launcher that simulates plugin processes with in-process socket clients
///
/// Each launch of a scripted file spawns a client that registers as
/// `<prefix>-<n>`, where `n` counts launches of that file from 1. Files
/// without a script launch successfully but never connect.
#[derive(Debug)]
pub struct ScriptedLauncher {
    socket: PathBuf,
    scripts: HashMap<String, Script>,
    failing: HashSet<String>,
    launches: Mutex<Vec<String>>,
    counters: Mutex<HashMap<String, usize>>,
    stops: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLauncher {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            scripts: HashMap::new(),
            failing: HashSet::new(),
            launches: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            stops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Script a plugin that acknowledges stop requests
    #[must_use]
    pub fn plugin(mut self, file: &str, id_prefix: &str, capabilities: &[&str]) -> Self {
        self.scripts.insert(
            file.to_string(),
            Script {
                id_prefix: id_prefix.to_string(),
                capabilities: capabilities.iter().map(ToString::to_string).collect(),
                answer_stop: true,
            },
        );
        self
    }

    /// Script a plugin that never answers stop requests
    #[must_use]
    pub fn stubborn(mut self, file: &str, id_prefix: &str, capabilities: &[&str]) -> Self {
        self = self.plugin(file, id_prefix, capabilities);
        if let Some(script) = self.scripts.get_mut(file) {
            script.answer_stop = false;
        }
        self
    }

    /// Make launches of `file` fail
    #[must_use]
    pub fn failing(mut self, file: &str) -> Self {
        self.failing.insert(file.to_string());
        self
    }

    /// Every launch call, in order
    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    /// Launch calls for one file
    pub fn launch_count(&self, file: &str) -> usize {
        self.launches().iter().filter(|f| *f == file).count()
    }

    /// IDs of simulated plugins that acknowledged a stop request
    pub fn acknowledged_stops(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, filename: &str) -> Result<()> {
        self.launches.lock().unwrap().push(filename.to_string());

        if self.failing.contains(filename) {
            return Err(Error::Launch(format!("{filename}: permission denied")));
        }
        let Some(script) = self.scripts.get(filename).cloned() else {
            return Ok(());
        };

        let n = {
            let mut counters = self.counters.lock().unwrap();
            let n = counters.entry(filename.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        let id = format!("{}-{n}", script.id_prefix);
        let socket = self.socket.clone();
        let file = filename.to_string();
        let stops = Arc::clone(&self.stops);
        tokio::spawn(async move {
            run_plugin(&socket, &id, &file, &script, &stops).await;
        });
        Ok(())
    }
}

/// Simulated plugin process: register, then serve requests until stopped
async fn run_plugin(
    socket: &Path,
    id: &str,
    file: &str,
    script: &Script,
    stops: &Mutex<Vec<String>>,
) {
    let Ok(mut client) = PluginClient::connect(socket).await else {
        return;
    };

    client
        .send(&json!({
            "type": "register",
            "id": id,
            "capabilities": script.capabilities,
            "source_file": file,
        }))
        .await;
    if client.recv().await.is_none() {
        return;
    }

    while let Some(message) = client.recv().await {
        if message["type"] != "request" {
            continue;
        }
        let request_id = message["request_id"].clone();

        if message["method"] == "stop" {
            if !script.answer_stop {
                continue;
            }
            stops.lock().unwrap().push(id.to_string());
            client
                .send(&json!({"type": "response", "request_id": request_id, "ok": true}))
                .await;
            return;
        }

        client
            .send(&json!({
                "type": "response",
                "request_id": request_id,
                "ok": true,
                "payload": message["params"],
            }))
            .await;
    }
}

/// Raw protocol client for driving the socket directly
pub struct PluginClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl PluginClient {
    pub async fn connect(socket: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            write,
        })
    }

    /// Send one JSON message; write failures are ignored
    pub async fn send(&mut self, message: &Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub async fn send_raw(&mut self, line: &str) {
        let _ = self.write.write_all(format!("{line}\n").as_bytes()).await;
    }

    /// Next message from the host, or `None` once the connection closes
    pub async fn recv(&mut self) -> Option<Value> {
        let line = self.lines.next_line().await.ok()??;
        serde_json::from_str(&line).ok()
    }
}
