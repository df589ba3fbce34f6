//! Common test utilities for reef integration tests.
//!
//! `TestEnv` isolates the CLI from the user's config and data directories.
//! `TestServer` and `Client` run a real server in-process and talk to it over
//! WebSocket.

#![allow(dead_code)]

use assert_cmd::Command;
use futures::{SinkExt, StreamExt};
use reef::config::{BindAddress, ReefConfig};
use reef::web::{Action, ControllerHandle, Server};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
pub use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A test environment with isolated data and config directories.
///
/// The `reef()` method sets `REEF_DATA_DIR` and `XDG_CONFIG_HOME`
/// per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub work_dir: TempDir,
    pub data_dir: TempDir,
    pub config_home: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            work_dir: TempDir::new().unwrap(),
            data_dir: TempDir::new().unwrap(),
            config_home: TempDir::new().unwrap(),
        }
    }

    /// Get a Command for the reef binary with isolated directories.
    pub fn reef(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_reef"));
        cmd.current_dir(self.work_dir.path());
        cmd.env("REEF_DATA_DIR", self.data_dir.path());
        cmd.env("XDG_CONFIG_HOME", self.config_home.path());
        cmd.env_remove("REEF_CONFIG");
        cmd.env_remove("REEF_LOG_FILE");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    pub fn data_path(&self) -> &Path {
        self.data_dir.path()
    }

    /// Write a config file into the working directory and return its path.
    pub fn write_config(&self, content: &str) -> std::path::PathBuf {
        let path = self.work_dir.path().join("config.kdl");
        std::fs::write(&path, content).unwrap();
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// A server listening on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub controller: ControllerHandle,
    shutdown: CancellationToken,
    handle: JoinHandle<reef::Result<()>>,
}

impl TestServer {
    /// Start a server storing its database in `data_dir`.
    pub async fn start(data_dir: &Path) -> Self {
        let config = ReefConfig {
            database_directory: data_dir.to_path_buf(),
            bind_addresses: vec![BindAddress::new("127.0.0.1", 0)],
            ..Default::default()
        };
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addrs().unwrap()[0];
        let controller = server.controller();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        Self {
            addr,
            controller,
            shutdown,
            handle,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Connect a client and consume the initial `TAG_LIST` and `SUMMARY_LIST`.
    pub async fn client(&self) -> Client {
        let mut client = Client::connect(&self.ws_url()).await;
        assert_eq!(client.recv().await["type"], "TAG_LIST");
        assert_eq!(client.recv().await["type"], "SUMMARY_LIST");
        client
    }

    /// Wait until the controller reports `expected` live connections.
    pub async fn wait_for_connections(&self, expected: usize) {
        timeout(RECV_TIMEOUT, async {
            loop {
                if self.controller.connection_count().await.unwrap() == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {} connections", expected));
    }

    /// Trigger shutdown and wait for the server to stop.
    pub async fn stop(self) -> reef::Result<()> {
        self.shutdown.cancel();
        timeout(RECV_TIMEOUT, self.handle)
            .await
            .expect("server did not stop")
            .unwrap()
    }
}

/// A WebSocket client speaking the JSON protocol.
pub struct Client {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    pub async fn connect(url: &str) -> Self {
        let (stream, _) = connect_async(url).await.unwrap();
        Self { stream }
    }

    /// Attempt the handshake with an `Origin` header, returning the HTTP
    /// status the server answered with.
    pub async fn handshake_status(url: &str, origin: &str) -> StatusCode {
        let mut request = url.into_client_request().unwrap();
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_str(origin).unwrap());
        match connect_async(request).await {
            Ok((_, response)) => response.status(),
            Err(WsError::Http(response)) => response.status(),
            Err(e) => panic!("handshake failed: {}", e),
        }
    }

    pub async fn send_text(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Send an `ACTION` request for `action` carrying `params`.
    pub async fn action(&mut self, id: &str, action: &str, params: Value) {
        let mut request = json!({"id": id, "type": "ACTION", "action": action});
        if let Ok(action) = action.parse::<Action>() {
            request[action.params_key()] = params;
        }
        self.send_text(&request.to_string()).await;
    }

    /// Next text frame as JSON, or `None` once the server closed the socket.
    pub async fn try_recv(&mut self) -> Option<Value> {
        loop {
            let message = timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for a message");
            match message {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    pub async fn recv(&mut self) -> Value {
        self.try_recv().await.expect("connection closed")
    }

    /// Assert that nothing arrives for a short while.
    pub async fn assert_silent(&mut self) {
        let next = timeout(Duration::from_millis(150), self.stream.next()).await;
        assert!(next.is_err(), "unexpected message: {:?}", next);
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
