//! IPC server - the supervisor side of the channel.
//!
//! One `select!` loop owns the listener, the current client's writer and the
//! runner event stream:
//! - a new connection supersedes (and closes) the previous one
//! - requests from the current client are dispatched in arrival order, each
//!   answered with exactly one response
//! - runner events go to the current client only; with no client they are
//!   dropped

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CodecError, DEFAULT_MAX_FRAME_LENGTH, LineJsonCodec};
use crate::bridge::protocol::{Event, Message, Request, Response, method, object};
use crate::bridge::transport::ChannelListener;
use crate::runner::{KernelControl, RunnerEvent};

pub const MESSAGE_TOO_LARGE: &str = "message too large";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_frame_length: usize,
    /// A client that does not drain its socket within this window is dropped.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Cap on one incoming request line.
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

type Writer = FramedWrite<OwnedWriteHalf, LineJsonCodec<Message>>;

enum Inbound {
    Request(Request),
    TooLarge,
    Closed,
}

struct Connection {
    id: u64,
    writer: Writer,
    reader: JoinHandle<()>,
}

impl Connection {
    async fn send(&mut self, msg: Message, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.writer.send(msg)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(conn = self.id, error = %e, "Client write failed");
                false
            }
            Err(_) => {
                tracing::warn!(conn = self.id, "Client stopped reading, dropping connection");
                false
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct IpcServer {
    listener: ChannelListener,
    kernel: Arc<dyn KernelControl>,
    events: mpsc::UnboundedReceiver<RunnerEvent>,
    config: ServerConfig,
}

impl IpcServer {
    pub fn new(
        listener: ChannelListener,
        kernel: Arc<dyn KernelControl>,
        events: mpsc::UnboundedReceiver<RunnerEvent>,
        config: ServerConfig,
    ) -> Self {
        Self {
            listener,
            kernel,
            events,
            config,
        }
    }

    /// Serve until a client requests `shutdown`.
    pub async fn run(mut self) {
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<(u64, Inbound)>(64);
        let mut current: Option<Connection> = None;
        let mut next_conn_id: u64 = 0;

        tracing::info!(addr = %self.listener.addr(), "IPC server listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    next_conn_id += 1;
                    if let Some(old) = current.take() {
                        tracing::info!(old = old.id, new = next_conn_id, "New client supersedes current connection");
                    }

                    let (read_half, write_half) = stream.into_split();
                    let reader = tokio::spawn(read_requests(
                        next_conn_id,
                        FramedRead::new(
                            read_half,
                            LineJsonCodec::<Message>::with_max_length(self.config.max_frame_length),
                        ),
                        inbound_tx.clone(),
                    ));
                    let mut conn = Connection {
                        id: next_conn_id,
                        writer: FramedWrite::new(write_half, LineJsonCodec::new()),
                        reader,
                    };
                    tracing::info!(conn = conn.id, "Client connected");

                    let running = self.kernel.status().await.unwrap_or(false);
                    if conn.send(Message::Event(Event::Status { running }), self.config.write_timeout).await {
                        current = Some(conn);
                    }
                }

                Some(event) = self.events.recv() => {
                    let Some(conn) = current.as_mut() else {
                        tracing::trace!(?event, "No client connected, dropping event");
                        continue;
                    };
                    if !conn.send(Message::Event(event.into()), self.config.write_timeout).await {
                        current = None;
                    }
                }

                Some((conn_id, inbound)) = inbound_rx.recv() => {
                    let Some(conn) = current.as_mut().filter(|c| c.id == conn_id) else {
                        tracing::debug!(conn = conn_id, "Discarding input from superseded connection");
                        continue;
                    };
                    match inbound {
                        Inbound::Request(req) => {
                            tracing::debug!(conn = conn_id, id = req.id, method = %req.method, "Request");
                            let (response, shutdown) = dispatch(self.kernel.as_ref(), &req).await;
                            if !conn.send(Message::Response(response), self.config.write_timeout).await {
                                current = None;
                            }
                            if shutdown {
                                tracing::info!("Shutdown requested by client");
                                break;
                            }
                        }
                        Inbound::TooLarge => {
                            tracing::warn!(conn = conn_id, max = self.config.max_frame_length, "Client exceeded max message size, disconnecting");
                            let error = Event::Error { message: MESSAGE_TOO_LARGE.to_string() };
                            conn.send(Message::Event(error), self.config.write_timeout).await;
                            current = None;
                        }
                        Inbound::Closed => {
                            tracing::info!(conn = conn_id, "Client disconnected");
                            current = None;
                        }
                    }
                }
            }
        }

        tracing::info!("IPC server exiting");
    }
}

async fn read_requests(
    conn_id: u64,
    mut reader: FramedRead<OwnedReadHalf, LineJsonCodec<Message>>,
    tx: mpsc::Sender<(u64, Inbound)>,
) {
    let last = loop {
        match reader.next().await {
            Some(Ok(Message::Request(req))) => {
                if tx.send((conn_id, Inbound::Request(req))).await.is_err() {
                    return;
                }
            }
            Some(Ok(other)) => {
                tracing::trace!(conn = conn_id, ?other, "Ignoring non-request message");
            }
            Some(Err(CodecError::MessageTooLarge { size, max })) => {
                tracing::debug!(conn = conn_id, size, max, "Oversized message");
                break Inbound::TooLarge;
            }
            Some(Err(e)) => {
                tracing::debug!(conn = conn_id, error = %e, "Client read failed");
                break Inbound::Closed;
            }
            None => break Inbound::Closed,
        }
    };
    let _ = tx.send((conn_id, last)).await;
}

fn config_param(req: &Request) -> Option<PathBuf> {
    req.str_param("configPath").map(PathBuf::from)
}

fn running(running: bool) -> serde_json::Map<String, serde_json::Value> {
    object(json!({ "running": running }))
}

/// Returns the response and whether the server should shut down after
/// sending it.
async fn dispatch(kernel: &dyn KernelControl, req: &Request) -> (Response, bool) {
    let id = req.id;
    let result = match req.method.as_str() {
        method::START => kernel.start(config_param(req)).await.map(running),
        method::STOP => kernel.stop().await.map(running),
        method::RESTART => kernel.restart(config_param(req)).await.map(running),
        method::STATUS => kernel.status().await.map(running),
        method::SET_CONFIG => {
            let Some(path) = config_param(req) else {
                return (Response::failure(id, "configPath is required"), false);
            };
            kernel.set_config(path).await.map(|path| {
                object(json!({ "configPath": path.to_string_lossy() }))
            })
        }
        method::VERSION => kernel
            .version()
            .await
            .map(|version| object(json!({ "version": version }))),
        method::SHUTDOWN => return (Response::success(id, object(json!({}))), true),
        other => {
            tracing::warn!(method = other, "Unknown method");
            return (Response::failure(id, format!("unknown method: {other}")), false);
        }
    };

    let response = match result {
        Ok(result) => Response::success(id, result),
        Err(e) => {
            tracing::info!(method = %req.method, error = %e, "Request failed");
            Response::failure(id, e.to_string())
        }
    };
    (response, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    use crate::bridge::transport::{ChannelAddr, connect};
    use crate::runner::RunnerError;

    #[derive(Default)]
    struct FakeKernelControl {
        running: StdMutex<bool>,
        spawned: AtomicUsize,
        config: StdMutex<Option<PathBuf>>,
    }

    #[async_trait]
    impl KernelControl for FakeKernelControl {
        async fn start(&self, config: Option<PathBuf>) -> Result<bool, RunnerError> {
            if let Some(path) = config {
                if !path.exists() {
                    return Err(RunnerError::ConfigNotFound(path));
                }
                *self.config.lock().unwrap() = Some(path);
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            *self.running.lock().unwrap() = true;
            Ok(true)
        }

        async fn stop(&self) -> Result<bool, RunnerError> {
            *self.running.lock().unwrap() = false;
            Ok(false)
        }

        async fn restart(&self, config: Option<PathBuf>) -> Result<bool, RunnerError> {
            self.start(config).await
        }

        async fn status(&self) -> Result<bool, RunnerError> {
            Ok(*self.running.lock().unwrap())
        }

        async fn set_config(&self, path: PathBuf) -> Result<PathBuf, RunnerError> {
            *self.config.lock().unwrap() = Some(path.clone());
            Ok(path)
        }

        async fn version(&self) -> Result<String, RunnerError> {
            Ok("1.9.3".to_string())
        }

        async fn shutdown(&self) -> Result<(), RunnerError> {
            Ok(())
        }
    }

    struct Harness {
        addr: ChannelAddr,
        kernel: Arc<FakeKernelControl>,
        events: mpsc::UnboundedSender<RunnerEvent>,
        server: JoinHandle<()>,
    }

    fn harness(tag: &str, config: ServerConfig) -> Harness {
        let addr = ChannelAddr::for_name(&format!(
            "boxpilot-server-test-{tag}-{}",
            std::process::id()
        ));
        let listener = ChannelListener::bind(addr.clone()).unwrap();
        let kernel = Arc::new(FakeKernelControl::default());
        let (events, events_rx) = mpsc::unbounded_channel();
        let server = IpcServer::new(listener, kernel.clone(), events_rx, config);
        Harness {
            addr,
            kernel,
            events,
            server: tokio::spawn(server.run()),
        }
    }

    struct RawClient {
        reader: FramedRead<OwnedReadHalf, LineJsonCodec<Value>>,
        writer: OwnedWriteHalf,
    }

    impl RawClient {
        async fn connect(addr: &ChannelAddr) -> Self {
            let stream: UnixStream = connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                reader: FramedRead::new(read_half, LineJsonCodec::new()),
                writer,
            }
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn call(&mut self, line: Value) -> Value {
            let mut bytes = serde_json::to_vec(&line).unwrap();
            bytes.push(b'\n');
            self.send_raw(&bytes).await;
            self.next_response().await
        }

        /// `None` once the server has closed the connection (EOF or reset).
        async fn next(&mut self) -> Option<Value> {
            tokio::time::timeout(Duration::from_secs(5), self.reader.next())
                .await
                .expect("timed out waiting for server")
                .and_then(|r| r.ok())
        }

        async fn next_response(&mut self) -> Value {
            loop {
                let msg = self.next().await.expect("connection closed");
                if msg.get("event").is_none() {
                    return msg;
                }
            }
        }
    }

    #[tokio::test]
    async fn pushes_status_on_connect() {
        let h = harness("initial", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;
        assert_eq!(
            client.next().await.unwrap(),
            json!({"event": "status", "running": false})
        );
    }

    #[tokio::test]
    async fn status_before_start() {
        let h = harness("status", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;
        let resp = client.call(json!({"id": 1, "method": "status", "params": {}})).await;
        assert_eq!(resp, json!({"id": 1, "ok": true, "result": {"running": false}}));
    }

    #[tokio::test]
    async fn null_params_still_get_a_response() {
        let h = harness("null-params", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;
        let resp = client.call(json!({"id": 2, "method": "status", "params": null})).await;
        assert_eq!(resp, json!({"id": 2, "ok": true, "result": {"running": false}}));
    }

    #[tokio::test]
    async fn start_with_missing_config_is_rejected() {
        let h = harness("missing-config", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;
        let resp = client
            .call(json!({"id": 1, "method": "start", "params": {"configPath": "/tmp/boxpilot-absent-c.json"}}))
            .await;
        assert_eq!(resp, json!({"id": 1, "ok": false, "error": "Config file not found"}));
        assert_eq!(h.kernel.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_method_and_missing_param() {
        let h = harness("unknown", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;

        let resp = client.call(json!({"id": 5, "method": "reboot"})).await;
        assert_eq!(resp, json!({"id": 5, "ok": false, "error": "unknown method: reboot"}));

        let resp = client.call(json!({"id": 6, "method": "setConfig", "params": {}})).await;
        assert_eq!(resp, json!({"id": 6, "ok": false, "error": "configPath is required"}));

        let resp = client
            .call(json!({"id": 7, "method": "setConfig", "params": {"configPath": "/etc/sb.json"}}))
            .await;
        assert_eq!(resp, json!({"id": 7, "ok": true, "result": {"configPath": "/etc/sb.json"}}));
        assert_eq!(
            *h.kernel.config.lock().unwrap(),
            Some(PathBuf::from("/etc/sb.json"))
        );
    }

    #[tokio::test]
    async fn pipelined_requests_answered_once_in_order() {
        let h = harness("pipelined", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;

        client
            .send_raw(
                b"{\"id\":1,\"method\":\"start\"}\nnot json\n[1]\n{\"id\":2,\"method\":\"status\"}\n{\"id\":3,\"method\":\"stop\"}\n",
            )
            .await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(client.next_response().await["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![1, 2, 3]);

        let resp = client.call(json!({"id": 4, "method": "version"})).await;
        assert_eq!(resp["result"], json!({"version": "1.9.3"}));
    }

    #[tokio::test]
    async fn forwards_runner_events_to_client() {
        let h = harness("events", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;
        client.next().await.unwrap();

        h.events
            .send(RunnerEvent::Output {
                stream: crate::bridge::protocol::LogStream::Stdout,
                text: "hello\n".to_string(),
            })
            .unwrap();
        assert_eq!(
            client.next().await.unwrap(),
            json!({"event": "log", "stream": "stdout", "message": "hello\n"})
        );
    }

    #[tokio::test]
    async fn newest_client_supersedes_previous() {
        let h = harness("supersede", ServerConfig::default());
        let mut first = RawClient::connect(&h.addr).await;
        first.next().await.unwrap();

        let mut second = RawClient::connect(&h.addr).await;
        second.next().await.unwrap();

        // First connection is closed by the server.
        assert!(first.next().await.is_none());

        h.events.send(RunnerEvent::Status(true)).unwrap();
        assert_eq!(
            second.next().await.unwrap(),
            json!({"event": "status", "running": true})
        );
    }

    #[tokio::test]
    async fn oversized_message_drops_connection() {
        let h = harness("oversized", ServerConfig::default().with_max_frame_length(64));
        let mut client = RawClient::connect(&h.addr).await;
        client.next().await.unwrap();

        client.send_raw(&[b'x'; 128]).await;
        assert_eq!(
            client.next().await.unwrap(),
            json!({"event": "error", "message": "message too large"})
        );
        assert!(client.next().await.is_none());

        // The server keeps serving new clients.
        let mut again = RawClient::connect(&h.addr).await;
        let resp = again.call(json!({"id": 1, "method": "status"})).await;
        assert_eq!(resp["ok"], json!(true));
    }

    #[tokio::test]
    async fn shutdown_answers_then_exits() {
        let h = harness("shutdown", ServerConfig::default());
        let mut client = RawClient::connect(&h.addr).await;
        let resp = client.call(json!({"id": 9, "method": "shutdown", "params": {}})).await;
        assert_eq!(resp, json!({"id": 9, "ok": true, "result": {}}));

        tokio::time::timeout(Duration::from_secs(5), h.server)
            .await
            .expect("server did not exit")
            .unwrap();
    }
}
