//! KernelService: the controller-side facade over the supervisor.
//!
//! This service owns:
//! - Supervisor bootstrap (connect, else spawn `boxpilot-manager` and retry)
//! - Request/response correlation (id-keyed table of oneshot senders)
//! - The subscription surface (`StatusChanged` / `OutputReceived` / `ErrorOccurred`)
//!
//! One dispatch loop consumes the IPC client's notifications. Callers get a
//! plain `async` result per operation; failures are also published as
//! `ErrorOccurred` so a UI layer only has to watch one stream.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::process::Child;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{Object, Response, method, object};
use crate::client::{ClientError, ClientNotification, IpcClient};
use crate::paths::{DATA_DIR_ENV, DataDir, manager_executable};
use crate::process::{Launch, ProcessControl, SystemProcessControl, spawn_confirmed};

/// Timing and location knobs for the facade.
#[derive(Clone)]
pub struct ServiceConfig {
    pub channel_name: String,
    pub data_dir: DataDir,
    pub rpc_timeout: Duration,
    /// Bound on a single connect attempt.
    pub connect_attempt_timeout: Duration,
    pub connect_retry_interval: Duration,
    /// Total time spent retrying after the supervisor was spawned.
    pub connect_budget: Duration,
    pub manager_start_timeout: Duration,
    pub max_in_flight: usize,
    /// Defaults to `boxpilot-manager` next to the current executable.
    pub manager_executable: Option<PathBuf>,
    pub control: Arc<dyn ProcessControl>,
}

impl ServiceConfig {
    /// Defaults for `channel_name` and `data_dir`.
    pub fn new(channel_name: impl Into<String>, data_dir: DataDir) -> Self {
        Self {
            channel_name: channel_name.into(),
            data_dir,
            rpc_timeout: Duration::from_secs(5),
            connect_attempt_timeout: Duration::from_millis(300),
            connect_retry_interval: Duration::from_millis(300),
            connect_budget: Duration::from_secs(3),
            manager_start_timeout: Duration::from_secs(3),
            max_in_flight: 64,
            manager_executable: None,
            control: Arc::new(SystemProcessControl),
        }
    }

    /// How long one request may wait for its response.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Total connect retry time after a spawn.
    pub fn with_connect_budget(mut self, budget: Duration) -> Self {
        self.connect_budget = budget;
        self
    }

    /// Cap on concurrent requests, at least one.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Supervisor binary to spawn when none is listening.
    pub fn with_manager_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.manager_executable = Some(path.into());
        self
    }
}

/// User-facing facade errors. `Display` strings are shown as-is.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("manager not found: {}", .0.display())]
    ManagerNotFound(PathBuf),
    #[error("failed to start manager: {0}")]
    ManagerStartFailed(String),
    #[error("failed to connect to manager: {0}")]
    ConnectFailed(String),
    #[error("failed to prepare working directory {}: {source}", .path.display())]
    PrepareWorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("RPC timeout: {method} got no response within {timeout:?}")]
    RpcTimeout {
        method: String,
        timeout: Duration,
    },
    /// The supervisor understood the request and refused it.
    #[error("{0}")]
    Rejected(String),
    #[error("connection to manager lost")]
    Disconnected,
    #[error(transparent)]
    Transport(#[from] ClientError),
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    StatusChanged(bool),
    OutputReceived(String),
    ErrorOccurred(String),
}

struct Inner {
    config: ServiceConfig,
    client: IpcClient,
    pending: DashMap<u64, PendingCall>,
    next_id: AtomicU64,
    in_flight: Semaphore,
    running: AtomicBool,
    config_path: StdMutex<PathBuf>,
    events: broadcast::Sender<ServiceEvent>,
    /// Supervisor spawned by this controller, if any. Also serializes bootstrap.
    manager: Mutex<Option<Child>>,
}

struct PendingCall {
    /// Connection the request went out on; 0 until the write completes.
    generation: u64,
    reply: oneshot::Sender<Response>,
}

/// Removes the correlation entry on every exit path.
struct PendingGuard<'a> {
    id: u64,
    pending: &'a DashMap<u64, PendingCall>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct KernelService {
    inner: Arc<Inner>,
    dispatch: JoinHandle<()>,
}

impl KernelService {
    /// Must be called inside a tokio runtime; the dispatch loop is spawned here.
    pub fn new(config: ServiceConfig) -> Self {
        let (client, notifications) = IpcClient::new();
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            in_flight: Semaphore::new(config.max_in_flight),
            config_path: StdMutex::new(config.data_dir.default_config()),
            config,
            client,
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
            events,
            manager: Mutex::new(None),
        });
        let dispatch = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), notifications));
        Self { inner, dispatch }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Last running state observed from the supervisor.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    /// Config path used when an operation is called without one.
    pub fn config_path(&self) -> PathBuf {
        self.inner.current_config_path()
    }

    /// Connect to the supervisor, spawning it first if nothing answers.
    pub async fn ensure_manager_ready(&self) -> Result<(), ServiceError> {
        self.inner.ensure_manager_ready().await
    }

    /// Issue one RPC and wait (bounded) for its response.
    pub async fn send_request_and_wait(
        &self,
        method: &str,
        params: Object,
    ) -> Result<Object, ServiceError> {
        self.inner.send_request_and_wait(method, params).await
    }

    pub async fn start(&self, config: Option<PathBuf>) -> Result<bool, ServiceError> {
        let path = config.unwrap_or_else(|| self.inner.current_config_path());
        let result = self.call(method::START, config_params(&path)).await?;
        Ok(running_of(&result))
    }

    pub async fn stop(&self) -> Result<bool, ServiceError> {
        let result = self.call(method::STOP, Object::new()).await?;
        Ok(running_of(&result))
    }

    pub async fn restart(&self) -> Result<bool, ServiceError> {
        self.restart_with_config(self.inner.current_config_path()).await
    }

    pub async fn restart_with_config(&self, path: PathBuf) -> Result<bool, ServiceError> {
        let result = self.call(method::RESTART, config_params(&path)).await?;
        Ok(running_of(&result))
    }

    /// Point the supervisor at a new config without restarting the kernel.
    pub async fn set_config_path(&self, path: PathBuf) -> Result<PathBuf, ServiceError> {
        let result = self.call(method::SET_CONFIG, config_params(&path)).await?;
        let applied = result
            .get("configPath")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or(path);
        if let Ok(mut current) = self.inner.config_path.lock() {
            *current = applied.clone();
        }
        Ok(applied)
    }

    pub async fn status(&self) -> Result<bool, ServiceError> {
        let result = self.call(method::STATUS, Object::new()).await?;
        let running = running_of(&result);
        self.inner.set_running(running);
        Ok(running)
    }

    pub async fn kernel_version(&self) -> Result<String, ServiceError> {
        let result = self.call(method::VERSION, Object::new()).await?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Ask the supervisor to stop the kernel and exit.
    pub async fn shutdown_manager(&self) -> Result<(), ServiceError> {
        self.call(method::SHUTDOWN, Object::new()).await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.inner.client.disconnect().await;
    }

    async fn call(&self, method: &str, params: Object) -> Result<Object, ServiceError> {
        match self.inner.send_request_and_wait(method, params).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(method, error = %e, "Manager request failed");
                self.inner.emit(ServiceEvent::ErrorOccurred(e.to_string()));
                Err(e)
            }
        }
    }
}

impl Drop for KernelService {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

impl Inner {
    fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_running(&self, running: bool) {
        if self.running.swap(running, Ordering::SeqCst) != running {
            self.emit(ServiceEvent::StatusChanged(running));
        }
    }

    fn current_config_path(&self) -> PathBuf {
        match self.config_path.lock() {
            Ok(path) => path.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn ensure_manager_ready(&self) -> Result<(), ServiceError> {
        if self.client.is_connected() {
            return Ok(());
        }
        let mut manager = self.manager.lock().await;
        if self.client.is_connected() {
            return Ok(());
        }

        let cfg = &self.config;
        match self
            .client
            .connect(&cfg.channel_name, cfg.connect_attempt_timeout)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => tracing::debug!(error = %e, "Manager not reachable"),
        }

        let alive = match manager.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            *manager = Some(self.spawn_manager().await?);
        }

        let deadline = tokio::time::Instant::now() + cfg.connect_budget;
        loop {
            let err = match self
                .client
                .connect(&cfg.channel_name, cfg.connect_attempt_timeout)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if tokio::time::Instant::now() + cfg.connect_retry_interval > deadline {
                return Err(ServiceError::ConnectFailed(err.to_string()));
            }
            tokio::time::sleep(cfg.connect_retry_interval).await;
        }
    }

    async fn spawn_manager(&self) -> Result<Child, ServiceError> {
        let cfg = &self.config;
        let exe = match &cfg.manager_executable {
            Some(path) => path.clone(),
            None => manager_executable()
                .map_err(|e| ServiceError::ManagerStartFailed(e.to_string()))?,
        };
        if !exe.is_file() {
            return Err(ServiceError::ManagerNotFound(exe));
        }

        let workdir = cfg.data_dir.root().to_path_buf();
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|source| ServiceError::PrepareWorkingDir {
                path: workdir.clone(),
                source,
            })?;

        let launch = Launch::new(&exe)
            .arg("--control-name")
            .arg(&cfg.channel_name)
            .current_dir(&workdir)
            .env(DATA_DIR_ENV, workdir.to_string_lossy())
            .detached();
        tracing::info!(exe = %exe.display(), channel = %cfg.channel_name, "Spawning manager");

        let child = spawn_confirmed(Arc::clone(&cfg.control), launch, cfg.manager_start_timeout)
            .await
            .map_err(|e| ServiceError::ManagerStartFailed(e.to_string()))?;
        tracing::info!(pid = ?child.id(), "Manager started");
        Ok(child)
    }

    async fn send_request_and_wait(
        &self,
        method: &str,
        params: Object,
    ) -> Result<Object, ServiceError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| ServiceError::Disconnected)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.ensure_manager_ready().await?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingCall {
                generation: 0,
                reply: tx,
            },
        );
        let _guard = PendingGuard {
            id,
            pending: &self.pending,
        };
        let generation = self.client.send_request(id, method, params).await?;
        // If that connection's disconnect was handled in between, the wait
        // below ends in the RPC timeout instead.
        if let Some(mut call) = self.pending.get_mut(&id) {
            call.generation = generation;
        }

        let response = match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ServiceError::Disconnected),
            Err(_) => {
                return Err(ServiceError::RpcTimeout {
                    method: method.to_string(),
                    timeout: self.config.rpc_timeout,
                });
            }
        };
        if response.ok {
            Ok(response.result.unwrap_or_default())
        } else {
            Err(ServiceError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| format!("{method} failed")),
            ))
        }
    }

    fn on_notification(&self, notification: ClientNotification) {
        match notification {
            ClientNotification::Response(response) => {
                match self.pending.remove(&response.id) {
                    Some((_, call)) => {
                        let _ = call.reply.send(response);
                    }
                    None => tracing::debug!(id = response.id, "Response with no waiter"),
                }
            }
            ClientNotification::Status(running) => self.set_running(running),
            ClientNotification::Log { message, .. } => {
                self.emit(ServiceEvent::OutputReceived(message));
            }
            ClientNotification::Error(message) | ClientNotification::ProtocolError(message) => {
                self.emit(ServiceEvent::ErrorOccurred(message));
            }
            ClientNotification::Disconnected(generation) => {
                // Waiters on that connection fail fast instead of running into
                // the RPC timeout. Requests already sent on a newer connection
                // keep waiting.
                self.pending.retain(|_, call| call.generation != generation);
                // A newer connection gets its own status push.
                if self.client.connection_generation().is_none() {
                    self.set_running(false);
                }
            }
        }
    }
}

async fn dispatch_loop(
    inner: Weak<Inner>,
    mut notifications: mpsc::UnboundedReceiver<ClientNotification>,
) {
    while let Some(notification) = notifications.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_notification(notification);
    }
}

fn config_params(path: &std::path::Path) -> Object {
    object(json!({ "configPath": path.to_string_lossy() }))
}

fn running_of(result: &Object) -> bool {
    result
        .get("running")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::transport::{ChannelAddr, ChannelListener};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

    /// The supervisor end of one accepted connection, driven by hand.
    struct Peer {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Peer {
        async fn accept(listener: &ChannelListener) -> Self {
            let stream = listener.accept().await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn next_request(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("no request")
                .unwrap()
                .expect("connection closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = serde_json::to_vec(&value).unwrap();
            line.push(b'\n');
            self.writer.write_all(&line).await.unwrap();
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        listener: ChannelListener,
        service: Arc<KernelService>,
    }

    fn fixture(tag: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("boxpilot-service-test-{tag}-{}", std::process::id());
        let listener = ChannelListener::bind(ChannelAddr::for_name(&name)).unwrap();
        let config = ServiceConfig::new(name, DataDir::new(dir.path()))
            .with_rpc_timeout(Duration::from_millis(500))
            .with_manager_executable(dir.path().join("no-such-manager"));
        Fixture {
            _dir: dir,
            listener,
            service: Arc::new(KernelService::new(config)),
        }
    }

    async fn connected(f: &Fixture) -> Peer {
        let (ready, peer) = tokio::join!(
            f.service.ensure_manager_ready(),
            Peer::accept(&f.listener)
        );
        ready.unwrap();
        peer
    }

    async fn next_event(rx: &mut broadcast::Receiver<ServiceEvent>) -> ServiceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event")
            .unwrap()
    }

    #[tokio::test]
    async fn start_fills_default_config_and_returns_running() {
        let f = fixture("start");
        let default_config = f.service.config_path();
        let mut peer = connected(&f).await;

        let service = Arc::clone(&f.service);
        let call = tokio::spawn(async move { service.start(None).await });

        let req = peer.next_request().await;
        assert_eq!(req["method"], "start");
        assert_eq!(
            req["params"]["configPath"],
            default_config.to_string_lossy().as_ref()
        );
        peer.send(json!({"id": req["id"], "ok": true, "result": {"running": true}}))
            .await;

        assert!(call.await.unwrap().unwrap());
        assert!(f.service.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn rejected_response_is_verbatim_and_published() {
        let f = fixture("rejected");
        let mut events = f.service.subscribe();
        let mut peer = connected(&f).await;

        let service = Arc::clone(&f.service);
        let call = tokio::spawn(async move { service.start(Some("/tmp/c.json".into())).await });

        let req = peer.next_request().await;
        peer.send(json!({"id": req["id"], "ok": false, "error": "Config file not found"}))
            .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(&err, ServiceError::Rejected(m) if m == "Config file not found"));
        assert_eq!(
            next_event(&mut events).await,
            ServiceEvent::ErrorOccurred("Config file not found".to_string())
        );
    }

    #[tokio::test]
    async fn missing_response_is_rpc_timeout() {
        let f = fixture("timeout");
        let mut peer = connected(&f).await;

        let service = Arc::clone(&f.service);
        let call = tokio::spawn(async move { service.status().await });
        let _ = peer.next_request().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::RpcTimeout { ref method, .. } if method == "status"));
        assert!(f.service.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn responses_are_correlated_by_id() {
        let f = fixture("correlate");
        let mut peer = connected(&f).await;

        let a = Arc::clone(&f.service);
        let first = tokio::spawn(async move { a.kernel_version().await });
        let first_req = peer.next_request().await;
        let b = Arc::clone(&f.service);
        let second = tokio::spawn(async move { b.set_config_path("/etc/next.json".into()).await });
        let second_req = peer.next_request().await;
        assert!(second_req["id"].as_u64().unwrap() > first_req["id"].as_u64().unwrap());

        // Answer out of order, with a stray id in between.
        peer.send(json!({"id": second_req["id"], "ok": true, "result": {"configPath": "/etc/next.json"}}))
            .await;
        peer.send(json!({"id": 9999, "ok": true, "result": {}})).await;
        peer.send(json!({"id": first_req["id"], "ok": true, "result": {"version": "1.9.3"}}))
            .await;

        assert_eq!(first.await.unwrap().unwrap(), "1.9.3");
        assert_eq!(
            second.await.unwrap().unwrap(),
            PathBuf::from("/etc/next.json")
        );
        assert_eq!(f.service.config_path(), PathBuf::from("/etc/next.json"));
    }

    #[tokio::test]
    async fn status_changes_are_deduplicated() {
        let f = fixture("dedupe");
        let mut events = f.service.subscribe();
        let mut peer = connected(&f).await;

        peer.send(json!({"event": "status", "running": false})).await;
        peer.send(json!({"event": "status", "running": true})).await;
        peer.send(json!({"event": "status", "running": true})).await;
        peer.send(json!({"event": "log", "stream": "stdout", "message": "hello"}))
            .await;

        assert_eq!(next_event(&mut events).await, ServiceEvent::StatusChanged(true));
        assert_eq!(
            next_event(&mut events).await,
            ServiceEvent::OutputReceived("hello".to_string())
        );
        assert!(f.service.is_running());
    }

    #[tokio::test]
    async fn disconnect_forces_not_running() {
        let f = fixture("disconnect");
        let mut events = f.service.subscribe();
        let mut peer = connected(&f).await;

        peer.send(json!({"event": "status", "running": true})).await;
        assert_eq!(next_event(&mut events).await, ServiceEvent::StatusChanged(true));

        drop(peer);
        assert_eq!(next_event(&mut events).await, ServiceEvent::StatusChanged(false));
        assert!(!f.service.is_running());
    }

    #[tokio::test]
    async fn disconnect_fails_waiters_fast() {
        let f = fixture("waiters");
        let mut peer = connected(&f).await;

        let service = Arc::clone(&f.service);
        let call = tokio::spawn(async move { service.stop().await });
        let _ = peer.next_request().await;
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::Disconnected));
    }

    async fn wait_disconnected(service: &KernelService) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while service.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("still connected");
    }

    #[tokio::test]
    async fn late_disconnect_of_old_connection_spares_new_waiters() {
        let f = fixture("stale");
        let old = connected(&f).await;
        let old_generation = f.service.inner.client.connection_generation().unwrap();
        drop(old);
        wait_disconnected(&f.service).await;

        let mut peer = connected(&f).await;
        let service = Arc::clone(&f.service);
        let call = tokio::spawn(async move { service.status().await });
        let req = peer.next_request().await;

        // The old connection's disconnect is handled after the new request went out.
        f.service
            .inner
            .on_notification(ClientNotification::Disconnected(old_generation));
        assert!(f.service.is_connected());

        peer.send(json!({"id": req["id"], "ok": true, "result": {"running": true}}))
            .await;
        assert!(call.await.unwrap().unwrap());
        assert!(f.service.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn log_backlog_from_old_connection_does_not_fail_reconnect() {
        let f = fixture("backlog");
        let mut old = connected(&f).await;
        for i in 0..2000 {
            old.send(json!({"event": "log", "stream": "stdout", "message": format!("line {i}")}))
                .await;
        }
        drop(old);
        wait_disconnected(&f.service).await;

        let mut peer = connected(&f).await;
        let service = Arc::clone(&f.service);
        let call = tokio::spawn(async move { service.kernel_version().await });
        let req = peer.next_request().await;
        peer.send(json!({"id": req["id"], "ok": true, "result": {"version": "1.9.3"}}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), "1.9.3");
    }

    #[tokio::test]
    async fn dropping_service_closes_connection() {
        let f = fixture("teardown");
        let mut peer = connected(&f).await;

        drop(f.service);
        let line = tokio::time::timeout(Duration::from_secs(5), peer.lines.next_line())
            .await
            .expect("socket left open")
            .unwrap();
        assert!(line.is_none());
    }

    #[tokio::test]
    async fn missing_manager_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::new("boxpilot-service-test-absent", DataDir::new(dir.path()))
            .with_manager_executable(dir.path().join("boxpilot-manager"));
        let service = KernelService::new(config);
        let mut events = service.subscribe();

        let err = service.status().await.unwrap_err();
        assert!(matches!(err, ServiceError::ManagerNotFound(_)));
        assert!(matches!(
            next_event(&mut events).await,
            ServiceEvent::ErrorOccurred(m) if m.starts_with("manager not found")
        ));
    }

    #[tokio::test]
    async fn spawned_manager_that_never_listens_is_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        // /bin/sh rejects `--control-name` and exits straight away.
        let config = ServiceConfig::new("boxpilot-service-test-silent", DataDir::new(&data))
            .with_manager_executable("/bin/sh")
            .with_connect_budget(Duration::from_millis(300));
        let service = KernelService::new(config);

        let err = service.ensure_manager_ready().await.unwrap_err();
        assert!(matches!(err, ServiceError::ConnectFailed(_)));
        assert!(data.is_dir());
    }
}
