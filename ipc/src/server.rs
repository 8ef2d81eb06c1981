use crate::handler::{ItemStream, MethodTable, Reply};
use crate::protocol::{Request, Response, CANCEL_METHOD, PING_METHOD};
use crate::transport::{is_disconnect, Connection, Listener};
use futures::FutureExt;
use futures::StreamExt;
use peerlink_core::{address_for, ensure_socket_dir, IpcConfig, IpcError, IpcResult};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Live streaming calls, keyed by task id.
#[derive(Debug, Default)]
pub struct ActiveTasks {
    inner: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh task id with a clear cancellation flag. The entry
    /// lives exactly as long as the returned guard.
    pub fn register(self: &Arc<Self>) -> TaskGuard {
        let id = Uuid::new_v4().to_string();
        let flag = Arc::new(AtomicBool::new(false));
        self.lock().insert(id.clone(), Arc::clone(&flag));
        TaskGuard {
            tasks: Arc::clone(self),
            id,
            flag,
        }
    }

    /// Flags `task_id` for cancellation. Returns whether the task was live.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.lock().get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one stream in the active-task table.
#[derive(Debug)]
pub struct TaskGuard {
    tasks: Arc<ActiveTasks>,
    id: String,
    flag: Arc<AtomicBool>,
}

impl TaskGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tasks.lock().remove(&self.id);
    }
}

const STALE_CHECK_PAUSE: Duration = Duration::from_millis(20);

/// Pause before accepting again after `accept` fails (e.g. out of file
/// descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop and dispatcher for one endpoint.
pub struct Server {
    endpoint: String,
    config: IpcConfig,
    methods: MethodTable,
    tasks: Arc<ActiveTasks>,
}

impl Server {
    pub fn new(endpoint: impl Into<String>, config: IpcConfig, methods: MethodTable) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            methods,
            tasks: Arc::new(ActiveTasks::new()),
        }
    }

    /// Starts the accept loop on the current runtime. Binding is retried in
    /// the background until it succeeds or the handle is shut down.
    pub fn spawn(self) -> ServerHandle {
        self.launch(None)
    }

    /// Binds this server's address once. `AddrInUse` means another live
    /// process is serving the name; a stale socket file is replaced.
    pub async fn try_bind(&self) -> io::Result<Listener> {
        let address = address_for(&self.config.socket_dir, &self.endpoint);
        bind(&self.config.socket_dir, &address).await
    }

    /// Starts the accept loop on a listener obtained from `try_bind`.
    pub fn serve(self, listener: Listener) -> ServerHandle {
        self.launch(Some(listener))
    }

    fn launch(self, listener: Option<Listener>) -> ServerHandle {
        let address = address_for(&self.config.socket_dir, &self.endpoint);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (ready_tx, ready_rx) = watch::channel(false);
        let endpoint = self.endpoint.clone();
        let tasks = Arc::clone(&self.tasks);

        let join = tokio::spawn(self.run(listener, shutdown_rx, ready_tx));

        ServerHandle {
            endpoint,
            address,
            tasks,
            shutdown_tx,
            ready: ready_rx,
            join,
        }
    }

    async fn run(
        self,
        listener: Option<Listener>,
        mut shutdown_rx: mpsc::Receiver<()>,
        ready_tx: watch::Sender<bool>,
    ) {
        let listener = match listener {
            Some(listener) => listener,
            None => loop {
                match self.try_bind().await {
                    Ok(listener) => break listener,
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "Failed to bind listener, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.bind_retry_delay()) => {}
                            Some(()) = shutdown_rx.recv() => return,
                        }
                    }
                }
            },
        };

        info!(endpoint = %self.endpoint, path = %listener.path().display(), "IPC server listening");
        let _ = ready_tx.send(true);

        let dispatcher = Arc::new(Dispatcher {
            endpoint: self.endpoint,
            methods: self.methods,
            tasks: self.tasks,
        });

        loop {
            tokio::select! {
                Some(()) = shutdown_rx.recv() => {
                    info!(endpoint = %dispatcher.endpoint, "IPC server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        debug!(endpoint = %dispatcher.endpoint, "Accepted new IPC connection");
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move { dispatcher.serve(conn).await });
                    }
                    Err(e) => {
                        warn!(endpoint = %dispatcher.endpoint, error = %e, "Failed to accept IPC connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

/// Binds `address`, clearing a socket file left behind by a dead process.
/// A socket that still answers connects is left alone.
/// A socket bound but not yet listening refuses connections briefly, so a
/// refusal is checked twice before the file counts as stale.
async fn is_live(address: &Path) -> bool {
    for attempt in 0..2 {
        if attempt > 0 {
            tokio::time::sleep(STALE_CHECK_PAUSE).await;
        }
        if Connection::connect(address).await.is_ok() {
            return true;
        }
    }
    false
}

async fn bind(socket_dir: &Path, address: &Path) -> io::Result<Listener> {
    ensure_socket_dir(socket_dir)?;
    match Listener::bind(address) {
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            if is_live(address).await {
                return Err(e);
            }
            warn!(path = %address.display(), "Removing stale socket file");
            std::fs::remove_file(address)?;
            Listener::bind(address)
        }
        other => other,
    }
}

/// Control handle for a spawned server.
///
/// Dropping the handle leaves the server running for the rest of the
/// process; `shutdown` stops it and removes its socket.
#[derive(Debug)]
pub struct ServerHandle {
    endpoint: String,
    address: PathBuf,
    tasks: Arc<ActiveTasks>,
    shutdown_tx: mpsc::Sender<()>,
    ready: watch::Receiver<bool>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    pub fn tasks(&self) -> &Arc<ActiveTasks> {
        &self.tasks
    }

    /// Number of streams currently in flight.
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_listening(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once the listener is bound. Returns `false` if the server
    /// stopped before that happened.
    pub async fn wait_until_listening(&self) -> bool {
        let mut ready = self.ready.clone();
        loop {
            if *ready.borrow_and_update() {
                return true;
            }
            if ready.changed().await.is_err() {
                return *ready.borrow();
            }
        }
    }

    /// Stops accepting connections and removes the socket file. Connections
    /// already being served run to completion.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            error!(endpoint = %self.endpoint, error = %e, "IPC server task panicked");
        }
    }
}

struct Dispatcher {
    endpoint: String,
    methods: MethodTable,
    tasks: Arc<ActiveTasks>,
}

impl Dispatcher {
    async fn serve(self: Arc<Self>, mut conn: Connection) {
        if let Err(e) = self.dispatch(&mut conn).await {
            if is_disconnect(&e) {
                debug!(endpoint = %self.endpoint, error = %e, "Client went away");
            } else {
                warn!(endpoint = %self.endpoint, error = %e, "Error handling IPC connection");
            }
        }
        conn.close().await;
    }

    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn dispatch(&self, conn: &mut Connection) -> IpcResult<()> {
        // A bare connect with no request is a liveness probe.
        let raw = match conn.recv::<Value>().await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(()),
            Err(e @ (IpcError::Serde(_) | IpcError::Protocol(_))) => {
                warn!(error = %e, "Undecodable request");
                return conn.send(&Response::error(format!("Malformed request: {}", e))).await;
            }
            Err(e) => return Err(e),
        };

        let request: Request = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                return conn.send(&Response::error(format!("Malformed request: {}", e))).await;
            }
        };

        match request.method.as_str() {
            CANCEL_METHOD => {
                if let Some(task_id) = request.task_id() {
                    let live = self.tasks.cancel(task_id);
                    debug!(task_id = %task_id, live, "Cancellation requested");
                }
                conn.send(&Response::ok(Value::Null)).await
            }
            PING_METHOD => conn.send(&Response::ok(Value::Bool(true))).await,
            _ => self.invoke(conn, request).await,
        }
    }

    async fn invoke(&self, conn: &mut Connection, request: Request) -> IpcResult<()> {
        let (method, args) = request.into_parts();

        let Some(handler) = self.methods.get(&method) else {
            debug!(method = %method, "Method not found");
            return conn
                .send(&Response::error(format!("Method '{}' not found", method)))
                .await;
        };

        debug!(method = %method, "Dispatching call");
        let outcome = AssertUnwindSafe(handler.handle(args)).catch_unwind().await;

        match outcome {
            Ok(Ok(Reply::Value(data))) => conn.send(&Response::ok(data)).await,
            Ok(Ok(Reply::Stream(items))) => self.pump(conn, &method, items).await,
            Ok(Err(e)) => {
                debug!(method = %method, error = %e, "Handler failed");
                conn.send(&Response::error(format!("{:#}", e))).await
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(method = %method, panic = %msg, "Handler panicked");
                conn.send(&Response::error(format!("handler panicked: {}", msg))).await
            }
        }
    }

    /// Relays a handler's stream. The task entry is dropped on every exit
    /// path, before the connection is closed.
    async fn pump(&self, conn: &mut Connection, method: &str, mut items: ItemStream) -> IpcResult<()> {
        let task = self.tasks.register();
        debug!(method = %method, task_id = %task.id(), "Starting stream");
        conn.send(&Response::StreamStart {
            task_id: task.id().to_string(),
        })
        .await?;

        loop {
            if task.is_cancelled() {
                debug!(task_id = %task.id(), "Stream cancelled");
                break;
            }

            let next = AssertUnwindSafe(items.next()).catch_unwind().await;
            match next {
                Ok(None) => break,
                Ok(Some(Ok(data))) => {
                    if task.is_cancelled() {
                        debug!(task_id = %task.id(), "Stream cancelled");
                        break;
                    }
                    conn.send(&Response::Progress { data }).await?;
                }
                Ok(Some(Err(e))) => {
                    debug!(task_id = %task.id(), error = %e, "Stream failed");
                    return conn.send(&Response::error(format!("{:#}", e))).await;
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!(task_id = %task.id(), panic = %msg, "Stream panicked");
                    return conn.send(&Response::error(format!("stream panicked: {}", msg))).await;
                }
            }
        }

        conn.send(&Response::StreamEnd).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_entry_on_drop() {
        let tasks = Arc::new(ActiveTasks::new());
        let guard = tasks.register();
        let id = guard.id().to_string();

        assert!(tasks.contains(&id));
        assert!(!guard.is_cancelled());
        assert!(tasks.cancel(&id));
        assert!(guard.is_cancelled());

        drop(guard);
        assert!(tasks.is_empty());
        assert!(!tasks.cancel(&id));
    }

    #[test]
    fn test_task_ids_are_unique() {
        let tasks = Arc::new(ActiveTasks::new());
        let guards: Vec<TaskGuard> = (0..64).map(|_| tasks.register()).collect();
        assert_eq!(tasks.len(), 64);

        let mut ids: Vec<&str> = guards.iter().map(TaskGuard::id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_cancelling_one_task_leaves_others_alone() {
        let tasks = Arc::new(ActiveTasks::new());
        let a = tasks.register();
        let b = tasks.register();

        tasks.cancel(a.id());
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn test_panic_message_extraction() {
        let static_panic: Box<dyn Any + Send> = Box::new("static");
        let owned_panic: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other_panic: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(static_panic.as_ref()), "static");
        assert_eq!(panic_message(owned_panic.as_ref()), "owned");
        assert_eq!(panic_message(other_panic.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_second_bind_of_a_live_name_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = IpcConfig::for_dirs(dir.path().join("sockets"), dir.path().join("registry.json"));
        let first = Server::new("Claimed", config.clone(), MethodTable::new());
        let second = Server::new("Claimed", config.clone(), MethodTable::new());

        let listener = first.try_bind().await.unwrap();
        let err = second.try_bind().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
        assert!(Connection::connect(listener.path()).await.is_ok());

        // Leave a socket file behind with nobody listening on it.
        let address = listener.path().to_path_buf();
        drop(listener);
        drop(std::os::unix::net::UnixListener::bind(&address).unwrap());
        assert!(address.exists());

        let replacement = second.try_bind().await.unwrap();
        assert_eq!(replacement.path(), address.as_path());
    }
}
