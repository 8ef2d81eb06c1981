use crate::client::Client;
use crate::handler::{Handler, MethodTable};
use crate::peer::RemotePeer;
use crate::protocol::CallArgs;
use crate::server::{Server, ServerHandle};
use crate::stream::RemoteStream;
use peerlink_core::{IpcConfig, IpcError, IpcResult, LaunchInfo, Registry};
use serde_json::Value;
use std::fmt;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{info, warn};

/// Result of trying to bring an endpoint up.
pub enum Startup {
    Started(Endpoint),
    /// Another process already serves this name; nothing was registered or
    /// bound.
    AlreadyRunning,
}

impl Startup {
    pub fn started(self) -> Option<Endpoint> {
        match self {
            Startup::Started(endpoint) => Some(endpoint),
            Startup::AlreadyRunning => None,
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, Startup::AlreadyRunning)
    }

    /// Returns the endpoint, or exits the process with status 0 when an older
    /// instance already owns the name.
    pub fn exit_if_running(self) -> Endpoint {
        match self {
            Startup::Started(endpoint) => endpoint,
            Startup::AlreadyRunning => {
                info!("Endpoint is already running, exiting");
                std::process::exit(0)
            }
        }
    }
}

impl fmt::Debug for Startup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Startup::Started(endpoint) => f.debug_tuple("Started").field(&endpoint.name).finish(),
            Startup::AlreadyRunning => f.write_str("AlreadyRunning"),
        }
    }
}

/// Collects the pieces an endpoint needs before it starts.
pub struct EndpointBuilder {
    name: String,
    config: Option<IpcConfig>,
    launch_info: Option<LaunchInfo>,
    register: bool,
    methods: MethodTable,
}

impl EndpointBuilder {
    /// Uses `config` instead of loading it from disk.
    pub fn config(mut self, config: IpcConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Registers `launch_info` instead of the running process' own command line.
    pub fn launch_info(mut self, launch_info: LaunchInfo) -> Self {
        self.launch_info = Some(launch_info);
        self
    }

    /// Skips writing a registry entry; the endpoint will not be wakeable.
    pub fn without_registration(mut self) -> Self {
        self.register = false;
        self
    }

    /// Shares an existing method table with the endpoint.
    pub fn methods(mut self, methods: MethodTable) -> Self {
        self.methods = methods;
        self
    }

    pub fn expose<H: Handler>(self, name: impl Into<String>, handler: H) -> IpcResult<Self> {
        self.methods.expose(name, handler)?;
        Ok(self)
    }

    /// Probes the name, claims its address, registers the launch recipe and
    /// starts serving. Losing the address to a live process counts as
    /// `AlreadyRunning`.
    pub async fn start(self) -> IpcResult<Startup> {
        validate_name(&self.name)?;
        let config = match self.config {
            Some(config) => config,
            None => IpcConfig::load()?,
        };
        let client = Client::new(config.clone());

        if client.ping(&self.name).await {
            info!(endpoint = %self.name, "Endpoint is already running");
            return Ok(Startup::AlreadyRunning);
        }

        // Two processes can both miss each other's ping; the bind decides.
        let server = Server::new(self.name.clone(), config.clone(), self.methods.clone());
        let listener = match server.try_bind().await {
            Ok(listener) => Some(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                info!(endpoint = %self.name, "Endpoint was claimed by another process");
                return Ok(Startup::AlreadyRunning);
            }
            Err(e) => {
                warn!(endpoint = %self.name, error = %e, "Failed to bind listener, retrying in the background");
                None
            }
        };

        if self.register {
            let launch_info = match self.launch_info {
                Some(info) => Some(info),
                None => LaunchInfo::current()
                    .map_err(|e| warn!(error = %e, "Could not determine launch command"))
                    .ok(),
            };
            if let Some(info) = launch_info {
                let registry = client.registry().clone();
                let name = self.name.clone();
                let _ = tokio::task::spawn_blocking(move || registry.register_self(&name, &info)).await;
            }
        }

        let server = match listener {
            Some(listener) => server.serve(listener),
            None => {
                let server = server.spawn();
                let bind_wait = config.call_timeout().max(Duration::from_secs(1));
                if tokio::time::timeout(bind_wait, server.wait_until_listening())
                    .await
                    .is_err()
                {
                    warn!(endpoint = %self.name, "Listener not bound yet, still retrying in the background");
                }
                server
            }
        };

        Ok(Startup::Started(Endpoint {
            name: self.name,
            client,
            methods: self.methods,
            server,
        }))
    }
}

/// A named, addressable process: serves its own methods and calls others.
pub struct Endpoint {
    name: String,
    client: Client,
    methods: MethodTable,
    server: ServerHandle,
}

impl Endpoint {
    pub fn builder(name: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder {
            name: name.into(),
            config: None,
            launch_info: None,
            register: true,
            methods: MethodTable::new(),
        }
    }

    /// Starts `name` with `config` and the process' own launch recipe.
    pub async fn start(name: impl Into<String>, config: IpcConfig) -> IpcResult<Startup> {
        Self::builder(name).config(config).start().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a handler; visible to the very next request.
    pub fn expose<H: Handler>(&self, name: impl Into<String>, handler: H) -> IpcResult<()> {
        self.methods.expose(name, handler)
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn registry(&self) -> &Registry {
        self.client.registry()
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    /// Number of streams this endpoint is currently serving.
    pub fn active_tasks(&self) -> usize {
        self.server.active_tasks()
    }

    pub async fn call(&self, target: &str, method: &str, args: CallArgs) -> IpcResult<Value> {
        self.client.call(target, method, args).await
    }

    pub async fn call_with_timeout(
        &self,
        target: &str,
        method: &str,
        args: CallArgs,
        reply_window: Duration,
    ) -> IpcResult<Value> {
        self.client
            .call_with_timeout(target, method, args, reply_window)
            .await
    }

    pub async fn stream(&self, target: &str, method: &str, args: CallArgs) -> IpcResult<RemoteStream> {
        self.client.stream(target, method, args).await
    }

    pub async fn ping(&self, target: &str) -> bool {
        self.client.ping(target).await
    }

    pub async fn wake(&self, target: &str) -> bool {
        self.client.wake(target).await
    }

    pub fn get_peer(&self, target: impl Into<String>) -> RemotePeer {
        RemotePeer::new(self.client.clone(), target)
    }

    /// Stops serving and removes the socket. The registry entry is kept so
    /// the endpoint can be woken again.
    pub async fn shutdown(self) {
        info!(endpoint = %self.name, "Shutting down endpoint");
        self.server.shutdown().await;
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("address", &self.server.address())
            .field("methods", &self.methods)
            .finish()
    }
}

/// Endpoint names become file names, so path separators are refused.
fn validate_name(name: &str) -> IpcResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(IpcError::Config(format!("Invalid endpoint name '{}'", name)));
    }
    Ok(())
}
