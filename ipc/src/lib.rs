// Named-endpoint RPC for local processes:
// - Wire envelopes and length-prefixed framing
// - Server with per-connection tasks and cancellable streams
// - Client, stream consumer and remote peer proxy
// - Endpoint facade with single-instance startup

pub mod client;
pub mod endpoint;
pub mod handler;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod transport;

pub use client::Client;
pub use endpoint::{Endpoint, EndpointBuilder, Startup};
pub use handler::{Handler, ItemStream, MethodTable, Reply};
pub use peer::{Invocation, Peer, RemotePeer};
pub use protocol::{CallArgs, Request, Response};
pub use server::{ActiveTasks, Server, ServerHandle};
pub use stream::RemoteStream;

pub use peerlink_core::{IpcConfig, IpcError, IpcResult, LaunchInfo, LaunchKind, Registry};
