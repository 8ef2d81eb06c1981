// Shared building blocks for peerlink endpoints:
// - Configuration loading
// - Error taxonomy
// - Endpoint name -> socket address mapping
// - Durable launch registry

// Export config module - Configuration loading
pub mod config;
pub use config::*;

// Export errors module - Shared error types
pub mod errors;
pub use errors::*;

// Export address module - Deterministic socket addressing
pub mod address;
pub use address::{address_for, ensure_socket_dir};

// Export registry module - Launch recipes and zombie pruning
pub mod registry;
pub use registry::{LaunchInfo, LaunchKind, Registry};
