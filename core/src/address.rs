use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Prefix shared by every endpoint socket file.
pub const SOCKET_PREFIX: &str = "peerlink_";

/// Maps a logical endpoint name to the socket path both the server and its
/// clients use. Pure: the same inputs always give the same path.
pub fn address_for(socket_dir: &Path, endpoint_name: &str) -> PathBuf {
    socket_dir.join(format!("{}{}.sock", SOCKET_PREFIX, endpoint_name))
}

/// Creates the socket directory if needed.
pub fn ensure_socket_dir(socket_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(socket_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_deterministic() {
        let dir = Path::new("/run/user/1000/peerlink");
        assert_eq!(address_for(dir, "Launcher"), address_for(dir, "Launcher"));
        assert_eq!(
            address_for(dir, "StatusBar"),
            PathBuf::from("/run/user/1000/peerlink/peerlink_StatusBar.sock")
        );
    }

    #[test]
    fn test_distinct_names_get_distinct_addresses() {
        let dir = Path::new("/tmp");
        assert_ne!(address_for(dir, "a"), address_for(dir, "b"));
    }
}
