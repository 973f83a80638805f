//! `bizcard-service`: host side of the contact card.
//!
//! Wraps a [`bizcard_core::CardContext`] with:
//!
//! - [`gatt`]: the five field endpoints with encrypted read, write and
//!   prepare/execute (reliable) write.
//! - [`store`] and [`emulator`]: file-backed implementations of the durable
//!   store and tag emulator ports.
//! - [`ipc`]: a Unix domain socket speaking newline-delimited JSON-RPC-lite,
//!   standing in for the radio link.

pub mod emulator;
pub mod gatt;
pub mod ipc;
pub mod protocol;
pub mod store;

/// Protocol version for the card IPC.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default socket filename.
pub const SOCKET_FILENAME: &str = "bizcard.sock";

/// Get the default socket path using XDG_RUNTIME_DIR.
///
/// Falls back to `/tmp/bizcard-<username>.sock` if XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> std::path::PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join(SOCKET_FILENAME)
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        std::path::PathBuf::from(format!("/tmp/bizcard-{user}.sock"))
    }
}
