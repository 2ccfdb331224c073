//! Built-in defaults for daemon paths.

use camino::Utf8PathBuf;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use libc::geteuid;

/// Default permissions for a freshly created client socket.
pub const DEFAULT_PERMISSIONS: u32 = 0o666;

/// Computes the default client socket path.
///
/// Root gets the system-wide `/var/run/lirc/lircd`; unprivileged users fall
/// back to their runtime directory so a development daemon can start without
/// touching `/var/run`.
#[must_use]
pub fn default_socket_path() -> Utf8PathBuf {
    default_base_directory().join("lircd")
}

/// Computes the default pidfile path, a sibling of the client socket.
#[must_use]
pub fn default_pidfile_path() -> Utf8PathBuf {
    default_base_directory().join("lircd.pid")
}

#[cfg(unix)]
fn default_base_directory() -> Utf8PathBuf {
    if unsafe { geteuid() } == 0 {
        return Utf8PathBuf::from("/var/run/lirc");
    }
    if let Some(dir) = runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok()) {
        return dir.join("irbus");
    }
    let temp = Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
    temp.join(format!("irbus-uid-{}", unsafe { geteuid() }))
}

#[cfg(not(unix))]
fn default_base_directory() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(std::env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
        .join("irbus")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_sits_next_to_the_socket() {
        let socket = default_socket_path();
        let pidfile = default_pidfile_path();
        assert_eq!(socket.parent(), pidfile.parent());
        assert!(pidfile.as_str().ends_with("lircd.pid"));
    }
}
