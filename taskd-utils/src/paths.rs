//! Path utilities for taskd
//!
//! Handles XDG Base Directory specification compliance for runtime,
//! state, and log directories.

use std::path::PathBuf;

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "taskd";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Get the default Unix socket path for client-server communication
///
/// Location: `$XDG_RUNTIME_DIR/taskd/taskd.sock` or `/tmp/taskd-$UID/taskd.sock`
pub fn socket_path() -> PathBuf {
    runtime_dir().join("taskd.sock")
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/taskd` or `/tmp/taskd-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // Fallback to /tmp with UID for security
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Get the state directory (persistent state)
///
/// Location: `$XDG_STATE_HOME/taskd` or `~/.local/state/taskd`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| {
            dirs_fallback_home()
                .join(".local")
                .join("state")
                .join(APP_NAME)
        })
}

/// Get the log directory
///
/// Location: `$XDG_STATE_HOME/taskd/log` or `~/.local/state/taskd/log`
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

fn dirs_fallback_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
