use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the fnug engine.
///
/// Loader errors surface at construction time. Selector failures are logged
/// and collapse to empty selections; per-process failures surface through the
/// owning process's status and never affect siblings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No config file was given and none was discovered walking up from cwd,
    /// or the given path does not exist.
    #[error("no config file found{}", .path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    ConfigNotFound { path: Option<PathBuf> },

    /// The config file exists but is not valid YAML/JSON.
    #[error("failed to parse config {}: {message}", .path.display())]
    ConfigParse { path: PathBuf, message: String },

    /// The config parsed but violates a structural rule (empty name,
    /// duplicate id, regex that does not compile).
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// No git repository is discoverable at or above the given directory.
    #[error("no git repository found at or above {}", .0.display())]
    GitUnavailable(PathBuf),

    /// A watch root does not exist or could not be monitored.
    #[error("cannot watch {}: {source}", .path.display())]
    WatchInit {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// A caller passed a value the engine cannot work with (for example a
    /// zero-sized terminal).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The PTY could not be allocated or the child failed to exec.
    #[error("failed to spawn command: {0}")]
    ProcessSpawn(String),

    /// Unrecoverable I/O error on the PTY master.
    #[error("process I/O error: {0}")]
    ProcessIo(#[from] std::io::Error),

    /// The consumer dropped the stream.
    #[error("stream cancelled")]
    Cancelled,
}
