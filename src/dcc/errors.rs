#[derive(Debug)]
pub enum StoreError {
    EnsureDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Inspect {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Unlink {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Open {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Promote {
        from: std::path::PathBuf,
        to: std::path::PathBuf,
        source: std::io::Error,
    },
    BadFilename(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnsureDir { path, source } => {
                write!(
                    f,
                    "failed to create destination directory '{}': {source}",
                    path.display()
                )
            }
            Self::Inspect { path, source } => {
                write!(f, "failed to stat '{}': {source}", path.display())
            }
            Self::Unlink { path, source } => {
                write!(f, "failed to remove '{}': {source}", path.display())
            }
            Self::Open { path, source } => {
                write!(f, "failed to open '{}': {source}", path.display())
            }
            Self::Promote { from, to, source } => write!(
                f,
                "failed to rename '{}' -> '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::BadFilename(reason) => write!(f, "unusable filename: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnsureDir { source, .. }
            | Self::Inspect { source, .. }
            | Self::Unlink { source, .. }
            | Self::Open { source, .. }
            | Self::Promote { source, .. } => Some(source),
            Self::BadFilename(_) => None,
        }
    }
}

/// Why a DCC payload could not be understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    NotDcc,
    UnknownCommand(String),
    MissingField(&'static str),
    BadNumber {
        field: &'static str,
        value: String,
    },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotDcc => write!(f, "payload is not a DCC message"),
            Self::UnknownCommand(cmd) => write!(f, "unknown DCC command '{cmd}'"),
            Self::MissingField(field) => write!(f, "DCC message is missing the {field} field"),
            Self::BadNumber { field, value } => {
                write!(f, "DCC message has an invalid {field}: '{value}'")
            }
        }
    }
}

impl std::error::Error for WireError {}

#[derive(Debug)]
pub enum TransferError {
    Store(StoreError),
    Wire(WireError),
    /// The bot confirmed a resume with parameters that do not match ours.
    AcceptMismatch,
    /// Peer closed before delivering the advertised byte count.
    UnexpectedClose,
    /// The transfer was canceled by the requesting side.
    Canceled,
    /// No bytes arrived on the data channel within the idle window.
    Idle(u64),
    /// The peer delivered more bytes than the advertised file size.
    Overrun { expected: u64, received: u64 },
    Connect {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    Io {
        what: &'static str,
        source: std::io::Error,
    },
    /// The IRC session is gone and control messages cannot be sent.
    IrcClosed,
    /// The transfer task panicked or was torn down by the runtime.
    Join(tokio::task::JoinError),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(source) => write!(f, "{source}"),
            Self::Wire(source) => write!(f, "{source}"),
            Self::AcceptMismatch => write!(f, "ACCEPT parameters mismatch"),
            Self::UnexpectedClose => write!(f, "Server unexpectedly closed connection"),
            Self::Canceled => write!(f, "download canceled"),
            Self::Idle(secs) => write!(f, "no data received for {secs} seconds"),
            Self::Overrun { expected, received } => write!(
                f,
                "received {received} bytes but the advertised size is {expected}"
            ),
            Self::Connect { addr, source } => {
                write!(f, "failed to connect to {addr}: {source}")
            }
            Self::Io { what, source } => write!(f, "failed to {what}: {source}"),
            Self::IrcClosed => write!(f, "IRC session is gone"),
            Self::Join(source) => write!(f, "transfer task failed: {source}"),
        }
    }
}

impl std::error::Error for TransferError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(source) => Some(source),
            Self::Wire(source) => Some(source),
            Self::Connect { source, .. } | Self::Io { source, .. } => Some(source),
            Self::Join(source) => Some(source),
            Self::AcceptMismatch
            | Self::UnexpectedClose
            | Self::Canceled
            | Self::Idle(_)
            | Self::Overrun { .. }
            | Self::IrcClosed => None,
        }
    }
}

impl From<StoreError> for TransferError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<WireError> for TransferError {
    fn from(value: WireError) -> Self {
        Self::Wire(value)
    }
}
