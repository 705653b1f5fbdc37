//! Closed error taxonomies for each component.
//!
//! Leaf modules return one of these typed errors; workflow-level code (the
//! `repo`/`ipc` modules) composes them through `anyhow::Error` the same way
//! the teacher crate's `mirror.rs`/`medium.rs` do.

use thiserror::Error;

/// Errors surfaced by the transfer engine.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("peer certificate invalid")]
    PeerCertificateInvalid,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("response exceeded maximum allowed length")]
    ExceededMaxLen,
    #[error("checksum mismatch for range at offset {offset}")]
    InvalidChecksum { offset: u64 },
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("malformed URL: {0}")]
    MalformedUrl(String),
    #[error("temporary problem: {0}")]
    TemporaryProblem(String),
    #[error("timeout downloading {url} to {target}")]
    Timeout { url: String, target: String },
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("authentication failed")]
    AuthFailed,
    #[error("server returned error: {0}")]
    ServerReturnedError(u16),
    #[error("missing data for {0} requested range(s)")]
    MissingData(usize),
    #[error("server refused range request")]
    RangeFail,
    #[error("HTTP/2 error: {0}")]
    Http2Error(String),
    #[error("HTTP/2 stream error: {0}")]
    Http2StreamError(String),
}

/// Errors surfaced by the provider / media handle layer.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media error: {0}")]
    Media(String),
    #[error("file not found on medium: {0}")]
    FileNotFound(String),
    #[error("no free device for volatile medium")]
    Jammed,
    #[error("medium does not provide the requested content")]
    NotDesired,
    #[error("bad URL: {0}")]
    BadUrl(String),
    #[error("user aborted request")]
    AbortRequest,
    #[error("user skipped request")]
    SkipRequest,
}

/// Errors surfaced by the keyring / key-adapter layer.
#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("keyring error: {0}")]
    KeyRing(String),
    #[error("openpgp adapter error: {0}")]
    Adapter(String),
}

/// Errors surfaced by the JSON parser.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("parse error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("nesting depth {depth} exceeds the allowed limit")]
    NestingTooDeep { depth: usize },
}

/// Errors surfaced by the repo / service refresh workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown repository type: {0}")]
    RepoUnknownType(String),
    #[error("repository error: {0}")]
    Repo(String),
    #[error("plugin service produced informal error output: {0}")]
    ServicePluginInformal(String),
}

/// Errors surfaced by the STOMP-like frame codec and the install-helper IPC
/// stream built on top of it.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed frame: {0}")]
    WrongMessageFormat(String),
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
