use crate::handle::ServiceHandle;
use std::io;
use thiserror::Error;

/// Failure to hand a message to its destination mailbox.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("unknown destination {0}")]
    UnknownDestination(ServiceHandle),
    #[error("unknown name {0:?}")]
    UnknownName(String),
    #[error("destination {0} is shutting down")]
    Closed(ServiceHandle),
    #[error("remote destination {0} unreachable (standalone node)")]
    Remote(ServiceHandle),
}

/// Failure to resolve or load a service module.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("module {name:?} not found on path {searched:?}")]
    NotFound { name: String, searched: String },
    #[error("failed to load module {name:?}: {source}")]
    Load {
        name: String,
        #[source]
        source: libloading::Error,
    },
    #[error("module {name:?} does not export {symbol:?}")]
    MissingSymbol { name: String, symbol: &'static str },
}

/// Failure to launch a service.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error("service registry is full")]
    RegistryFull,
    #[error("init of {module:?} failed: {reason}")]
    InitFailed { module: String, reason: String },
}

/// Failure reported by a service's own init.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Boot(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure of a synchronous runtime command (C12).
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("command {command}: bad parameter {param:?}")]
    BadParam { command: &'static str, param: String },
    #[error("command {command}: {reason}")]
    Failed { command: &'static str, reason: String },
}

/// Failure of a socket-plane operation performed on the caller's thread.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("invalid socket id {0}")]
    InvalidId(i32),
    #[error("socket {0} is closed")]
    Closed(i32),
    #[error("socket slot table exhausted")]
    SlotsExhausted,
    #[error("invalid address {0:?}")]
    BadAddress(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure decoding the canonical in-process serialisation.
#[derive(Error, Debug, PartialEq)]
pub enum PackError {
    #[error("truncated stream at byte {0}")]
    Truncated(usize),
    #[error("invalid tag byte {tag:#04x} at byte {at}")]
    BadTag { tag: u8, at: usize },
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
    #[error("unsupported value in pack")]
    Unsupported,
}
