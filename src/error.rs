use thiserror::Error;

/// Errors that map directly onto a RESP error reply (`-<message>\r\n`).
///
/// `Protocol` is the only variant that also closes the connection (§7(a));
/// every other variant is local to the command that raised it and leaves
/// the connection and the stores untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR protocol error")]
    Protocol,

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR The ID specified in XADD must be greater than 0-0")]
    XaddZeroId,

    #[error("ERR The ID specified in XADD is equal or smaller than the target stream top item")]
    XaddIdTooSmall,

    #[error("ERR invalid stream ID specified as stream command argument")]
    InvalidStreamId,

    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR EXEC without MULTI")]
    ExecWithoutMulti,

    #[error("ERR DISCARD without MULTI")]
    DiscardWithoutMulti,
}
