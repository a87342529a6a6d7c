//! Recognized command names and case-insensitive lookup. See spec §4.6.
//!
//! Unlike the protocol layer this sits on top of, a `Command` carries no
//! arguments of its own — it is purely the dispatch key. Arguments stay as
//! the raw decoded token vector so that, e.g., `MULTI`'s queue can hold them
//! unvalidated until `EXEC`.

use std::str::FromStr;

use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Echo,
    Set,
    Get,
    Incr,
    Type,
    Keys,
    Config,
    Xadd,
    Xrange,
    Xread,
    Multi,
    Exec,
    Discard,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_uppercase().as_str() {
            "PING" => Ok(Command::Ping),
            "ECHO" => Ok(Command::Echo),
            "SET" => Ok(Command::Set),
            "GET" => Ok(Command::Get),
            "INCR" => Ok(Command::Incr),
            "TYPE" => Ok(Command::Type),
            "KEYS" => Ok(Command::Keys),
            "CONFIG" => Ok(Command::Config),
            "XADD" => Ok(Command::Xadd),
            "XRANGE" => Ok(Command::Xrange),
            "XREAD" => Ok(Command::Xread),
            "MULTI" => Ok(Command::Multi),
            "EXEC" => Ok(Command::Exec),
            "DISCARD" => Ok(Command::Discard),
            _ => Err(CommandError::UnknownCommand(input.to_string())),
        }
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Echo => "ECHO",
            Command::Set => "SET",
            Command::Get => "GET",
            Command::Incr => "INCR",
            Command::Type => "TYPE",
            Command::Keys => "KEYS",
            Command::Config => "CONFIG",
            Command::Xadd => "XADD",
            Command::Xrange => "XRANGE",
            Command::Xread => "XREAD",
            Command::Multi => "MULTI",
            Command::Exec => "EXEC",
            Command::Discard => "DISCARD",
        }
    }

}

/// A decoded, unvalidated command line: the command name plus its raw
/// argument tokens, still exactly as received on the wire.
pub struct CommandLine {
    pub command: Command,
    pub args: Vec<Vec<u8>>,
}

/// Parses the first token of a decoded command frame into a known
/// `Command`, leaving the remaining tokens as-is for the executor to
/// interpret (spec §4.6: unrecognized commands are the only case where the
/// first token itself is in error).
pub fn parse(tokens: Vec<Vec<u8>>) -> Result<CommandLine, CommandError> {
    let mut iter = tokens.into_iter();
    let head = iter.next().ok_or(CommandError::Protocol)?;
    let name = String::from_utf8_lossy(&head);
    let command = name.parse::<Command>()?;
    Ok(CommandLine { command, args: iter.collect() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_command_case_insensitively() {
        let line = parse(vec![b"sEt".to_vec(), b"k".to_vec(), b"v".to_vec()]).unwrap();
        assert_eq!(line.command, Command::Set);
        assert_eq!(line.args, vec![b"k".to_vec(), b"v".to_vec()]);
    }

    #[test]
    fn unknown_command_is_reported_by_name() {
        let err = parse(vec![b"NOPE".to_vec()]).unwrap_err();
        assert_eq!(err, CommandError::UnknownCommand("NOPE".to_string()));
    }
}
