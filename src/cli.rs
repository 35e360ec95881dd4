//! CLI utilities for Sift.
//!
//! The utilities present in this module are used by `sift_cli` to turn REPL input into
//! requests and to print what the server sends back.
use std::io::{self, BufRead, Write};

use thiserror::Error;

use crate::protocol::{Message, Payload, Value, payload_to_json};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("input closed")]
    Eof,
}

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Exit command `.exit`
    Exit,
    /// Empty line; shows pending server messages.
    Poll,
    Register {
        name: String,
        nickname: String,
        email: String,
        password: String,
    },
    Login {
        email: String,
        password: String,
    },
    Logout,
    /// `query <type> [key=value ...]`
    Query {
        query_type: String,
        parameters: Payload,
    },
    /// `metadata <type>`
    Metadata(String),
}

fn arguments<'a>(
    command: &str,
    args: &[&'a str],
    usage: &str,
    count: usize,
) -> Result<Vec<&'a str>, CommandError> {
    if args.len() != count {
        return Err(CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: format!("usage: {usage}"),
        });
    }
    Ok(args.to_vec())
}

/// Numbers become numeric values; everything else is text.
fn parse_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::from(raw),
    }
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return Ok(Command::Poll);
        };

        match command {
            ".exit" => Ok(Command::Exit),
            "register" => {
                let usage = "register <name> <nickname> <email> <password>";
                let a = arguments(command, args, usage, 4)?;
                Ok(Command::Register {
                    name: a[0].to_string(),
                    nickname: a[1].to_string(),
                    email: a[2].to_string(),
                    password: a[3].to_string(),
                })
            }
            "login" => {
                let a = arguments(command, args, "login <email> <password>", 2)?;
                Ok(Command::Login {
                    email: a[0].to_string(),
                    password: a[1].to_string(),
                })
            }
            "logout" => {
                arguments(command, args, "logout", 0)?;
                Ok(Command::Logout)
            }
            "metadata" => {
                let a = arguments(command, args, "metadata <type>", 1)?;
                Ok(Command::Metadata(a[0].to_string()))
            }
            "query" => {
                let Some((query_type, pairs)) = args.split_first() else {
                    return Err(CommandError::InvalidCommandArguments {
                        command: command.to_string(),
                        reason: "usage: query <type> [key=value ...]".to_string(),
                    });
                };
                let mut parameters = Payload::new();
                for pair in pairs {
                    let Some((key, value)) = pair.split_once('=') else {
                        return Err(CommandError::InvalidCommandArguments {
                            command: command.to_string(),
                            reason: format!("expected key=value, got '{pair}'"),
                        });
                    };
                    parameters.insert(key.to_string(), parse_value(value));
                }
                Ok(Command::Query {
                    query_type: query_type.to_string(),
                    parameters,
                })
            }
            other => Err(CommandError::UnrecognizedCommand(other.to_string())),
        }
    }
}

/// Prompt user for a command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")
        .and_then(|_| writer.flush())
        .map_err(|_| CommandError::Eof)?;

    match reader.read_line(&mut s) {
        Ok(0) | Err(_) => Err(CommandError::Eof),
        Ok(_) => s.trim_end().try_into(),
    }
}

/// Human readable rendering of a server message.
pub fn render(message: &Message) -> String {
    let mut json = payload_to_json(message.payload());
    if let Some(Value::Bytes(plot)) = message.get("plot") {
        json["plot"] = format!("<{} bytes>", plot.len()).into();
    }
    let body = serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string());
    format!("[{}] {body}", message.kind())
}

/// Writes `message` followed by a newline.
pub fn print_message<W: Write>(mut writer: W, message: &Message) -> io::Result<()> {
    writeln!(writer, "{}", render(message))
}
