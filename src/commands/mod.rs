pub mod append;
pub mod auth;
pub mod bpop;
pub mod client;
pub mod dbsize;
pub mod debug;
pub mod del;
pub mod echo;
pub mod executable;
pub mod exists;
pub mod expire;
pub mod flushdb;
pub mod get;
pub mod incr;
pub mod info;
pub mod keys;
pub mod llen;
pub mod lrange;
pub mod mget;
pub mod mset;
pub mod multi;
pub mod ping;
pub mod pop;
pub mod push;
pub mod set;
pub mod strlen;
pub mod ttl;
pub mod type_;

use bytes::Bytes;
use std::str::{self, FromStr};
use std::vec;
use strum_macros::{Display, EnumString, IntoStaticStr};
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::db::{Key, Side};
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::transaction::Scope;
use crate::Error;

use append::Append;
use auth::Auth;
use bpop::BlockingPop;
use client::Client;
use dbsize::DbSize;
use debug::DebugCommand;
use del::Del;
use echo::Echo;
use exists::Exists;
use expire::Expire;
use flushdb::FlushDb;
use get::Get;
use incr::{Incr, Variant};
use info::Info;
use keys::{Keys, KEYS_BATCH};
use llen::Llen;
use lrange::Lrange;
use mget::Mget;
use mset::Mset;
use multi::{Discard, Exec, Multi};
use ping::Ping;
use pop::Pop;
use push::Push;
use set::Set;
use strlen::Strlen;
use ttl::{Ttl, TtlUnit};
use type_::Type;

/// Every command name the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CommandKind {
    Append,
    Auth,
    Blpop,
    Brpop,
    Client,
    Dbsize,
    Debug,
    Decr,
    Decrby,
    Del,
    Discard,
    Echo,
    Exec,
    Exists,
    Expire,
    Flushall,
    Flushdb,
    Get,
    Incr,
    Incrby,
    Info,
    Keys,
    Llen,
    Lpop,
    Lpush,
    Lrange,
    Mget,
    Mset,
    Multi,
    Ping,
    Pttl,
    Rpop,
    Rpush,
    Set,
    Strlen,
    Ttl,
    Type,
}

impl CommandKind {
    /// The command name of a request frame, without parsing its arguments.
    pub fn peek(frame: &Frame) -> Option<CommandKind> {
        let Frame::Array(parts) = frame else {
            return None;
        };

        let name = match parts.first()? {
            Frame::Simple(s) => s.as_bytes(),
            Frame::Bulk(bytes) => &bytes[..],
            _ => return None,
        };

        CommandKind::from_str(str::from_utf8(name).ok()?).ok()
    }

    /// Folds aliases onto one kind, so restricting either name restricts both.
    pub fn canonical(self) -> CommandKind {
        match self {
            CommandKind::Flushall => CommandKind::Flushdb,
            kind => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Append(Append),
    BlockingPop(BlockingPop),
    DbSize(DbSize),
    Debug(DebugCommand),
    Del(Del),
    Exists(Exists),
    Expire(Expire),
    FlushDb(FlushDb),
    Get(Get),
    Incr(Incr),
    Keys(Keys),
    Llen(Llen),
    Lrange(Lrange),
    Mget(Mget),
    Mset(Mset),
    Pop(Pop),
    Push(Push),
    Set(Set),
    Strlen(Strlen),
    Ttl(Ttl),
    Type(Type),

    Auth(Auth),
    Client(Client),
    Discard(Discard),
    Echo(Echo),
    Exec(Exec),
    Info(Info),
    Multi(Multi),
    Ping(Ping),
}

impl Command {
    /// Keys the command touches, which decides the shards it runs on.
    pub fn scope(&self) -> Scope {
        match self {
            Command::Append(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::BlockingPop(cmd) => Scope::Keys(cmd.keys.clone()),
            Command::Del(cmd) => Scope::Keys(cmd.keys.clone()),
            Command::Exists(cmd) => Scope::Keys(cmd.keys.clone()),
            Command::Expire(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Get(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Incr(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Llen(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Lrange(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Mget(cmd) => Scope::Keys(cmd.keys.clone()),
            Command::Mset(cmd) => {
                Scope::Keys(cmd.pairs.iter().map(|(key, _)| key.clone()).collect())
            }
            Command::Pop(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Push(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Set(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Strlen(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Ttl(cmd) => Scope::Keys(vec![cmd.key.clone()]),
            Command::Type(cmd) => Scope::Keys(vec![cmd.key.clone()]),

            Command::DbSize(_) | Command::Debug(_) | Command::FlushDb(_) | Command::Keys(_) => {
                Scope::All
            }

            Command::Auth(_)
            | Command::Client(_)
            | Command::Discard(_)
            | Command::Echo(_)
            | Command::Exec(_)
            | Command::Info(_)
            | Command::Multi(_)
            | Command::Ping(_) => Scope::None,
        }
    }

    /// Whether the command may allocate, and so has to pass the write gate first.
    pub fn grows_memory(&self) -> bool {
        matches!(
            self,
            Command::Append(_)
                | Command::Debug(_)
                | Command::Incr(_)
                | Command::Mset(_)
                | Command::Push(_)
                | Command::Set(_)
        )
    }

    /// Runs the write gate when needed, then the command.
    pub fn apply(&self, ctx: &mut HopContext<'_>) -> Frame {
        if self.grows_memory() {
            if let Err(err) = ctx.admit_write() {
                return err.to_frame();
            }
        }
        self.exec(ctx)
    }

    /// Reply of a keyless command, computed without any shard.
    pub fn exec_local(&self) -> Frame {
        match self {
            Command::Ping(cmd) => cmd.reply(),
            Command::Echo(cmd) => Frame::Bulk(cmd.message.clone()),
            Command::Client(cmd) => cmd.reply(),
            Command::Info(_) => Frame::Error("ERR INFO is not allowed in this context".to_string()),
            _ => Frame::Error("ERR command not allowed in this context".to_string()),
        }
    }

    /// Combines the replies of the shards a multi-shard command ran on.
    pub fn merge(&self, parts: Vec<Frame>, keys_output_limit: usize) -> Frame {
        match self {
            Command::Mget(_) => overlay(parts),
            Command::Del(_) | Command::Exists(_) | Command::DbSize(_) => sum(parts),
            Command::Keys(_) => concat_keys(parts, keys_output_limit),
            Command::Mset(_) | Command::FlushDb(_) | Command::Debug(_) => all_ok(parts),
            _ => parts.into_iter().next().unwrap_or(Frame::NullBulk),
        }
    }
}

impl Executable for Command {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match self {
            Command::Append(cmd) => cmd.exec(ctx),
            Command::BlockingPop(cmd) => cmd.exec(ctx),
            Command::DbSize(cmd) => cmd.exec(ctx),
            Command::Debug(cmd) => cmd.exec(ctx),
            Command::Del(cmd) => cmd.exec(ctx),
            Command::Exists(cmd) => cmd.exec(ctx),
            Command::Expire(cmd) => cmd.exec(ctx),
            Command::FlushDb(cmd) => cmd.exec(ctx),
            Command::Get(cmd) => cmd.exec(ctx),
            Command::Incr(cmd) => cmd.exec(ctx),
            Command::Keys(cmd) => cmd.exec(ctx),
            Command::Llen(cmd) => cmd.exec(ctx),
            Command::Lrange(cmd) => cmd.exec(ctx),
            Command::Mget(cmd) => cmd.exec(ctx),
            Command::Mset(cmd) => cmd.exec(ctx),
            Command::Pop(cmd) => cmd.exec(ctx),
            Command::Push(cmd) => cmd.exec(ctx),
            Command::Set(cmd) => cmd.exec(ctx),
            Command::Strlen(cmd) => cmd.exec(ctx),
            Command::Ttl(cmd) => cmd.exec(ctx),
            Command::Type(cmd) => cmd.exec(ctx),
            command => command.exec_local(),
        }
    }
}

impl TryFrom<Frame> for Command {
    type Error = Error;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the Redis server as RESP arrays.
        let frames = match frame {
            Frame::Array(array) => array,
            frame => {
                return Err(CommandParserError::InvalidFrame {
                    expected: "array".to_string(),
                    actual: frame,
                }
                .into())
            }
        };

        let parser = &mut CommandParser {
            parts: frames.into_iter(),
        };

        let command_name = parser.parse_command_name()?;
        let kind = CommandKind::from_str(&command_name).map_err(|_| {
            CommandParserError::UnknownCommand {
                command: command_name.clone(),
            }
        })?;

        match kind {
            CommandKind::Append => Append::try_from(parser).map(Command::Append),
            CommandKind::Auth => Auth::try_from(parser).map(Command::Auth),
            CommandKind::Blpop => BlockingPop::parse(parser, Side::Left).map(Command::BlockingPop),
            CommandKind::Brpop => BlockingPop::parse(parser, Side::Right).map(Command::BlockingPop),
            CommandKind::Client => Client::try_from(parser).map(Command::Client),
            CommandKind::Dbsize => DbSize::try_from(parser).map(Command::DbSize),
            CommandKind::Debug => DebugCommand::try_from(parser).map(Command::Debug),
            CommandKind::Decr => Incr::parse(parser, Variant::Decr).map(Command::Incr),
            CommandKind::Decrby => Incr::parse(parser, Variant::DecrBy).map(Command::Incr),
            CommandKind::Del => Del::try_from(parser).map(Command::Del),
            CommandKind::Discard => Discard::try_from(parser).map(Command::Discard),
            CommandKind::Echo => Echo::try_from(parser).map(Command::Echo),
            CommandKind::Exec => Exec::try_from(parser).map(Command::Exec),
            CommandKind::Exists => Exists::try_from(parser).map(Command::Exists),
            CommandKind::Expire => Expire::try_from(parser).map(Command::Expire),
            CommandKind::Flushall | CommandKind::Flushdb => {
                FlushDb::try_from(parser).map(Command::FlushDb)
            }
            CommandKind::Get => Get::try_from(parser).map(Command::Get),
            CommandKind::Incr => Incr::parse(parser, Variant::Incr).map(Command::Incr),
            CommandKind::Incrby => Incr::parse(parser, Variant::IncrBy).map(Command::Incr),
            CommandKind::Info => Info::try_from(parser).map(Command::Info),
            CommandKind::Keys => Keys::try_from(parser).map(Command::Keys),
            CommandKind::Llen => Llen::try_from(parser).map(Command::Llen),
            CommandKind::Lpop => Pop::parse(parser, Side::Left).map(Command::Pop),
            CommandKind::Lpush => Push::parse(parser, Side::Left).map(Command::Push),
            CommandKind::Lrange => Lrange::try_from(parser).map(Command::Lrange),
            CommandKind::Mget => Mget::try_from(parser).map(Command::Mget),
            CommandKind::Mset => Mset::try_from(parser).map(Command::Mset),
            CommandKind::Multi => Multi::try_from(parser).map(Command::Multi),
            CommandKind::Ping => Ping::try_from(parser).map(Command::Ping),
            CommandKind::Pttl => Ttl::parse(parser, TtlUnit::Milliseconds).map(Command::Ttl),
            CommandKind::Rpop => Pop::parse(parser, Side::Right).map(Command::Pop),
            CommandKind::Rpush => Push::parse(parser, Side::Right).map(Command::Push),
            CommandKind::Set => Set::try_from(parser).map(Command::Set),
            CommandKind::Strlen => Strlen::try_from(parser).map(Command::Strlen),
            CommandKind::Ttl => Ttl::parse(parser, TtlUnit::Seconds).map(Command::Ttl),
            CommandKind::Type => Type::try_from(parser).map(Command::Type),
        }
    }
}

/// MGET: every shard answers for all keys, with nil for the keys it does not own.
fn overlay(parts: Vec<Frame>) -> Frame {
    let mut merged: Option<Vec<Frame>> = None;

    for part in parts {
        match part {
            Frame::Array(values) => match merged.as_mut() {
                None => merged = Some(values),
                Some(merged) => {
                    for (slot, value) in merged.iter_mut().zip(values) {
                        if *slot == Frame::NullBulk {
                            *slot = value;
                        }
                    }
                }
            },
            err => return err,
        }
    }

    Frame::Array(merged.unwrap_or_default())
}

fn sum(parts: Vec<Frame>) -> Frame {
    let mut total = 0;
    for part in parts {
        match part {
            Frame::Integer(n) => total += n,
            err => return err,
        }
    }
    Frame::Integer(total)
}

fn all_ok(parts: Vec<Frame>) -> Frame {
    parts
        .into_iter()
        .find(|part| matches!(part, Frame::Error(_)))
        .unwrap_or_else(Frame::ok)
}

/// Appends whole batches of shard results until `limit` keys are collected, so the reply holds
/// between `limit` and `limit + KEYS_BATCH - 1` keys when enough exist. A limit of 0 disables it.
fn concat_keys(parts: Vec<Frame>, limit: usize) -> Frame {
    let mut keys = Vec::new();

    for part in parts {
        match part {
            Frame::Array(shard_keys) => {
                for batch in shard_keys.chunks(KEYS_BATCH) {
                    if limit > 0 && keys.len() >= limit {
                        return Frame::Array(keys);
                    }
                    keys.extend_from_slice(batch);
                }
            }
            err => return err,
        }
    }

    Frame::Array(keys)
}

pub struct CommandParser {
    parts: vec::IntoIter<Frame>,
}

impl CommandParser {
    fn parse_command_name(&mut self) -> Result<String, CommandParserError> {
        let command_name = self
            .parts
            .next()
            .ok_or_else(|| CommandParserError::EndOfStream)?;

        match command_name {
            Frame::Simple(s) => Ok(s.to_lowercase()),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_lowercase())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple string".to_string(),
                actual: frame,
            }),
        }
    }

    pub fn remaining(&self) -> usize {
        self.parts.len()
    }

    pub fn next_string(&mut self) -> Result<String, CommandParserError> {
        let frame = self
            .parts
            .next()
            .ok_or_else(|| CommandParserError::EndOfStream)?;

        match frame {
            // Both `Simple` and `Bulk` representation may be strings. Strings are parsed to UTF-8.
            // While errors are stored as strings, they are considered separate types.
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_string())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    pub fn next_integer(&mut self) -> Result<i64, CommandParserError> {
        let frame = self
            .parts
            .next()
            .ok_or_else(|| CommandParserError::EndOfStream)?;

        match frame {
            Frame::Integer(i) => Ok(i),
            Frame::Simple(string) => {
                string
                    .parse::<i64>()
                    .map_err(|_| CommandParserError::InvalidFrame {
                        expected: "parseable i64 frame".to_string(),
                        actual: Frame::Simple(string),
                    })
            }
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map_err(CommandParserError::InvalidUTF8String)?
                .parse::<i64>()
                .map_err(|_| CommandParserError::InvalidFrame {
                    expected: "parseable i64 frame".to_string(),
                    actual: Frame::Bulk(bytes),
                }),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "integer".to_string(),
                actual: frame,
            }),
        }
    }

    pub fn next_f64(&mut self) -> Result<f64, CommandParserError> {
        let frame = self
            .parts
            .next()
            .ok_or_else(|| CommandParserError::EndOfStream)?;

        let parsed = match &frame {
            Frame::Integer(i) => Some(*i as f64),
            Frame::Simple(s) => s.parse::<f64>().ok(),
            Frame::Bulk(bytes) => str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse::<f64>().ok()),
            _ => None,
        };

        parsed
            .filter(|value| value.is_finite())
            .ok_or(CommandParserError::InvalidFrame {
                expected: "parseable f64 frame".to_string(),
                actual: frame,
            })
    }

    pub fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        let frame = self
            .parts
            .next()
            .ok_or_else(|| CommandParserError::EndOfStream)?;

        match frame {
            // Both `Simple` and `Bulk` representation may be strings. Strings are parsed to UTF-8.
            // While errors are stored as strings, they are considered separate types.
            Frame::Simple(s) => Ok(Bytes::from(s)),
            Frame::Bulk(bytes) => Ok(bytes),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    pub fn next_key(&mut self) -> Result<Key, CommandParserError> {
        self.next_bytes()
    }

    /// Every remaining argument, at least one.
    pub fn rest(&mut self) -> Result<Vec<Bytes>, CommandParserError> {
        let mut values = Vec::with_capacity(self.remaining());

        loop {
            match self.next_bytes() {
                Ok(value) => values.push(value),
                Err(CommandParserError::EndOfStream) if !values.is_empty() => break,
                Err(err) => return Err(err),
            }
        }

        Ok(values)
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("protocol error; invalid frame, expected {expected}, got {actual}")]
    InvalidFrame { expected: String, actual: Frame },
    #[error("unknown command '{command}'")]
    UnknownCommand { command: String },
    #[error("invalid argument '{argument}' for '{command}'")]
    InvalidCommandArgument { command: String, argument: String },
    #[error("protocol error; invalid UTF-8 string")]
    InvalidUTF8String(#[from] str::Utf8Error),
    #[error("wrong number of arguments")]
    EndOfStream,
    #[error("invalid expire time in '{command}' command")]
    InvalidExpireTime { command: String },
    #[error("timeout is out of range")]
    TimeoutOutOfRange,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(parts: &[&str]) -> Frame {
        Frame::Array(
            parts
                .iter()
                .map(|part| Frame::Bulk(Bytes::from(part.to_string())))
                .collect(),
        )
    }

    #[test]
    fn parse_get_command_with_simple_string() {
        let get_frame = Frame::Array(vec![
            Frame::Simple(String::from("GET")),
            Frame::Simple(String::from("foo")),
        ]);

        let get_command = Command::try_from(get_frame).unwrap();

        assert_eq!(
            get_command,
            Command::Get(Get {
                key: Bytes::from("foo")
            })
        );
    }

    #[test]
    fn parse_command_name_is_case_insensitive() {
        let cmd = Command::try_from(bulk(&["gEt", "foo"])).unwrap();
        assert_eq!(cmd, Command::Get(Get { key: Bytes::from("foo") }));
    }

    #[test]
    fn unknown_command() {
        let err = Command::try_from(bulk(&["FOO", "bar"])).err().unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert_eq!(
            *err,
            CommandParserError::UnknownCommand {
                command: "foo".to_string()
            }
        );
    }

    #[test]
    fn command_must_be_an_array() {
        let err = Command::try_from(Frame::Simple("PING".to_string()))
            .err()
            .unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert!(matches!(err, CommandParserError::InvalidFrame { .. }));
    }

    #[test]
    fn peek_command_kind() {
        assert_eq!(CommandKind::peek(&bulk(&["FlushAll"])), Some(CommandKind::Flushall));
        assert_eq!(CommandKind::peek(&bulk(&["nope"])), None);
        assert_eq!(CommandKind::peek(&Frame::Integer(1)), None);
        assert_eq!(CommandKind::Flushdb.to_string(), "flushdb");
    }

    #[test]
    fn scopes() {
        let mset = Command::try_from(bulk(&["MSET", "a", "1", "b", "2"])).unwrap();
        assert_eq!(
            mset.scope(),
            Scope::Keys(vec![Bytes::from("a"), Bytes::from("b")])
        );
        assert!(mset.grows_memory());

        let keys = Command::try_from(bulk(&["KEYS", "*"])).unwrap();
        assert_eq!(keys.scope(), Scope::All);
        assert!(!keys.grows_memory());

        let ping = Command::try_from(bulk(&["PING"])).unwrap();
        assert_eq!(ping.scope(), Scope::None);
    }

    #[test]
    fn merge_mget_overlays_shard_replies() {
        let cmd = Command::try_from(bulk(&["MGET", "a", "b", "c"])).unwrap();
        let parts = vec![
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("1")),
                Frame::NullBulk,
                Frame::NullBulk,
            ]),
            Frame::Array(vec![
                Frame::NullBulk,
                Frame::NullBulk,
                Frame::Bulk(Bytes::from("3")),
            ]),
        ];

        assert_eq!(
            cmd.merge(parts, 0),
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("1")),
                Frame::NullBulk,
                Frame::Bulk(Bytes::from("3")),
            ])
        );
    }

    #[test]
    fn merge_counts_and_errors() {
        let del = Command::try_from(bulk(&["DEL", "a", "b"])).unwrap();
        assert_eq!(
            del.merge(vec![Frame::Integer(1), Frame::Integer(2)], 0),
            Frame::Integer(3)
        );

        let mset = Command::try_from(bulk(&["MSET", "a", "1"])).unwrap();
        let oom = Frame::Error("OOM".to_string());
        assert_eq!(mset.merge(vec![Frame::ok(), oom.clone()], 0), oom);
        assert_eq!(mset.merge(vec![Frame::ok(), Frame::ok()], 0), Frame::ok());
    }

    #[test]
    fn merge_keys_stops_after_the_limit() {
        let cmd = Command::try_from(bulk(&["KEYS", "*"])).unwrap();
        let shard = |n: usize| {
            Frame::Array(
                (0..n)
                    .map(|i| Frame::Bulk(Bytes::from(i.to_string())))
                    .collect(),
            )
        };

        let Frame::Array(keys) = cmd.merge(vec![shard(1000), shard(1000), shard(1000)], 1500)
        else {
            panic!("expected an array");
        };
        assert!(keys.len() >= 1500 && keys.len() < 1500 + KEYS_BATCH);

        let Frame::Array(keys) = cmd.merge(vec![shard(1000), shard(1000)], 0) else {
            panic!("expected an array");
        };
        assert_eq!(keys.len(), 2000);
    }
}
