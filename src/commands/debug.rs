use bytes::{BufMut, Bytes, BytesMut};

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::db::{Key, Value};
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

const DEFAULT_PREFIX: &str = "key";

/// Developer commands. Only POPULATE is supported.
///
/// Ref: <https://redis.io/docs/latest/commands/debug/>
#[derive(Debug, Clone, PartialEq)]
pub enum DebugCommand {
    Populate(Populate),
}

/// `DEBUG POPULATE count [prefix] [size]` creates `count` string keys named `prefix:<i>`.
/// Existing keys are left untouched. When `size` is given every value is padded or truncated
/// to that many bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Populate {
    pub count: u64,
    pub prefix: String,
    pub size: Option<usize>,
}

impl Populate {
    fn value(&self, index: u64) -> Bytes {
        let value = format!("value:{}", index);
        let Some(size) = self.size else {
            return Bytes::from(value);
        };

        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(&value.as_bytes()[..value.len().min(size)]);
        buf.put_bytes(0, size - buf.len());
        buf.freeze()
    }
}

impl Executable for DebugCommand {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match self {
            DebugCommand::Populate(populate) => {
                for index in 0..populate.count {
                    let key = Key::from(format!("{}:{}", populate.prefix, index));
                    if !ctx.db.owns(&key) || ctx.db.exists(&key) {
                        continue;
                    }

                    // Every key goes through the write gate, so a large populate can evict in
                    // cache mode or stop with OOM otherwise.
                    if let Err(err) = ctx.admit_write() {
                        return err.to_frame();
                    }

                    ctx.db.set(key, Value::String(populate.value(index)), None);
                }

                Frame::ok()
            }
        }
    }
}

impl TryFrom<&mut CommandParser> for DebugCommand {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let subcommand = parser.next_string()?;

        match subcommand.to_uppercase().as_str() {
            "POPULATE" => {
                let count = parser.next_integer()?;
                if count < 0 {
                    return Err(invalid_argument(count.to_string()).into());
                }

                let prefix = match parser.next_string() {
                    Ok(prefix) => prefix,
                    Err(CommandParserError::EndOfStream) => DEFAULT_PREFIX.to_string(),
                    Err(err) => return Err(err.into()),
                };

                let size = match parser.next_integer() {
                    Ok(size) if size >= 0 => Some(size as usize),
                    Ok(size) => return Err(invalid_argument(size.to_string()).into()),
                    Err(CommandParserError::EndOfStream) => None,
                    Err(err) => return Err(err.into()),
                };

                Ok(DebugCommand::Populate(Populate {
                    count: count as u64,
                    prefix,
                    size,
                }))
            }
            _ => Err(invalid_argument(subcommand).into()),
        }
    }
}

fn invalid_argument(argument: String) -> CommandParserError {
    CommandParserError::InvalidCommandArgument {
        command: "debug".to_string(),
        argument,
    }
}
