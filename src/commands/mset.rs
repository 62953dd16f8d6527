use bytes::Bytes;
use itertools::Itertools;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::db::{Key, Value};
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Sets the given keys to their respective values. Across shards the write is all or nothing:
/// it only runs once every shard involved admitted it.
///
/// Ref: <https://redis.io/docs/latest/commands/mset/>
#[derive(Debug, Clone, PartialEq)]
pub struct Mset {
    pub pairs: Vec<(Key, Bytes)>,
}

impl Executable for Mset {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        for (key, value) in &self.pairs {
            if ctx.db.owns(key) {
                ctx.db
                    .set(key.clone(), Value::String(value.clone()), None);
            }
        }

        Frame::ok()
    }
}

impl TryFrom<&mut CommandParser> for Mset {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let args = parser.rest()?;
        if args.len() % 2 != 0 {
            return Err(CommandParserError::EndOfStream.into());
        }

        let pairs = args.into_iter().tuples().collect();
        Ok(Self { pairs })
    }
}
