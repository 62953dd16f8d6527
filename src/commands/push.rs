use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::{Key, Side};
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// LPUSH and RPUSH. Inserts all the values at the head or tail of the list stored at `key`,
/// waking clients blocked on it.
///
/// Ref: <https://redis.io/docs/latest/commands/lpush/>
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub key: Key,
    pub side: Side,
    pub values: Vec<Bytes>,
}

impl Push {
    pub fn parse(parser: &mut CommandParser, side: Side) -> Result<Self, Error> {
        let key = parser.next_key()?;
        let values = parser.rest()?;

        Ok(Self { key, side, values })
    }
}

impl Executable for Push {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match ctx.db.push(&self.key, self.side, self.values.clone()) {
            Ok(len) => Frame::Integer(len as i64),
            Err(err) => Frame::Error(err.to_string()),
        }
    }
}
