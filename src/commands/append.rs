use bytes::Bytes;

use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// If `key` already exists and is a string, this command appends the value at the end of the
/// string. If `key` does not exist it is created and set as an empty string, so APPEND will be
/// similar to SET in this special case.
///
/// Ref: <https://redis.io/docs/latest/commands/append/>
#[derive(Debug, Clone, PartialEq)]
pub struct Append {
    pub key: Key,
    pub value: Bytes,
}

impl Executable for Append {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match ctx.db.append(&self.key, &self.value) {
            Ok(len) => Frame::Integer(len as i64),
            Err(err) => Frame::Error(err.to_string()),
        }
    }
}

impl TryFrom<&mut CommandParser> for Append {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        let value = parser.next_bytes()?;

        Ok(Self { key, value })
    }
}
