use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Returns the elements of the list stored at `key` between `start` and `stop`, both
/// inclusive. Negative offsets count from the end of the list.
///
/// Ref: <https://redis.io/docs/latest/commands/lrange/>
#[derive(Debug, Clone, PartialEq)]
pub struct Lrange {
    pub key: Key,
    pub start: i64,
    pub stop: i64,
}

impl Executable for Lrange {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match ctx.db.range(&self.key, self.start, self.stop) {
            Ok(values) => Frame::Array(values.into_iter().map(Frame::Bulk).collect()),
            Err(err) => Frame::Error(err.to_string()),
        }
    }
}

impl TryFrom<&mut CommandParser> for Lrange {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        let start = parser.next_integer()?;
        let stop = parser.next_integer()?;

        Ok(Self { key, start, stop })
    }
}
