use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// FLUSHDB and FLUSHALL. There is a single database, so both remove every key. The optional
/// ASYNC / SYNC modifier is accepted and ignored.
///
/// Ref: <https://redis.io/docs/latest/commands/flushdb/>
#[derive(Debug, Clone, PartialEq)]
pub struct FlushDb;

impl Executable for FlushDb {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        ctx.db.flush();
        Frame::ok()
    }
}

impl TryFrom<&mut CommandParser> for FlushDb {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let _ = parser.next_string();
        Ok(Self)
    }
}
