use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Return the number of keys in the currently-selected database.
///
/// Ref: <https://redis.io/docs/latest/commands/dbsize/>
#[derive(Debug, Clone, PartialEq)]
pub struct DbSize;

impl Executable for DbSize {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        Frame::Integer(ctx.db.keys().count() as i64)
    }
}

impl TryFrom<&mut CommandParser> for DbSize {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}
