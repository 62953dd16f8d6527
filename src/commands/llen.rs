use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

// https://redis.io/commands/llen
#[derive(Debug, Clone, PartialEq)]
pub struct Llen {
    pub key: Key,
}

impl Executable for Llen {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match ctx.db.list_len(&self.key) {
            Ok(len) => Frame::Integer(len as i64),
            Err(err) => Frame::Error(err.to_string()),
        }
    }
}

impl TryFrom<&mut CommandParser> for Llen {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        Ok(Self { key })
    }
}
