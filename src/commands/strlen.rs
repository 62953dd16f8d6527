use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Returns the length of the string value stored at `key`, 0 when the key does not exist.
///
/// Ref: <https://redis.io/docs/latest/commands/strlen/>
#[derive(Debug, Clone, PartialEq)]
pub struct Strlen {
    pub key: Key,
}

impl Executable for Strlen {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match ctx.db.strlen(&self.key) {
            Ok(len) => Frame::Integer(len as i64),
            Err(err) => Frame::Error(err.to_string()),
        }
    }
}

impl TryFrom<&mut CommandParser> for Strlen {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        Ok(Self { key })
    }
}
