use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Get the value of `key`. If the key does not exist the special value `nil` is returned.
///
/// Ref: <https://redis.io/docs/latest/commands/get/>
#[derive(Debug, Clone, PartialEq)]
pub struct Get {
    pub key: Key,
}

impl Executable for Get {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match ctx.db.get_string(&self.key) {
            Ok(Some(value)) => Frame::Bulk(value),
            Ok(None) => Frame::NullBulk,
            Err(err) => Frame::Error(err.to_string()),
        }
    }
}

impl TryFrom<&mut CommandParser> for Get {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        Ok(Self { key })
    }
}
