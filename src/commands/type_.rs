use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Returns the string representation of the type of the value stored at `key`, or `none`.
///
/// Ref: <https://redis.io/docs/latest/commands/type/>
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    pub key: Key,
}

impl Executable for Type {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let name = ctx.db.value_type(&self.key).unwrap_or("none");
        Frame::Simple(name.to_string())
    }
}

impl TryFrom<&mut CommandParser> for Type {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        Ok(Self { key })
    }
}
