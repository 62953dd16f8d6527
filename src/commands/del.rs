use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

// https://redis.io/commands/del
#[derive(Debug, Clone, PartialEq)]
pub struct Del {
    pub keys: Vec<Key>,
}

impl Executable for Del {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let mut count = 0;
        for key in &self.keys {
            if ctx.db.owns(key) && ctx.db.remove(key).is_some() {
                count += 1;
            }
        }
        Frame::Integer(count)
    }
}

impl TryFrom<&mut CommandParser> for Del {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let keys = parser.rest()?;
        Ok(Self { keys })
    }
}
