use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::db::{Key, Side};
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// LPOP and RPOP. Without `count` a single element is returned, with it an array of up to
/// `count` elements.
///
/// Ref: <https://redis.io/docs/latest/commands/lpop/>
#[derive(Debug, Clone, PartialEq)]
pub struct Pop {
    pub key: Key,
    pub side: Side,
    pub count: Option<usize>,
}

impl Pop {
    pub fn parse(parser: &mut CommandParser, side: Side) -> Result<Self, Error> {
        let key = parser.next_key()?;

        let count = match parser.next_integer() {
            Ok(count) if count >= 0 => Some(count as usize),
            Ok(count) => {
                return Err(CommandParserError::InvalidCommandArgument {
                    command: match side {
                        Side::Left => "lpop",
                        Side::Right => "rpop",
                    }
                    .to_string(),
                    argument: count.to_string(),
                }
                .into())
            }
            Err(CommandParserError::EndOfStream) => None,
            Err(err) => return Err(err.into()),
        };

        Ok(Self { key, side, count })
    }
}

impl Executable for Pop {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let exists = ctx.db.exists(&self.key);

        let popped = match ctx.db.pop(&self.key, self.side, self.count.unwrap_or(1)) {
            Ok(popped) => popped,
            Err(err) => return Frame::Error(err.to_string()),
        };

        match self.count {
            None => popped
                .into_iter()
                .next()
                .map_or(Frame::NullBulk, Frame::Bulk),
            Some(_) if !exists => Frame::NullArray,
            Some(_) => Frame::Array(popped.into_iter().map(Frame::Bulk).collect()),
        }
    }
}
