use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Incr,
    IncrBy,
    Decr,
    DecrBy,
}

/// INCR, INCRBY, DECR and DECRBY. Adds `delta` to the number stored at `key`, a missing key
/// counts as 0.
///
/// Ref: <https://redis.io/docs/latest/commands/incrby/>
#[derive(Debug, Clone, PartialEq)]
pub struct Incr {
    pub key: Key,
    pub delta: i64,
}

impl Incr {
    pub fn parse(parser: &mut CommandParser, variant: Variant) -> Result<Self, Error> {
        let key = parser.next_key()?;

        let delta = match variant {
            Variant::Incr => 1,
            Variant::Decr => -1,
            Variant::IncrBy => parser.next_integer()?,
            Variant::DecrBy => {
                let decrement = parser.next_integer()?;
                decrement
                    .checked_neg()
                    .ok_or_else(|| CommandParserError::InvalidCommandArgument {
                        command: "decrby".to_string(),
                        argument: decrement.to_string(),
                    })?
            }
        };

        Ok(Self { key, delta })
    }
}

impl Executable for Incr {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        match ctx.db.incr_by::<i64>(&self.key, self.delta) {
            Ok(value) => Frame::Integer(value),
            Err(err) => Frame::Error(err.to_string()),
        }
    }
}
