use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Seconds,
    Milliseconds,
}

/// TTL and PTTL. Returns the remaining time to live of `key`, -2 if the key does not exist and
/// -1 if it has no associated expire.
///
/// Ref: <https://redis.io/docs/latest/commands/ttl/>
#[derive(Debug, Clone, PartialEq)]
pub struct Ttl {
    pub key: Key,
    pub unit: TtlUnit,
}

impl Ttl {
    pub fn parse(parser: &mut CommandParser, unit: TtlUnit) -> Result<Self, Error> {
        let key = parser.next_key()?;
        Ok(Self { key, unit })
    }
}

impl Executable for Ttl {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let ttl = match ctx.db.ttl(&self.key) {
            None => -2,
            Some(None) => -1,
            Some(Some(remaining)) => match self.unit {
                // Rounded to the closest second.
                TtlUnit::Seconds => ((remaining.as_millis() + 500) / 1000) as i64,
                TtlUnit::Milliseconds => remaining.as_millis() as i64,
            },
        };

        Frame::Integer(ttl)
    }
}
