use crate::commands::CommandParser;
use crate::Error;

/// Marks the start of a transaction block. Commands are queued by the connection until EXEC.
///
/// Ref: <https://redis.io/docs/latest/commands/multi/>
#[derive(Debug, Clone, PartialEq)]
pub struct Multi;

/// Runs every queued command as one transaction, atomically across shards.
///
/// Ref: <https://redis.io/docs/latest/commands/exec/>
#[derive(Debug, Clone, PartialEq)]
pub struct Exec;

// https://redis.io/commands/discard
#[derive(Debug, Clone, PartialEq)]
pub struct Discard;

impl TryFrom<&mut CommandParser> for Multi {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}

impl TryFrom<&mut CommandParser> for Exec {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}

impl TryFrom<&mut CommandParser> for Discard {
    type Error = Error;

    fn try_from(_parser: &mut CommandParser) -> Result<Self, Self::Error> {
        Ok(Self)
    }
}
