use bytes::Bytes;

use crate::commands::CommandParser;
use crate::Error;

// https://redis.io/commands/echo
#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    pub message: Bytes,
}

impl TryFrom<&mut CommandParser> for Echo {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let message = parser.next_bytes()?;
        Ok(Self { message })
    }
}
