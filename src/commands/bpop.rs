use bytes::Bytes;
use std::str;
use tokio::time::Duration;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::db::{Key, Side};
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// BLPOP and BRPOP. Pops from the first non-empty list among `keys`, blocking the connection
/// until one of them receives an element or `timeout` elapses. A zero timeout blocks forever.
///
/// Ref: <https://redis.io/docs/latest/commands/blpop/>
#[derive(Debug, Clone, PartialEq)]
pub struct BlockingPop {
    pub keys: Vec<Key>,
    pub side: Side,
    pub timeout: Duration,
}

impl BlockingPop {
    pub fn parse(parser: &mut CommandParser, side: Side) -> Result<Self, Error> {
        let mut args = parser.rest()?;
        if args.len() < 2 {
            return Err(CommandParserError::EndOfStream.into());
        }

        let timeout = args.pop().unwrap_or_default();
        let seconds = str::from_utf8(&timeout)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
            .ok_or_else(|| CommandParserError::InvalidCommandArgument {
                command: command_name(side).to_string(),
                argument: String::from_utf8_lossy(&timeout).into_owned(),
            })?;
        let timeout = Duration::try_from_secs_f64(seconds)
            .map_err(|_| CommandParserError::TimeoutOutOfRange)?;

        Ok(Self {
            keys: args,
            side,
            timeout,
        })
    }

    /// Pops without blocking from the first non-empty list this shard owns.
    pub fn pop_owned(&self, ctx: &mut HopContext<'_>) -> Option<Frame> {
        for key in &self.keys {
            if !ctx.db.owns(key) {
                continue;
            }

            match ctx.db.pop(key, self.side, 1) {
                Ok(popped) => {
                    if let Some(value) = popped.into_iter().next() {
                        return Some(pair(key.clone(), value));
                    }
                }
                Err(err) => return Some(Frame::Error(err.to_string())),
            }
        }

        None
    }
}

/// Inside MULTI blocking pops never block, they reply nil right away.
impl Executable for BlockingPop {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        self.pop_owned(ctx).unwrap_or(Frame::NullArray)
    }
}

pub fn pair(key: Key, value: Bytes) -> Frame {
    Frame::Array(vec![Frame::Bulk(key), Frame::Bulk(value)])
}

fn command_name(side: Side) -> &'static str {
    match side {
        Side::Left => "blpop",
        Side::Right => "brpop",
    }
}
