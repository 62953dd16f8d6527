use glob_match::glob_match;
use std::str;

use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Shard results are merged in batches of this many keys.
pub const KEYS_BATCH: usize = 512;

/// Returns all keys matching `pattern`. The reply is capped by `keys_output_limit`, so it may
/// list fewer keys than exist.
///
/// Ref: <https://redis.io/docs/latest/commands/keys/>
#[derive(Debug, Clone, PartialEq)]
pub struct Keys {
    pub pattern: String,
}

impl Keys {
    fn matches(&self, key: &[u8]) -> bool {
        if self.pattern == "*" {
            return true;
        }

        match str::from_utf8(key) {
            Ok(key) => glob_match(&self.pattern, key),
            Err(_) => false,
        }
    }
}

impl Executable for Keys {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let limit = ctx.keys_output_limit();
        let mut res = vec![];

        for key in ctx.db.keys() {
            if limit > 0 && res.len() >= limit {
                break;
            }
            if self.matches(key) {
                res.push(Frame::Bulk(key.clone()));
            }
        }

        Frame::Array(res)
    }
}

impl TryFrom<&mut CommandParser> for Keys {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let pattern = parser.next_string()?;
        Ok(Self { pattern })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::commands::debug::{DebugCommand, Populate};
    use crate::commands::{Command, CommandParserError};
    use crate::shard::testing::TestShard;

    use super::*;

    fn sorted(frame: Frame) -> Vec<Frame> {
        let Frame::Array(mut keys) = frame else {
            panic!("expected an array");
        };
        keys.sort_by_key(|key| key.to_string());
        keys
    }

    #[test]
    fn with_wildcard_pattern() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("KEYS")),
            Frame::Bulk(Bytes::from("*")),
        ]);
        let cmd = Command::try_from(frame).unwrap();
        assert_eq!(
            cmd,
            Command::Keys(Keys {
                pattern: String::from("*")
            })
        );
    }

    #[test]
    fn matches_glob_patterns() {
        let mut shard = TestShard::new();
        shard.exec(&Command::Debug(DebugCommand::Populate(Populate {
            count: 3,
            prefix: "user".to_string(),
            size: None,
        })));
        shard.exec(&Command::Debug(DebugCommand::Populate(Populate {
            count: 1,
            prefix: "session".to_string(),
            size: None,
        })));

        let cmd = Command::Keys(Keys {
            pattern: "user:*".to_string(),
        });

        assert_eq!(
            sorted(shard.exec(&cmd)),
            vec![
                Frame::Bulk(Bytes::from("user:0")),
                Frame::Bulk(Bytes::from("user:1")),
                Frame::Bulk(Bytes::from("user:2")),
            ]
        );

        let cmd = Command::Keys(Keys {
            pattern: "*".to_string(),
        });
        assert_eq!(sorted(shard.exec(&cmd)).len(), 4);
    }

    #[test]
    fn zero_keys() {
        let frame = Frame::Array(vec![Frame::Bulk(Bytes::from("KEYS"))]);
        let err = Command::try_from(frame).err().unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert_eq!(*err, CommandParserError::EndOfStream);
    }

    #[test]
    fn invalid_frame() {
        let frame = Frame::Array(vec![Frame::Bulk(Bytes::from("KEYS")), Frame::Integer(42)]);
        let err = Command::try_from(frame).err().unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert_eq!(
            *err,
            CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: Frame::Integer(42)
            }
        );
    }
}
