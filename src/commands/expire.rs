use tokio::time::Duration;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Set a timeout on `key` in seconds. A non-positive timeout deletes the key.
///
/// Ref: <https://redis.io/docs/latest/commands/expire/>
#[derive(Debug, Clone, PartialEq)]
pub struct Expire {
    pub key: Key,
    pub seconds: i64,
}

impl Executable for Expire {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let applied = if self.seconds <= 0 {
            ctx.db.remove(&self.key).is_some()
        } else {
            ctx.db
                .expire(&self.key, Duration::from_secs(self.seconds as u64))
        };

        Frame::Integer(applied as i64)
    }
}

impl TryFrom<&mut CommandParser> for Expire {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        let seconds = parser.next_integer()?;
        if seconds > i64::MAX / 1000 {
            return Err(CommandParserError::InvalidExpireTime {
                command: "expire".to_string(),
            }
            .into());
        }

        Ok(Self { key, seconds })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::commands::Command;
    use crate::db::Value;
    use crate::shard::testing::TestShard;

    use super::*;

    #[test]
    fn sets_a_ttl() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("EXPIRE")),
            Frame::Bulk(Bytes::from("key1")),
            Frame::Bulk(Bytes::from("10")),
        ]);
        let cmd = Command::try_from(frame).unwrap();
        assert_eq!(
            cmd,
            Command::Expire(Expire {
                key: Bytes::from("key1"),
                seconds: 10,
            })
        );

        let mut shard = TestShard::new();
        assert_eq!(shard.exec(&cmd), Frame::Integer(0));

        shard
            .db
            .set(Bytes::from("key1"), Value::String(Bytes::from("1")), None);
        assert_eq!(shard.exec(&cmd), Frame::Integer(1));
        assert!(matches!(shard.db.ttl(b"key1"), Some(Some(_))));
    }

    #[test]
    fn non_positive_timeout_deletes() {
        let mut shard = TestShard::new();
        shard
            .db
            .set(Bytes::from("key1"), Value::String(Bytes::from("1")), None);

        let cmd = Command::Expire(Expire {
            key: Bytes::from("key1"),
            seconds: 0,
        });

        assert_eq!(shard.exec(&cmd), Frame::Integer(1));
        assert!(!shard.db.exists(b"key1"));
    }

    #[test]
    fn expire_out_of_range() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("EXPIRE")),
            Frame::Bulk(Bytes::from("key1")),
            Frame::Bulk(Bytes::from(i64::MAX.to_string())),
        ]);
        let err = Command::try_from(frame).err().unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert_eq!(
            *err,
            CommandParserError::InvalidExpireTime {
                command: "expire".to_string()
            }
        );
    }

    #[test]
    fn largest_accepted_timeout_keeps_the_key() {
        let mut shard = TestShard::new();
        shard
            .db
            .set(Bytes::from("key1"), Value::String(Bytes::from("1")), None);

        let cmd = Command::Expire(Expire {
            key: Bytes::from("key1"),
            seconds: i64::MAX / 1000,
        });

        assert_eq!(shard.exec(&cmd), Frame::Integer(1));
        assert_eq!(
            shard.run(Frame::Array(vec![
                Frame::Bulk(Bytes::from("GET")),
                Frame::Bulk(Bytes::from("key1")),
            ])),
            Frame::Bulk(Bytes::from("1"))
        );
    }
}
