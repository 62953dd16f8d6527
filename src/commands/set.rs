use bytes::Bytes;
use tokio::time::Duration;

use crate::commands::executable::Executable;
use crate::commands::{CommandParser, CommandParserError};
use crate::db::{Key, Value};
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    /// Only set the key if it does not already exist.
    Nx,
    /// Only set the key if it already exists.
    Xx,
}

/// Set `key` to hold the string `value`, discarding any previous value and TTL.
///
/// Ref: <https://redis.io/docs/latest/commands/set/>
#[derive(Debug, Clone, PartialEq)]
pub struct Set {
    pub key: Key,
    pub value: Bytes,
    pub expire: Option<Duration>,
    pub condition: Option<SetCondition>,
}

impl Executable for Set {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        if let Some(condition) = self.condition {
            let exists = ctx.db.exists(&self.key);
            let skip = match condition {
                SetCondition::Nx => exists,
                SetCondition::Xx => !exists,
            };
            if skip {
                return Frame::NullBulk;
            }
        }

        ctx.db.set(
            self.key.clone(),
            Value::String(self.value.clone()),
            self.expire,
        );

        Frame::ok()
    }
}

impl TryFrom<&mut CommandParser> for Set {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let key = parser.next_key()?;
        let value = parser.next_bytes()?;

        let mut expire = None;
        let mut condition = None;

        loop {
            let option = match parser.next_string() {
                Ok(option) => option,
                Err(CommandParserError::EndOfStream) => break,
                Err(err) => return Err(err.into()),
            };

            match option.to_uppercase().as_str() {
                "EX" | "PX" if expire.is_none() => {
                    let amount = parser.next_integer()?;
                    if amount <= 0 {
                        return Err(invalid_argument(amount.to_string()).into());
                    }
                    let millis = if option.eq_ignore_ascii_case("EX") {
                        amount.checked_mul(1000)
                    } else {
                        Some(amount)
                    };
                    let millis = millis.ok_or_else(|| CommandParserError::InvalidExpireTime {
                        command: "set".to_string(),
                    })?;
                    expire = Some(Duration::from_millis(millis as u64));
                }
                "NX" if condition.is_none() => condition = Some(SetCondition::Nx),
                "XX" if condition.is_none() => condition = Some(SetCondition::Xx),
                _ => return Err(invalid_argument(option).into()),
            }
        }

        Ok(Self {
            key,
            value,
            expire,
            condition,
        })
    }
}

fn invalid_argument(argument: String) -> CommandParserError {
    CommandParserError::InvalidCommandArgument {
        command: "set".to_string(),
        argument,
    }
}

#[cfg(test)]
mod tests {
    use crate::commands::Command;
    use crate::shard::testing::TestShard;

    use super::*;

    fn bulk(parts: &[&str]) -> Frame {
        Frame::Array(
            parts
                .iter()
                .map(|part| Frame::Bulk(Bytes::from(part.to_string())))
                .collect(),
        )
    }

    #[test]
    fn plain_set() {
        let cmd = Command::try_from(bulk(&["SET", "key1", "1"])).unwrap();
        assert_eq!(
            cmd,
            Command::Set(Set {
                key: Bytes::from("key1"),
                value: Bytes::from("1"),
                expire: None,
                condition: None,
            })
        );

        let mut shard = TestShard::new();
        assert_eq!(shard.exec(&cmd), Frame::ok());
        assert_eq!(shard.db.get_string(b"key1"), Ok(Some(Bytes::from("1"))));
    }

    #[test]
    fn with_options() {
        let cmd = Command::try_from(bulk(&["SET", "key1", "1", "px", "1500", "NX"])).unwrap();
        assert_eq!(
            cmd,
            Command::Set(Set {
                key: Bytes::from("key1"),
                value: Bytes::from("1"),
                expire: Some(Duration::from_millis(1500)),
                condition: Some(SetCondition::Nx),
            })
        );
    }

    #[test]
    fn conditions() {
        let mut shard = TestShard::new();

        assert_eq!(shard.run(bulk(&["SET", "k", "1", "XX"])), Frame::NullBulk);
        assert_eq!(shard.run(bulk(&["SET", "k", "1", "NX"])), Frame::ok());
        assert_eq!(shard.run(bulk(&["SET", "k", "2", "NX"])), Frame::NullBulk);
        assert_eq!(shard.run(bulk(&["SET", "k", "3", "XX"])), Frame::ok());
        assert_eq!(shard.db.get_string(b"k"), Ok(Some(Bytes::from("3"))));
    }

    #[test]
    fn invalid_options() {
        for parts in [
            &["SET", "k", "v", "EX", "0"][..],
            &["SET", "k", "v", "NX", "XX"][..],
            &["SET", "k", "v", "KEEPALL"][..],
        ] {
            let err = Command::try_from(bulk(parts)).err().unwrap();
            let err = err.downcast_ref::<CommandParserError>().unwrap();
            assert!(matches!(
                err,
                CommandParserError::InvalidCommandArgument { .. }
            ));
        }
    }

    #[test]
    fn missing_value() {
        let err = Command::try_from(bulk(&["SET", "k"])).err().unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert_eq!(*err, CommandParserError::EndOfStream);
    }

    #[test]
    fn expire_out_of_range() {
        let max = i64::MAX.to_string();
        let err = Command::try_from(bulk(&["SET", "k", "v", "EX", max.as_str()]))
            .err()
            .unwrap();
        let err = err.downcast_ref::<CommandParserError>().unwrap();

        assert_eq!(
            *err,
            CommandParserError::InvalidExpireTime {
                command: "set".to_string()
            }
        );
        assert_eq!(err.to_string(), "invalid expire time in 'set' command");

        // The largest accepted value still leaves the key readable.
        let mut shard = TestShard::new();
        let reply = shard.run(bulk(&["SET", "k", "v", "PX", max.as_str()]));
        assert_eq!(reply, Frame::ok());
        assert_eq!(shard.run(bulk(&["GET", "k"])), Frame::Bulk(Bytes::from("v")));
    }
}
