use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Returns the number of `keys` that exist. A key mentioned multiple times is counted
/// multiple times.
///
/// Ref: <https://redis.io/docs/latest/commands/exists/>
#[derive(Debug, Clone, PartialEq)]
pub struct Exists {
    pub keys: Vec<Key>,
}

impl Executable for Exists {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let count = self
            .keys
            .iter()
            .filter(|key| ctx.db.owns(key) && ctx.db.exists(key))
            .count();

        Frame::Integer(count as i64)
    }
}

impl TryFrom<&mut CommandParser> for Exists {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let keys = parser.rest()?;
        Ok(Self { keys })
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
    fn counts_repeated_keys() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("EXISTS")),
            Frame::Bulk(Bytes::from("a")),
            Frame::Bulk(Bytes::from("a")),
            Frame::Bulk(Bytes::from("missing")),
        ]);
        let cmd = Command::try_from(frame).unwrap();

        let mut shard = TestShard::new();
        shard
            .db
            .set(Bytes::from("a"), Value::String(Bytes::from("1")), None);

        assert_eq!(shard.exec(&cmd), Frame::Integer(2));
    }
}
