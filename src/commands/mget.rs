use crate::commands::executable::Executable;
use crate::commands::CommandParser;
use crate::db::Key;
use crate::frame::Frame;
use crate::shard::HopContext;
use crate::Error;

/// Returns the values of all specified keys. For every key that does not hold a string value
/// or does not exist, the special value nil is returned.
///
/// Ref: <https://redis.io/docs/latest/commands/mget/>
#[derive(Debug, Clone, PartialEq)]
pub struct Mget {
    pub keys: Vec<Key>,
}

impl Executable for Mget {
    /// Keys owned by other shards are nil here and filled in when the replies are merged.
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame {
        let values = self
            .keys
            .iter()
            .map(|key| {
                if !ctx.db.owns(key) {
                    return Frame::NullBulk;
                }
                match ctx.db.get_string(key) {
                    Ok(Some(value)) => Frame::Bulk(value),
                    _ => Frame::NullBulk,
                }
            })
            .collect();

        Frame::Array(values)
    }
}

impl TryFrom<&mut CommandParser> for Mget {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let keys = parser.rest()?;
        Ok(Self { keys })
    }
}
