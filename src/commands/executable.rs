use crate::frame::Frame;
use crate::shard::HopContext;

/// A command that runs inside a hop, against the keys its shard owns.
pub trait Executable {
    fn exec(&self, ctx: &mut HopContext<'_>) -> Frame;
}
