use crate::commands::CommandParser;
use crate::frame::Frame;
use crate::Error;

/// Connection management. Only the handshake subcommands clients send on connect are
/// understood.
///
/// Ref: <https://redis.io/docs/latest/commands/client/>
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub subcommand: String,
}

impl Client {
    pub fn reply(&self) -> Frame {
        match self.subcommand.as_str() {
            "SETNAME" | "SETINFO" => Frame::ok(),
            "GETNAME" => Frame::NullBulk,
            subcommand => Frame::Error(format!(
                "ERR unknown subcommand '{}'",
                subcommand.to_lowercase()
            )),
        }
    }
}

impl TryFrom<&mut CommandParser> for Client {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let subcommand = parser.next_string()?.to_uppercase();
        // Subcommand arguments are accepted and ignored.
        while parser.next_bytes().is_ok() {}

        Ok(Self { subcommand })
    }
}
