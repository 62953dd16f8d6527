use crate::commands::{CommandParser, CommandParserError};
use crate::Error;

/// Authenticates the connection. Only the default user exists, so a username other than
/// `default` never matches.
///
/// Ref: <https://redis.io/docs/latest/commands/auth/>
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub username: Option<String>,
    pub password: String,
}

impl Auth {
    pub fn matches(&self, password: &str) -> bool {
        let user_matches = self
            .username
            .as_deref()
            .map_or(true, |username| username == "default");

        user_matches && self.password == password
    }
}

impl TryFrom<&mut CommandParser> for Auth {
    type Error = Error;

    fn try_from(parser: &mut CommandParser) -> Result<Self, Self::Error> {
        let first = parser.next_string()?;

        match parser.next_string() {
            Ok(password) => Ok(Self {
                username: Some(first),
                password,
            }),
            Err(CommandParserError::EndOfStream) => Ok(Self {
                username: None,
                password: first,
            }),
            Err(err) => Err(err.into()),
        }
    }
}
