use crate::domain::{ChatId, UserId};

/// Platform-neutral inbound command (`/start`, `/status`, ...).
#[derive(Clone, Debug)]
pub struct Command {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub username: Option<String>,
    pub first_name: Option<String>,
    /// Lower-cased command name without the leading `/` or `@botname` suffix.
    pub name: String,
}

impl Command {
    /// Parse `/cmd@botname ...` (arguments are ignored); `None` when the text is not a command.
    pub fn parse(
        text: &str,
        chat_id: ChatId,
        user_id: UserId,
        username: Option<String>,
        first_name: Option<String>,
    ) -> Option<Self> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let first = text.split(char::is_whitespace).next().unwrap_or("");

        let name = first
            .trim_start_matches('/')
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();
        if name.is_empty() {
            return None;
        }

        Some(Self {
            chat_id,
            user_id,
            username,
            first_name,
            name,
        })
    }
}

/// Limits of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub max_message_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_with_bot_suffix() {
        let c = Command::parse(
            "/Status@fnb_bot  now please",
            ChatId(1),
            UserId(2),
            None,
            None,
        )
        .unwrap();
        assert_eq!(c.name, "status");
        assert!(Command::parse("hello", ChatId(1), UserId(2), None, None).is_none());
        assert!(Command::parse("/", ChatId(1), UserId(2), None, None).is_none());
    }
}
