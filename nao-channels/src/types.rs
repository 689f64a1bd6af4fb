use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::LazyLock;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ChannelId);
// Slack message timestamps double as message ids.
id_newtype!(MessageTs);

/// A Slack conversation thread: channel plus the root message timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackThread {
    pub channel: ChannelId,
    pub thread_ts: MessageTs,
}

impl SlackThread {
    pub fn new(channel: impl Into<ChannelId>, thread_ts: impl Into<MessageTs>) -> Self {
        Self {
            channel: channel.into(),
            thread_ts: thread_ts.into(),
        }
    }

    /// Stable key for the thread, shaped like a Slack permalink tail:
    /// `C123/p1700000000123456`.
    pub fn thread_id(&self) -> String {
        format!("{}/p{}", self.channel, self.thread_ts.replacen('.', "", 1))
    }
}

static MENTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)<@[A-Z0-9]+>").ok());

/// Removes `<@U123>` mentions and trims the rest.
pub fn strip_mentions(text: &str) -> String {
    match MENTION.as_ref() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_drops_the_first_dot() {
        let thread = SlackThread::new("C024BE91L", "1700000000.123456");
        assert_eq!(thread.thread_id(), "C024BE91L/p1700000000123456");
    }

    #[test]
    fn mentions_are_stripped() {
        assert_eq!(
            strip_mentions("<@U0LAN0Z89> how many orders <@w123abc> today?"),
            "how many orders  today?"
        );
        assert_eq!(strip_mentions("  plain  "), "plain");
    }
}
