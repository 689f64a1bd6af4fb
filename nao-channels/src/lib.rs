//! Messaging-platform bridge for nao.
//!
//! The Slack Web API client is pure I/O; [`MessageRelay`] turns a session's
//! text stream into throttled message edits on any [`MessagingChannel`].

mod events;
mod relay;
mod signature;
mod slack;
mod traits;
mod types;

pub use events::{SlackEnvelope, SlackEvent, SlackInteraction, parse_interaction_form};
pub use relay::{
    MessageRelay, PLACEHOLDER_TEXT, RelayFragment, RelaySummary, STOP_ACTION_ID, STOP_BUTTON_LABEL,
    STOP_BUTTON_TEXT, stop_button_block,
};
pub use signature::{SIGNATURE_MAX_AGE_SECS, verify_slack_signature};
pub use slack::SlackClient;
pub use traits::MessagingChannel;
pub use types::{ChannelId, MessageTs, SlackThread, strip_mentions};
