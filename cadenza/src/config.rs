use std::time::Duration;

use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;

pub(crate) const DEFAULT_USER_AGENT: &str = concat!("cadenza/", env!("CARGO_PKG_VERSION"));

/// Knobs shared by servers and channels. Exposed through builder-style
/// setters on [`crate::Server`] and [`crate::Channel`].
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) max_message_size: usize,
    pub(crate) max_concurrent_streams: u32,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) user_agent: String,
    pub(crate) drain_timeout: Duration,
    pub(crate) inbound_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_concurrent_streams: 100,
            default_timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            drain_timeout: Duration::from_secs(30),
            inbound_queue: 16,
        }
    }
}
