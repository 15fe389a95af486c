//! Sliding-window rate limiting, keyed per resolved identity and per channel.
//!
//! The limiter is an injected, explicitly owned component so tests can build
//! an isolated instance. A check is read-then-append under one lock: two
//! concurrent requests cannot both slip under a ceiling with one slot left.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    UserLimited { ceiling: usize },
    ChannelLimited { ceiling: usize },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Allowed => "within limits".to_string(),
            Self::UserLimited { ceiling } => {
                format!("user exceeded {ceiling} calls in the current window")
            }
            Self::ChannelLimited { ceiling } => {
                format!("channel exceeded {ceiling} calls in the current window")
            }
        }
    }
}

#[derive(Debug, Default)]
struct Windows {
    per_user: HashMap<String, VecDeque<Instant>>,
    per_channel: HashMap<String, VecDeque<Instant>>,
}

#[derive(Debug)]
pub struct RateLimiter {
    user_ceiling: usize,
    channel_ceiling: usize,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(user_ceiling: usize, channel_ceiling: usize, window: Duration) -> Self {
        Self {
            user_ceiling,
            channel_ceiling,
            window,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn check_and_record(&self, user_key: &str, channel_key: &str) -> RateDecision {
        self.check_and_record_at(user_key, channel_key, Instant::now())
    }

    fn check_and_record_at(&self, user_key: &str, channel_key: &str, now: Instant) -> RateDecision {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let user_window = windows.per_user.entry(user_key.to_string()).or_default();
        prune(user_window, now, self.window);
        if user_window.len() >= self.user_ceiling {
            return RateDecision::UserLimited {
                ceiling: self.user_ceiling,
            };
        }

        let channel_window = windows
            .per_channel
            .entry(channel_key.to_string())
            .or_default();
        prune(channel_window, now, self.window);
        if channel_window.len() >= self.channel_ceiling {
            return RateDecision::ChannelLimited {
                ceiling: self.channel_ceiling,
            };
        }

        channel_window.push_back(now);
        if let Some(window) = windows.per_user.get_mut(user_key) {
            window.push_back(now);
        }
        RateDecision::Allowed
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}
