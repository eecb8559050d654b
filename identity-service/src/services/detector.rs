//! Suspicious-login heuristics.
//!
//! A pure classifier over an account's recent successful logins and the
//! current attempt. It never blocks login: callers dispatch the notification
//! side effect as a detached task.

use chrono::Timelike;
use serde::Serialize;

use crate::models::Session;

/// One observed login, reduced to the fields the heuristics use.
#[derive(Debug, Clone)]
pub struct LoginSample {
    pub ip_address: String,
    pub user_agent: Option<String>,
    /// Hour of day (UTC) of the login.
    pub hour: u32,
}

impl From<&Session> for LoginSample {
    fn from(s: &Session) -> Self {
        Self {
            ip_address: s.ip_address.clone(),
            user_agent: s.user_agent.clone(),
            hour: s.created_utc.hour(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspicionReason {
    NewOrigin,
    NewDevice,
    UnusualHour,
}

impl SuspicionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspicionReason::NewOrigin => "new_origin",
            SuspicionReason::NewDevice => "new_device",
            SuspicionReason::UnusualHour => "unusual_hour",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Assessment {
    pub suspicious: bool,
    pub reasons: Vec<SuspicionReason>,
}

/// Hours within this circular distance of a prior login hour are "typical".
const TYPICAL_HOUR_RADIUS: u32 = 2;

fn hour_distance(a: u32, b: u32) -> u32 {
    let d = a.abs_diff(b);
    d.min(24 - d)
}

/// Classify the current attempt against prior successful logins.
///
/// With no history there is nothing to compare against; a first login is
/// never flagged.
pub fn assess(history: &[LoginSample], current: &LoginSample) -> Assessment {
    if history.is_empty() {
        return Assessment {
            suspicious: false,
            reasons: Vec::new(),
        };
    }

    let mut reasons = Vec::new();

    if !history.iter().any(|h| h.ip_address == current.ip_address) {
        reasons.push(SuspicionReason::NewOrigin);
    }

    if let Some(agent) = &current.user_agent {
        let known_device = history
            .iter()
            .any(|h| h.user_agent.as_deref() == Some(agent.as_str()));
        if !known_device {
            reasons.push(SuspicionReason::NewDevice);
        }
    }

    if !history
        .iter()
        .any(|h| hour_distance(h.hour, current.hour) <= TYPICAL_HOUR_RADIUS)
    {
        reasons.push(SuspicionReason::UnusualHour);
    }

    Assessment {
        suspicious: !reasons.is_empty(),
        reasons,
    }
}
