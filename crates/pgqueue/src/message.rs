//! Transport messages and the reserved headers the transport interprets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::TransportError;

/// Header carrying the message priority. Lower values are received first.
pub const MESSAGE_PRIORITY_HEADER_KEY: &str = "rbs2-msg-priority";

/// Header carrying an absolute delivery time. Consumed on send.
pub const DEFERRED_UNTIL_HEADER_KEY: &str = "rbs2-deferred-until";

/// Header carrying a time-to-be-received duration (`[d.]hh:mm:ss[.fff]`).
pub const TIME_TO_BE_RECEIVED_HEADER_KEY: &str = "rbs2-time-to-be-received";

/// Time to live used when a message has no time-to-be-received header.
pub const DEFAULT_TTL_SECONDS: i32 = i32::MAX;

/// A message as moved by the transport: string headers plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportMessage {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: HashMap<String, String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }
}

/// Read the message priority. Absent means 0.
pub fn message_priority(headers: &HashMap<String, String>) -> Result<i32, TransportError> {
    let Some(value) = headers.get(MESSAGE_PRIORITY_HEADER_KEY) else {
        return Ok(0);
    };
    value
        .trim()
        .parse::<i32>()
        .map_err(|e| TransportError::Format {
            reason: format!("could not parse '{value}' into an i32"),
            source: Some(Box::new(e)),
        })
}

/// Remove the deferred-until header and return the delay until it, in whole
/// seconds relative to `now`. Absent means 0. Times in the past give a
/// negative delay, which makes the message visible immediately.
pub fn take_initial_visibility_delay(
    headers: &mut HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<i64, TransportError> {
    let Some(value) = headers.get(DEFERRED_UNTIL_HEADER_KEY) else {
        return Ok(0);
    };
    let deferred_until =
        DateTime::parse_from_rfc3339(value.trim()).map_err(|e| TransportError::Format {
            reason: format!("could not parse '{value}' into a timestamp"),
            source: Some(Box::new(e)),
        })?;
    headers.remove(DEFERRED_UNTIL_HEADER_KEY);

    Ok((deferred_until.with_timezone(&Utc) - now).num_seconds())
}

/// Read the time-to-be-received header as whole seconds.
/// Absent means [`DEFAULT_TTL_SECONDS`].
pub fn ttl_seconds(headers: &HashMap<String, String>) -> Result<i32, TransportError> {
    let Some(value) = headers.get(TIME_TO_BE_RECEIVED_HEADER_KEY) else {
        return Ok(DEFAULT_TTL_SECONDS);
    };
    let seconds = parse_time_span_seconds(value.trim()).ok_or_else(|| TransportError::Format {
        reason: format!("could not parse '{value}' into a time span"),
        source: None,
    })?;
    i32::try_from(seconds).map_err(|e| TransportError::Format {
        reason: format!("time span '{value}' is out of range"),
        source: Some(Box::new(e)),
    })
}

/// Parse `[-]d`, `[-][d.]hh:mm` or `[-][d.]hh:mm:ss[.fffffff]` into whole
/// seconds, truncating any fraction.
fn parse_time_span_seconds(value: &str) -> Option<i64> {
    let (negative, value) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    if value.is_empty() {
        return None;
    }

    let total = if !value.contains(':') {
        parse_digits(value)?.checked_mul(86_400)?
    } else {
        let mut parts = value.split(':');
        let (head, minutes, seconds) = (parts.next()?, parts.next()?, parts.next());
        if parts.next().is_some() {
            return None;
        }

        let (days, hours) = match head.split_once('.') {
            Some((days, hours)) => (parse_digits(days)?, parse_digits(hours)?),
            None => (0, parse_digits(head)?),
        };
        let minutes = parse_digits(minutes)?;
        let seconds = match seconds {
            Some(seconds) => {
                let whole = match seconds.split_once('.') {
                    Some((whole, fraction)) => {
                        parse_digits(fraction)?;
                        whole
                    }
                    None => seconds,
                };
                parse_digits(whole)?
            }
            None => 0,
        };
        if hours > 23 || minutes > 59 || seconds > 59 {
            return None;
        }
        days.checked_mul(86_400)?
            .checked_add(hours * 3_600 + minutes * 60 + seconds)?
    };

    Some(if negative { -total } else { total })
}

fn parse_digits(value: &str) -> Option<i64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
