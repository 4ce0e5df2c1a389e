use crate::limits::*;
use crate::model::*;

use super::{EngineError, ValidationError};

/// Booking fields as they arrived on the wire, before any checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBooking {
    pub from: Option<String>,
    pub to: Option<String>,
    /// Field names the request carried that bookings do not have.
    pub unknown_fields: Vec<String>,
}

impl RawBooking {
    pub fn new(from: Option<String>, to: Option<String>) -> Self {
        Self {
            from,
            to,
            unknown_fields: Vec::new(),
        }
    }

    pub fn from_ms(from: Ms, to: Ms) -> Self {
        Self::new(Some(from.to_string()), Some(to.to_string()))
    }
}

/// Run the booking checks in order, stopping at the first failure:
///
/// 1. no unrecognized fields
/// 2. `start`/`end` present and parseable (on update a missing side keeps `stored`)
/// 3. a supplied `start` is strictly later than `now`
/// 4. `start < end`
/// 5. timestamps and duration within limits
///
/// Room existence is checked by the caller once it holds the room.
pub(crate) fn validate_interval(
    raw: &RawBooking,
    stored: Option<&Interval>,
    now: Ms,
) -> Result<Interval, EngineError> {
    if let Some(name) = raw.unknown_fields.first() {
        return Err(ValidationError::UnknownField(name.clone()).into());
    }

    let (start, end) = match stored {
        None => (
            parse_instant("start", raw.from.as_deref().ok_or(ValidationError::MissingField("start"))?)?,
            parse_instant("end", raw.to.as_deref().ok_or(ValidationError::MissingField("end"))?)?,
        ),
        Some(current) => {
            if raw.from.is_none() && raw.to.is_none() {
                return Err(ValidationError::NothingToUpdate.into());
            }
            let start = match raw.from.as_deref() {
                Some(s) => parse_instant("start", s)?,
                None => current.start,
            };
            let end = match raw.to.as_deref() {
                Some(s) => parse_instant("end", s)?,
                None => current.end,
            };
            (start, end)
        }
    };

    // An unchanged stored start is not re-checked against the clock.
    if raw.from.is_some() && start <= now {
        return Err(ValidationError::StartNotInFuture { start, now }.into());
    }

    let interval =
        Interval::new(start, end).ok_or(ValidationError::InvertedInterval { start, end })?;
    validate_range(&interval)?;
    Ok(interval)
}

pub(crate) fn validate_range(interval: &Interval) -> Result<(), EngineError> {
    if interval.start < MIN_VALID_TIMESTAMP_MS || interval.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if interval.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(())
}

pub(crate) fn validate_room_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::InvalidName("name must not be empty").into());
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    Ok(name.to_string())
}

fn parse_instant(field: &'static str, value: &str) -> Result<Ms, ValidationError> {
    value
        .trim()
        .parse::<Ms>()
        .map_err(|_| ValidationError::Unparseable {
            field,
            value: value.to_string(),
        })
}
