use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Wall-clock time as Unix milliseconds.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Every committed booking of `rs` overlapping `candidate`, except `exclude`.
/// Results come back in start order.
pub(crate) fn find_overlaps<'a>(
    rs: &'a RoomState,
    candidate: &Interval,
    exclude: Option<Ulid>,
    policy: OverlapPolicy,
) -> impl Iterator<Item = &'a Booking> + 'a {
    rs.overlapping(candidate, policy)
        .filter(move |b| Some(b.id) != exclude)
}

pub(crate) fn check_no_conflict(
    rs: &RoomState,
    candidate: &Interval,
    exclude: Option<Ulid>,
    policy: OverlapPolicy,
) -> Result<(), EngineError> {
    let blocking: Vec<Ulid> = find_overlaps(rs, candidate, exclude, policy)
        .map(|b| b.id)
        .collect();
    if blocking.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict(blocking))
    }
}
