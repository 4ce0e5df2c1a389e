use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms};
use super::validate::{validate_interval, RawBooking};
use super::{Engine, EngineError};

impl Engine {
    /// Validate, conflict-check and commit a new booking in `room_id`.
    ///
    /// `id` defaults to a fresh ULID. `actor` becomes the owner; an inactive
    /// actor may not book.
    pub async fn create_booking(
        &self,
        id: Option<Ulid>,
        room_id: Ulid,
        raw: RawBooking,
        actor: Option<&Actor>,
    ) -> Result<Booking, EngineError> {
        self.create_booking_at(id, room_id, raw, actor, now_ms()).await
    }

    /// [`Engine::create_booking`] with an explicit request time.
    pub async fn create_booking_at(
        &self,
        id: Option<Ulid>,
        room_id: Ulid,
        raw: RawBooking,
        actor: Option<&Actor>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let owner_id = match actor {
            Some(a) if !a.is_active => return Err(EngineError::Forbidden("inactive user")),
            Some(a) if a.id.len() > MAX_OWNER_LEN => {
                return Err(EngineError::LimitExceeded("user name too long"));
            }
            Some(a) => Some(a.id.clone()),
            None => None,
        };
        let id = id.unwrap_or_else(Ulid::new);
        let result = self
            .with_commit_retry(|| self.try_create(id, room_id, &raw, owner_id.clone(), now))
            .await;
        record_outcome("create", &result);
        if let Ok(booking) = &result {
            info!(
                "booking {} committed in room {} [{}, {}]",
                booking.id, room_id, booking.interval.start, booking.interval.end
            );
        }
        result
    }

    async fn try_create(
        &self,
        id: Ulid,
        room_id: Ulid,
        raw: &RawBooking,
        owner_id: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let interval = validate_interval(raw, None, now)?;
        let mut txn = self.begin(room_id).await?;
        if self.booking_to_room.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if txn.state().bookings.len() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings in room"));
        }
        check_no_conflict(txn.state(), &interval, None, self.policy)?;

        let booking = Booking {
            id,
            room_id,
            interval,
            owner_id,
            created_at: now,
        };
        txn.commit(Event::BookingCreated {
            booking: booking.clone(),
        })
        .await?;
        Ok(booking)
    }

    /// Replace a booking's interval. Fields missing from `raw` keep their
    /// stored value; the booking never conflicts with itself.
    pub async fn update_booking(&self, id: Ulid, raw: RawBooking) -> Result<Booking, EngineError> {
        self.update_booking_at(id, raw, now_ms()).await
    }

    /// [`Engine::update_booking`] with an explicit request time.
    pub async fn update_booking_at(
        &self,
        id: Ulid,
        raw: RawBooking,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let result = self
            .with_commit_retry(|| self.try_update(id, &raw, now))
            .await;
        record_outcome("update", &result);
        if let Ok(booking) = &result {
            info!(
                "booking {id} rescheduled to [{}, {}]",
                booking.interval.start, booking.interval.end
            );
        }
        result
    }

    async fn try_update(&self, id: Ulid, raw: &RawBooking, now: Ms) -> Result<Booking, EngineError> {
        let room_id = self.room_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut txn = self.begin(room_id).await?;
        let current = txn
            .state()
            .get_booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let interval = validate_interval(raw, Some(&current.interval), now)?;
        check_no_conflict(txn.state(), &interval, Some(id), self.policy)?;

        txn.commit(Event::BookingRescheduled {
            id,
            room_id,
            interval,
        })
        .await?;
        Ok(Booking {
            interval,
            ..current
        })
    }

    /// Remove a booking and return it. Cancelling an absent booking is
    /// `NotFound`, including the loser of two racing cancels.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let result = self.with_commit_retry(|| self.try_cancel(id)).await;
        record_outcome("cancel", &result);
        if result.is_ok() {
            info!("booking {id} cancelled");
        }
        result
    }

    async fn try_cancel(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self.room_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let mut txn = self.begin(room_id).await?;
        let booking = txn
            .state()
            .get_booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        txn.commit(Event::BookingCancelled { id, room_id }).await?;
        Ok(booking)
    }
}

fn record_outcome(op: &'static str, result: &Result<Booking, EngineError>) {
    match result {
        Ok(_) => {
            metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL, "op" => op).increment(1);
        }
        Err(EngineError::Conflict(ids)) => {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "op" => op).increment(1);
            debug!("{op} rejected: overlaps {} booking(s)", ids.len());
        }
        Err(e) => debug!("{op} rejected: {e}"),
    }
}
