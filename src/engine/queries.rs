use ulid::Ulid;

use crate::model::*;

use super::conflict::find_overlaps;
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    /// Committed bookings of `room_id` overlapping `candidate`, except `exclude`.
    pub async fn find_overlaps(
        &self,
        room_id: Ulid,
        candidate: Interval,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(find_overlaps(&guard, &candidate, exclude, self.policy)
            .cloned()
            .collect())
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let room_id = self.room_for_booking(&id)?;
        let rs = self.get_room_state(&room_id)?;
        let guard = rs.read().await;
        guard.get_booking(id).cloned()
    }

    /// Every committed booking, ordered by start.
    pub async fn list_bookings(&self) -> Vec<Booking> {
        self.collect_bookings(|_| true).await
    }

    pub async fn list_bookings_by_owner(&self, owner_id: &str) -> Vec<Booking> {
        self.collect_bookings(|b| b.owner_id.as_deref() == Some(owner_id))
            .await
    }

    /// Bookings of `room_id` that have not ended by `now`.
    pub async fn list_future_bookings_for_room(
        &self,
        room_id: Ulid,
        now: Ms,
    ) -> Result<Vec<Booking>, EngineError> {
        let rs = self
            .get_room_state(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard
            .bookings
            .iter()
            .filter(|b| b.interval.end > now)
            .cloned()
            .collect())
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let rooms: Vec<SharedRoomState> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        out.sort_by_key(|b| (b.interval.start, b.id));
        out
    }
}
