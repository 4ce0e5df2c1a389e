use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC.
pub type Ms = i64;

/// Which boundary semantics the conflict index uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// `[start, end]`: an interval ending exactly when another begins conflicts.
    #[default]
    Inclusive,
    /// `[start, end)`: touching intervals do not conflict.
    HalfOpen,
}

impl OverlapPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inclusive" => Some(Self::Inclusive),
            "half-open" | "half_open" | "halfopen" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

/// Time range with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: Ms,
    pub end: Ms,
}

impl Interval {
    /// Returns `None` for empty or inverted ranges.
    pub fn new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Interval, policy: OverlapPolicy) -> bool {
        match policy {
            OverlapPolicy::Inclusive => self.start <= other.end && other.start <= self.end,
            OverlapPolicy::HalfOpen => self.start < other.end && other.start < self.end,
        }
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub interval: Interval,
    pub owner_id: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    /// Committed bookings, sorted by `interval.start`.
    pub bookings: Vec<Booking>,
    /// Set once the room has been deleted. A writer that waited on the lock
    /// of a retired room must start over.
    pub retired: bool,
}

impl RoomState {
    pub fn new(id: Ulid, name: String, description: Option<String>) -> Self {
        Self {
            id,
            name,
            description,
            bookings: Vec::new(),
            retired: false,
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    /// Insert a booking keeping start order. Refuses (returning the blocking id)
    /// if the booking would overlap a committed one under `policy`.
    pub fn insert_booking(&mut self, booking: Booking, policy: OverlapPolicy) -> Result<(), Ulid> {
        if let Some(blocking) = self
            .overlapping(&booking.interval, policy)
            .find(|b| b.id != booking.id)
        {
            return Err(blocking.id);
        }
        let pos = self
            .bookings
            .partition_point(|b| b.interval.start <= booking.interval.start);
        self.bookings.insert(pos, booking);
        Ok(())
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get_booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose interval overlaps `query`.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping<'a>(
        &'a self,
        query: &Interval,
        policy: OverlapPolicy,
    ) -> impl Iterator<Item = &'a Booking> + 'a {
        let query = *query;
        let right_bound = match policy {
            OverlapPolicy::Inclusive => self
                .bookings
                .partition_point(|b| b.interval.start <= query.end),
            OverlapPolicy::HalfOpen => self
                .bookings
                .partition_point(|b| b.interval.start < query.end),
        };
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.interval.overlaps(&query, policy))
    }
}

/// The authenticated caller. `id` is the login name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub is_active: bool,
    pub is_superuser: bool,
}

/// WAL record format. Flat, one mutation per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    RoomUpdated {
        id: Ulid,
        name: String,
        description: Option<String>,
    },
    RoomDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        room_id: Ulid,
        interval: Interval,
    },
    BookingCancelled {
        id: Ulid,
        room_id: Ulid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            room_id: Ulid::nil(),
            interval: Interval::new(start, end).unwrap(),
            owner_id: None,
            created_at: 0,
        }
    }

    fn room() -> RoomState {
        RoomState::new(Ulid::new(), "Alpha".into(), None)
    }

    #[test]
    fn interval_rejects_empty_and_inverted() {
        assert!(Interval::new(100, 100).is_none());
        assert!(Interval::new(200, 100).is_none());
        assert_eq!(Interval::new(100, 200).unwrap().duration_ms(), 100);
    }

    #[test]
    fn inclusive_touching_overlaps() {
        let a = Interval::new(100, 200).unwrap();
        let b = Interval::new(200, 300).unwrap();
        assert!(a.overlaps(&b, OverlapPolicy::Inclusive));
        assert!(b.overlaps(&a, OverlapPolicy::Inclusive));
        assert!(!a.overlaps(&b, OverlapPolicy::HalfOpen));
    }

    #[test]
    fn disjoint_never_overlaps() {
        let a = Interval::new(100, 200).unwrap();
        let b = Interval::new(201, 300).unwrap();
        assert!(!a.overlaps(&b, OverlapPolicy::Inclusive));
        assert!(!a.overlaps(&b, OverlapPolicy::HalfOpen));
    }

    #[test]
    fn containment_overlaps() {
        let outer = Interval::new(0, 1000).unwrap();
        let inner = Interval::new(400, 500).unwrap();
        assert!(outer.overlaps(&inner, OverlapPolicy::HalfOpen));
        assert!(inner.overlaps(&outer, OverlapPolicy::Inclusive));
        assert!(outer.contains_instant(1000));
    }

    #[test]
    fn policy_parse() {
        assert_eq!(OverlapPolicy::parse("Inclusive"), Some(OverlapPolicy::Inclusive));
        assert_eq!(OverlapPolicy::parse("half-open"), Some(OverlapPolicy::HalfOpen));
        assert_eq!(OverlapPolicy::parse("sometimes"), None);
    }

    #[test]
    fn bookings_stay_sorted() {
        let mut rs = room();
        rs.insert_booking(booking(300, 400), OverlapPolicy::Inclusive).unwrap();
        rs.insert_booking(booking(100, 200), OverlapPolicy::Inclusive).unwrap();
        rs.insert_booking(booking(201, 299), OverlapPolicy::Inclusive).unwrap();
        let starts: Vec<Ms> = rs.bookings.iter().map(|b| b.interval.start).collect();
        assert_eq!(starts, vec![100, 201, 300]);
    }

    #[test]
    fn insert_refuses_overlap() {
        let mut rs = room();
        let first = booking(100, 200);
        let first_id = first.id;
        rs.insert_booking(first, OverlapPolicy::Inclusive).unwrap();
        let err = rs
            .insert_booking(booking(200, 300), OverlapPolicy::Inclusive)
            .unwrap_err();
        assert_eq!(err, first_id);
        assert_eq!(rs.bookings.len(), 1);

        rs.insert_booking(booking(200, 300), OverlapPolicy::HalfOpen).unwrap();
        assert_eq!(rs.bookings.len(), 2);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = room();
        rs.insert_booking(booking(100, 200), OverlapPolicy::Inclusive).unwrap();
        rs.insert_booking(booking(450, 600), OverlapPolicy::Inclusive).unwrap();
        rs.insert_booking(booking(1000, 1100), OverlapPolicy::Inclusive).unwrap();

        let query = Interval::new(500, 800).unwrap();
        let hits: Vec<_> = rs.overlapping(&query, OverlapPolicy::Inclusive).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].interval, Interval::new(450, 600).unwrap());
    }

    #[test]
    fn overlapping_boundary_depends_on_policy() {
        let mut rs = room();
        rs.insert_booking(booking(100, 200), OverlapPolicy::Inclusive).unwrap();
        let query = Interval::new(200, 300).unwrap();
        assert_eq!(rs.overlapping(&query, OverlapPolicy::Inclusive).count(), 1);
        assert_eq!(rs.overlapping(&query, OverlapPolicy::HalfOpen).count(), 0);

        // Query ending exactly where the booking starts.
        let before = Interval::new(0, 100).unwrap();
        assert_eq!(rs.overlapping(&before, OverlapPolicy::Inclusive).count(), 1);
        assert_eq!(rs.overlapping(&before, OverlapPolicy::HalfOpen).count(), 0);
    }

    #[test]
    fn overlapping_empty_room() {
        let rs = room();
        let query = Interval::new(0, 1000).unwrap();
        assert_eq!(rs.overlapping(&query, OverlapPolicy::Inclusive).count(), 0);
    }

    #[test]
    fn remove_booking_by_id() {
        let mut rs = room();
        let b = booking(100, 200);
        let id = b.id;
        rs.insert_booking(b, OverlapPolicy::Inclusive).unwrap();
        assert!(rs.remove_booking(Ulid::new()).is_none());
        assert_eq!(rs.remove_booking(id).map(|b| b.id), Some(id));
        assert!(rs.bookings.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: Booking {
                owner_id: Some("alice".into()),
                ..booking(100, 200)
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
