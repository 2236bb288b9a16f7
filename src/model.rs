use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::limits::*;

/// Wall-clock instant with the caller's UTC offset preserved.
pub type Timestamp = DateTime<FixedOffset>;

pub fn now() -> Timestamp {
    Utc::now().fixed_offset()
}

/// Why a requested interval was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidInterval {
    #[error("start and end are required")]
    MissingBound,
    #[error("end {end} must be after start {start}")]
    EndNotAfterStart { start: Timestamp, end: Timestamp },
    #[error("timestamp out of range")]
    OutOfRange,
    #[error("interval longer than 366 days")]
    TooLong,
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from possibly-unset bounds, enforcing `start < end` and the
    /// accepted timestamp range.
    pub fn validate(start: Option<Timestamp>, end: Option<Timestamp>) -> Result<Self, InvalidInterval> {
        let (Some(start), Some(end)) = (start, end) else {
            return Err(InvalidInterval::MissingBound);
        };
        if start.timestamp_millis() <= MIN_VALID_TIMESTAMP_MS || end.timestamp_millis() <= MIN_VALID_TIMESTAMP_MS {
            return Err(InvalidInterval::MissingBound);
        }
        if end <= start {
            return Err(InvalidInterval::EndNotAfterStart { start, end });
        }
        if end.timestamp_millis() > MAX_VALID_TIMESTAMP_MS {
            return Err(InvalidInterval::OutOfRange);
        }
        let span = Self { start, end };
        if span.duration().num_milliseconds() > MAX_SPAN_DURATION_MS {
            return Err(InvalidInterval::TooLong);
        }
        Ok(span)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Two spans overlap iff `a.start < b.end && b.start < a.end`; touching
    /// spans (`a.end == b.start`) do not.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// The calendar day `date` in the given offset as `[midnight, midnight + 24h)`.
/// `None` when either bound falls outside chrono's representable range.
pub fn day_window(date: NaiveDate, offset: FixedOffset) -> Option<Span> {
    let midnight_utc = date.and_time(NaiveTime::MIN).checked_sub_offset(offset)?;
    let start = DateTime::from_naive_utc_and_offset(midnight_utc, offset);
    let end = start.checked_add_signed(Duration::hours(24))?;
    Some(Span::new(start, end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Active)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown reservation status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for ReservationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReservationStatus::Active),
            "cancelled" => Ok(ReservationStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A committed reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub holder_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Caller input for a new reservation. Bounds may be missing; the engine
/// rejects them before anything is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub resource_id: Ulid,
    pub holder_id: Ulid,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

/// A validated reservation handed to the store for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub resource_id: Ulid,
    pub holder_id: Ulid,
    pub span: Span,
}

/// Partial update: only the fields that are `Some` change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub status: Option<ReservationStatus>,
}

impl ReservationPatch {
    pub fn touches_span(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.touches_span() && self.status.is_none()
    }
}

/// All reservations of one resource, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Active reservations overlapping `query`, except `exclude`.
    pub fn active_overlapping(&self, query: &Span, exclude: Option<Ulid>) -> impl Iterator<Item = &Reservation> {
        self.overlapping(query)
            .filter(move |r| r.is_active() && Some(r.id) != exclude)
    }
}

/// WAL record format. Flat, no nesting.
///
/// Creation carries no status: a reservation is always born active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        holder_id: Ulid,
        span: Span,
        created_at: Timestamp,
    },
    ReservationUpdated {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        status: ReservationStatus,
        updated_at: Timestamp,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ReservationCreated { resource_id, .. }
            | Event::ReservationUpdated { resource_id, .. } => *resource_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub id: Ulid,
    pub name: String,
    pub email: String,
}

/// A reservation joined with the public fields of its resource and holder.
/// Either side is `None` when the directory has no entry for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationView {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub resource: Option<ResourceInfo>,
    pub holder: Option<HolderInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn span(start: &str, end: &str) -> Span {
        Span::new(ts(start), ts(end))
    }

    fn reservation(start: &str, end: &str, status: ReservationStatus) -> Reservation {
        let created = ts("2024-01-01T00:00:00Z");
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            holder_id: Ulid::new(),
            span: span(start, end),
            status,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn span_overlap() {
        let a = span("2024-01-01T10:00:00Z", "2024-01-01T20:00:00Z");
        let b = span("2024-01-01T19:00:00Z", "2024-01-01T23:00:00Z");
        let c = span("2024-01-01T20:00:00Z", "2024-01-01T23:00:00Z");
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn overlap_compares_instants_across_offsets() {
        // 10:00+02:00 == 08:00Z
        let a = span("2024-01-01T09:00:00+02:00", "2024-01-01T10:00:00+02:00");
        let b = span("2024-01-01T08:00:00Z", "2024-01-01T09:00:00Z");
        let c = span("2024-01-01T07:30:00Z", "2024-01-01T08:30:00Z");
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn span_contains_span() {
        let outer = span("2024-01-01T08:00:00Z", "2024-01-01T18:00:00Z");
        let inner = span("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z");
        let partial = span("2024-01-01T07:00:00Z", "2024-01-01T09:00:00Z");
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn validate_accepts_well_formed() {
        let s = Span::validate(Some(ts("2024-01-01T10:00:00Z")), Some(ts("2024-01-01T11:00:00Z"))).unwrap();
        assert_eq!(s.duration(), Duration::hours(1));
    }

    #[test]
    fn validate_rejects_missing_bounds() {
        let t = ts("2024-01-01T10:00:00Z");
        assert_eq!(Span::validate(None, Some(t)), Err(InvalidInterval::MissingBound));
        assert_eq!(Span::validate(Some(t), None), Err(InvalidInterval::MissingBound));
        assert_eq!(Span::validate(None, None), Err(InvalidInterval::MissingBound));
    }

    #[test]
    fn validate_rejects_zero_value() {
        let epoch = ts("1970-01-01T00:00:00Z");
        let result = Span::validate(Some(epoch), Some(ts("2024-01-01T10:00:00Z")));
        assert_eq!(result, Err(InvalidInterval::MissingBound));
    }

    #[test]
    fn validate_rejects_empty_and_inverted() {
        let a = ts("2024-01-01T10:00:00Z");
        let b = ts("2024-01-01T11:00:00Z");
        assert!(matches!(
            Span::validate(Some(a), Some(a)),
            Err(InvalidInterval::EndNotAfterStart { .. })
        ));
        assert!(matches!(
            Span::validate(Some(b), Some(a)),
            Err(InvalidInterval::EndNotAfterStart { .. })
        ));
    }

    #[test]
    fn validate_rejects_too_long() {
        let result = Span::validate(Some(ts("2024-01-01T00:00:00Z")), Some(ts("2025-06-01T00:00:00Z")));
        assert_eq!(result, Err(InvalidInterval::TooLong));
    }

    #[test]
    fn day_window_is_half_open_24h() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let w = day_window(date, FixedOffset::east_opt(7 * 3600).unwrap()).unwrap();
        assert_eq!(w.start, ts("2024-01-01T00:00:00+07:00"));
        assert_eq!(w.end, ts("2024-01-02T00:00:00+07:00"));
        assert_eq!(w.duration(), Duration::hours(24));
    }

    #[test]
    fn day_window_at_calendar_limits_is_none() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus1 = FixedOffset::east_opt(3600).unwrap();
        let minus1 = FixedOffset::west_opt(3600).unwrap();
        assert_eq!(day_window(NaiveDate::MAX, utc), None);
        assert_eq!(day_window(NaiveDate::MIN, plus1), None);
        assert_eq!(day_window(NaiveDate::MAX, minus1), None);
        // Midnight of the first day is representable when shifted forward.
        assert!(day_window(NaiveDate::MIN, minus1).is_some());
    }

    #[test]
    fn status_strings() {
        assert_eq!("active".parse::<ReservationStatus>(), Ok(ReservationStatus::Active));
        assert_eq!("cancelled".parse::<ReservationStatus>(), Ok(ReservationStatus::Cancelled));
        assert!("Active".parse::<ReservationStatus>().is_err());
        assert_eq!(ReservationStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(serde_json::to_string(&ReservationStatus::Active).unwrap(), "\"active\"");
    }

    #[test]
    fn resource_state_keeps_start_order() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert(reservation("2024-01-01T12:00:00Z", "2024-01-01T13:00:00Z", ReservationStatus::Active));
        rs.insert(reservation("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z", ReservationStatus::Active));
        rs.insert(reservation("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", ReservationStatus::Cancelled));
        let starts: Vec<_> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(
            starts,
            vec![
                ts("2024-01-01T09:00:00Z"),
                ts("2024-01-01T10:00:00Z"),
                ts("2024-01-01T12:00:00Z"),
            ]
        );
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert(reservation("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z", ReservationStatus::Active));
        assert!(rs.remove(Ulid::new()).is_none());
        assert_eq!(rs.reservations.len(), 1);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert(reservation("2024-01-01T06:00:00Z", "2024-01-01T07:00:00Z", ReservationStatus::Active));
        let hit = reservation("2024-01-01T09:30:00Z", "2024-01-01T10:30:00Z", ReservationStatus::Active);
        let hit_id = hit.id;
        rs.insert(hit);
        rs.insert(reservation("2024-01-01T15:00:00Z", "2024-01-01T16:00:00Z", ReservationStatus::Active));

        let query = span("2024-01-01T10:00:00Z", "2024-01-01T12:00:00Z");
        let hits: Vec<_> = rs.overlapping(&query).map(|r| r.id).collect();
        assert_eq!(hits, vec![hit_id]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert(reservation("2024-01-01T09:00:00Z", "2024-01-01T10:00:00Z", ReservationStatus::Active));
        let query = span("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z");
        assert_eq!(rs.overlapping(&query).count(), 0);
    }

    #[test]
    fn overlapping_long_reservation_spanning_query() {
        let mut rs = ResourceState::new(Ulid::new());
        rs.insert(reservation("2024-01-01T00:00:00Z", "2024-01-02T00:00:00Z", ReservationStatus::Active));
        rs.insert(reservation("2024-01-01T01:00:00Z", "2024-01-01T02:00:00Z", ReservationStatus::Active));
        let query = span("2024-01-01T12:00:00Z", "2024-01-01T13:00:00Z");
        assert_eq!(rs.overlapping(&query).count(), 1);
    }

    #[test]
    fn active_overlapping_skips_cancelled_and_excluded() {
        let mut rs = ResourceState::new(Ulid::new());
        let own = reservation("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", ReservationStatus::Active);
        let own_id = own.id;
        rs.insert(own);
        rs.insert(reservation("2024-01-01T10:30:00Z", "2024-01-01T11:30:00Z", ReservationStatus::Cancelled));

        let query = span("2024-01-01T10:15:00Z", "2024-01-01T11:15:00Z");
        assert_eq!(rs.active_overlapping(&query, Some(own_id)).count(), 0);
        assert_eq!(rs.active_overlapping(&query, None).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            id: Ulid::new(),
            resource_id: Ulid::new(),
            holder_id: Ulid::new(),
            span: span("2024-01-01T10:00:00+07:00", "2024-01-01T11:00:00+07:00"),
            created_at: ts("2023-12-31T08:00:00Z"),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        if let Event::ReservationCreated { span, .. } = decoded {
            assert_eq!(span.start.offset().local_minus_utc(), 7 * 3600);
        }
    }

    #[test]
    fn view_flattens_reservation_fields() {
        let r = reservation("2024-01-01T10:00:00Z", "2024-01-01T11:00:00Z", ReservationStatus::Active);
        let view = ReservationView {
            reservation: r.clone(),
            resource: Some(ResourceInfo { id: r.resource_id, name: "Orchid".into(), capacity: 8 }),
            holder: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["id"], r.id.to_string());
        assert_eq!(json["resource"]["name"], "Orchid");
        assert!(json["holder"].is_null());
    }
}
