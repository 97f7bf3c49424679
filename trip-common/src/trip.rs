use std::fmt;
use std::str::FromStr;

use crate::attributes::{AttributeValue, Attributes};

pub const RAW_PREFIX: &str = "RAW#";
pub const COMPLETED_PREFIX: &str = "COMPLETED#";

pub const RAW_STATUS: &str = "raw";
pub const COMPLETED_STATUS: &str = "completed";

/// Which half of a trip a raw event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Start,
    End,
}

impl Phase {
    /// The `data_type` tag producers use for this phase.
    pub fn tag(&self) -> &'static str {
        match self {
            Phase::Start => "trip_start",
            Phase::End => "trip_end",
        }
    }

    /// The payload field holding this phase's timestamp.
    pub fn timestamp_field(&self) -> &'static str {
        match self {
            Phase::Start => "pickup_datetime",
            Phase::End => "dropoff_datetime",
        }
    }

    /// Sort key prefix shared by every raw row of this phase.
    pub fn sort_key_prefix(&self) -> String {
        format!("{}{}#", RAW_PREFIX, self.tag())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trip_start" => Ok(Phase::Start),
            "trip_end" => Ok(Phase::End),
            invalid => Err(UnknownPhase(invalid.to_owned())),
        }
    }
}

/// Composite primary key of a table item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.partition_key, self.sort_key)
    }
}

/// One row of the trip table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableItem {
    pub key: ItemKey,
    pub attributes: Attributes,
}

impl TableItem {
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttributeValue::as_str)
    }

    pub fn is_raw(&self) -> bool {
        self.key.sort_key.starts_with(RAW_PREFIX)
    }
}

/// A persisted, unjoined half of a trip.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTripEvent {
    pub trip_id: String,
    pub phase: Phase,
    pub event_timestamp: String,
    pub attributes: Attributes,
    pub ingestion_timestamp: String,
}

impl RawTripEvent {
    /// Identity of the event: two events with the same key are the same event.
    pub fn key(&self) -> ItemKey {
        ItemKey {
            partition_key: self.trip_id.clone(),
            sort_key: raw_sort_key(self.phase, &self.event_timestamp),
        }
    }

    pub fn to_item(&self) -> TableItem {
        let mut attributes = self.attributes.clone();
        attributes.insert("trip_id".to_owned(), self.trip_id.as_str().into());
        attributes.insert("data_type".to_owned(), self.phase.tag().into());
        attributes.insert("status".to_owned(), RAW_STATUS.into());
        attributes.insert(
            "ingestion_timestamp".to_owned(),
            self.ingestion_timestamp.as_str().into(),
        );

        TableItem {
            key: self.key(),
            attributes,
        }
    }

    /// Rebuild a raw event from a stored row. Returns None for rows that are not raw events.
    pub fn from_item(item: &TableItem) -> Option<Self> {
        let (phase, event_timestamp) = parse_raw_sort_key(&item.key.sort_key)?;

        let mut attributes = item.attributes.clone();
        for bookkeeping in ["trip_id", "data_type", "status"] {
            attributes.remove(bookkeeping);
        }
        let ingestion_timestamp = match attributes.remove("ingestion_timestamp") {
            Some(AttributeValue::String(s)) => s,
            _ => String::new(),
        };

        Some(Self {
            trip_id: item.key.partition_key.clone(),
            phase,
            event_timestamp: event_timestamp.to_owned(),
            attributes,
            ingestion_timestamp,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }
}

/// The joined record emitted once both halves of a trip were seen.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTrip {
    pub trip_id: String,
    pub pickup_timestamp: String,
    pub dropoff_timestamp: String,
    pub fare: AttributeValue,
    pub distance: AttributeValue,
    pub pickup_location: Option<AttributeValue>,
    pub dropoff_location: Option<AttributeValue>,
    pub completion_timestamp: String,
}

impl CompletedTrip {
    /// Join a start and an end event of the same trip.
    pub fn from_phases(start: &RawTripEvent, end: &RawTripEvent, completion_timestamp: String) -> Self {
        Self {
            trip_id: start.trip_id.clone(),
            pickup_timestamp: start.event_timestamp.clone(),
            dropoff_timestamp: end.event_timestamp.clone(),
            fare: end
                .attribute("fare_amount")
                .cloned()
                .unwrap_or(AttributeValue::Null),
            distance: end
                .attribute("trip_distance")
                .cloned()
                .unwrap_or(AttributeValue::Null),
            pickup_location: start.attribute("pickup_location").cloned(),
            dropoff_location: end.attribute("dropoff_location").cloned(),
            completion_timestamp,
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey {
            partition_key: self.trip_id.clone(),
            sort_key: completed_sort_key(&self.pickup_timestamp),
        }
    }

    pub fn to_item(&self) -> TableItem {
        let mut attributes = Attributes::new();
        attributes.insert("trip_id".to_owned(), self.trip_id.as_str().into());
        attributes.insert("status".to_owned(), COMPLETED_STATUS.into());
        attributes.insert(
            "pickup_datetime".to_owned(),
            self.pickup_timestamp.as_str().into(),
        );
        attributes.insert(
            "dropoff_datetime".to_owned(),
            self.dropoff_timestamp.as_str().into(),
        );
        attributes.insert("fare".to_owned(), self.fare.clone());
        attributes.insert("distance".to_owned(), self.distance.clone());
        if let Some(location) = &self.pickup_location {
            attributes.insert("pickup_location".to_owned(), location.clone());
        }
        if let Some(location) = &self.dropoff_location {
            attributes.insert("dropoff_location".to_owned(), location.clone());
        }
        attributes.insert(
            "completion_timestamp".to_owned(),
            self.completion_timestamp.as_str().into(),
        );

        TableItem {
            key: self.key(),
            attributes,
        }
    }
}

pub fn raw_sort_key(phase: Phase, timestamp: &str) -> String {
    format!("{}{}", phase.sort_key_prefix(), timestamp)
}

pub fn completed_sort_key(pickup_timestamp: &str) -> String {
    format!("{}{}", COMPLETED_PREFIX, pickup_timestamp)
}

/// Split `RAW#{phase}#{timestamp}` into its parts.
pub fn parse_raw_sort_key(sort_key: &str) -> Option<(Phase, &str)> {
    let rest = sort_key.strip_prefix(RAW_PREFIX)?;
    let (tag, timestamp) = rest.split_once('#')?;
    let phase = tag.parse().ok()?;
    Some((phase, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn start_event() -> RawTripEvent {
        let mut attributes = Attributes::new();
        attributes.insert("pickup_datetime".to_owned(), "2024-01-01T10:00:00".into());
        attributes.insert("pickup_location".to_owned(), "JFK".into());
        RawTripEvent {
            trip_id: "T1".to_owned(),
            phase: Phase::Start,
            event_timestamp: "2024-01-01T10:00:00".to_owned(),
            attributes,
            ingestion_timestamp: "2024-01-01T10:00:01Z".to_owned(),
        }
    }

    fn end_event() -> RawTripEvent {
        let mut attributes = Attributes::new();
        attributes.insert("dropoff_datetime".to_owned(), "2024-01-01T10:20:00".into());
        attributes.insert("fare_amount".to_owned(), Decimal::new(125, 1).into());
        RawTripEvent {
            trip_id: "T1".to_owned(),
            phase: Phase::End,
            event_timestamp: "2024-01-01T10:20:00".to_owned(),
            attributes,
            ingestion_timestamp: "2024-01-01T10:20:01Z".to_owned(),
        }
    }

    #[test]
    fn test_sort_key_conventions() {
        assert_eq!(
            start_event().key().sort_key,
            "RAW#trip_start#2024-01-01T10:00:00"
        );
        assert_eq!(end_event().key().sort_key, "RAW#trip_end#2024-01-01T10:20:00");
        assert_eq!(
            completed_sort_key("2024-01-01T10:00:00"),
            "COMPLETED#2024-01-01T10:00:00"
        );
    }

    #[test]
    fn test_parse_raw_sort_key() {
        assert_eq!(
            parse_raw_sort_key("RAW#trip_end#2024-01-01 10:20:00"),
            Some((Phase::End, "2024-01-01 10:20:00"))
        );
        assert_eq!(parse_raw_sort_key("COMPLETED#2024-01-01"), None);
        assert_eq!(parse_raw_sort_key("RAW#trip_middle#2024-01-01"), None);
    }

    #[test]
    fn test_raw_event_item_round_trip() {
        let event = start_event();
        let item = event.to_item();

        assert_eq!(item.attribute_str("status"), Some(RAW_STATUS));
        assert_eq!(item.attribute_str("data_type"), Some("trip_start"));
        assert_eq!(item.attribute_str("trip_id"), Some("T1"));
        assert!(item.is_raw());
        assert_eq!(RawTripEvent::from_item(&item), Some(event));
    }

    #[test]
    fn test_completed_trip_joins_both_phases() {
        let completed = CompletedTrip::from_phases(
            &start_event(),
            &end_event(),
            "2024-01-01T10:21:00Z".to_owned(),
        );

        assert_eq!(completed.pickup_timestamp, "2024-01-01T10:00:00");
        assert_eq!(completed.dropoff_timestamp, "2024-01-01T10:20:00");
        assert_eq!(completed.fare, AttributeValue::Number(Decimal::new(125, 1)));
        assert_eq!(completed.distance, AttributeValue::Null);
        assert_eq!(completed.pickup_location, Some("JFK".into()));
        assert_eq!(completed.dropoff_location, None);

        let item = completed.to_item();
        assert_eq!(item.key.sort_key, "COMPLETED#2024-01-01T10:00:00");
        assert_eq!(item.attribute_str("status"), Some(COMPLETED_STATUS));
        assert!(!item.is_raw());
        assert!(!item.attributes.contains_key("dropoff_location"));
    }
}
