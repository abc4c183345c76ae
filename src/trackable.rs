//! The donation model: status state machine, update records and the typed
//! metadata that rides along with them.

use chrono::{DateTime, Utc};

use crate::document::{Document, Value};
use crate::error::StoreError;

pub const NAME_PATH: &str = "name";
pub const IMAGE_PATH: &str = "image";
pub const STATUS_PATH: &str = "status";
pub const DRIVER_PATH: &str = "driver";
pub const UPDATES_PATH: &str = "updates";
pub const METADATA_PATH: &str = "metadata";
pub const COLLABORATORS_PATH: &str = "collaborators";

pub fn update_path(timestamp_ms: i64) -> String {
    format!("{UPDATES_PATH}/{timestamp_ms}")
}

pub fn collaborator_path(user_did: &str) -> String {
    format!("{COLLABORATORS_PATH}/{user_did}")
}

/// Donation lifecycle. Strictly ordered; a trackable only ever advances to
/// the immediately following status, never backward and never skipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrackableStatus {
    Created,
    Published,
    Accepted,
    PickedUp,
    Delivered,
}

impl TrackableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackableStatus::Created => "Created",
            TrackableStatus::Published => "Published",
            TrackableStatus::Accepted => "Accepted",
            TrackableStatus::PickedUp => "PickedUp",
            TrackableStatus::Delivered => "Delivered",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "Created" => Ok(TrackableStatus::Created),
            "Published" => Ok(TrackableStatus::Published),
            "Accepted" => Ok(TrackableStatus::Accepted),
            "PickedUp" => Ok(TrackableStatus::PickedUp),
            "Delivered" => Ok(TrackableStatus::Delivered),
            other => Err(StoreError::InvalidData(format!(
                "unknown trackable status {other:?}"
            ))),
        }
    }

    /// Forward-only, one step at a time.
    pub fn can_advance_to(&self, next: TrackableStatus) -> bool {
        next as u8 == *self as u8 + 1
    }
}

/// Pickup / dropoff street address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub street: String,
    pub city_state_zip: String,
}

impl Address {
    pub fn to_value(&self) -> Value {
        let mut entries = std::collections::BTreeMap::new();
        entries.insert("street".to_string(), Value::text(self.street.clone()));
        entries.insert(
            "cityStateZip".to_string(),
            Value::text(self.city_state_zip.clone()),
        );
        Value::Map(entries)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let entries = value.as_map()?;
        Some(Self {
            street: entries.get("street")?.as_text()?.to_string(),
            city_state_zip: entries.get("cityStateZip")?.as_text()?.to_string(),
        })
    }
}

/// Tagged union over the metadata kinds the lifecycle actually uses, with an
/// escape hatch for forward-compatible unknown keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Location(Address),
    ImageRef(String),
    FreeformText(String),
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: MetadataValue,
}

impl MetadataEntry {
    pub fn location(key: impl Into<String>, address: Address) -> Self {
        Self {
            key: key.into(),
            value: MetadataValue::Location(address),
        }
    }

    pub fn image(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: MetadataValue::ImageRef(url.into()),
        }
    }

    pub fn text(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: MetadataValue::FreeformText(text.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        match &self.value {
            MetadataValue::Location(address) => address.to_value(),
            MetadataValue::ImageRef(url) => Value::text(url.clone()),
            MetadataValue::FreeformText(text) => Value::text(text.clone()),
            MetadataValue::Other(value) => value.clone(),
        }
    }

    /// Classify a raw tree value by its key: addresses come back as
    /// `Location`, image-keyed strings as `ImageRef`, other strings as
    /// `FreeformText`, anything else through the escape hatch.
    pub fn from_value(key: &str, value: &Value) -> Self {
        let decoded = if let Some(address) = Address::from_value(value) {
            MetadataValue::Location(address)
        } else if let Some(text) = value.as_text() {
            if key == "image" || key == "confirmationImage" {
                MetadataValue::ImageRef(text.to_string())
            } else {
                MetadataValue::FreeformText(text.to_string())
            }
        } else {
            MetadataValue::Other(value.clone())
        };
        Self {
            key: key.to_string(),
            value: decoded,
        }
    }
}

fn metadata_to_value(metadata: &[MetadataEntry]) -> Value {
    let mut entries = std::collections::BTreeMap::new();
    for entry in metadata {
        entries.insert(entry.key.clone(), entry.to_value());
    }
    Value::Map(entries)
}

fn metadata_from_value(value: Option<&Value>) -> Vec<MetadataEntry> {
    let Some(entries) = value.and_then(|v| v.as_map()) else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|(key, value)| MetadataEntry::from_value(key, value))
        .collect()
}

/// One append-only update record, keyed in the tree by its millisecond
/// timestamp. Never reordered or edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackableUpdate {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub metadata: Vec<MetadataEntry>,
    pub user_did: String,
    pub user_name: String,
}

impl TrackableUpdate {
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn to_value(&self) -> Value {
        let mut entries = std::collections::BTreeMap::new();
        entries.insert(
            "timestamp".to_string(),
            Value::text(self.timestamp.to_rfc3339()),
        );
        entries.insert("message".to_string(), Value::text(self.message.clone()));
        entries.insert("metadata".to_string(), metadata_to_value(&self.metadata));
        entries.insert("userDid".to_string(), Value::text(self.user_did.clone()));
        entries.insert("userName".to_string(), Value::text(self.user_name.clone()));
        Value::Map(entries)
    }

    pub fn from_value(value: &Value) -> Result<Self, StoreError> {
        let entries = value
            .as_map()
            .ok_or_else(|| StoreError::InvalidData("update is not a map".into()))?;
        let timestamp_text = entries
            .get("timestamp")
            .and_then(|v| v.as_text())
            .ok_or_else(|| StoreError::InvalidData("update missing timestamp".into()))?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp_text)
            .map_err(|e| StoreError::InvalidData(format!("bad update timestamp: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            timestamp,
            message: entries
                .get("message")
                .and_then(|v| v.as_text())
                .unwrap_or_default()
                .to_string(),
            metadata: metadata_from_value(entries.get("metadata")),
            user_did: entries
                .get("userDid")
                .and_then(|v| v.as_text())
                .unwrap_or_default()
                .to_string(),
            user_name: entries
                .get("userName")
                .and_then(|v| v.as_text())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// A donation as read out of its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trackable {
    pub did: String,
    pub name: String,
    pub image: Option<String>,
    pub status: TrackableStatus,
    pub driver: Option<String>,
    pub metadata: Vec<MetadataEntry>,
    pub updates: Vec<TrackableUpdate>,
}

impl Trackable {
    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        let name = doc
            .resolve_data(NAME_PATH)
            .and_then(|v| v.as_text())
            .ok_or_else(|| StoreError::InvalidData(format!("{} has no name", doc.did)))?
            .to_string();
        let status_text = doc
            .resolve_data(STATUS_PATH)
            .and_then(|v| v.as_text())
            .ok_or_else(|| StoreError::InvalidData(format!("{} has no status", doc.did)))?;

        let mut updates: Vec<(i64, TrackableUpdate)> = Vec::new();
        if let Some(entries) = doc.resolve_data(UPDATES_PATH).and_then(|v| v.as_map()) {
            for (key, value) in entries {
                let ms: i64 = key.parse().map_err(|_| {
                    StoreError::InvalidData(format!("bad update key {key:?} in {}", doc.did))
                })?;
                updates.push((ms, TrackableUpdate::from_value(value)?));
            }
        }
        updates.sort_by_key(|(ms, _)| *ms);

        Ok(Self {
            did: doc.did.clone(),
            name,
            image: doc
                .resolve_data(IMAGE_PATH)
                .and_then(|v| v.as_text())
                .map(str::to_string),
            status: TrackableStatus::parse(status_text)?,
            driver: doc
                .resolve_data(DRIVER_PATH)
                .and_then(|v| v.as_text())
                .map(str::to_string),
            metadata: metadata_from_value(doc.resolve_data(METADATA_PATH)),
            updates: updates.into_iter().map(|(_, u)| u).collect(),
        })
    }

    /// The most recent update, by timestamp key.
    pub fn last_update(&self) -> Option<&TrackableUpdate> {
        self.updates.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_is_forward_only() {
        use TrackableStatus::*;
        assert!(Created.can_advance_to(Published));
        assert!(Published.can_advance_to(Accepted));
        assert!(Accepted.can_advance_to(PickedUp));
        assert!(PickedUp.can_advance_to(Delivered));

        assert!(!Published.can_advance_to(Published));
        assert!(!Accepted.can_advance_to(Published));
        assert!(!Published.can_advance_to(PickedUp));
        assert!(!Delivered.can_advance_to(Created));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            TrackableStatus::Created,
            TrackableStatus::Published,
            TrackableStatus::Accepted,
            TrackableStatus::PickedUp,
            TrackableStatus::Delivered,
        ] {
            assert_eq!(TrackableStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TrackableStatus::parse("Teleported").is_err());
    }

    #[test]
    fn metadata_classification_by_key() {
        let address = Address {
            street: "1 Elm".into(),
            city_state_zip: "X, NJ 00000".into(),
        };
        let location = MetadataEntry::from_value("location", &address.to_value());
        assert!(matches!(location.value, MetadataValue::Location(_)));

        let image = MetadataEntry::from_value("confirmationImage", &Value::text("img://x"));
        assert!(matches!(image.value, MetadataValue::ImageRef(_)));

        let note = MetadataEntry::from_value("instructions", &Value::text("ring the bell"));
        assert!(matches!(note.value, MetadataValue::FreeformText(_)));

        let odd = MetadataEntry::from_value("weight", &Value::Int(12));
        assert!(matches!(odd.value, MetadataValue::Other(_)));
    }
}
