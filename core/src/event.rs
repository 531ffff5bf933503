use serde::{Deserialize, Serialize};

use crate::reference::ImageReference;

/// What happened to an image-tag object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// Change notification for one image-tag object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTagEvent {
    /// Event kind
    pub kind: EventKind,

    /// The tag the event is about
    pub reference: ImageReference,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ImageTagEvent {
    /// Create a new event
    pub fn new(kind: EventKind, reference: ImageReference) -> Self {
        Self {
            kind,
            reference,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn added(reference: ImageReference) -> Self {
        Self::new(EventKind::Added, reference)
    }

    pub fn modified(reference: ImageReference) -> Self {
        Self::new(EventKind::Modified, reference)
    }

    pub fn deleted(reference: ImageReference) -> Self {
        Self::new(EventKind::Deleted, reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constructors() {
        let reference = ImageReference::new("ci", "tools", "latest");
        assert_eq!(ImageTagEvent::added(reference.clone()).kind, EventKind::Added);
        assert_eq!(ImageTagEvent::modified(reference.clone()).kind, EventKind::Modified);
        assert_eq!(ImageTagEvent::deleted(reference).kind, EventKind::Deleted);
    }

    #[test]
    fn test_event_serializes_lowercase_kind() {
        let event = ImageTagEvent::added(ImageReference::new("ci", "tools", "latest"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "added");
        assert_eq!(json["reference"]["tag"], "latest");
    }
}
