//! Canvas events — classification of inbound board frames.
//!
//! DESIGN
//! ======
//! Clients send JSON envelopes of the form
//! `{"type", "userId", "boardId", "payload", "timestamp"}`. Only JSON
//! objects are envelopes. The classifier reads `type` off the object first,
//! so unknown discriminants fail without decoding the body, then decodes the
//! envelope into the concrete payload variant.
//!
//! The relay never depends on a successful parse: raw bytes are forwarded
//! verbatim either way. Classification only decides whether a frame is
//! staged in the durable buffer, and that decision is made against
//! `ARCHIVAL_ACTIONS` alone.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

// =============================================================================
// ARCHIVAL ALLOW-LIST
// =============================================================================

/// Event types that are buffered and later archived. Everything else is
/// broadcast-only.
pub const ARCHIVAL_ACTIONS: &[&str] = &[EventKind::Draw.as_str()];

/// Whether an action string belongs to the archival allow-list.
#[must_use]
pub fn is_archival_action(action: &str) -> bool {
    ARCHIVAL_ACTIONS.contains(&action)
}

// =============================================================================
// TYPES
// =============================================================================

/// Discriminant of a canvas event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Draw,
    CursorMove,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draw => "draw",
            Self::CursorMove => "cursor_move",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "draw" => Some(Self::Draw),
            "cursor_move" => Some(Self::CursorMove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One freehand stroke.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct DrawPayload {
    pub points: Vec<Point>,
    pub color: String,
    pub thickness: i64,
}

/// Pointer position of a peer. Ephemeral.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct CursorMovePayload {
    pub x: i64,
    pub y: i64,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Draw(DrawPayload),
    CursorMove(CursorMovePayload),
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasEvent {
    /// User id claimed by the client. The authenticated id is what gets stored.
    pub user_id: String,
    pub board_id: String,
    pub payload: Payload,
    /// Client timestamp in milliseconds since the Unix epoch, `0` if absent.
    pub timestamp: i64,
}

impl CanvasEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self.payload {
            Payload::Draw(_) => EventKind::Draw,
            Payload::CursorMove(_) => EventKind::CursorMove,
        }
    }

    /// Action string recorded in the buffer and archive.
    #[must_use]
    pub fn action(&self) -> &'static str {
        self.kind().as_str()
    }

    #[must_use]
    pub fn is_archival(&self) -> bool {
        is_archival_action(self.action())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("unknown event type: {0:?}")]
    UnknownType(String),
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

// =============================================================================
// PARSE
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<P> {
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    board_id: String,
    #[serde(default)]
    payload: P,
    #[serde(default)]
    timestamp: i64,
}

fn malformed(msg: &str) -> ClassifyError {
    ClassifyError::Malformed(serde::de::Error::custom(msg))
}

/// Classify a raw frame.
///
/// # Errors
///
/// Returns `UnknownType` when the discriminant is missing or not recognized,
/// and `Malformed` when the bytes are not a JSON object, `type` is not a
/// string, or the body does not match the discriminant's shape.
pub fn parse(bytes: &[u8]) -> Result<CanvasEvent, ClassifyError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(fields) = &value else {
        return Err(malformed("frame is not a JSON object"));
    };

    let tag = match fields.get("type") {
        None | Some(Value::Null) => "",
        Some(Value::String(tag)) => tag.as_str(),
        Some(_) => return Err(malformed("`type` is not a string")),
    };
    let Some(kind) = EventKind::from_tag(tag) else {
        return Err(ClassifyError::UnknownType(tag.to_owned()));
    };

    if fields.get("payload").is_some_and(|p| !p.is_object()) {
        return Err(malformed("`payload` is not an object"));
    }

    match kind {
        EventKind::Draw => decode(value, Payload::Draw),
        EventKind::CursorMove => decode(value, Payload::CursorMove),
    }
}

fn decode<P>(value: Value, wrap: fn(P) -> Payload) -> Result<CanvasEvent, ClassifyError>
where
    P: DeserializeOwned + Default,
{
    let envelope: Envelope<P> = serde_json::from_value(value)?;
    Ok(CanvasEvent {
        user_id: envelope.user_id,
        board_id: envelope.board_id,
        payload: wrap(envelope.payload),
        timestamp: envelope.timestamp,
    })
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
