//! Serialization envelope for call and event payloads.
//!
//! A [`Payload`] is the boundary between in-process values and the channel's
//! textual wire form. It carries an explicit presence flag next to the JSON
//! text of the value, so "no value at all" stays distinguishable from "a
//! value whose JSON text is `null`" even under transports that drop absent
//! fields.
//!
//! The value is encoded to JSON text exactly once, on the side that produced
//! it. The protocol messages embed that text as an opaque string; nothing
//! re-encodes the value in flight.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

/// An optionally-present serialized value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    // ---
    /// Explicit presence marker. `false` means "no value at all".
    present: bool,

    /// JSON text of the value when present. `"null"` is a *present* null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    json: Option<String>,
}

impl Payload {
    // ---

    /// The "no value" payload.
    pub fn absent() -> Self {
        // ---
        Self {
            present: false,
            json: None,
        }
    }

    /// Encode a value into a present payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the value cannot be represented as
    /// JSON.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        // ---
        Ok(Self {
            present: true,
            json: Some(serde_json::to_string(value)?),
        })
    }

    /// Whether this payload carries a value.
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Borrow the raw JSON text, if any.
    pub fn json_text(&self) -> Option<&str> {
        self.json.as_deref()
    }

    /// Decode the payload into a value, keeping absence visible.
    ///
    /// Returns `Ok(None)` for an absent payload and `Ok(Some(value))` for a
    /// present one; a present `null` decodes as `Some` of whatever `T` makes
    /// of `null`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the JSON text does not parse into
    /// `T`, or if a payload claims presence without carrying any text.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        // ---
        if !self.present {
            return Ok(None);
        }

        let text = self.json.as_deref().ok_or_else(|| {
            crate::Error::Serialization(<serde_json::Error as serde::de::Error>::custom(
                "present payload carries no JSON text",
            ))
        })?;

        Ok(Some(serde_json::from_str(text)?))
    }

    /// Decode the payload, treating absence as JSON `null`.
    ///
    /// This is the typed-handler view of optional input: `T = Option<_>`
    /// models "may be missing", while a non-optional `T` turns an absent
    /// payload into a serialization error.
    pub fn decode_or_null<T: DeserializeOwned>(&self) -> Result<T> {
        // ---
        let text = if self.present {
            self.json.as_deref().unwrap_or("null")
        } else {
            "null"
        };

        Ok(serde_json::from_str(text)?)
    }
}
