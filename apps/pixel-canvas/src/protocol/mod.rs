use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::model::{Color, Identity, NewPixel, Pixel};

pub const PIXEL_TABLE: &str = "pixel";
pub const PIXEL_QUERY: &str = "SELECT * FROM pixel";
pub const SEND_PIXEL: &str = "sendPixel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerStatus {
    Committed,
    Failed,
    OutOfEnergy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    IdentityToken {
        identity: Identity,
        token: String,
    },
    SubscriptionApplied {
        request_id: RequestId,
        query: String,
    },
    SubscriptionError {
        request_id: RequestId,
        error: String,
    },
    RowInsert {
        table: String,
        row: Value,
    },
    RowDelete {
        table: String,
        row: Value,
    },
    ReducerResult {
        request_id: RequestId,
        reducer: String,
        status: ReducerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        request_id: RequestId,
        query: String,
    },
    CallReducer {
        request_id: RequestId,
        reducer: String,
        args: Value,
    },
}

impl ClientMessage {
    pub fn send_pixel(request_id: RequestId, pixel: &NewPixel) -> Result<Self, ProtocolError> {
        Ok(ClientMessage::CallReducer {
            request_id,
            reducer: SEND_PIXEL.to_string(),
            args: serde_json::to_value(pixel)?,
        })
    }
}

/// Row shape of the pixel table. Older rows were stored without a sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRow {
    pub x: i64,
    pub y: i64,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Identity>,
}

impl PixelRow {
    pub fn from_value(row: &Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(row.clone())?)
    }

    /// Unparsable colors keep their cell and paint black; the row is still authoritative.
    pub fn into_pixel(self) -> Pixel {
        let color = match Color::parse(&self.color) {
            Ok(color) => color,
            Err(err) => {
                tracing::warn!(
                    target = "pixel_canvas::protocol",
                    x = self.x,
                    y = self.y,
                    error = %err,
                    "pixel row carries an invalid color; using fallback"
                );
                Color::BLACK
            }
        };
        Pixel::new(
            self.x,
            self.y,
            color,
            self.sender.unwrap_or(Identity::ANONYMOUS),
        )
    }
}

impl From<&Pixel> for PixelRow {
    fn from(pixel: &Pixel) -> Self {
        Self {
            x: pixel.x,
            y: pixel.y,
            color: pixel.color.to_string(),
            sender: Some(pixel.sender),
        }
    }
}

impl From<NewPixel> for PixelRow {
    fn from(pixel: NewPixel) -> Self {
        Self {
            x: pixel.x,
            y: pixel.y,
            color: pixel.color.to_string(),
            sender: Some(pixel.sender),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_client_message(message: &ClientMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::from)
}

pub fn decode_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::from)
}
