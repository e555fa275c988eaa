//! Core value types shared by the replica, input and render layers.
//!
//! Coordinates are plain signed integers: the canvas is unbounded and the
//! surface a frame is rendered into decides what is visible.

pub mod palette;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use palette::{Palette, SharedSelection};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid color '{0}': expected #RRGGBB")]
    InvalidColor(String),
    #[error("invalid identity '{0}': expected 64 hex digits")]
    InvalidIdentity(String),
}

/// Opaque principal handle issued by the authoritative store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity([u8; 32]);

impl Identity {
    /// Stand-in sender for rows that were stored without one.
    pub const ANONYMOUS: Identity = Identity([0; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(raw: &str) -> Result<Self, ModelError> {
        let trimmed = raw.trim().trim_start_matches("0x");
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(trimmed, &mut bytes)
            .map_err(|_| ModelError::InvalidIdentity(raw.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex digits, enough to tell participants apart in logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for Identity {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::from_hex(&value)
    }
}

impl From<Identity> for String {
    fn from(value: Identity) -> Self {
        value.to_hex()
    }
}

/// A `#RRGGBB` color. Parsing is case-insensitive; display is canonical upper case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0x00, 0x00, 0x00);
    pub const WHITE: Color = Color::rgb(0xFF, 0xFF, 0xFF);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let invalid = || ModelError::InvalidColor(raw.to_string());
        let digits = raw.trim().strip_prefix('#').ok_or_else(invalid)?;
        if digits.len() != 6 {
            return Err(invalid());
        }
        let mut rgb = [0u8; 3];
        hex::decode_to_slice(digits, &mut rgb).map_err(|_| invalid())?;
        Ok(Self::rgb(rgb[0], rgb[1], rgb[2]))
    }

    pub fn to_rgba(self) -> [u8; 4] {
        [self.r, self.g, self.b, 0xFF]
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

impl FromStr for Color {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::parse(s)
    }
}

impl TryFrom<String> for Color {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Color::parse(&value)
    }
}

impl From<Color> for String {
    fn from(value: Color) -> Self {
        value.to_string()
    }
}

/// Unique index of a grid cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinateKey {
    pub x: i64,
    pub y: i64,
}

impl CoordinateKey {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

/// One live cell of the shared canvas as delivered by the authoritative store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pixel {
    pub x: i64,
    pub y: i64,
    pub color: Color,
    pub sender: Identity,
}

impl Pixel {
    pub fn new(x: i64, y: i64, color: Color, sender: Identity) -> Self {
        Self {
            x,
            y,
            color,
            sender,
        }
    }

    pub fn key(&self) -> CoordinateKey {
        CoordinateKey::new(self.x, self.y)
    }
}

/// Arguments of the `sendPixel` mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPixel {
    pub x: i64,
    pub y: i64,
    pub color: Color,
    pub sender: Identity,
}
