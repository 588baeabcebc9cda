use crate::error::{LiveError, Result};
use crate::model::Filter;
use serde::Serialize;
use serde_json::Value;

const HANDSHAKE_PREFIX: &str = "ACK:";

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// First frame on a connection: the id the server assigned to it.
    Handshake(String),
    Data(Value),
}

pub fn parse_frame(text: &str) -> Result<Frame> {
    let text = text.trim();
    if let Some(id) = text.strip_prefix(HANDSHAKE_PREFIX) {
        let id = id.trim();
        if id.is_empty() {
            return Err(LiveError::Malformed("handshake without connection id".into()));
        }
        return Ok(Frame::Handshake(id.to_string()));
    }
    Ok(Frame::Data(serde_json::from_str(text)?))
}

/// Full replacement of the server-side filter set for one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterUpdate<'a> {
    pub connection_id: &'a str,
    pub filters: &'a [Filter],
    pub overwrite: bool,
}

impl<'a> FilterUpdate<'a> {
    pub fn replace(connection_id: &'a str, filters: &'a [Filter]) -> Self {
        Self {
            connection_id,
            filters,
            overwrite: true,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
