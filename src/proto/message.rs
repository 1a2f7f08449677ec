//! The typed envelope: `{ Key, Id, DataRaw }` for requests, with `Code` and
//! `Message` added for responses. Decoding resolves `Key` against the
//! [`crate::model::Payload`] registry instead of runtime reflection (see
//! DESIGN.md — "reflection-driven message registry").

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{PtunError, Result};
use crate::model::Payload;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// The process-wide, strictly increasing request id counter.
pub fn next_id() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Serialize, Deserialize)]
struct WireRequest<'a> {
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Id")]
    id: u32,
    #[serde(rename = "DataRaw", skip_serializing_if = "Option::is_none")]
    data_raw: Option<Box<RawValue>>,
}

#[derive(Serialize, Deserialize)]
struct WireResponse<'a> {
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Id")]
    id: u32,
    #[serde(rename = "Code")]
    code: i32,
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "DataRaw", skip_serializing_if = "Option::is_none")]
    data_raw: Option<Box<RawValue>>,
}

pub struct Request {
    pub key: &'static str,
    pub id: u32,
    pub payload: Payload,
}

impl Request {
    pub fn new(payload: Payload) -> Self {
        Self {
            key: payload.key(),
            id: next_id(),
            payload,
        }
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let data_raw = RawValue::from_string(serde_json::to_string(&self.payload)?)?;
        let wire = WireRequest {
            key: self.key,
            id: self.id,
            data_raw: Some(data_raw),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(body: &[u8]) -> Result<Request> {
        let wire: WireRequest = serde_json::from_slice(body)?;
        let payload = match &wire.data_raw {
            Some(raw) => Payload::decode(wire.key, raw.get())?,
            None => Payload::decode(wire.key, "null")?,
        };
        Ok(Request {
            key: payload.key(),
            id: wire.id,
            payload,
        })
    }
}

pub struct Response {
    pub key: &'static str,
    pub id: u32,
    pub code: i32,
    pub message: String,
    pub payload: Payload,
}

impl Response {
    pub fn success(id: u32, payload: Payload) -> Self {
        Self {
            key: payload.key(),
            id,
            code: 0,
            message: "success".into(),
            payload,
        }
    }

    pub fn failure(id: u32, code: i32, message: impl Into<String>) -> Self {
        Self {
            key: Payload::EMPTY_KEY,
            id,
            code,
            message: message.into(),
            payload: Payload::Empty,
        }
    }

    pub fn reply_to(req: &Request, code: i32, message: impl Into<String>, payload: Payload) -> Self {
        Self {
            key: payload.key(),
            id: req.id,
            code,
            message: message.into(),
            payload,
        }
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let data_raw = RawValue::from_string(serde_json::to_string(&self.payload)?)?;
        let wire = WireResponse {
            key: self.key,
            id: self.id,
            code: self.code,
            message: self.message.clone(),
            data_raw: Some(data_raw),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decodes a response. `Code < 0` is a failure response; callers that
    /// need the `PtunError` form should check `.code` themselves, as the
    /// error text is carried in `.message` rather than raised here — the
    /// original raises on decode, but that collapses "got a failure
    /// response" and "couldn't decode the response" into one error type.
    pub fn decode(body: &[u8]) -> Result<Response> {
        let wire: WireResponse = serde_json::from_slice(body)?;
        let payload = match &wire.data_raw {
            Some(raw) => Payload::decode(wire.key, raw.get())?,
            None => Payload::decode(wire.key, "null")?,
        };
        Ok(Response {
            key: payload.key(),
            id: wire.id,
            code: wire.code,
            message: wire.message,
            payload,
        })
    }
}

/// Returns `Err` iff `resp.payload` is not of type `T`.
pub fn payload_of<T: TryFrom<Payload, Error = PtunError>>(payload: Payload) -> Result<T> {
    T::try_from(payload)
}
