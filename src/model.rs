//! The message set from spec.md §6, plus [`Payload`], the explicit,
//! process-wide message registry that replaces the original's
//! reflection-based `messageRegistry` (`pkg/proto/message.go`). Each
//! concrete type is matched by name in [`Payload::decode`] instead of being
//! looked up via `reflect.Type`; this is the "tagged-variant enum" the
//! original's redesign notes call out as preferred.

use serde::{Deserialize, Serialize};

use crate::error::PtunError;
use crate::nat::{AnalyzeResult, DetectResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct LoginRequest {
    pub name: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoginResponse {
    pub name: String,
    #[serde(default)]
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeerListRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerListResponse {
    pub peer_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerNatInfo {
    pub name: String,
    pub mapping: DetectResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct DetectNatRequest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote: Option<PeerNatInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectNatResponse {
    pub ip: String,
    pub local: PeerNatInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PunchRequest {
    pub local: PeerNatInfo,
    pub local_ip: String,
    pub peer_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PunchResponse {
    pub local_ip: String,
    pub remote_ip: String,
    pub local_nat: AnalyzeResult,
    pub remote_nat: AnalyzeResult,
    pub remote_peer_name: String,
}

macro_rules! payload_enum {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        #[derive(Debug, Clone, Serialize)]
        #[serde(untagged)]
        pub enum Payload {
            Empty,
            $($variant($ty)),+
        }

        impl Payload {
            pub const EMPTY_KEY: &'static str = "Empty";

            pub fn key(&self) -> &'static str {
                match self {
                    Payload::Empty => Self::EMPTY_KEY,
                    $(Payload::$variant(_) => stringify!($variant)),+
                }
            }

            /// Resolves `key` against the registry and decodes `raw` (a JSON
            /// text fragment) into the matching concrete type. Unknown keys
            /// are `NoHandler`, mirroring the original's
            /// `messageRegistry[key]` lookup miss.
            pub fn decode(key: &str, raw: &str) -> crate::error::Result<Payload> {
                Ok(match key {
                    "Empty" => Payload::Empty,
                    $(stringify!($variant) => Payload::$variant(serde_json::from_str(raw)?)),+,
                    other => return Err(PtunError::NoHandler(other.to_string())),
                })
            }
        }

        $(
            impl TryFrom<Payload> for $ty {
                type Error = PtunError;
                fn try_from(p: Payload) -> Result<Self, Self::Error> {
                    match p {
                        Payload::$variant(v) => Ok(v),
                        other => Err(PtunError::NoHandler(format!(
                            "expected {}, got {}",
                            stringify!($ty),
                            other.key()
                        ))),
                    }
                }
            }

            impl From<$ty> for Payload {
                fn from(v: $ty) -> Payload {
                    Payload::$variant(v)
                }
            }
        )+
    };
}

payload_enum! {
    LoginRequest => LoginRequest,
    LoginResponse => LoginResponse,
    PeerListRequest => PeerListRequest,
    PeerListResponse => PeerListResponse,
    DetectNatRequest => DetectNatRequest,
    DetectNatResponse => DetectNatResponse,
    PunchRequest => PunchRequest,
    PunchResponse => PunchResponse,
}
