use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::TargetId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

/// Kind of content a secondary request fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "HTML")]
    Html,
    #[serde(rename = "JS")]
    Js,
    #[serde(rename = "CSS")]
    Css,
    Image,
    Other,
}

/// Whether the exchange carried session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Stateful,
    Stateless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Https,
    Quic,
    Tcp,
    Udp,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Html => "HTML",
            ResourceType::Js => "JS",
            ResourceType::Css => "CSS",
            ResourceType::Image => "Image",
            ResourceType::Other => "Other",
        }
    }
}

impl StateType {
    pub fn as_str(self) -> &'static str {
        match self {
            StateType::Stateful => "Stateful",
            StateType::Stateless => "Stateless",
        }
    }
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Quic => "QUIC",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }

    /// URL scheme used when a request is reconstructed from packets
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https | Protocol::Quic => "https",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

macro_rules! str_enum {
    ($ty:ident, $kind:literal, [$($variant:ident),+]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($ty::$variant.as_str()) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(UnknownVariant { kind: $kind, value: s.to_string() })
            }
        }
    };
}

str_enum!(ResourceType, "resource type", [Html, Js, Css, Image, Other]);
str_enum!(StateType, "state type", [Stateful, Stateless]);
str_enum!(Protocol, "protocol", [Http, Https, Quic, Tcp, Udp]);

/// A secondary fetch observed while one check ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsequentRequest {
    /// Check that observed this request
    pub check_id: Uuid,
    pub target_id: TargetId,
    pub url: String,
    pub ip: Option<IpAddr>,
    pub resource_type: ResourceType,
    pub state_type: StateType,
    pub protocol: Protocol,
    /// First sighting within the capture window
    pub timestamp: DateTime<Utc>,
}
