//! INDI Protocol Client
//!
//! Speaks the INDI XML wire protocol to a running `indiserver` and keeps a
//! live model of every device property it announces.
//!
//! ## Features
//!
//! - Tag-balance frame scanning of the XML stream
//! - Property model with per-device dirty tracking
//! - Number formatting including INDI sexagesimal (`%m`) specifiers
//! - Validated property writes with HTTP-mappable errors
//! - Listener callbacks, broadcast subscriptions and a per-device event hub
//! - Auto-connect of newly discovered devices

mod client;
mod error;
pub mod format;
pub mod framing;
pub mod hub;
mod model;
mod protocol;
pub mod xml;

pub use client::*;
pub use error::{IndiError, IndiResult, SetPropertyError};
pub use format::format_number;
pub use hub::{DeviceEventHub, DeviceEventMessage};
pub use model::{IndiElement, IndiProperty, NumberLimits, PropertyModel};
pub use protocol::{standard_properties, INDI_PROTOCOL_VERSION};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndiPropertyType {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl IndiPropertyType {
    /// Type named by a vector tag such as `defNumberVector` or `setBLOBVector`
    pub fn from_vector_tag(tag: &str) -> Option<Self> {
        let kind = tag
            .strip_prefix("def")
            .or_else(|| tag.strip_prefix("set"))
            .or_else(|| tag.strip_prefix("new"))?
            .strip_suffix("Vector")?;
        match kind {
            "Text" => Some(IndiPropertyType::Text),
            "Number" => Some(IndiPropertyType::Number),
            "Switch" => Some(IndiPropertyType::Switch),
            "Light" => Some(IndiPropertyType::Light),
            "BLOB" => Some(IndiPropertyType::Blob),
            _ => None,
        }
    }

    /// Tag fragment used on the wire (`Text`, `Number`, `Switch`, `Light`, `BLOB`)
    pub fn tag_fragment(&self) -> &'static str {
        match self {
            IndiPropertyType::Text => "Text",
            IndiPropertyType::Number => "Number",
            IndiPropertyType::Switch => "Switch",
            IndiPropertyType::Light => "Light",
            IndiPropertyType::Blob => "BLOB",
        }
    }
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndiPropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl IndiPropertyState {
    /// Parse a wire state, falling back to `Idle`
    pub fn parse(s: &str) -> Self {
        match s {
            "Ok" => IndiPropertyState::Ok,
            "Busy" => IndiPropertyState::Busy,
            "Alert" => IndiPropertyState::Alert,
            _ => IndiPropertyState::Idle,
        }
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IndiPermission {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "wo")]
    WriteOnly,
    #[default]
    #[serde(rename = "rw")]
    ReadWrite,
}

impl IndiPermission {
    /// Parse a wire permission, falling back to read-write
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ro" => IndiPermission::ReadOnly,
            "wo" => IndiPermission::WriteOnly,
            _ => IndiPermission::ReadWrite,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, IndiPermission::WriteOnly | IndiPermission::ReadWrite)
    }
}

/// Selection rule of a switch vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

impl SwitchRule {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OneOfMany" => Some(SwitchRule::OneOfMany),
            "AtMostOne" => Some(SwitchRule::AtMostOne),
            "AnyOfMany" => Some(SwitchRule::AnyOfMany),
            _ => None,
        }
    }
}

/// Client timing and behaviour settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for the initial TCP connection (default: 10 seconds)
    pub connection_timeout_secs: u64,
    /// Grace period after connecting for initial definitions (default: 1000ms)
    pub initial_sync_ms: u64,
    /// Turn on the CONNECTION switch of newly defined devices (default: true)
    pub auto_connect: bool,
    /// Delay before auto-connecting a device (default: 2000ms)
    pub auto_connect_delay_ms: u64,
    /// Poll interval for `wait_for_device` (default: 100ms)
    pub device_poll_interval_ms: u64,
    /// Protocol version sent with `getProperties`
    pub protocol_version: String,
    /// Capacity of the broadcast event channel (default: 256)
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 10,
            initial_sync_ms: 1000,
            auto_connect: true,
            auto_connect_delay_ms: 2000,
            device_poll_interval_ms: 100,
            protocol_version: INDI_PROTOCOL_VERSION.to_string(),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn initial_sync(&self) -> Duration {
        Duration::from_millis(self.initial_sync_ms)
    }

    pub fn auto_connect_delay(&self) -> Duration {
        Duration::from_millis(self.auto_connect_delay_ms)
    }

    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_interval_ms)
    }
}
