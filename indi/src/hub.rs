//! Per-device event fan-out
//!
//! Push consumers (a websocket per open device page, typically) subscribe by
//! device name. The hub registers itself as a client listener and republishes
//! each event as a [`DeviceEventMessage`] to that device's subscribers only.

use crate::client::{IndiClient, IndiEvent, ListenerId};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Payload delivered to device subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEventMessage {
    pub event: String,
    pub device: String,
    pub data: Value,
}

impl DeviceEventMessage {
    /// Build the message for an event, or `None` when it has no device or no payload
    pub fn from_event(event: &IndiEvent) -> Option<Self> {
        let device = event.device()?.to_string();
        let data = match event {
            IndiEvent::PropertyDefined { property, .. }
            | IndiEvent::PropertyUpdated { property, .. } => match serde_json::to_value(property) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Failed to serialize {}.{}: {}", device, property.name, e);
                    return None;
                }
            },
            IndiEvent::PropertyDeleted { name, .. } => json!({ "name": name }),
            IndiEvent::Message {
                message, timestamp, ..
            } => json!({ "message": message, "timestamp": timestamp }),
            IndiEvent::BlobReceived {
                property,
                element,
                format,
                size,
                ..
            } => json!({
                "property": property,
                "element": element,
                "format": format,
                "size": size,
            }),
            IndiEvent::DeviceDeleted { .. } | IndiEvent::ConnectionStateChanged { .. } => {
                return None
            }
        };
        Some(Self {
            event: event.kind().to_string(),
            device,
            data,
        })
    }
}

/// Fan-out of client events to per-device subscribers
pub struct DeviceEventHub {
    channels: RwLock<HashMap<String, broadcast::Sender<DeviceEventMessage>>>,
    capacity: usize,
}

impl Default for DeviceEventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl DeviceEventHub {
    /// Create a hub whose per-device channels buffer `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to the events of one device
    pub fn subscribe(&self, device: &str) -> broadcast::Receiver<DeviceEventMessage> {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        let receiver = channels
            .entry(device.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        tracing::info!(
            "Subscriber added for device: {} (total: {})",
            device,
            channels.get(device).map(|c| c.receiver_count()).unwrap_or(0)
        );
        receiver
    }

    /// Deliver an event to its device's subscribers; returns how many received it
    pub fn publish(&self, event: &IndiEvent) -> usize {
        let device = match event.device() {
            Some(d) => d,
            None => return 0,
        };

        let sender = self
            .channels
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(device)
            .cloned();
        let sender = match sender {
            Some(sender) => sender,
            None => return 0,
        };
        if sender.receiver_count() == 0 {
            self.prune(device);
            return 0;
        }

        match DeviceEventMessage::from_event(event) {
            Some(message) => sender.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Register the hub as a listener on `client`
    pub fn attach(self: &Arc<Self>, client: &IndiClient) -> ListenerId {
        let hub = Arc::clone(self);
        let id = client.add_listener(move |event| {
            hub.publish(event);
            Ok(())
        });
        tracing::info!("INDI event listener registered with device event hub");
        id
    }

    /// Subscribers of one device, or of all devices when `device` is `None`
    pub fn connection_count(&self, device: Option<&str>) -> usize {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        match device {
            Some(device) => channels.get(device).map(|c| c.receiver_count()).unwrap_or(0),
            None => channels.values().map(|c| c.receiver_count()).sum(),
        }
    }

    fn prune(&self, device: &str) {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        if channels
            .get(device)
            .map(|c| c.receiver_count() == 0)
            .unwrap_or(false)
        {
            channels.remove(device);
            tracing::debug!("Dropped idle event channel for {}", device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IndiPermission, IndiProperty, IndiPropertyState, IndiPropertyType};

    fn property(device: &str) -> IndiProperty {
        IndiProperty {
            device: device.to_string(),
            name: "CCD_TEMPERATURE".to_string(),
            label: "Temperature".to_string(),
            group: "Main Control".to_string(),
            property_type: IndiPropertyType::Number,
            state: IndiPropertyState::Ok,
            perm: IndiPermission::ReadWrite,
            rule: None,
            timestamp: None,
            elements: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_device() {
        let hub = DeviceEventHub::default();
        let mut ccd = hub.subscribe("CCD Simulator");
        let mut mount = hub.subscribe("Telescope Simulator");

        let delivered = hub.publish(&IndiEvent::PropertyUpdated {
            device: "CCD Simulator".to_string(),
            property: property("CCD Simulator"),
        });
        assert_eq!(delivered, 1);

        let message = ccd.recv().await.unwrap();
        assert_eq!(message.event, "property_updated");
        assert_eq!(message.device, "CCD Simulator");
        assert_eq!(message.data["name"], "CCD_TEMPERATURE");
        assert_eq!(message.data["type"], "number");
        assert!(mount.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_without_device_or_payload_are_dropped() {
        let hub = DeviceEventHub::default();
        let mut rx = hub.subscribe("CCD Simulator");

        assert_eq!(
            hub.publish(&IndiEvent::Message {
                device: None,
                message: "server wide".to_string(),
                timestamp: "2024-01-01T00:00:00".to_string(),
            }),
            0
        );
        assert_eq!(
            hub.publish(&IndiEvent::DeviceDeleted {
                device: "CCD Simulator".to_string()
            }),
            0
        );
        assert_eq!(
            hub.publish(&IndiEvent::PropertyDeleted {
                device: "Nobody".to_string(),
                name: "X".to_string(),
            }),
            0
        );
        assert!(rx.try_recv().is_err());

        hub.publish(&IndiEvent::Message {
            device: Some("CCD Simulator".to_string()),
            message: "Cooler on".to_string(),
            timestamp: "2024-01-01T00:00:00".to_string(),
        });
        let message = rx.recv().await.unwrap();
        assert_eq!(message.data, json!({"message": "Cooler on", "timestamp": "2024-01-01T00:00:00"}));
    }

    #[tokio::test]
    async fn test_connection_counts_and_pruning() {
        let hub = DeviceEventHub::default();
        let a = hub.subscribe("CCD Simulator");
        let _b = hub.subscribe("CCD Simulator");
        let c = hub.subscribe("Focuser Simulator");
        assert_eq!(hub.connection_count(Some("CCD Simulator")), 2);
        assert_eq!(hub.connection_count(None), 3);
        assert_eq!(hub.connection_count(Some("Nobody")), 0);

        drop(a);
        assert_eq!(hub.connection_count(Some("CCD Simulator")), 1);

        drop(c);
        hub.publish(&IndiEvent::PropertyDeleted {
            device: "Focuser Simulator".to_string(),
            name: "X".to_string(),
        });
        assert_eq!(hub.connection_count(None), 1);
    }

    #[tokio::test]
    async fn test_blob_payload_omits_data() {
        let message = DeviceEventMessage::from_event(&IndiEvent::BlobReceived {
            device: "CCD Simulator".to_string(),
            property: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            size: 2880,
            data: vec![0; 2880],
        })
        .unwrap();
        assert_eq!(message.event, "blob_received");
        assert_eq!(message.data["size"], 2880);
        assert!(message.data.get("data").is_none());
    }
}
