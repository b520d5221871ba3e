//! Live property model
//!
//! Holds every property the server has defined, keyed by device and then by
//! property name, plus the per-device dirty sets consumers drain when they
//! poll. The receive loop is the only writer; it feeds each decoded frame to
//! [`PropertyModel::apply`] and forwards the resulting events.

use crate::client::IndiEvent;
use crate::format::format_number;
use crate::xml::XmlElement;
use crate::{IndiPermission, IndiPropertyState, IndiPropertyType, SwitchRule};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Number element limits (min, max, step) and display format
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberLimits {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub format: Option<String>,
}

/// One element of a property vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndiElement {
    pub name: String,
    pub label: String,
    /// Raw value as sent by the server
    pub value: String,
    /// Display value; differs from `value` only for formatted numbers
    pub formatted_value: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub limits: Option<NumberLimits>,
}

impl IndiElement {
    fn set_value(&mut self, value: String) {
        self.formatted_value = match self.limits.as_ref().and_then(|l| l.format.as_deref()) {
            Some(format) => format_number(&value, format),
            None => value.clone(),
        };
        self.value = value;
    }
}

/// An INDI property vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndiProperty {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    #[serde(rename = "type")]
    pub property_type: IndiPropertyType,
    pub state: IndiPropertyState,
    pub perm: IndiPermission,
    pub rule: Option<SwitchRule>,
    pub timestamp: Option<String>,
    pub elements: Vec<IndiElement>,
}

impl IndiProperty {
    pub fn element(&self, name: &str) -> Option<&IndiElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn element_mut(&mut self, name: &str) -> Option<&mut IndiElement> {
        self.elements.iter_mut().find(|e| e.name == name)
    }

    /// Whether a switch element is currently on
    pub fn is_on(&self, element: &str) -> bool {
        self.element(element)
            .map(|e| e.value.eq_ignore_ascii_case("On"))
            .unwrap_or(false)
    }
}

/// Device properties and dirty sets as seen by one client
#[derive(Debug, Default)]
pub struct PropertyModel {
    devices: BTreeMap<String, BTreeMap<String, IndiProperty>>,
    dirty: HashMap<String, BTreeMap<String, DateTime<Utc>>>,
}

impl PropertyModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one complete protocol element, returning the events it raises.
    ///
    /// Tags the client does not consume are ignored.
    pub fn apply(&mut self, root: &XmlElement) -> Vec<IndiEvent> {
        let tag = root.name.as_str();
        let mut events = Vec::new();

        if tag.starts_with("def") {
            if let Some(property_type) = IndiPropertyType::from_vector_tag(tag) {
                self.define(root, property_type, &mut events);
            }
        } else if tag.starts_with("set") {
            if let Some(property_type) = IndiPropertyType::from_vector_tag(tag) {
                self.update(root, property_type, &mut events);
            }
        } else if tag == "delProperty" {
            self.delete(root, &mut events);
        } else if tag == "message" {
            events.push(message_event(root.attr("device"), &root.text, root.attr("timestamp")));
        } else {
            tracing::debug!("Ignoring INDI element <{}>", tag);
        }

        events
    }

    fn define(
        &mut self,
        root: &XmlElement,
        property_type: IndiPropertyType,
        events: &mut Vec<IndiEvent>,
    ) {
        let (device, name) = match (root.attr("device"), root.attr("name")) {
            (Some(device), Some(name)) => (device.to_string(), name.to_string()),
            _ => {
                tracing::warn!("<{}> without device or name, skipping", root.name);
                return;
            }
        };

        let elements = root
            .children
            .iter()
            .filter(|child| child.name.starts_with("def"))
            .filter_map(|child| {
                let element_name = child.attr("name")?.to_string();
                let limits = (property_type == IndiPropertyType::Number).then(|| NumberLimits {
                    min: child.attr("min").and_then(|s| s.trim().parse().ok()),
                    max: child.attr("max").and_then(|s| s.trim().parse().ok()),
                    step: child.attr("step").and_then(|s| s.trim().parse().ok()),
                    format: child.attr("format").map(str::to_string),
                });
                let mut element = IndiElement {
                    label: child.attr("label").unwrap_or(&element_name).to_string(),
                    name: element_name,
                    value: String::new(),
                    formatted_value: String::new(),
                    limits,
                };
                element.set_value(child.text.trim().to_string());
                Some(element)
            })
            .collect();

        let property = IndiProperty {
            label: root.attr("label").unwrap_or(&name).to_string(),
            group: root.attr("group").unwrap_or("Main").to_string(),
            property_type,
            state: IndiPropertyState::parse(root.attr("state").unwrap_or("Idle")),
            perm: IndiPermission::parse(root.attr("perm").unwrap_or("rw")),
            rule: match property_type {
                IndiPropertyType::Switch => root.attr("rule").and_then(SwitchRule::parse),
                _ => None,
            },
            timestamp: root.attr("timestamp").map(str::to_string),
            elements,
            device: device.clone(),
            name: name.clone(),
        };

        self.devices
            .entry(device.clone())
            .or_default()
            .insert(name.clone(), property.clone());
        self.mark_dirty(&device, &name);

        events.push(IndiEvent::PropertyDefined { device, property });
        if let Some(text) = root.attr("message") {
            events.push(message_event(root.attr("device"), text, root.attr("timestamp")));
        }
    }

    fn update(
        &mut self,
        root: &XmlElement,
        property_type: IndiPropertyType,
        events: &mut Vec<IndiEvent>,
    ) {
        let (device, name) = match (root.attr("device"), root.attr("name")) {
            (Some(device), Some(name)) => (device, name),
            _ => return,
        };

        let property = match self.devices.get_mut(device).and_then(|props| props.get_mut(name)) {
            Some(property) => property,
            None => {
                tracing::debug!("Update for unknown property {}.{}", device, name);
                return;
            }
        };

        property.state = IndiPropertyState::parse(root.attr("state").unwrap_or("Idle"));
        if let Some(timestamp) = root.attr("timestamp") {
            property.timestamp = Some(timestamp.to_string());
        }

        let mut blobs = Vec::new();
        for child in root.children.iter().filter(|c| c.name.starts_with("one")) {
            let element_name = match child.attr("name") {
                Some(n) => n,
                None => continue,
            };
            let element = match property.element_mut(element_name) {
                Some(e) => e,
                None => continue,
            };

            if property_type == IndiPropertyType::Blob {
                let size = child
                    .attr("size")
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                element.set_value(size.to_string());
                if let Some(blob) = decode_blob(device, name, element_name, child, size) {
                    blobs.push(blob);
                }
            } else {
                element.set_value(child.text.trim().to_string());
            }
        }

        let snapshot = property.clone();
        self.mark_dirty(device, name);

        events.push(IndiEvent::PropertyUpdated {
            device: device.to_string(),
            property: snapshot,
        });
        events.extend(blobs);
        if let Some(text) = root.attr("message") {
            events.push(message_event(Some(device), text, root.attr("timestamp")));
        }
    }

    fn delete(&mut self, root: &XmlElement, events: &mut Vec<IndiEvent>) {
        let device = match root.attr("device") {
            Some(d) => d,
            None => return,
        };

        match root.attr("name") {
            Some(name) => {
                let removed = self
                    .devices
                    .get_mut(device)
                    .and_then(|props| props.remove(name))
                    .is_some();
                if removed {
                    events.push(IndiEvent::PropertyDeleted {
                        device: device.to_string(),
                        name: name.to_string(),
                    });
                }
            }
            None => {
                if self.devices.remove(device).is_some() {
                    events.push(IndiEvent::DeviceDeleted {
                        device: device.to_string(),
                    });
                }
            }
        }

        if let Some(text) = root.attr("message") {
            events.push(message_event(Some(device), text, root.attr("timestamp")));
        }
    }

    fn mark_dirty(&mut self, device: &str, name: &str) {
        self.dirty
            .entry(device.to_string())
            .or_default()
            .insert(name.to_string(), Utc::now());
    }

    /// Drop every device, property and dirty mark
    pub fn clear(&mut self) {
        self.devices.clear();
        self.dirty.clear();
    }

    /// Known device names, sorted
    pub fn devices(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn has_device(&self, device: &str) -> bool {
        self.devices.contains_key(device)
    }

    pub fn device_properties(&self, device: &str) -> Option<&BTreeMap<String, IndiProperty>> {
        self.devices.get(device)
    }

    pub fn property(&self, device: &str, name: &str) -> Option<&IndiProperty> {
        self.devices.get(device).and_then(|props| props.get(name))
    }

    /// Names changed since the last drain; clears the set
    pub fn drain_dirty(&mut self, device: &str) -> Vec<String> {
        self.dirty
            .remove(device)
            .map(|names| names.into_keys().collect())
            .unwrap_or_default()
    }

    /// Drain the set, keeping only names changed at or after `since`
    pub fn drain_dirty_since(&mut self, device: &str, since: DateTime<Utc>) -> Vec<String> {
        self.dirty
            .remove(device)
            .map(|names| {
                names
                    .into_iter()
                    .filter(|(_, changed)| *changed >= since)
                    .map(|(name, _)| name)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshots of the requested properties; unknown names are skipped
    pub fn changed_properties<S: AsRef<str>>(
        &self,
        device: &str,
        names: &[S],
    ) -> BTreeMap<String, IndiProperty> {
        let props = match self.devices.get(device) {
            Some(p) => p,
            None => return BTreeMap::new(),
        };
        names
            .iter()
            .filter_map(|name| props.get(name.as_ref()))
            .map(|p| (p.name.clone(), p.clone()))
            .collect()
    }

    /// Properties grouped by their group name
    pub fn device_structure(
        &self,
        device: &str,
    ) -> Option<BTreeMap<String, BTreeMap<String, IndiProperty>>> {
        let props = self.devices.get(device)?;
        let mut structure: BTreeMap<String, BTreeMap<String, IndiProperty>> = BTreeMap::new();
        for (name, property) in props {
            structure
                .entry(property.group.clone())
                .or_default()
                .insert(name.clone(), property.clone());
        }
        Some(structure)
    }
}

fn message_event(device: Option<&str>, text: &str, timestamp: Option<&str>) -> IndiEvent {
    IndiEvent::Message {
        device: device.map(str::to_string),
        message: text.to_string(),
        timestamp: timestamp
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
    }
}

fn decode_blob(
    device: &str,
    property: &str,
    element: &str,
    child: &XmlElement,
    size: usize,
) -> Option<IndiEvent> {
    let encoded: String = child.text.split_ascii_whitespace().collect();
    if encoded.is_empty() {
        return None;
    }
    match BASE64.decode(encoded.as_bytes()) {
        Ok(data) => Some(IndiEvent::BlobReceived {
            device: device.to_string(),
            property: property.to_string(),
            element: element.to_string(),
            format: child.attr("format").unwrap_or_default().to_string(),
            size,
            data,
        }),
        Err(e) => {
            tracing::warn!(
                "Failed to decode BLOB base64 for {}.{}.{}: {}",
                device,
                property,
                element,
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(model: &mut PropertyModel, xml: &str) -> Vec<IndiEvent> {
        model.apply(&XmlElement::parse(xml).unwrap())
    }

    const DEF_EXPOSURE: &str = r#"<defNumberVector device="CCD Simulator" name="CCD_EXPOSURE" label="Expose" group="Main Control" state="Idle" perm="rw" timeout="60">
        <defNumber name="CCD_EXPOSURE_VALUE" label="Duration (s)" format="%5.2f" min="0.01" max="3600" step="1">1</defNumber>
    </defNumberVector>"#;

    #[test]
    fn test_definition_then_update() {
        let mut model = PropertyModel::new();
        let events = apply(&mut model, DEF_EXPOSURE);
        assert!(matches!(&events[..], [IndiEvent::PropertyDefined { device, .. }] if device == "CCD Simulator"));

        let prop = model.property("CCD Simulator", "CCD_EXPOSURE").unwrap();
        assert_eq!(prop.property_type, IndiPropertyType::Number);
        assert_eq!(prop.group, "Main Control");
        let element = prop.element("CCD_EXPOSURE_VALUE").unwrap();
        assert_eq!(element.value, "1");
        assert_eq!(element.formatted_value, " 1.00");
        let limits = element.limits.as_ref().unwrap();
        assert_eq!(limits.min, Some(0.01));
        assert_eq!(limits.max, Some(3600.0));

        let events = apply(
            &mut model,
            r#"<setNumberVector device="CCD Simulator" name="CCD_EXPOSURE" state="Busy">
                <oneNumber name="CCD_EXPOSURE_VALUE">2.5</oneNumber>
            </setNumberVector>"#,
        );
        assert!(matches!(&events[..], [IndiEvent::PropertyUpdated { .. }]));

        let prop = model.property("CCD Simulator", "CCD_EXPOSURE").unwrap();
        assert_eq!(prop.state, IndiPropertyState::Busy);
        let element = prop.element("CCD_EXPOSURE_VALUE").unwrap();
        assert_eq!(element.value, "2.5");
        assert_eq!(element.formatted_value, " 2.50");

        assert_eq!(model.drain_dirty("CCD Simulator"), vec!["CCD_EXPOSURE"]);
        assert!(model.drain_dirty("CCD Simulator").is_empty());
    }

    #[test]
    fn test_definition_defaults() {
        let mut model = PropertyModel::new();
        apply(
            &mut model,
            r#"<defSwitchVector device="Telescope Simulator" name="CONNECTION" rule="OneOfMany">
                <defSwitch name="CONNECT">Off</defSwitch>
                <defSwitch name="DISCONNECT">On</defSwitch>
            </defSwitchVector>"#,
        );
        let prop = model.property("Telescope Simulator", "CONNECTION").unwrap();
        assert_eq!(prop.label, "CONNECTION");
        assert_eq!(prop.group, "Main");
        assert_eq!(prop.state, IndiPropertyState::Idle);
        assert_eq!(prop.perm, IndiPermission::ReadWrite);
        assert_eq!(prop.rule, Some(SwitchRule::OneOfMany));
        assert_eq!(prop.element("CONNECT").unwrap().label, "CONNECT");
        assert!(prop.element("CONNECT").unwrap().limits.is_none());
        assert!(prop.is_on("DISCONNECT"));
        assert!(!prop.is_on("CONNECT"));
    }

    #[test]
    fn test_rule_ignored_for_non_switch() {
        let mut model = PropertyModel::new();
        apply(
            &mut model,
            r#"<defTextVector device="D" name="INFO" rule="OneOfMany"><defText name="A">x</defText></defTextVector>"#,
        );
        assert_eq!(model.property("D", "INFO").unwrap().rule, None);
    }

    #[test]
    fn test_update_of_unknown_property_is_noop() {
        let mut model = PropertyModel::new();
        let events = apply(
            &mut model,
            r#"<setTextVector device="Ghost" name="X"><oneText name="A">1</oneText></setTextVector>"#,
        );
        assert!(events.is_empty());
        assert!(!model.has_device("Ghost"));
        assert!(model.drain_dirty("Ghost").is_empty());
    }

    #[test]
    fn test_update_ignores_unknown_elements() {
        let mut model = PropertyModel::new();
        apply(&mut model, DEF_EXPOSURE);
        apply(
            &mut model,
            r#"<setNumberVector device="CCD Simulator" name="CCD_EXPOSURE"><oneNumber name="NOPE">5</oneNumber></setNumberVector>"#,
        );
        let prop = model.property("CCD Simulator", "CCD_EXPOSURE").unwrap();
        assert_eq!(prop.elements.len(), 1);
        assert!(prop.element("NOPE").is_none());
    }

    #[test]
    fn test_delete_property_and_device() {
        let mut model = PropertyModel::new();
        apply(&mut model, DEF_EXPOSURE);
        apply(
            &mut model,
            r#"<defTextVector device="CCD Simulator" name="DRIVER_INFO"><defText name="DRIVER_NAME">sim</defText></defTextVector>"#,
        );

        let events = apply(
            &mut model,
            r#"<delProperty device="CCD Simulator" name="DRIVER_INFO"/>"#,
        );
        assert!(matches!(&events[..], [IndiEvent::PropertyDeleted { name, .. }] if name == "DRIVER_INFO"));
        assert!(model.property("CCD Simulator", "DRIVER_INFO").is_none());
        assert!(model.property("CCD Simulator", "CCD_EXPOSURE").is_some());

        let events = apply(&mut model, r#"<delProperty device="CCD Simulator"/>"#);
        assert!(matches!(&events[..], [IndiEvent::DeviceDeleted { device }] if device == "CCD Simulator"));
        assert!(model.devices().is_empty());
    }

    #[test]
    fn test_message_defaults_timestamp() {
        let mut model = PropertyModel::new();
        let events = apply(&mut model, r#"<message device="CCD Simulator">Exposure done</message>"#);
        match &events[..] {
            [IndiEvent::Message { device, message, timestamp }] => {
                assert_eq!(device.as_deref(), Some("CCD Simulator"));
                assert_eq!(message, "Exposure done");
                assert!(!timestamp.is_empty());
            }
            other => panic!("unexpected events: {:?}", other),
        }

        let events = apply(&mut model, r#"<message timestamp="2024-01-01T00:00:00">hello</message>"#);
        assert!(matches!(&events[..], [IndiEvent::Message { device: None, timestamp, .. }] if timestamp == "2024-01-01T00:00:00"));
    }

    #[test]
    fn test_vector_message_attribute_raises_message() {
        let mut model = PropertyModel::new();
        let events = apply(
            &mut model,
            r#"<defTextVector device="D" name="P" message="[INFO] ready"><defText name="A"/></defTextVector>"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], IndiEvent::Message { message, .. } if message == "[INFO] ready"));
    }

    #[test]
    fn test_blob_update_records_size_and_emits_payload() {
        let mut model = PropertyModel::new();
        apply(
            &mut model,
            r#"<defBLOBVector device="CCD Simulator" name="CCD1" perm="ro"><defBLOB name="CCD1"/></defBLOBVector>"#,
        );
        // "hello" in base64, split across lines like real servers do
        let events = apply(
            &mut model,
            "<setBLOBVector device=\"CCD Simulator\" name=\"CCD1\" state=\"Ok\">\
             <oneBLOB name=\"CCD1\" size=\"5\" format=\".fits\">aGVs\nbG8=</oneBLOB></setBLOBVector>",
        );
        assert_eq!(events.len(), 2);
        match &events[1] {
            IndiEvent::BlobReceived { element, format, size, data, .. } => {
                assert_eq!(element, "CCD1");
                assert_eq!(format, ".fits");
                assert_eq!(*size, 5);
                assert_eq!(data, b"hello");
            }
            other => panic!("expected blob, got {:?}", other),
        }
        let element = model
            .property("CCD Simulator", "CCD1")
            .unwrap()
            .element("CCD1")
            .unwrap()
            .clone();
        assert_eq!(element.value, "5");
    }

    #[test]
    fn test_dirty_since_filters_older_changes() {
        let mut model = PropertyModel::new();
        apply(&mut model, DEF_EXPOSURE);
        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(model.drain_dirty_since("CCD Simulator", later).is_empty());
        // The drain consumed everything
        assert!(model.drain_dirty("CCD Simulator").is_empty());

        apply(&mut model, DEF_EXPOSURE);
        let earlier = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(
            model.drain_dirty_since("CCD Simulator", earlier),
            vec!["CCD_EXPOSURE"]
        );
    }

    #[test]
    fn test_changed_properties_and_structure() {
        let mut model = PropertyModel::new();
        apply(&mut model, DEF_EXPOSURE);
        apply(
            &mut model,
            r#"<defTextVector device="CCD Simulator" name="DRIVER_INFO" group="General Info"><defText name="DRIVER_NAME">sim</defText></defTextVector>"#,
        );

        let changed = model.changed_properties("CCD Simulator", &["CCD_EXPOSURE", "MISSING"]);
        assert_eq!(changed.keys().collect::<Vec<_>>(), vec!["CCD_EXPOSURE"]);
        assert!(model.changed_properties("Nobody", &["CCD_EXPOSURE"]).is_empty());

        let structure = model.device_structure("CCD Simulator").unwrap();
        assert_eq!(
            structure.keys().collect::<Vec<_>>(),
            vec!["General Info", "Main Control"]
        );
        assert!(structure["General Info"].contains_key("DRIVER_INFO"));
        assert!(model.device_structure("Nobody").is_none());
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut model = PropertyModel::new();
        apply(&mut model, DEF_EXPOSURE);
        model.clear();
        assert!(model.devices().is_empty());
        assert!(model.drain_dirty("CCD Simulator").is_empty());
    }
}
