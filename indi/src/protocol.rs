//! INDI XML Protocol definitions

use crate::IndiPropertyType;
use quick_xml::escape::escape;

/// INDI protocol version
pub const INDI_PROTOCOL_VERSION: &str = "1.7";

/// Standard INDI properties
pub mod standard_properties {
    /// Connection control switch
    pub const CONNECTION: &str = "CONNECTION";
    pub const CONNECT: &str = "CONNECT";
    pub const DISCONNECT: &str = "DISCONNECT";
}

/// `<getProperties>` request sent right after connecting
pub fn get_properties(version: &str) -> String {
    format!("<getProperties version=\"{}\"/>", escape(version))
}

/// `<enableBLOB>` request so BLOB payloads are sent alongside other traffic
pub fn enable_blob(device: &str) -> String {
    format!("<enableBLOB device=\"{}\">Also</enableBLOB>", escape(device))
}

/// Build a `new*Vector` message for a writable property type.
///
/// Returns `None` for light and BLOB vectors, which clients cannot set this way.
pub fn new_vector<K: AsRef<str>, V: AsRef<str>>(
    property_type: IndiPropertyType,
    device: &str,
    property: &str,
    values: &[(K, V)],
) -> Option<String> {
    let kind = match property_type {
        IndiPropertyType::Text | IndiPropertyType::Number | IndiPropertyType::Switch => {
            property_type.tag_fragment()
        }
        IndiPropertyType::Light | IndiPropertyType::Blob => return None,
    };

    let elements: String = values
        .iter()
        .map(|(name, value)| {
            format!(
                "<one{kind} name=\"{}\">{}</one{kind}>",
                escape(name.as_ref()),
                escape(value.as_ref()),
            )
        })
        .collect();

    Some(format!(
        "<new{kind}Vector device=\"{}\" name=\"{}\">{}</new{kind}Vector>",
        escape(device),
        escape(property),
        elements
    ))
}
