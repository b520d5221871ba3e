//! Driver catalog
//!
//! Drivers are discovered from the XML descriptor files INDI installs
//! (`/usr/share/indi/*.xml`), optionally extended with user-defined custom
//! drivers and with remote `device@host` references.

use crate::error::{ServerError, ServerResult};
use indiweb_indi::xml::XmlElement;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Family assigned to remote drivers
pub const REMOTE_FAMILY: &str = "Remote";

/// Scripts and delays run around a driver's start and stop.
///
/// Field names match the JSON stored with a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LifecycleRule {
    /// Label of the driver this rule applies to
    pub driver: Option<String>,
    /// Seconds to wait before issuing `start`
    pub pre_delay: f64,
    pub pre_script: Option<String>,
    /// Seconds to wait after issuing `start`
    pub post_delay: f64,
    pub post_script: Option<String>,
    pub stopping_script: Option<String>,
    /// Seconds to wait before issuing `stop`
    pub stopping_delay: f64,
    /// Seconds to wait after issuing `stop`
    pub stopped_delay: f64,
    pub stopped_script: Option<String>,
}

/// One installable driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    /// Protocol identifier from the `<driver name=..>` attribute
    pub name: String,
    /// Human readable label, the lookup key everywhere else
    pub label: String,
    pub version: String,
    /// Executable name, or `device@host[:port]` for a remote driver
    pub binary: Option<String>,
    pub family: String,
    /// Property skeleton file, already joined with the descriptor directory
    pub skeleton: Option<PathBuf>,
    /// One process serves several devices and names them itself
    pub mdpd: bool,
    /// Added by the user rather than discovered
    pub custom: bool,
    pub rule: Option<LifecycleRule>,
}

impl DriverDescriptor {
    /// Descriptor for a driver hosted by another server, e.g. `CCD Simulator@host:7624`
    pub fn remote(spec: &str) -> Self {
        Self {
            name: spec.to_string(),
            label: spec.to_string(),
            version: "1.0".to_string(),
            binary: Some(spec.to_string()),
            family: REMOTE_FAMILY.to_string(),
            skeleton: None,
            mdpd: false,
            custom: false,
            rule: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.binary.as_deref().map_or(false, |b| b.contains('@'))
    }
}

/// User-defined driver as stored with a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomDriver {
    pub name: String,
    pub label: String,
    pub version: String,
    pub exec: String,
    pub family: String,
}

impl From<&CustomDriver> for DriverDescriptor {
    fn from(custom: &CustomDriver) -> Self {
        Self {
            name: custom.name.clone(),
            label: custom.label.clone(),
            version: custom.version.clone(),
            binary: Some(custom.exec.clone()),
            family: custom.family.clone(),
            skeleton: None,
            mdpd: false,
            custom: true,
            rule: None,
        }
    }
}

/// Sorted catalog of drivers
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    path: PathBuf,
    drivers: Vec<DriverDescriptor>,
}

impl DriverRegistry {
    /// Scan `dir` for descriptor files.
    ///
    /// A missing directory or a bad file is logged and yields fewer drivers,
    /// never an error. A file is all or nothing: if any entry in it is
    /// malformed, none of its drivers are added, including entries that
    /// parsed before the bad one.
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let mut drivers = Vec::new();

        for file in descriptor_files(dir) {
            match parse_descriptor_file(&file, dir) {
                Ok(mut parsed) => {
                    tracing::debug!("Loaded {} driver(s) from {}", parsed.len(), file.display());
                    drivers.append(&mut parsed);
                }
                Err(e) => tracing::error!("Skipping driver descriptor: {}", e),
            }
        }

        drivers.sort_by(|a, b| a.label.cmp(&b.label));
        tracing::info!("Driver registry loaded {} driver(s) from {}", drivers.len(), dir.display());

        Self {
            path: dir.to_path_buf(),
            drivers,
        }
    }

    /// Directory the registry was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn drivers(&self) -> &[DriverDescriptor] {
        &self.drivers
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Exact label match, else the first driver whose label prefixes `label`
    pub fn by_label(&self, label: &str) -> Option<&DriverDescriptor> {
        self.position_by_label(label).map(|i| &self.drivers[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&DriverDescriptor> {
        self.drivers.iter().find(|d| d.name == name)
    }

    pub fn by_binary(&self, binary: &str) -> Option<&DriverDescriptor> {
        self.drivers
            .iter()
            .find(|d| d.binary.as_deref() == Some(binary))
    }

    /// Family name to driver labels, in registry order
    pub fn families(&self) -> BTreeMap<String, Vec<String>> {
        let mut families: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for driver in &self.drivers {
            families
                .entry(driver.family.clone())
                .or_default()
                .push(driver.label.clone());
        }
        families
    }

    /// Append user-defined drivers; duplicates are kept
    pub fn add_custom_drivers(&mut self, custom: &[CustomDriver]) {
        self.drivers.extend(custom.iter().map(DriverDescriptor::from));
    }

    pub fn clear_custom_drivers(&mut self) {
        self.drivers.retain(|d| !d.custom);
    }

    /// Attach each rule to the driver its `Driver` field resolves to
    pub fn apply_rules(&mut self, rules: &[LifecycleRule]) {
        for rule in rules {
            let label = match rule.driver.as_deref() {
                Some(label) if !label.is_empty() => label,
                _ => continue,
            };
            match self.position_by_label(label) {
                Some(i) => self.drivers[i].rule = Some(rule.clone()),
                None => tracing::debug!("No driver matches rule for {}", label),
            }
        }
    }

    fn position_by_label(&self, label: &str) -> Option<usize> {
        self.drivers
            .iter()
            .position(|d| d.label == label)
            .or_else(|| {
                self.drivers
                    .iter()
                    .position(|d| label.starts_with(d.label.as_str()))
            })
    }
}

/// Descriptor files in `dir`, skeletons excluded, in file name order
fn descriptor_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read driver directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(".xml") && !n.contains("_sk"))
        })
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files
}

fn parse_descriptor_file(file: &Path, dir: &Path) -> ServerResult<Vec<DriverDescriptor>> {
    let bytes = std::fs::read(file)?;
    let text = String::from_utf8_lossy(&bytes);
    parse_descriptors(&text, dir).map_err(|reason| ServerError::DescriptorParse {
        path: file.to_path_buf(),
        reason,
    })
}

/// Parse one descriptor document; skeleton paths are joined with `dir`
fn parse_descriptors(text: &str, dir: &Path) -> Result<Vec<DriverDescriptor>, String> {
    let root = XmlElement::parse(text).map_err(|e| e.to_string())?;
    let mut drivers = Vec::new();

    for group in root.children_named("devGroup") {
        let family = group
            .attr("group")
            .ok_or("devGroup without 'group' attribute")?;

        for device in group.children_named("device") {
            let label = device
                .attr("label")
                .ok_or("device without 'label' attribute")?;
            let driver = device
                .child("driver")
                .ok_or_else(|| format!("device {} has no driver element", label))?;
            let name = driver
                .attr("name")
                .ok_or_else(|| format!("driver of {} without 'name' attribute", label))?;

            drivers.push(DriverDescriptor {
                name: name.to_string(),
                label: label.to_string(),
                version: device.child_text("version").unwrap_or("0.0").to_string(),
                binary: Some(driver.text.clone()).filter(|b| !b.is_empty()),
                family: family.to_string(),
                skeleton: device.attr("skel").map(|skel| dir.join(skel)),
                mdpd: device.attr("mdpd") == Some("true"),
                custom: false,
                rule: None,
            });
        }
    }

    Ok(drivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const TELESCOPES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<driversList>
  <devGroup group="Telescopes">
    <device label="Telescope Simulator">
      <driver name="Telescope Simulator">indi_simulator_telescope</driver>
      <version>1.0</version>
    </device>
  </devGroup>
</driversList>"#;

    const CAMERAS: &str = r#"<driversList>
  <devGroup group="CCDs">
    <device label="CCD Simulator" skel="indi_ccd_sk.xml">
      <driver name="CCD Simulator">indi_simulator_ccd</driver>
    </device>
  </devGroup>
  <devGroup group="Focusers">
    <device label="Focuser Simulator" mdpd="true">
      <driver name="Focuser Simulator">indi_simulator_focus</driver>
      <version>2.1</version>
    </device>
  </devGroup>
</driversList>"#;

    fn write(dir: &TempDir, name: &str, content: &str) {
        fs::write(dir.path().join(name), content).unwrap();
    }

    fn registry() -> (TempDir, DriverRegistry) {
        let dir = TempDir::new().unwrap();
        write(&dir, "indi_telescopes.xml", TELESCOPES);
        write(&dir, "indi_cameras.xml", CAMERAS);
        write(&dir, "indi_ccd_sk.xml", "<INDIDriver/>");
        write(&dir, "notes.txt", "not a descriptor");
        let registry = DriverRegistry::load(dir.path());
        (dir, registry)
    }

    fn custom(label: &str) -> CustomDriver {
        CustomDriver {
            name: label.to_string(),
            label: label.to_string(),
            version: "0.1".to_string(),
            exec: "indi_custom".to_string(),
            family: "Auxiliary".to_string(),
        }
    }

    #[test]
    fn test_load_sorts_and_parses_fields() {
        let (dir, registry) = registry();
        let labels: Vec<&str> = registry.drivers().iter().map(|d| d.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["CCD Simulator", "Focuser Simulator", "Telescope Simulator"]
        );

        let ccd = registry.by_label("CCD Simulator").unwrap();
        assert_eq!(ccd.binary.as_deref(), Some("indi_simulator_ccd"));
        assert_eq!(ccd.version, "0.0");
        assert_eq!(ccd.skeleton, Some(dir.path().join("indi_ccd_sk.xml")));
        assert!(!ccd.mdpd);

        let focuser = registry.by_label("Focuser Simulator").unwrap();
        assert_eq!(focuser.version, "2.1");
        assert!(focuser.mdpd);
        assert!(focuser.skeleton.is_none());
    }

    #[test]
    fn test_families() {
        let (_dir, registry) = registry();
        let families = registry.families();
        assert_eq!(families.len(), 3);
        assert_eq!(families["Telescopes"], vec!["Telescope Simulator"]);
        assert_eq!(families["CCDs"], vec!["CCD Simulator"]);
        assert_eq!(families["Focusers"], vec!["Focuser Simulator"]);
        let total: usize = families.values().map(Vec::len).sum();
        assert_eq!(total, registry.len());
    }

    #[test]
    fn test_bad_files_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "indi_telescopes.xml", TELESCOPES);
        write(&dir, "broken.xml", "<driversList><devGroup group=\"X\">");
        write(
            &dir,
            "missing_label.xml",
            r#"<driversList><devGroup group="CCDs">
                 <device label="Good"><driver name="g">indi_good</driver></device>
                 <device><driver name="b">indi_bad</driver></device>
               </devGroup></driversList>"#,
        );
        let registry = DriverRegistry::load(dir.path());
        assert_eq!(registry.len(), 1);
        assert!(registry.by_label("Good").is_none());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let registry = DriverRegistry::load("/nonexistent/indi/drivers");
        assert!(registry.is_empty());
        assert!(registry.families().is_empty());
    }

    #[test]
    fn test_lookups() {
        let (_dir, registry) = registry();
        assert_eq!(
            registry.by_name("Telescope Simulator").unwrap().label,
            "Telescope Simulator"
        );
        assert_eq!(
            registry.by_binary("indi_simulator_focus").unwrap().label,
            "Focuser Simulator"
        );
        assert!(registry.by_name("nope").is_none());
        assert!(registry.by_binary("nope").is_none());
    }

    #[test]
    fn test_by_label_prefix_fallback() {
        let (_dir, registry) = registry();
        assert_eq!(
            registry.by_label("CCD Simulator 2").unwrap().label,
            "CCD Simulator"
        );
        assert!(registry.by_label("CCD").is_none());
    }

    #[test]
    fn test_custom_drivers_add_and_clear() {
        let (_dir, mut registry) = registry();
        let before = registry.drivers().to_vec();

        registry.add_custom_drivers(&[custom("My Relay"), custom("My Relay")]);
        assert_eq!(registry.len(), before.len() + 2);
        let added = registry.by_label("My Relay").unwrap();
        assert!(added.custom);
        assert_eq!(added.binary.as_deref(), Some("indi_custom"));

        registry.clear_custom_drivers();
        assert_eq!(registry.drivers(), before.as_slice());
    }

    #[test]
    fn test_apply_rules() {
        let (_dir, mut registry) = registry();
        let rules: Vec<LifecycleRule> = serde_json::from_str(
            r#"[{"Driver": "CCD Simulator", "PreDelay": 2, "PostScript": "/opt/post.sh"},
                {"PreDelay": 5},
                {"Driver": "Unknown Device", "PostDelay": 1}]"#,
        )
        .unwrap();
        registry.apply_rules(&rules);
        registry.apply_rules(&[]);

        let rule = registry.by_label("CCD Simulator").unwrap().rule.as_ref().unwrap();
        assert_eq!(rule.pre_delay, 2.0);
        assert_eq!(rule.post_script.as_deref(), Some("/opt/post.sh"));
        assert_eq!(rule.stopped_delay, 0.0);
        assert!(registry.by_label("Telescope Simulator").unwrap().rule.is_none());
    }

    #[test]
    fn test_remote_descriptor() {
        let remote = DriverDescriptor::remote("CCD Simulator@observatory:7624");
        assert!(remote.is_remote());
        assert_eq!(remote.family, REMOTE_FAMILY);
        assert_eq!(remote.version, "1.0");
        assert_eq!(remote.label, "CCD Simulator@observatory:7624");
        assert!(!DriverDescriptor::from(&custom("x")).is_remote());
    }
}
