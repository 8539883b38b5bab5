//! Idempotent component injection into a decoded manifest.
//!
//! Each [`PatchRule`] pairs a locator with a template element. Applying a
//! rule appends the template only when no sibling of the same kind already
//! carries the locator's attribute value, so running the whole rule set a
//! second time changes nothing.

use crate::android::attr;
use crate::android::binary_xml::{
    AttributeValue, BinaryXmlResult, ManifestDocument, ValueType, XmlElement,
};
use crate::config::{ActivitySpec, InjectionTable, ReceiverSpec};
use crate::error::{InjectError, Result};
use log::{debug, info};

/// Which element a rule's template is appended to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Manifest,
    Application,
}

/// Identifies an existing component: element kind plus the value one of its
/// `android:` attributes must hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    pub element: String,
    pub attribute: &'static str,
    pub resource_id: u32,
    pub value: String,
    /// The attribute is a `;`-separated list (provider authorities).
    pub list: bool,
}

impl Locator {
    fn by_name(element: &str, value: &str) -> Self {
        Locator {
            element: element.to_string(),
            attribute: "name",
            resource_id: attr::NAME,
            value: value.to_string(),
            list: false,
        }
    }

    pub fn matches(&self, candidate: &XmlElement) -> bool {
        if candidate.name != self.element {
            return false;
        }
        let Some(found) = candidate
            .android_attribute(self.resource_id, self.attribute)
            .and_then(|attr| attr.value().as_str())
        else {
            return false;
        };
        if self.list {
            found.split(';').any(|part| part.trim() == self.value)
        } else {
            found == self.value
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchRule {
    pub scope: Scope,
    pub locator: Locator,
    pub template: XmlElement,
}

impl PatchRule {
    /// Append the template unless a matching element exists. Returns whether
    /// the tree changed.
    pub fn apply(&self, document: &mut ManifestDocument) -> Result<bool> {
        let parent = match self.scope {
            Scope::Manifest => document.root_mut(),
            Scope::Application => document
                .root_mut()
                .find_child_mut("application")
                .ok_or(InjectError::MissingApplication)?,
        };
        if parent.children.iter().any(|child| self.locator.matches(child)) {
            debug!(
                "<{}> {} already present, skipping",
                self.locator.element, self.locator.value
            );
            return Ok(false);
        }
        parent.append_child(self.template.clone());
        debug!("injected <{}> {}", self.locator.element, self.locator.value);
        Ok(true)
    }
}

/// What a patch run found and changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub package: String,
    pub min_sdk: Option<i32>,
    pub init_order: bool,
    pub injected: Vec<String>,
}

impl PatchReport {
    pub fn changed(&self) -> bool {
        !self.injected.is_empty()
    }
}

pub struct ManifestPatcher<'a> {
    table: &'a InjectionTable,
}

impl<'a> ManifestPatcher<'a> {
    pub fn new(table: &'a InjectionTable) -> Self {
        ManifestPatcher { table }
    }

    /// Decode, patch and re-encode a compiled manifest.
    pub fn patch_bytes(&self, manifest: &[u8]) -> Result<(Vec<u8>, PatchReport)> {
        let mut document = ManifestDocument::decode(manifest)?;
        let report = self.patch(&mut document)?;
        let bytes = document.encode()?;
        Ok((bytes, report))
    }

    pub fn patch(&self, document: &mut ManifestDocument) -> Result<PatchReport> {
        let package = document
            .package_name()
            .filter(|package| !package.is_empty())
            .ok_or(InjectError::MissingPackage)?
            .to_string();
        let min_sdk = resolve_min_sdk(document);
        let init_order = min_sdk.map_or(true, |sdk| sdk >= self.table.init_order_min_sdk);
        if document.root().find_child("application").is_none() {
            return Err(InjectError::MissingApplication);
        }

        let mut report = PatchReport {
            package: package.clone(),
            min_sdk,
            init_order,
            injected: Vec::new(),
        };
        for rule in self.rules(&package, init_order)? {
            if rule.apply(document)? {
                report.injected.push(rule.locator.value.clone());
            }
        }
        info!(
            "patched manifest of {package} (minSdk {:?}, initOrder {}): {} injected",
            min_sdk,
            init_order,
            report.injected.len()
        );
        Ok(report)
    }

    /// The rule set for one package, in application order: permissions,
    /// provider, export receiver, control receiver, placeholder activity.
    pub fn rules(&self, package: &str, init_order: bool) -> Result<Vec<PatchRule>> {
        let table = self.table;
        let mut rules = Vec::new();

        for permission in &table.permissions {
            let mut element = XmlElement::new("uses-permission");
            element.android_attribute_mut("name", attr::NAME).set_string(permission);
            rules.push(PatchRule {
                scope: Scope::Manifest,
                locator: Locator::by_name("uses-permission", permission),
                template: element,
            });
        }

        let authority = table.provider_authority(package);
        rules.push(PatchRule {
            scope: Scope::Application,
            locator: Locator {
                element: "provider".to_string(),
                attribute: "authorities",
                resource_id: attr::AUTHORITIES,
                value: authority.clone(),
                list: true,
            },
            template: self.provider(&authority, init_order)?,
        });

        for receiver in [&table.export_receiver, &table.control_receiver] {
            rules.push(PatchRule {
                scope: Scope::Application,
                locator: Locator::by_name("receiver", &receiver.name),
                template: receiver_element(receiver),
            });
        }

        rules.push(PatchRule {
            scope: Scope::Application,
            locator: Locator::by_name("activity", &table.placeholder_activity.name),
            template: activity_element(&table.placeholder_activity),
        });
        Ok(rules)
    }

    fn provider(&self, authority: &str, init_order: bool) -> BinaryXmlResult<XmlElement> {
        let mut element = XmlElement::new("provider");
        element
            .android_attribute_mut("name", attr::NAME)
            .set_string(&self.table.provider_name);
        element
            .android_attribute_mut("authorities", attr::AUTHORITIES)
            .set_string(authority);
        element
            .android_attribute_mut("exported", attr::EXPORTED)
            .set_bool(true);
        element
            .android_attribute_mut("permission", attr::PERMISSION)
            .set_string(&self.table.ipc_permission);
        if init_order {
            element
                .android_attribute_mut("initOrder", attr::INIT_ORDER)
                .set_int_with_type(i32::MAX, ValueType::IntDec)?;
        }
        Ok(element)
    }
}

fn receiver_element(spec: &ReceiverSpec) -> XmlElement {
    let mut receiver = XmlElement::new("receiver");
    receiver
        .android_attribute_mut("name", attr::NAME)
        .set_string(&spec.name);
    receiver
        .android_attribute_mut("exported", attr::EXPORTED)
        .set_bool(spec.exported);
    if let Some(permission) = &spec.permission {
        receiver
            .android_attribute_mut("permission", attr::PERMISSION)
            .set_string(permission);
    }
    let filter = receiver.append_child(XmlElement::new("intent-filter"));
    for action in &spec.actions {
        let mut element = XmlElement::new("action");
        element.android_attribute_mut("name", attr::NAME).set_string(action);
        filter.append_child(element);
    }
    receiver
}

fn activity_element(spec: &ActivitySpec) -> XmlElement {
    let mut activity = XmlElement::new("activity");
    activity
        .android_attribute_mut("theme", attr::THEME)
        .set_reference(spec.theme);
    activity
        .android_attribute_mut("name", attr::NAME)
        .set_string(&spec.name);
    activity
        .android_attribute_mut("exported", attr::EXPORTED)
        .set_bool(spec.exported);
    activity
}

/// `minSdkVersion` from `<uses-sdk>`: integers are taken as-is, strings keep
/// only their digits. Anything else (absent, references, no digits,
/// negative) yields `None`.
pub fn resolve_min_sdk(document: &ManifestDocument) -> Option<i32> {
    let uses_sdk = document.root().find_child("uses-sdk")?;
    let value = uses_sdk
        .android_attribute(attr::MIN_SDK_VERSION, "minSdkVersion")?
        .value();
    let sdk = match value {
        AttributeValue::Integer { data, .. } => *data as i32,
        AttributeValue::String(text) => {
            let digits: String = text.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()?
        }
        _ => return None,
    };
    (sdk >= 0).then_some(sdk)
}
