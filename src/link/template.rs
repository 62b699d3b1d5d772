//! Contract and script templates with named, typed address slots
//!
//! A slot is written `{{Name}}` or `{{Name: Kind}}`; the kind defaults to
//! `Address`. Slots are validated when the template is parsed, and resolution
//! is strict in both directions: every slot needs a binding of the right kind
//! and every binding needs a slot.

use crate::error::LinkError;
use crate::types::Address;

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

lazy_static! {
    static ref SLOT: Regex =
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?::\s*([A-Za-z]+)\s*)?\}\}").unwrap();
}

/// Kind of value a slot accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Address,
    String,
}

impl SlotKind {
    fn parse(kind: &str) -> Option<Self> {
        match kind {
            "Address" => Some(SlotKind::Address),
            "String" => Some(SlotKind::String),
            _ => None,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SlotKind::Address => "Address",
            SlotKind::String => "String",
        })
    }
}

/// Value bound to a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Address(Address),
    String(String),
}

impl Binding {
    pub fn kind(&self) -> SlotKind {
        match self {
            Binding::Address(_) => SlotKind::Address,
            Binding::String(_) => SlotKind::String,
        }
    }

    fn render(&self) -> String {
        match self {
            Binding::Address(address) => address.to_string(),
            Binding::String(s) => s.clone(),
        }
    }
}

/// Slot name -> bound value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(BTreeMap<String, Binding>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, name: impl Into<String>, address: Address) -> Self {
        self.insert(name, Binding::Address(address));
        self
    }

    pub fn string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, Binding::String(value.into()));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, binding: Binding) {
        self.0.insert(name.into(), binding);
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Binding)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot(String),
}

/// Parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
    /// Slots in order of first appearance
    slots: Vec<(String, SlotKind)>,
}

impl Template {
    /// Parse template source, validating every slot
    pub fn parse(source: &str) -> Result<Self, LinkError> {
        let mut segments = Vec::new();
        let mut slots: Vec<(String, SlotKind)> = Vec::new();
        let mut cursor = 0;

        for cap in SLOT.captures_iter(source) {
            let Some(whole) = cap.get(0) else { continue };
            push_text(&mut segments, source, cursor, whole.start())?;

            let name = cap[1].to_string();
            let kind = match cap.get(2) {
                Some(k) => SlotKind::parse(k.as_str()).ok_or_else(|| LinkError::MalformedTemplate {
                    position: k.start(),
                    message: format!("unknown slot kind {:?} for {}", k.as_str(), name),
                })?,
                None => SlotKind::Address,
            };

            match slots.iter().find(|(n, _)| *n == name) {
                Some((_, existing)) if *existing != kind => {
                    return Err(LinkError::MalformedTemplate {
                        position: whole.start(),
                        message: format!("slot {} declared as both {} and {}", name, existing, kind),
                    });
                }
                Some(_) => {}
                None => slots.push((name.clone(), kind)),
            }

            segments.push(Segment::Slot(name));
            cursor = whole.end();
        }
        push_text(&mut segments, source, cursor, source.len())?;

        Ok(Self { segments, slots })
    }

    /// Slots in order of first appearance
    pub fn slots(&self) -> impl Iterator<Item = (&str, SlotKind)> {
        self.slots.iter().map(|(n, k)| (n.as_str(), *k))
    }

    pub fn slot_kind(&self, name: &str) -> Option<SlotKind> {
        self.slots.iter().find(|(n, _)| n == name).map(|(_, k)| *k)
    }

    /// Check that `bound` covers exactly this template's slots with matching kinds
    pub fn check_bindings<'a>(
        &self,
        bound: impl IntoIterator<Item = (&'a str, SlotKind)>,
    ) -> Result<(), LinkError> {
        let bound: BTreeMap<&str, SlotKind> = bound.into_iter().collect();

        for (name, kind) in self.slots() {
            match bound.get(name) {
                None => {
                    return Err(LinkError::UnresolvedPlaceholder {
                        placeholder: name.to_string(),
                    })
                }
                Some(found) if *found != kind => {
                    return Err(LinkError::BindingTypeMismatch {
                        slot: name.to_string(),
                        expected: kind.to_string(),
                        found: found.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        if let Some(unused) = bound.keys().find(|name| self.slot_kind(name).is_none()) {
            return Err(LinkError::UnusedBinding {
                binding: unused.to_string(),
            });
        }

        Ok(())
    }

    /// Substitute every slot, producing source ready for a transaction
    pub fn resolve(&self, bindings: &Bindings) -> Result<ResolvedScript, LinkError> {
        self.check_bindings(bindings.iter().map(|(n, b)| (n, b.kind())))?;

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Slot(name) => {
                    // check_bindings guarantees presence
                    if let Some(binding) = bindings.get(name) {
                        out.push_str(&binding.render());
                    }
                }
            }
        }

        Ok(ResolvedScript(out))
    }
}

fn push_text(
    segments: &mut Vec<Segment>,
    source: &str,
    start: usize,
    end: usize,
) -> Result<(), LinkError> {
    let text = &source[start..end];
    if let Some(offset) = text.find("{{") {
        return Err(LinkError::MalformedTemplate {
            position: start + offset,
            message: "unterminated or invalid slot".to_string(),
        });
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
    Ok(())
}

/// Source text with every slot resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript(String);

impl ResolvedScript {
    /// Source that must not contain any slot
    pub fn from_source(source: &str) -> Result<Self, LinkError> {
        Template::parse(source)?.resolve(&Bindings::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

impl fmt::Display for ResolvedScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse `template` and resolve it against `bindings`
pub fn resolve(template: &str, bindings: &Bindings) -> Result<ResolvedScript, LinkError> {
    Template::parse(template)?.resolve(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = r#"
import FungibleToken from {{FungibleToken}}
import Kibble from {{Kibble}}

transaction(recipient: Address, amount: UFix64) {
    prepare(signer: AuthAccount) {
        let admin = signer.borrow<&Kibble.Administrator>(from: /storage/{{AdminPath: String}})
    }
}
"#;

    #[test]
    fn test_resolves_all_slots() {
        let bindings = Bindings::new()
            .address("FungibleToken", "0x01".parse().unwrap())
            .address("Kibble", "0x02".parse().unwrap())
            .string("AdminPath", "KibbleAdmin");

        let resolved = resolve(MINT, &bindings).unwrap();
        let text = resolved.as_str();

        assert!(!text.contains("{{"));
        assert!(text.contains("import FungibleToken from 0x0000000000000001"));
        assert!(text.contains("import Kibble from 0x0000000000000002"));
        assert!(text.contains("/storage/KibbleAdmin"));
    }

    #[test]
    fn test_two_address_bindings_leave_no_placeholder() {
        let template = "import A from {{A}}\nimport B from {{B}}\nlet again = {{A}}";
        let bindings = Bindings::new()
            .address("A", "0x01".parse().unwrap())
            .address("B", "0x02".parse().unwrap());

        let resolved = resolve(template, &bindings).unwrap();
        assert_eq!(
            resolved.as_str(),
            "import A from 0x0000000000000001\nimport B from 0x0000000000000002\nlet again = 0x0000000000000001"
        );
    }

    #[test]
    fn test_unbound_placeholder_fails() {
        let bindings = Bindings::new().address("A", Address::from_index(1));
        let err = resolve("import A from {{A}}\nimport B from {{B}}", &bindings).unwrap_err();
        assert_eq!(
            err,
            LinkError::UnresolvedPlaceholder {
                placeholder: "B".to_string()
            }
        );
    }

    #[test]
    fn test_binding_without_slot_fails() {
        let bindings = Bindings::new()
            .address("A", Address::from_index(1))
            .address("Stray", Address::from_index(9));
        let err = resolve("import A from {{A}}", &bindings).unwrap_err();
        assert_eq!(
            err,
            LinkError::UnusedBinding {
                binding: "Stray".to_string()
            }
        );
    }

    #[test]
    fn test_kind_mismatch_fails() {
        let bindings = Bindings::new().string("A", "not an address");
        let err = resolve("import A from {{A}}", &bindings).unwrap_err();
        assert!(matches!(err, LinkError::BindingTypeMismatch { ref slot, .. } if slot == "A"));
    }

    #[test]
    fn test_malformed_slots_rejected_at_parse() {
        assert!(matches!(
            Template::parse("import A from {{A"),
            Err(LinkError::MalformedTemplate { position: 14, .. })
        ));
        assert!(matches!(
            Template::parse("{{A: Int}}"),
            Err(LinkError::MalformedTemplate { .. })
        ));
        assert!(matches!(
            Template::parse("{{A}} {{A: String}}"),
            Err(LinkError::MalformedTemplate { .. })
        ));
    }

    #[test]
    fn test_slots_listed_in_order() {
        let template = Template::parse(MINT).unwrap();
        let slots: Vec<_> = template.slots().collect();
        assert_eq!(
            slots,
            vec![
                ("FungibleToken", SlotKind::Address),
                ("Kibble", SlotKind::Address),
                ("AdminPath", SlotKind::String),
            ]
        );
    }

    #[test]
    fn test_plain_source_resolves_verbatim() {
        let source = "transaction { execute { log(\"hi\") } }";
        assert_eq!(ResolvedScript::from_source(source).unwrap().as_str(), source);
    }
}
