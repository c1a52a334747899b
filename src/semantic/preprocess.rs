//! Canonical text for embedding generation.
//!
//! Records are rendered as `Label: value` lines in a fixed field order:
//! 1. Skip fields that are absent or blank (whitespace only)
//! 2. Join list fields with ", " keeping their order, dropping blank entries
//! 3. Join lines with "\n"
//!
//! Values that are kept are written exactly as stored.
//!
//! The output depends on nothing but the record, so refreshing an unchanged
//! record always sends the provider the same input.

use serde_json::Value;

use crate::documents::Document;

/// A single field's value as seen by the normalizer.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Text(&'a str),
    List(&'a [String]),
}

/// Records that can be rendered by [`build_text`].
pub trait TextFields {
    fn field(&self, key: &str) -> Option<FieldValue<'_>>;
}

/// Source field key and the label it is rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub key: &'static str,
    pub label: &'static str,
}

pub const PROFILE_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "displayName", label: "Name" },
    FieldSpec { key: "bio", label: "Bio" },
    FieldSpec { key: "location", label: "location" },
    FieldSpec { key: "interests", label: "interests" },
];

pub const ITEM_FIELDS: &[FieldSpec] = &[
    FieldSpec { key: "title", label: "Title" },
    FieldSpec { key: "category", label: "Category" },
    FieldSpec { key: "description", label: "Description" },
    FieldSpec { key: "location", label: "Location" },
];

/// Build the canonical text for `record`.
///
/// Returns an empty string when no field in `field_order` has a usable value.
pub fn build_text(record: &impl TextFields, field_order: &[FieldSpec]) -> String {
    field_order
        .iter()
        .filter_map(|spec| {
            let value = render(record.field(spec.key)?)?;
            Some(format!("{}: {}", spec.label, value))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Copy the fields listed in `field_order` into a snapshot document.
///
/// Present fields are copied as-is (even when blank); absent ones are left out.
pub fn snapshot(record: &impl TextFields, field_order: &[FieldSpec]) -> Document {
    let mut doc = Document::new();
    for spec in field_order {
        let value = match record.field(spec.key) {
            Some(FieldValue::Text(text)) => Value::String(text.to_string()),
            Some(FieldValue::List(items)) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            None => continue,
        };
        doc.insert(spec.key.to_string(), value);
    }
    doc
}

fn render(value: FieldValue<'_>) -> Option<String> {
    match value {
        FieldValue::Text(text) => (!is_blank(text)).then(|| text.to_string()),
        FieldValue::List(items) => {
            let items: Vec<&str> = items
                .iter()
                .map(String::as_str)
                .filter(|item| !is_blank(item))
                .collect();
            (!items.is_empty()).then(|| items.join(", "))
        }
    }
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
