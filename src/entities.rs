use std::fmt::Display;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    documents::{Collection, Document},
    semantic::{FieldSpec, FieldValue, TextFields, ITEM_FIELDS, PROFILE_FIELDS},
};

/// Which side of the recommendation an entity lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Profile,
    Item,
}

impl EntityKind {
    /// Collection holding the source records.
    pub fn source_collection(&self) -> Collection {
        match self {
            EntityKind::Profile => Collection::Profiles,
            EntityKind::Item => Collection::Items,
        }
    }

    /// Collection holding the embedding records.
    pub fn embedding_collection(&self) -> Collection {
        match self {
            EntityKind::Profile => Collection::ProfileEmbeddings,
            EntityKind::Item => Collection::ItemEmbeddings,
        }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            EntityKind::Profile => PROFILE_FIELDS,
            EntityKind::Item => ITEM_FIELDS,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Profile => f.write_str("profile"),
            EntityKind::Item => f.write_str("item"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileRecord {
    #[serde(skip)]
    pub id: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub interests: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemRecord {
    #[serde(skip)]
    pub id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// A source record of either kind, decoded from its document.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    Profile(ProfileRecord),
    Item(ItemRecord),
}

impl SourceRecord {
    /// Decode `doc` as a record of `kind`. Unknown document fields are ignored.
    pub fn from_document(
        kind: EntityKind,
        id: &str,
        doc: Document,
    ) -> Result<Self, serde_json::Error> {
        let value = Value::Object(doc);
        Ok(match kind {
            EntityKind::Profile => {
                let mut record: ProfileRecord = serde_json::from_value(value)?;
                record.id = id.to_string();
                SourceRecord::Profile(record)
            }
            EntityKind::Item => {
                let mut record: ItemRecord = serde_json::from_value(value)?;
                record.id = id.to_string();
                SourceRecord::Item(record)
            }
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            SourceRecord::Profile(_) => EntityKind::Profile,
            SourceRecord::Item(_) => EntityKind::Item,
        }
    }
}

fn text(value: &Option<String>) -> Option<FieldValue<'_>> {
    value.as_deref().map(FieldValue::Text)
}

impl TextFields for ProfileRecord {
    fn field(&self, key: &str) -> Option<FieldValue<'_>> {
        match key {
            "displayName" => text(&self.display_name),
            "bio" => text(&self.bio),
            "location" => text(&self.location),
            "interests" => self.interests.as_deref().map(FieldValue::List),
            _ => None,
        }
    }
}

impl TextFields for ItemRecord {
    fn field(&self, key: &str) -> Option<FieldValue<'_>> {
        match key {
            "title" => text(&self.title),
            "category" => text(&self.category),
            "description" => text(&self.description),
            "location" => text(&self.location),
            _ => None,
        }
    }
}

impl TextFields for SourceRecord {
    fn field(&self, key: &str) -> Option<FieldValue<'_>> {
        match self {
            SourceRecord::Profile(record) => record.field(key),
            SourceRecord::Item(record) => record.field(key),
        }
    }
}
