use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const SPEC_V2: &str = "chara_card_v2";
pub const SPEC_VERSION_V2: &str = "2.0";

fn default_true() -> bool {
    true
}

fn spec_v2() -> String {
    SPEC_V2.to_string()
}

fn spec_version_v2() -> String {
    SPEC_VERSION_V2.to_string()
}

/// Read an integer the way upstream producers actually write them:
/// plain integers, floats, or numeric strings.
fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(lenient_i64(&value).unwrap_or(0))
}

fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(lenient_i64(&value))
}

/// Where a lorebook entry is inserted relative to the character definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryPosition {
    BeforeChar,
    #[default]
    AfterChar,
}

impl EntryPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPosition::BeforeChar => "before_char",
            EntryPosition::AfterChar => "after_char",
        }
    }

    /// Parse one of the two semantic values; anything else is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "before_char" => Some(EntryPosition::BeforeChar),
            "after_char" => Some(EntryPosition::AfterChar),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LorebookEntry {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub extensions: Map<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "de_i64")]
    pub insertion_order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>, // Can be int or string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selective: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant: Option<bool>,
    #[serde(default)]
    pub position: EntryPosition,

    // Preserve unknown fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CharacterBook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        deserialize_with = "de_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub scan_depth: Option<i64>,
    #[serde(
        default,
        deserialize_with = "de_opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub token_budget: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursive_scanning: Option<bool>,
    #[serde(default)]
    pub extensions: Map<String, Value>,
    #[serde(default)]
    pub entries: Vec<LorebookEntry>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CardData {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub first_mes: String,
    #[serde(default)]
    pub mes_example: String,

    #[serde(default)]
    pub creator_notes: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub post_history_instructions: String,
    #[serde(default)]
    pub alternate_greetings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_book: Option<CharacterBook>,

    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub character_version: String,
    #[serde(default)]
    pub extensions: Map<String, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A normalized character card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDocument {
    #[serde(default = "spec_v2")]
    pub spec: String, // "chara_card_v2"
    #[serde(default = "spec_version_v2")]
    pub spec_version: String, // "2.0"
    pub data: CardData,
}

impl Default for CardDocument {
    fn default() -> Self {
        Self {
            spec: spec_v2(),
            spec_version: spec_version_v2(),
            data: CardData::default(),
        }
    }
}

impl CardDocument {
    pub fn new(name: String) -> Self {
        Self {
            data: CardData {
                name,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Serialize to the compact JSON form that is persisted and embedded.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Move the personality text into the creator notes and clear it.
    ///
    /// Existing creator notes are replaced.
    pub fn relocate_personality(&mut self) {
        self.data.creator_notes = std::mem::take(&mut self.data.personality);
    }

    pub fn lorebook_entries(&self) -> &[LorebookEntry] {
        self.data
            .character_book
            .as_ref()
            .map(|book| book.entries.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_card_has_v2_spec() {
        let card = CardDocument::new("Test".to_string());
        assert_eq!(card.spec, "chara_card_v2");
        assert_eq!(card.spec_version, "2.0");
        assert_eq!(card.data.name, "Test");
    }

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let value = json!({
            "spec": "chara_card_v2",
            "spec_version": "2.0",
            "data": {
                "name": "A",
                "vendor_field": {"x": 1},
                "character_book": {
                    "entries": [
                        {"keys": ["k"], "content": "c", "position": "before_char", "display_index": 3}
                    ],
                    "book_extra": true
                }
            }
        });

        let card: CardDocument = serde_json::from_value(value).unwrap();
        assert_eq!(card.data.extra["vendor_field"], json!({"x": 1}));

        let back = serde_json::to_value(&card).unwrap();
        assert_eq!(back["data"]["vendor_field"], json!({"x": 1}));
        assert_eq!(back["data"]["character_book"]["book_extra"], true);
        assert_eq!(
            back["data"]["character_book"]["entries"][0]["display_index"],
            3
        );
        assert_eq!(
            back["data"]["character_book"]["entries"][0]["position"],
            "before_char"
        );
    }

    #[test]
    fn test_lenient_integers() {
        let entry: LorebookEntry = serde_json::from_value(json!({
            "keys": [],
            "content": "",
            "insertion_order": 12.0,
            "priority": "7"
        }))
        .unwrap();
        assert_eq!(entry.insertion_order, 12);
        assert_eq!(entry.priority, Some(7));
        assert!(entry.enabled);
    }

    #[test]
    fn test_numeric_position_is_not_canonical() {
        let result: Result<LorebookEntry, _> =
            serde_json::from_value(json!({"keys": [], "content": "", "position": 0}));
        assert!(result.is_err());
    }

    #[test]
    fn test_relocate_personality() {
        let mut card = CardDocument::new("P".to_string());
        card.data.personality = "cheerful".to_string();
        card.data.creator_notes = "old notes".to_string();
        card.relocate_personality();
        assert_eq!(card.data.creator_notes, "cheerful");
        assert_eq!(card.data.personality, "");
    }

    #[test]
    fn test_entry_position_parse() {
        assert_eq!(
            EntryPosition::parse("before_char"),
            Some(EntryPosition::BeforeChar)
        );
        assert_eq!(EntryPosition::parse("0"), None);
        assert_eq!(EntryPosition::AfterChar.as_str(), "after_char");
    }
}
