use crate::card::{CardDocument, EntryPosition, SPEC_V2, SPEC_VERSION_V2};
use crate::definition::unwrap_double_encoded;
use crate::error::{CharavaultError, Result};
use serde_json::{Map, Value};
use tracing::debug;

pub const SPEC_V3: &str = "chara_card_v3";

/// Fields that are plain strings in the canonical schema.
const STRING_FIELDS: &[&str] = &[
    "name",
    "description",
    "personality",
    "scenario",
    "first_mes",
    "mes_example",
    "creator_notes",
    "system_prompt",
    "post_history_instructions",
    "creator",
    "character_version",
];

/// V3 fields with no V2 counterpart; kept under `extensions.chara_card_v3`.
const V3_ONLY_FIELDS: &[&str] = &[
    "assets",
    "nickname",
    "creator_notes_multilingual",
    "source",
    "group_only_greetings",
    "creation_date",
    "modification_date",
];

/// Caller-selected transforms applied after conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Move `personality` into `creator_notes` and clear it.
    pub personality_to_creator_notes: bool,
}

/// Upstream card shapes recognized by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CardDialect {
    /// `{spec: "chara_card_v2", data: {...}}`
    V2,
    /// `{spec: "chara_card_v3", data: {...}}`
    V3,
    /// `{data: {name, ...}}` without a `spec` marker
    Nested,
    /// Flat `{name, description, personality, ...}`
    V1,
    /// Flat `{char_name, char_persona, world_scenario, ...}`
    Pygmalion,
}

/// Parse raw card JSON into the canonical schema.
pub fn parse_to_canonical(raw_json: &str) -> Result<CardDocument> {
    normalize_card(raw_json, &NormalizeOptions::default())
}

/// Parse raw card JSON into the canonical schema and apply `options`.
pub fn normalize_card(raw_json: &str, options: &NormalizeOptions) -> Result<CardDocument> {
    let without_bom = raw_json.trim_start().trim_start_matches('\u{feff}');
    let unwrapped = unwrap_double_encoded(without_bom)?;
    let trimmed = unwrapped.trim();
    let trimmed = trimmed.strip_prefix('\u{feff}').unwrap_or(trimmed);

    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| CharavaultError::SchemaError(format!("Card is not valid JSON: {}", e)))?;

    normalize_value(value, options)
}

/// Normalize an already-parsed JSON value.
pub fn normalize_value(value: Value, options: &NormalizeOptions) -> Result<CardDocument> {
    let dialect = detect_dialect(&value)?;

    let Value::Object(root) = value else {
        return Err(CharavaultError::SchemaError(
            "Card must be a JSON object".to_string(),
        ));
    };

    let data = match dialect {
        CardDialect::V2 | CardDialect::Nested => canonical_data(nested_data(root)?)?,
        CardDialect::V3 => canonical_data(downgrade_v3(nested_data(root)?))?,
        CardDialect::V1 => canonical_data(flat_data(root))?,
        CardDialect::Pygmalion => canonical_data(pygmalion_data(root))?,
    };

    let mut canonical = serde_json::json!({
        "spec": SPEC_V2,
        "spec_version": SPEC_VERSION_V2,
        "data": Value::Object(data),
    });

    let repaired = repair_lorebook_positions(&mut canonical);

    let mut card: CardDocument = serde_json::from_value(canonical).map_err(|e| {
        CharavaultError::SchemaError(format!("Card does not match {} schema: {}", dialect, e))
    })?;

    if options.personality_to_creator_notes {
        card.relocate_personality();
    }

    debug!(%dialect, repaired, name = %card.data.name, "normalized card");
    Ok(card)
}

/// Identify which upstream shape `value` has.
pub fn detect_dialect(value: &Value) -> Result<CardDialect> {
    let Some(obj) = value.as_object() else {
        return Err(CharavaultError::SchemaError(
            "Card must be a JSON object".to_string(),
        ));
    };

    let has_data_object = obj.get("data").is_some_and(Value::is_object);

    match obj.get("spec") {
        Some(Value::String(spec)) if spec == SPEC_V2 && has_data_object => {
            return Ok(CardDialect::V2)
        }
        Some(Value::String(spec)) if spec == SPEC_V3 && has_data_object => {
            return Ok(CardDialect::V3)
        }
        Some(Value::String(spec)) => {
            return Err(CharavaultError::SchemaError(format!(
                "Unsupported card spec '{}'",
                spec
            )))
        }
        _ => {}
    }

    if has_data_object && obj["data"].get("name").is_some_and(Value::is_string) {
        return Ok(CardDialect::Nested);
    }
    if obj.get("name").is_some_and(Value::is_string) {
        return Ok(CardDialect::V1);
    }
    if obj.get("char_name").is_some_and(Value::is_string) {
        return Ok(CardDialect::Pygmalion);
    }

    Err(CharavaultError::SchemaError(
        "JSON does not match any known card shape".to_string(),
    ))
}

/// Apply the lorebook position repair rule to a canonical card value.
///
/// Entries whose `position` is not `before_char`/`after_char` get
/// `before_char` when the value is loosely zero and `after_char` otherwise.
/// Returns how many entries were changed; a second pass always returns 0.
pub fn repair_lorebook_positions(card: &mut Value) -> usize {
    let Some(entries) = card
        .pointer_mut("/data/character_book/entries")
        .and_then(Value::as_array_mut)
    else {
        return 0;
    };

    let mut repaired = 0;
    for entry in entries.iter_mut() {
        let Some(obj) = entry.as_object_mut() else {
            continue;
        };

        let current = obj.get("position");
        if current
            .and_then(Value::as_str)
            .and_then(EntryPosition::parse)
            .is_some()
        {
            continue;
        }

        let position = if current.is_some_and(is_loosely_zero) {
            EntryPosition::BeforeChar
        } else {
            EntryPosition::AfterChar
        };
        obj.insert(
            "position".to_string(),
            Value::String(position.as_str().to_string()),
        );
        repaired += 1;
    }

    repaired
}

/// Mirrors the loose `== 0` comparison upstream producers rely on.
fn is_loosely_zero(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Bool(b) => !b,
        Value::String(s) => {
            let t = s.trim();
            t.is_empty() || t.parse::<f64>().is_ok_and(|f| f == 0.0)
        }
        _ => false,
    }
}

fn nested_data(mut root: Map<String, Value>) -> Result<Map<String, Value>> {
    match root.remove("data") {
        Some(Value::Object(data)) => Ok(data),
        _ => Err(CharavaultError::SchemaError(
            "Card 'data' must be an object".to_string(),
        )),
    }
}

fn flat_data(mut root: Map<String, Value>) -> Map<String, Value> {
    root.remove("spec");
    root.remove("spec_version");
    root.remove("data");
    rename_key(&mut root, "creatorcomment", "creator_notes");
    root
}

fn pygmalion_data(mut root: Map<String, Value>) -> Map<String, Value> {
    rename_key(&mut root, "char_name", "name");
    rename_key(&mut root, "char_persona", "description");
    rename_key(&mut root, "world_scenario", "scenario");
    rename_key(&mut root, "char_greeting", "first_mes");
    rename_key(&mut root, "example_dialogue", "mes_example");
    root
}

fn downgrade_v3(mut data: Map<String, Value>) -> Map<String, Value> {
    let mut v3_only = Map::new();
    for field in V3_ONLY_FIELDS {
        if let Some(value) = data.remove(*field) {
            v3_only.insert(field.to_string(), value);
        }
    }

    if !v3_only.is_empty() {
        let extensions = data
            .entry("extensions")
            .or_insert_with(|| Value::Object(Map::new()));
        if !extensions.is_object() {
            *extensions = Value::Object(Map::new());
        }
        if let Some(ext) = extensions.as_object_mut() {
            ext.insert(SPEC_V3.to_string(), Value::Object(v3_only));
        }
    }

    data
}

/// Move `from` to `to` unless `to` is already present.
fn rename_key(map: &mut Map<String, Value>, from: &str, to: &str) {
    if map.contains_key(to) {
        return;
    }
    if let Some(value) = map.remove(from) {
        map.insert(to.to_string(), value);
    }
}

/// Coerce loosely-typed fields into the shapes the typed model expects.
fn canonical_data(mut data: Map<String, Value>) -> Result<Map<String, Value>> {
    for field in STRING_FIELDS {
        if let Some(value) = data.get_mut(*field) {
            coerce_string(value);
        }
    }

    if let Some(tags) = data.get_mut("tags") {
        coerce_string_list(tags, true);
    }
    if let Some(greetings) = data.get_mut("alternate_greetings") {
        coerce_string_list(greetings, false);
    }
    if data.get("extensions").is_some_and(Value::is_null) {
        data.insert("extensions".to_string(), Value::Object(Map::new()));
    }

    match data.get_mut("character_book") {
        Some(Value::Null) => {
            data.remove("character_book");
        }
        Some(Value::Object(book)) => canonical_book(book),
        Some(_) => {
            return Err(CharavaultError::SchemaError(
                "character_book must be an object".to_string(),
            ))
        }
        None => {}
    }

    Ok(data)
}

fn canonical_book(book: &mut Map<String, Value>) {
    if book.get("extensions").is_some_and(Value::is_null) {
        book.insert("extensions".to_string(), Value::Object(Map::new()));
    }
    if !book.get("entries").is_some_and(Value::is_array) {
        book.insert("entries".to_string(), Value::Array(Vec::new()));
    }

    let Some(entries) = book.get_mut("entries").and_then(Value::as_array_mut) else {
        return;
    };
    for entry in entries.iter_mut().filter_map(Value::as_object_mut) {
        if let Some(keys) = entry.get_mut("keys") {
            coerce_string_list(keys, true);
        }
        if let Some(keys) = entry.get_mut("secondary_keys") {
            coerce_string_list(keys, true);
        }
        if let Some(content) = entry.get_mut("content") {
            coerce_string(content);
        }
        if entry.get("extensions").is_some_and(Value::is_null) {
            entry.insert("extensions".to_string(), Value::Object(Map::new()));
        }
    }
}

fn coerce_string(value: &mut Value) {
    match value {
        Value::Null => *value = Value::String(String::new()),
        Value::Number(n) => *value = Value::String(n.to_string()),
        Value::Bool(b) => *value = Value::String(b.to_string()),
        _ => {}
    }
}

/// Accept arrays (dropping nulls, stringifying scalars) and, for keyword-like
/// fields, comma-separated strings.
fn coerce_string_list(value: &mut Value, comma_separated: bool) {
    let items: Vec<String> = match value {
        Value::Null => Vec::new(),
        Value::String(s) if comma_separated => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) if s.is_empty() => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(arr) => arr
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
            .collect(),
        _ => return,
    };

    *value = Value::Array(items.into_iter().map(Value::String).collect());
}
