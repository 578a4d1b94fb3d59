//! Decoding of generation-service output.
//!
//! The generation service is untrusted and loosely formatted: the payload may
//! arrive fenced in markdown, surrounded by prose, or string-encoded one or
//! more times. [`parse_allocation`] peels those layers off losslessly, then
//! decodes the result into a typed [`Allocation`] or fails with
//! [`EngineError::InvalidAllocation`]. Nothing untyped leaves this module.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::SessionKind;

/// A validated candidate allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub sections: Vec<SectionPlan>,
    /// Authoritative replacement bitmaps, when the service supplied them.
    pub snapshot: Option<AvailabilitySnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionPlan {
    pub section_id: String,
    pub section_name: Option<String>,
    /// `days[day][slot]`; `None` for empty, break and malformed cells.
    /// A malformed day row decodes as empty.
    pub days: Vec<Vec<Option<PlacedCell>>>,
}

/// An occupied cell as proposed by the generation service.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedCell {
    pub course_id: String,
    pub faculty_ids: Vec<Ulid>,
    pub room_ids: Vec<Ulid>,
    pub kind: SessionKind,
    /// 1-based global slot index, not yet range-checked.
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvailabilitySnapshot {
    pub faculty: Vec<(Ulid, Vec<u8>)>,
    pub rooms: Vec<(Ulid, Vec<u8>)>,
}

impl AvailabilitySnapshot {
    pub fn is_empty(&self) -> bool {
        self.faculty.is_empty() && self.rooms.is_empty()
    }
}

impl Allocation {
    pub fn occupied_cells(&self) -> usize {
        self.sections
            .iter()
            .flat_map(|s| s.days.iter())
            .flat_map(|d| d.iter())
            .filter(|c| c.is_some())
            .count()
    }
}

/// Cell as it comes off the wire. Every field is optional so that decoding an
/// object never fails; interpretation happens in [`decode_cell`].
#[derive(Debug, Default, Deserialize)]
struct RawCell {
    courseid: Option<Value>,
    facultyid: Option<Value>,
    roomid: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<Value>,
    index: Option<Value>,
}

pub fn parse_allocation(raw: &str) -> Result<Allocation, EngineError> {
    if raw.len() > MAX_ALLOCATION_BYTES {
        return Err(EngineError::LimitExceeded("allocation payload too large"));
    }
    let root = normalize(raw)?;
    decode(&root)
}

/// Extract the JSON value carried by `raw`, stripping markdown fences,
/// surrounding text and layers of string encoding.
pub fn normalize(raw: &str) -> Result<Value, EngineError> {
    let mut text = raw.trim().to_string();
    for _ in 0..=MAX_UNWRAP_DEPTH {
        match serde_json::from_str::<Value>(strip_fences(&text)) {
            Ok(Value::String(inner)) => {
                text = inner.trim().to_string();
                continue;
            }
            Ok(value) => return Ok(value),
            Err(_) => {}
        }
        if let Some(object) = outermost_object(&text)
            && object.len() < text.len()
        {
            text = object.to_string();
            continue;
        }
        // Escaped quoting without an enclosing string literal: {\"timetables\": ...}
        if text.contains("\\\"")
            && let Ok(unescaped) = serde_json::from_str::<String>(&format!("\"{text}\""))
        {
            text = unescaped;
            continue;
        }
        break;
    }
    Err(invalid("no JSON object found in generation output"))
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (```json) up to the first newline.
    let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// The first balanced `{...}` in `text`. Braces inside JSON string literals
/// do not count.
fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn decode(root: &Value) -> Result<Allocation, EngineError> {
    let obj = root
        .as_object()
        .ok_or_else(|| invalid("top-level value is not an object"))?;
    let timetables = match obj.get("timetables") {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(invalid("`timetables` is not a mapping")),
        None => return Err(invalid("missing `timetables`")),
    };
    if timetables.len() > MAX_SECTIONS_PER_COMMIT {
        return Err(EngineError::LimitExceeded("too many sections in allocation"));
    }

    let mut sections = Vec::with_capacity(timetables.len());
    for (section_id, block) in timetables {
        if let Some(section) = decode_section(section_id, block)? {
            sections.push(section);
        }
    }

    let snapshot = match obj.get("updatedAvailability") {
        None | Some(Value::Null) => None,
        Some(v) => Some(decode_snapshot(v)?),
    };

    Ok(Allocation { sections, snapshot })
}

/// `Ok(None)` for a section block that carries no usable `days`.
fn decode_section(section_id: &str, block: &Value) -> Result<Option<SectionPlan>, EngineError> {
    let section_id = section_id.trim();
    if section_id.is_empty() {
        warn!("skipping section with an empty id");
        return Ok(None);
    }
    if section_id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("section id too long"));
    }
    let days = match block.get("days") {
        Some(Value::Array(days)) => days,
        _ => {
            warn!("skipping section {section_id}: no `days` sequence");
            return Ok(None);
        }
    };
    let section_name = block
        .get("sectionName")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut decoded = Vec::with_capacity(days.len());
    for (day, slots) in days.iter().enumerate() {
        let mut cells = Vec::new();
        match slots {
            Value::Array(raw) => {
                cells.reserve(raw.len());
                for (slot, cell) in raw.iter().enumerate() {
                    cells.push(decode_cell(cell, section_id, day, slot)?);
                }
            }
            Value::Null => {}
            _ => debug!("section {section_id}: day {day} is not a slot sequence, skipped"),
        }
        decoded.push(cells);
    }

    Ok(Some(SectionPlan {
        section_id: section_id.to_string(),
        section_name,
        days: decoded,
    }))
}

/// `Ok(None)` for any cell that does not describe an occupied teaching slot,
/// including cells whose ids or index cannot be read.
fn decode_cell(
    cell: &Value,
    section_id: &str,
    day: usize,
    slot: usize,
) -> Result<Option<PlacedCell>, EngineError> {
    if !cell.is_object() {
        return Ok(None);
    }
    let Ok(raw) = RawCell::deserialize(cell) else {
        return Ok(None);
    };
    let kind = match raw.kind.as_ref().and_then(Value::as_str) {
        Some(t) if t.eq_ignore_ascii_case("break") => return Ok(None),
        Some(t) if t.eq_ignore_ascii_case("practical") || t.eq_ignore_ascii_case("lab") => {
            SessionKind::Practical
        }
        _ => SessionKind::Theory,
    };
    let Some(course_id) = raw.courseid.as_ref().and_then(scalar_string) else {
        return Ok(None);
    };
    if course_id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("course id too long"));
    }

    let ids = (
        decode_ids(raw.facultyid.as_ref(), "facultyid"),
        decode_ids(raw.roomid.as_ref(), "roomid"),
    );
    let (faculty_ids, room_ids) = match ids {
        (Ok(faculty), Ok(rooms)) => (faculty, rooms),
        (Err(reason), _) | (_, Err(reason)) => {
            warn!("skipping section {section_id} day {day} slot {slot}: {reason}");
            return Ok(None);
        }
    };
    let index = match raw.index.as_ref() {
        None => None,
        Some(v) => match decode_index(v) {
            Some(index) => Some(index),
            None => {
                warn!(
                    "skipping section {section_id} day {day} slot {slot}: \
                     `index` {v} is not a non-negative integer"
                );
                return Ok(None);
            }
        },
    };

    Ok(Some(PlacedCell {
        course_id,
        faculty_ids,
        room_ids,
        kind,
        index,
    }))
}

/// Accepts an absent/empty id, a single id, or a sequence of ids.
/// Duplicates collapse, first occurrence wins. `Err` carries the reason the
/// field could not be read.
fn decode_ids(value: Option<&Value>, field: &str) -> Result<Vec<Ulid>, String> {
    let mut ids = Vec::new();
    let mut push = |raw: &str| -> Result<(), String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(());
        }
        let id = Ulid::from_string(raw).map_err(|e| format!("bad {field} {raw:?}: {e}"))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
        Ok(())
    };
    match value {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => push(s)?,
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(s) => push(s)?,
                    Value::Null => {}
                    other => return Err(format!("bad {field} element {other}")),
                }
            }
        }
        Some(other) => return Err(format!("bad {field} {other}")),
    }
    Ok(ids)
}

fn decode_index(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn decode_snapshot(value: &Value) -> Result<AvailabilitySnapshot, EngineError> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid("`updatedAvailability` is not an object"))?;
    Ok(AvailabilitySnapshot {
        faculty: decode_bitmaps(obj, "faculty")?,
        rooms: decode_bitmaps(obj, "rooms")?,
    })
}

fn decode_bitmaps(obj: &Map<String, Value>, field: &str) -> Result<Vec<(Ulid, Vec<u8>)>, EngineError> {
    let map = match obj.get(field) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(invalid(format!("`updatedAvailability.{field}` is not a mapping"))),
    };
    let mut out = Vec::with_capacity(map.len());
    for (raw_id, bits) in map {
        let id = Ulid::from_string(raw_id.trim())
            .map_err(|e| invalid(format!("updatedAvailability.{field}: bad id {raw_id:?}: {e}")))?;
        let Value::Array(items) = bits else {
            return Err(invalid(format!("updatedAvailability.{field}.{raw_id} is not a sequence")));
        };
        if items.len() > MAX_GRID_CELLS {
            return Err(EngineError::LimitExceeded("snapshot bitmap too long"));
        }
        let bits = items
            .iter()
            .map(|b| match b {
                Value::Bool(v) => Some(u8::from(*v)),
                Value::Number(n) => n.as_u64().map(|v| u8::from(v != 0)),
                _ => None,
            })
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| invalid(format!("updatedAvailability.{field}.{raw_id}: non-numeric bit")))?;
        out.push((id, bits));
    }
    Ok(out)
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::InvalidAllocation(msg.into())
}
