//! Task records
//!
//! A task is an open mapping from attribute names to string values. Known
//! attributes carry a semantic type used at the JSON boundary; everything
//! else rides along verbatim (UDA orphans). Two input encodings are
//! accepted: Taskwarrior's Format-4 text records (`[name:"value" …]`) and
//! canonical JSON. Emission is always canonical JSON. Legacy file formats
//! 1-3 are recognized and rejected.
//!
//! Internally dates are epoch seconds; on the wire they use the
//! `YYYYMMDDThhmmssZ` layout. Tags and dependencies are comma-joined
//! strings; annotations are flattened into `annotation_<epoch>`
//! pseudo-attributes.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};
use crate::scanner::Pig;

/// Wire layout for dates. Taskwarrior clients from 2.3.0 on always send
/// dates in this shape.
pub const DATE_LAYOUT: &str = "%Y%m%dT%H%M%SZ";

const ANNOTATION_PREFIX: &str = "annotation_";

/// Semantic type of a known attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Text,
    Date,
    Numeric,
    Duration,
}

/// The static schema for recognized columns; anything else is a UDA orphan.
pub fn attribute_type(name: &str) -> Option<AttrType> {
    match name {
        "depends" | "description" | "id" | "mask" | "parent" | "priority" | "project"
        | "status" | "tags" | "urgency" | "uuid" => Some(AttrType::Text),
        "due" | "end" | "entry" | "modification" | "modified" | "scheduled" | "start"
        | "until" | "wait" => Some(AttrType::Date),
        "imask" => Some(AttrType::Numeric),
        "recur" => Some(AttrType::Duration),
        _ => None,
    }
}

/// Parse a wire-layout date into epoch seconds.
pub fn parse_date(raw: &str) -> Result<i64> {
    let parsed = NaiveDateTime::parse_from_str(raw, DATE_LAYOUT)
        .map_err(|err| Error::TaskParse(format!("parsing date {raw:?}: {err}")))?;
    Ok(parsed.and_utc().timestamp())
}

/// Format epoch seconds in the wire layout.
pub fn format_date(epoch: i64) -> String {
    let date = DateTime::<Utc>::from_timestamp(epoch, 0).unwrap_or_default();
    date.format(DATE_LAYOUT).to_string()
}

/// One task snapshot: an attribute bag keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Task {
    data: BTreeMap<String, String>,
    // Counts non-`annotation_` attributes seen during Format-4 parsing.
    // Looks inverted, and is: taskd counts the same way. Never read,
    // vestigial.
    #[allow(dead_code)]
    annotation_count: usize,
}

/// Equality is the attribute bag alone: the vestigial counter depends on
/// which parse path produced the task and must not distinguish snapshots.
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Task {}

impl Task {
    /// Parse a task record, dispatching on the first rune.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.chars().next() {
            Some('[') => Self::parse_v4(raw),
            Some('{') => Self::parse_json(raw),
            _ => Self::parse_legacy(raw),
        }
    }

    fn parse_v4(raw: &str) -> Result<Self> {
        let mut task = Task::default();

        let mut pig = Pig::new(raw);
        let mut line = String::new();

        if !(pig.skip('[')
            && pig.get_until(']', &mut line)
            && pig.skip(']')
            && (pig.skip('\n') || pig.eos()))
        {
            return Err(Error::TaskParse(
                "unrecognized characters at end of record".into(),
            ));
        }

        if line.is_empty() {
            return Self::parse_legacy(raw);
        }

        let mut attrs = Pig::new(&line);
        while !attrs.eos() {
            let mut name = String::new();
            let mut value = String::new();
            if attrs.get_until(':', &mut name)
                && attrs.skip(':')
                && attrs.get_quoted('"', &mut value)
            {
                if !name.starts_with(ANNOTATION_PREFIX) {
                    task.annotation_count += 1;
                }
                task.data.insert(name, decode(&value));
            } else {
                return Self::parse_legacy(raw);
            }
            attrs.skip(' ');
        }

        Ok(task)
    }

    fn parse_legacy(raw: &str) -> Result<Self> {
        match determine_version(raw) {
            // File format 1, 2006-11-27 - 2007-12-31, v0.x+ - v0.9.3
            1 => Err(Error::TaskParse(
                "taskwarrior no longer supports file format 1, originally used between 27 November 2006 and 31 December 2007".into(),
            )),
            // File format 2, 2008-1-1 - 2009-3-23, v0.9.3 - v1.5.0
            2 => Err(Error::TaskParse(
                "taskwarrior no longer supports file format 2, originally used between 1 January 2008 and 12 April 2009".into(),
            )),
            // File format 3, 2009-3-23 - 2009-05-16, v1.6.0 - v1.7.1
            3 => Err(Error::TaskParse(
                "taskwarrior no longer supports file format 3, originally used between 23 March 2009 and 16 May 2009".into(),
            )),
            // A format-4 shape that did not survive the strict parse.
            4 => Err(Error::TaskParse(
                "record looks like file format 4 but could not be parsed".into(),
            )),
            _ => Err(Error::TaskParse(
                "unrecognized Taskwarrior file format or blank line in data".into(),
            )),
        }
    }

    fn parse_json(raw: &str) -> Result<Self> {
        let fields: Map<String, Value> = serde_json::from_str(raw)
            .map_err(|err| Error::TaskParse(format!("parsing json: {err}")))?;

        let mut task = Task::default();

        for (name, value) in &fields {
            match attribute_type(name) {
                Some(attr_type) => match name.as_str() {
                    // Any specified id or urgency is ignored.
                    "id" | "urgency" => continue,
                    // TW-1274 standardization.
                    "modification" => {
                        let epoch = parse_date(&stringify(value))?;
                        task.data.insert("modified".into(), epoch.to_string());
                    }
                    "tags" => match value {
                        Value::Array(tags) => {
                            for tag in tags {
                                task.add_tag(&stringify(tag));
                            }
                        }
                        // Mirakel sent tags as a bare string; it dropped
                        // sync support in 2015 but the payloads survive.
                        Value::String(tag) => task.add_tag(tag),
                        _ => {
                            return Err(Error::TaskParse(format!(
                                "invalid type for field tags: {value}"
                            )))
                        }
                    },
                    "depends" => match value {
                        Value::Array(deps) => {
                            for dep in deps {
                                task.add_dependency(&stringify(dep))?;
                            }
                        }
                        Value::String(deps) => {
                            for dep in deps.split(',') {
                                task.add_dependency(dep)?;
                            }
                        }
                        _ => {
                            return Err(Error::TaskParse(format!(
                                "invalid type for field depends: {value}"
                            )))
                        }
                    },
                    _ if attr_type == AttrType::Date => {
                        let epoch = parse_date(&stringify(value))?;
                        task.data.insert(name.clone(), epoch.to_string());
                    }
                    _ => {
                        task.data.insert(name.clone(), stringify(value));
                    }
                },
                None if name == "annotations" => task.flatten_annotations(value)?,
                // UDA orphan, preserved as-is.
                None => {
                    task.data.insert(name.clone(), stringify(value));
                }
            }
        }

        Ok(task)
    }

    fn flatten_annotations(&mut self, value: &Value) -> Result<()> {
        let Value::Array(annotations) = value else {
            return Err(Error::TaskParse(format!(
                "annotations type does not match: {value}"
            )));
        };

        for annotation in annotations {
            let Value::Object(fields) = annotation else {
                return Err(Error::TaskParse(format!(
                    "annotation type inside list does not match: {annotation}"
                )));
            };
            let entry = fields.get("entry").ok_or_else(|| {
                Error::TaskParse(format!("annotation is missing an entry date: {annotation}"))
            })?;
            let description = fields.get("description").ok_or_else(|| {
                Error::TaskParse(format!("annotation is missing a description: {annotation}"))
            })?;

            let epoch = parse_date(&stringify(entry))?;
            self.data
                .insert(format!("{ANNOTATION_PREFIX}{epoch}"), stringify(description));
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> &str {
        self.data.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.data.insert(name.into(), value.into());
    }

    pub fn has(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.data.remove(name);
    }

    pub fn uuid(&self) -> &str {
        self.get("uuid")
    }

    /// Numeric value of an attribute; 0 when absent or unparseable.
    pub fn get_int(&self, name: &str) -> i64 {
        self.get(name).parse().unwrap_or(0)
    }

    /// Date attribute as epoch seconds; 0 when absent or unparseable.
    pub fn get_date(&self, name: &str) -> i64 {
        self.get(name).parse().unwrap_or(0)
    }

    pub fn set_date(&mut self, name: impl Into<String>, epoch: i64) {
        self.data.insert(name.into(), epoch.to_string());
    }

    pub fn attr_names(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    fn add_tag(&mut self, tag: &str) {
        let tags = self.get("tags");
        if !tags.is_empty() && tags.split(',').any(|existing| existing == tag) {
            return;
        }
        let joined = if tags.is_empty() {
            tag.to_string()
        } else {
            format!("{tags},{tag}")
        };
        self.data.insert("tags".into(), joined);
    }

    fn add_dependency(&mut self, dependency: &str) -> Result<()> {
        if dependency == self.get("uuid") {
            return Err(Error::TaskParse(
                "a task cannot be dependent on itself".into(),
            ));
        }

        let depends = self.get("depends");
        if depends.split(',').any(|existing| existing == dependency) {
            return Ok(());
        }
        let joined = if depends.is_empty() {
            dependency.to_string()
        } else {
            format!("{depends},{dependency}")
        };
        self.data.insert("depends".into(), joined);
        Ok(())
    }

    /// Canonical JSON emission: dates in the wire layout, `tags` and
    /// `depends` as arrays, annotations re-assembled, numeric attributes as
    /// JSON numbers, empty string values omitted.
    pub fn compose_json(&self) -> String {
        let mut out = Map::new();
        let mut annotations = Vec::new();

        for (name, value) in &self.data {
            if let Some(raw_epoch) = name.strip_prefix(ANNOTATION_PREFIX) {
                let Ok(epoch) = raw_epoch.parse::<i64>() else {
                    warn!(attribute = %name, "malformed annotation attribute");
                    continue;
                };
                let mut annotation = Map::new();
                annotation.insert("entry".into(), Value::String(format_date(epoch)));
                annotation.insert("description".into(), Value::String(value.clone()));
                annotations.push(Value::Object(annotation));
                continue;
            }

            match attribute_type(name) {
                Some(AttrType::Date) => {
                    out.insert(name.clone(), Value::String(format_date(self.get_date(name))));
                }
                Some(AttrType::Numeric) => {
                    out.insert(name.clone(), Value::Number(self.get_int(name).into()));
                }
                _ if name == "tags" || name == "depends" => {
                    let list: Vec<Value> = value
                        .split(',')
                        .map(|item| Value::String(item.to_string()))
                        .collect();
                    out.insert(name.clone(), Value::Array(list));
                }
                _ if !value.is_empty() => {
                    out.insert(name.clone(), Value::String(value.clone()));
                }
                _ => {}
            }
        }

        if !annotations.is_empty() {
            out.insert("annotations".into(), Value::Array(annotations));
        }

        Value::Object(out).to_string()
    }
}

/// Reverse the bracket-protection escapes applied by Format-4 writers.
/// All other escapes stay literal.
pub fn decode(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value.replace("&open;", "[").replace("&close;", "]")
}

/// Classify a record against the historical Taskwarrior file formats.
/// Returns 0 for "no idea".
fn determine_version(line: &str) -> u8 {
    // Version 2: `uuid status [tags] [attributes] description`, where the
    // status char is one of `-+Xr`. Version 3 inserts `[annotations]`
    // before the description; distinguish by counting bracket pairs.
    let valid_uuid = line
        .get(0..36)
        .map(|head| uuid::Uuid::parse_str(head).is_ok())
        .unwrap_or(false);
    let status = line.as_bytes().get(37).copied();

    if valid_uuid && matches!(status, Some(b'-') | Some(b'+') | Some(b'X') | Some(b'r')) {
        let sections = line
            .find("] [")
            .and_then(|tag_atts| {
                line[tag_atts + 1..]
                    .find("] [")
                    .map(|rel| tag_atts + 1 + rel)
            })
            .and_then(|atts_anno| line[atts_anno + 1..].find("] "));
        return if sections.is_some() { 3 } else { 2 };
    }

    if line.starts_with('[') && line.ends_with(']') && line.contains("uuid:\"") {
        // Version 4: `[name:"value" ...]`.
        return 4;
    }

    if line.contains("X [") || (line.starts_with('[') && !line.ends_with(']') && line.len() > 3) {
        // Version 1: `[tags] [attributes] description`, optionally
        // prefixed `X `.
        return 1;
    }

    0
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
