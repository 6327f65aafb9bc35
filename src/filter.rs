//! NIP-01 subscription filters and event matching.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};

use crate::event::Event;

/// One filter object from a `REQ` or `COUNT` message.
///
/// Fields within a filter are combined with AND; a list of filters is combined
/// with OR (see [`matches_any`]). Absent fields place no constraint, while a
/// present but empty set matches nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<HashSet<String>>,
    pub authors: Option<HashSet<String>>,
    pub kinds: Option<HashSet<u32>>,
    /// Tag constraints keyed without the `#` prefix, e.g. `"t" -> {"news"}`.
    pub tags: BTreeMap<String, HashSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    /// Caps historical replay only; live delivery ignores it.
    pub limit: Option<usize>,
}

impl Filter {
    /// Build a filter from its JSON object form.
    ///
    /// Unknown keys are ignored. A known key holding a value of the wrong type
    /// is an error so clients learn about typos in their filters.
    pub fn from_value(val: &Value) -> Result<Self, String> {
        let obj = val
            .as_object()
            .ok_or_else(|| "filter must be a JSON object".to_string())?;
        let mut filter = Filter::default();
        for (key, value) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_set(key, value)?),
                "authors" => filter.authors = Some(string_set(key, value)?),
                "kinds" => {
                    let arr = value
                        .as_array()
                        .ok_or_else(|| format!("{key} must be an array"))?;
                    let kinds = arr
                        .iter()
                        .map(|v| {
                            v.as_u64()
                                .and_then(|k| u32::try_from(k).ok())
                                .ok_or_else(|| format!("{key} must contain kind numbers"))
                        })
                        .collect::<Result<_, _>>()?;
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(timestamp(key, value)?),
                "until" => filter.until = Some(timestamp(key, value)?),
                "limit" => {
                    let limit = timestamp(key, value)?;
                    filter.limit = Some(usize::try_from(limit).unwrap_or(usize::MAX));
                }
                tag if tag.len() > 1 && tag.starts_with('#') => {
                    filter
                        .tags
                        .insert(tag[1..].to_string(), string_set(key, value)?);
                }
                _ => {}
            }
        }
        Ok(filter)
    }

    /// JSON object form, as echoed back to kind handlers.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), sorted(ids));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), sorted(authors));
        }
        if let Some(kinds) = &self.kinds {
            let mut kinds: Vec<u32> = kinds.iter().copied().collect();
            kinds.sort_unstable();
            obj.insert("kinds".into(), Value::from(kinds));
        }
        for (key, values) in &self.tags {
            obj.insert(format!("#{key}"), sorted(values));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), limit.into());
        }
        Value::Object(obj)
    }

    /// Check whether `ev` satisfies every constraint of this filter.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (key, accepted) in &self.tags {
            let hit = ev.tags.iter().any(|tag| {
                tag.key() == Some(key.as_str()) && tag.value().is_some_and(|v| accepted.contains(v))
            });
            if !hit {
                return false;
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }
}

/// True when any filter in `filters` matches `ev`.
pub fn matches_any(filters: &[Filter], ev: &Event) -> bool {
    filters.iter().any(|f| f.matches(ev))
}

fn string_set(key: &str, value: &Value) -> Result<HashSet<String>, String> {
    let arr = value
        .as_array()
        .ok_or_else(|| format!("{key} must be an array"))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("{key} must contain strings"))
        })
        .collect()
}

fn timestamp(key: &str, value: &Value) -> Result<u64, String> {
    value
        .as_u64()
        .ok_or_else(|| format!("{key} must be a non-negative integer"))
}

fn sorted(values: &HashSet<String>) -> Value {
    let mut out: Vec<&String> = values.iter().collect();
    out.sort();
    Value::from(out.into_iter().cloned().collect::<Vec<_>>())
}
