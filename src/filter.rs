//! Subscription filters sent in `REQ` messages.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Filter parameters used when building a Nostr subscription filter.
///
/// Field order is fixed and tags are kept in a `BTreeMap`, so two equal
/// filters always render to the same JSON. Subscription keys rely on that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    /// Restrict to specific authors.
    pub authors: Option<Vec<String>>,
    /// Restrict to event kinds.
    pub kinds: Option<Vec<u32>>,
    /// Tag filters keyed by tag name without the `#` prefix (e.g. `g`).
    pub tags: BTreeMap<String, Vec<String>>,
    /// Lower bound for `created_at`.
    pub since: Option<u64>,
    /// Upper bound for `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored events requested.
    pub limit: Option<u32>,
}

impl Filter {
    pub fn kinds(kinds: impl IntoIterator<Item = u32>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn tag<S: Into<String>>(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let name = name.trim_start_matches('#').to_string();
        self.tags
            .insert(name, values.into_iter().map(Into::into).collect());
        self
    }

    /// Convert into the JSON object used for `REQ` messages.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(authors) = &self.authors {
            map.insert(
                "authors".into(),
                Value::Array(authors.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(kinds) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(
                format!("#{tag}"),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }
}

/// Build the `["REQ", id, filter...]` frame.
pub fn req_message(sub_id: &str, filters: &[Filter]) -> Value {
    let mut frame = vec![Value::String("REQ".into()), Value::String(sub_id.into())];
    frame.extend(filters.iter().map(|f| Value::Object(f.to_json())));
    Value::Array(frame)
}

/// Build the `["CLOSE", id]` frame.
pub fn close_message(sub_id: &str) -> Value {
    Value::Array(vec![
        Value::String("CLOSE".into()),
        Value::String(sub_id.into()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_fields_serialize() {
        let f = Filter {
            since: Some(5),
            until: Some(9),
            limit: Some(100),
            ..Filter::kinds([37515])
        }
        .authors(["a1", "a2"])
        .tag("#g", ["u4p"]);
        let json = Value::Object(f.to_json());
        assert_eq!(json["authors"][1], "a2");
        assert_eq!(json["kinds"][0], 37515);
        assert_eq!(json["#g"][0], "u4p");
        assert_eq!(json["since"], 5);
        assert_eq!(json["until"], 9);
        assert_eq!(json["limit"], 100);
    }

    #[test]
    fn empty_tag_values_are_skipped() {
        let f = Filter::kinds([1]).tag("g", Vec::<String>::new());
        assert!(f.to_json().get("#g").is_none());
    }

    #[test]
    fn empty_authors_are_kept() {
        // an explicit empty author list must not widen to "everyone"
        let f = Filter::kinds([0]).authors(Vec::<String>::new());
        assert_eq!(f.to_json()["authors"], serde_json::json!([]));
    }

    #[test]
    fn frames() {
        let req = req_message("s1", &[Filter::kinds([1])]);
        assert_eq!(req, serde_json::json!(["REQ", "s1", {"kinds": [1]}]));
        assert_eq!(close_message("s1"), serde_json::json!(["CLOSE", "s1"]));
    }
}
