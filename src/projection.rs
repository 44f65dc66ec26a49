use std::collections::HashSet;

use crate::model::{FieldMap, LogMessage, MessageEntry, MessageWrapper, ID_FIELD};

/// Requested subset of extension fields. An empty selection keeps everything.
///
/// Identity fields (`_id`, `timestamp`, `source`) and the message body are
/// always kept, so the same selection yields the same shape for plain,
/// deduplicated and context output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSelection {
    names: Vec<String>,
    lookup: HashSet<String>,
}

impl FieldSelection {
    pub fn all() -> Self {
        Self::default()
    }

    /// Parses a comma separated field list; blanks are ignored.
    pub fn parse(raw: &str) -> Self {
        Self::from_names(raw.split(',').map(str::trim))
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sel = Self::default();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || sel.lookup.contains(name) {
                continue;
            }
            sel.lookup.insert(name.to_string());
            sel.names.push(name.to_string());
        }
        sel
    }

    pub fn is_all(&self) -> bool {
        self.names.is_empty()
    }

    /// Field names in request order, for forwarding upstream.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn project(&self, message: &LogMessage) -> FieldMap {
        let mut map = message.to_field_map();
        if self.is_all() {
            return map;
        }
        map.retain(|k, _| !message.extra.contains_key(k) || self.lookup.contains(k));
        map
    }

    pub fn project_entry(&self, wrapper: &MessageWrapper) -> MessageEntry {
        MessageEntry {
            message: self.project(&wrapper.message),
            index: wrapper.index.clone(),
        }
    }

    /// Projection used for deduplicated groups: `_id` is dropped because the
    /// group reports its members through `message_ids`.
    pub fn project_without_id(&self, message: &LogMessage) -> FieldMap {
        let mut map = self.project(message);
        map.remove(ID_FIELD);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> LogMessage {
        let mut msg = LogMessage {
            id: "m1".into(),
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            source: "api".into(),
            body: "hello".into(),
            ..Default::default()
        };
        msg.extra.insert("level".into(), json!("ERROR"));
        msg.extra.insert("trace_id".into(), json!("t-1"));
        msg
    }

    #[test]
    fn empty_selection_keeps_everything() {
        let map = FieldSelection::parse("").project(&sample());
        assert_eq!(map.len(), 6);
    }

    #[test]
    fn selection_keeps_identity_and_requested_fields() {
        let map = FieldSelection::parse(" level , ,").project(&sample());
        assert_eq!(map["_id"], "m1");
        assert_eq!(map["timestamp"], "2024-01-01T00:00:00.000Z");
        assert_eq!(map["source"], "api");
        assert_eq!(map["message"], "hello");
        assert_eq!(map["level"], "ERROR");
        assert!(!map.contains_key("trace_id"));
    }

    #[test]
    fn identity_fields_survive_even_when_not_listed() {
        let map = FieldSelection::parse("nothing_here").project(&sample());
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn project_without_id_drops_only_id() {
        let map = FieldSelection::all().project_without_id(&sample());
        assert!(!map.contains_key("_id"));
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn names_are_deduplicated_in_order() {
        let sel = FieldSelection::parse("b,a,b");
        assert_eq!(sel.names(), &["b".to_string(), "a".to_string()]);
    }
}
