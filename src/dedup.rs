//! Content-hash deduplication of message batches.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::{FieldMap, LogMessage, MessageWrapper, ID_FIELD, TIMESTAMP_FIELD};
use crate::projection::FieldSelection;

/// Fields that identify a message rather than describe it.
const UNHASHED_FIELDS: [&str; 3] = [ID_FIELD, TIMESTAMP_FIELD, "index"];

/// Messages judged content-identical, represented by the first one seen.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupGroup {
    pub message: LogMessage,
    pub index: String,
    /// Number of source messages in the group. Never reduced by capping.
    pub count: usize,
    pub sample_ids: Vec<String>,
}

/// Serialized form of a [`DedupGroup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub message: FieldMap,
    pub index: String,
    pub count: usize,
    pub message_ids: Vec<String>,
}

impl DedupGroup {
    pub fn to_entry(&self, fields: &FieldSelection) -> DedupEntry {
        DedupEntry {
            message: fields.project_without_id(&self.message),
            index: self.index.clone(),
            count: self.count,
            message_ids: self.sample_ids.clone(),
        }
    }
}

/// Groups `messages` by content hash in first-occurrence order.
///
/// `hash_fields`, when non-empty, restricts hashing to those fields.
pub fn deduplicate(messages: &[MessageWrapper], hash_fields: &[String]) -> Vec<DedupGroup> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(messages.len());
    let mut groups: Vec<DedupGroup> = Vec::new();

    for mw in messages {
        let hash = content_hash(&mw.message, hash_fields);
        match positions.get(&hash) {
            Some(&pos) => {
                let group = &mut groups[pos];
                group.count += 1;
                group.sample_ids.push(mw.message.id.clone());
            }
            None => {
                positions.insert(hash, groups.len());
                groups.push(DedupGroup {
                    message: mw.message.clone(),
                    index: mw.index.clone(),
                    count: 1,
                    sample_ids: vec![mw.message.id.clone()],
                });
            }
        }
    }
    groups
}

/// Keeps at most `max_ids` sample ids per group. Counts are untouched.
pub fn cap_sample_ids(groups: &mut [DedupGroup], max_ids: usize) {
    for group in groups {
        group.sample_ids.truncate(max_ids);
    }
}

/// Hex SHA-256 over the canonical (key-sorted) JSON of the hashed fields.
pub fn content_hash(message: &LogMessage, hash_fields: &[String]) -> String {
    let all = message.to_field_map();
    let canonical: BTreeMap<&str, &Value> = if hash_fields.is_empty() {
        all.iter()
            .filter(|(k, _)| !UNHASHED_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    } else {
        hash_fields
            .iter()
            .filter(|f| !UNHASHED_FIELDS.contains(&f.as_str()))
            .filter_map(|f| all.get_key_value(f.as_str()))
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    };

    let bytes = serde_json::to_vec(&canonical)
        .unwrap_or_else(|_| format!("{canonical:?}").into_bytes());
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}
