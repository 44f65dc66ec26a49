//! Template grouping of message bodies through a line-pattern miner.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GraylogMcpError, Result};
use crate::model::MessageWrapper;

pub const WILDCARD: &str = "<*>";

/// One group reported by a miner: its template and the input line
/// positions that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct MinedGroup {
    pub template: String,
    pub lines: Vec<usize>,
}

/// Turns single-line strings into template groups.
pub trait PatternMiner {
    fn mine(&mut self, lines: &[String]) -> Result<Vec<MinedGroup>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateGroup {
    #[serde(rename = "template")]
    pub pattern: String,
    pub count: usize,
    #[serde(rename = "message_ids")]
    pub sample_ids: Vec<String>,
}

/// Groups message bodies into templates, most frequent first.
///
/// Equal counts keep the order in which their first member appeared in
/// `messages`. Each group lists at most `max_ids` sample ids.
pub fn templateize<M: PatternMiner + ?Sized>(
    messages: &[MessageWrapper],
    miner: &mut M,
    max_ids: usize,
) -> Result<Vec<TemplateGroup>> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let lines: Vec<String> = messages
        .iter()
        .map(|mw| single_line(&mw.message.body))
        .collect();
    let ids: Vec<&str> = messages.iter().map(|mw| mw.message.id.as_str()).collect();

    let mut ranked: Vec<(usize, TemplateGroup)> = Vec::new();
    for group in miner.mine(&lines)? {
        let mut members: Vec<usize> = group.lines.into_iter().filter(|&l| l < ids.len()).collect();
        if members.is_empty() {
            continue;
        }
        members.sort_unstable();
        members.dedup();
        let first = members[0];
        ranked.push((
            first,
            TemplateGroup {
                pattern: group.template,
                count: members.len(),
                sample_ids: members.iter().map(|&l| ids[l].to_string()).collect(),
            },
        ));
    }

    ranked.sort_by(|(fa, a), (fb, b)| b.count.cmp(&a.count).then(fa.cmp(fb)));
    let mut groups: Vec<TemplateGroup> = ranked.into_iter().map(|(_, g)| g).collect();
    cap_template_ids(&mut groups, max_ids);
    Ok(groups)
}

pub fn cap_template_ids(groups: &mut [TemplateGroup], max_ids: usize) {
    for group in groups {
        group.sample_ids.truncate(max_ids);
    }
}

/// The miner is line oriented, so embedded line breaks become spaces.
fn single_line(body: &str) -> String {
    body.replace(['\r', '\n'], " ")
}

static VARIABLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
        r"\b\d{1,3}(?:\.\d{1,3}){3}(?::\d+)?\b",
        r"\b0x[0-9a-fA-F]+\b",
        r"\b[0-9a-fA-F]{16,}\b",
        r"\b\d+(?:\.\d+)?\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static PLACEHOLDER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"<[^>\s]+>").ok());

/// Replaces obviously variable tokens (ids, addresses, numbers) with
/// [`WILDCARD`] before mining.
pub fn mask_variables(line: &str) -> String {
    let mut out = line.to_string();
    for re in VARIABLE_PATTERNS.iter() {
        out = re.replace_all(&out, WILDCARD).into_owned();
    }
    out
}

/// Normalizes any `<NAME>` placeholder to [`WILDCARD`].
pub fn to_generic_template(s: &str) -> String {
    match PLACEHOLDER.as_ref() {
        Some(re) => re.replace_all(s, WILDCARD).into_owned(),
        None => s.to_string(),
    }
}

fn is_wildcard(token: &str) -> bool {
    token.len() > 2 && token.starts_with('<') && token.ends_with('>')
}

/// Whether `template` generalizes `line` token by token.
fn covers(template: &[&str], line: &[&str]) -> bool {
    template.len() == line.len()
        && template
            .iter()
            .zip(line)
            .all(|(t, l)| t == l || is_wildcard(t))
}

/// Drain-based miner. Each `mine` call starts from a fresh tree.
#[derive(Debug, Clone, Copy)]
pub struct DrainMiner {
    max_depth: u16,
    min_similarity: f32,
    max_children: u16,
}

impl Default for DrainMiner {
    fn default() -> Self {
        Self {
            max_depth: 4,
            min_similarity: 0.5,
            max_children: 100,
        }
    }
}

impl DrainMiner {
    pub fn new(max_depth: u16, min_similarity: f32, max_children: u16) -> Self {
        Self {
            max_depth,
            min_similarity,
            max_children,
        }
    }
}

impl PatternMiner for DrainMiner {
    fn mine(&mut self, lines: &[String]) -> Result<Vec<MinedGroup>> {
        let mut tree = drain_rs::DrainTree::new()
            .max_depth(self.max_depth)
            .min_similarity(self.min_similarity)
            .max_children(self.max_children);

        // Per line: the masked text and the template drain assigned on insert.
        let mut seeds: Vec<(String, String)> = Vec::with_capacity(lines.len());
        for line in lines {
            let masked = to_generic_template(&mask_variables(line));
            if masked.split_whitespace().next().is_none() {
                seeds.push((String::new(), String::new()));
                continue;
            }
            let seed = tree
                .add_log_line(&masked)
                .map(|lg| to_generic_template(&lg.as_string()))
                .ok_or_else(|| GraylogMcpError::Mining("failed to add log line".into()))?;
            seeds.push((masked, seed));
        }

        // Drain only widens templates as lines arrive, so each line belongs
        // to the final template that covers it.
        let mut groups: Vec<MinedGroup> = Vec::new();
        let mut by_template: HashMap<String, usize> = HashMap::new();
        for lg in tree.log_groups() {
            let template = to_generic_template(&lg.as_string());
            if !by_template.contains_key(&template) {
                by_template.insert(template.clone(), groups.len());
                groups.push(MinedGroup {
                    template,
                    lines: Vec::new(),
                });
            }
        }
        let tokenized: Vec<Vec<String>> = groups
            .iter()
            .map(|g| g.template.split_whitespace().map(str::to_string).collect())
            .collect();

        for (pos, (masked, seed)) in seeds.into_iter().enumerate() {
            let tokens: Vec<&str> = masked.split_whitespace().collect();
            let found = tokenized.iter().position(|t| {
                let t: Vec<&str> = t.iter().map(String::as_str).collect();
                !tokens.is_empty() && covers(&t, &tokens)
            });
            let slot = match found.or_else(|| by_template.get(&seed).copied()) {
                Some(slot) => slot,
                None => {
                    by_template.insert(seed.clone(), groups.len());
                    groups.push(MinedGroup {
                        template: seed,
                        lines: Vec::new(),
                    });
                    groups.len() - 1
                }
            };
            groups[slot].lines.push(pos);
        }

        groups.retain(|g| !g.lines.is_empty());
        Ok(groups)
    }
}
