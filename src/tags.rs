use serde::Deserialize;

use crate::feed::parse_id_list;
use crate::models::{Id, TagSummary};

pub const DEFAULT_TAG_LIMIT: usize = 10;
pub const MAX_TAG_LIMIT: usize = 100;
/// Queries shorter than this fall back to trending category tags.
pub const MIN_PREFIX_LEN: usize = 2;

/// Tag names are their natural key: trimmed and lowercased.
pub fn normalize_tag_name(raw: &str) -> Result<String, String> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() {
        return Err("tag name must not be empty".into());
    }
    Ok(name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagSearch {
    pub query: Option<String>,
    pub limit: usize,
    pub excluded_tag_ids: Vec<Id>,
}

impl TagSearch {
    pub fn show_trending(&self) -> bool {
        self.query.as_ref().map(|q| q.chars().count() < MIN_PREFIX_LEN).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagSearchParams {
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub excluded_tag_ids: Option<String>,
}

impl TryFrom<TagSearchParams> for TagSearch {
    type Error = String;

    fn try_from(p: TagSearchParams) -> Result<Self, Self::Error> {
        let limit = p.limit.unwrap_or(DEFAULT_TAG_LIMIT);
        if limit == 0 || limit > MAX_TAG_LIMIT {
            return Err(format!("limit must be between 1 and {MAX_TAG_LIMIT}"));
        }
        Ok(TagSearch {
            query: p.query.map(|q| q.trim().to_lowercase()),
            limit,
            excluded_tag_ids: parse_id_list(p.excluded_tag_ids.as_deref())?,
        })
    }
}

/// Prefix matches: shortest names first, then by all-time post count rank.
pub fn order_prefix_matches(mut matches: Vec<(TagSummary, i32)>) -> Vec<TagSummary> {
    matches.sort_by(|(a, ra), (b, rb)| {
        a.name.chars().count().cmp(&b.name.chars().count()).then(ra.cmp(rb)).then(a.id.cmp(&b.id))
    });
    matches.into_iter().map(|(t, _)| t).collect()
}
