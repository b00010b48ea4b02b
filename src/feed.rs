//! Feed query shape and the cursor arithmetic shared by every repository
//! backend.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::{BrowsingMode, Id, MetricPeriod, Post, PostSort};

pub const DEFAULT_FEED_LIMIT: usize = 50;
pub const MAX_FEED_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct FeedQuery {
    pub limit: usize,
    /// Id of the first post of the requested page (the `next_cursor` handed
    /// out by the previous page).
    pub cursor: Option<Id>,
    pub query: Option<String>,
    pub username: Option<String>,
    pub excluded_tag_ids: Vec<Id>,
    pub excluded_user_ids: Vec<Id>,
    pub excluded_image_ids: Vec<Id>,
    pub browsing_mode: BrowsingMode,
    pub sort: PostSort,
    pub period: MetricPeriod,
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_FEED_LIMIT,
            cursor: None,
            query: None,
            username: None,
            excluded_tag_ids: Vec::new(),
            excluded_user_ids: Vec::new(),
            excluded_image_ids: Vec::new(),
            browsing_mode: BrowsingMode::All,
            sort: PostSort::Newest,
            period: MetricPeriod::AllTime,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct PostsPage {
    /// Posts carrying only their lead image.
    pub items: Vec<Post>,
    pub next_cursor: Option<Id>,
}

/// Turns `limit + 1` over-fetched candidates into a page.
///
/// Candidates without a lead image are dropped first; if more than `limit`
/// remain the last one is popped and becomes the cursor of the next page.
pub fn paginate(candidates: Vec<Post>, limit: usize) -> PostsPage {
    let mut items: Vec<Post> = candidates.into_iter().filter(|p| !p.images.is_empty()).collect();
    let mut next_cursor = None;
    if items.len() > limit {
        items.truncate(limit + 1);
        next_cursor = items.pop().map(|p| p.id);
    }
    PostsPage { items, next_cursor }
}

/// Raw query-string form of [`FeedQuery`]; id lists are comma separated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedParams {
    pub limit: Option<usize>,
    pub cursor: Option<Id>,
    pub query: Option<String>,
    pub username: Option<String>,
    pub excluded_tag_ids: Option<String>,
    pub excluded_user_ids: Option<String>,
    pub excluded_image_ids: Option<String>,
    pub browsing_mode: Option<BrowsingMode>,
    pub sort: Option<PostSort>,
    pub period: Option<MetricPeriod>,
}

pub fn parse_id_list(raw: Option<&str>) -> Result<Vec<Id>, String> {
    let Some(raw) = raw else { return Ok(Vec::new()) };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Id>().map_err(|_| format!("invalid id '{s}'")))
        .collect()
}

impl TryFrom<FeedParams> for FeedQuery {
    type Error = String;

    fn try_from(p: FeedParams) -> Result<Self, Self::Error> {
        let limit = p.limit.unwrap_or(DEFAULT_FEED_LIMIT);
        if limit == 0 || limit > MAX_FEED_LIMIT {
            return Err(format!("limit must be between 1 and {MAX_FEED_LIMIT}"));
        }
        Ok(FeedQuery {
            limit,
            cursor: p.cursor,
            query: p.query.filter(|q| !q.trim().is_empty()),
            username: p.username.filter(|u| !u.is_empty()),
            excluded_tag_ids: parse_id_list(p.excluded_tag_ids.as_deref())?,
            excluded_user_ids: parse_id_list(p.excluded_user_ids.as_deref())?,
            excluded_image_ids: parse_id_list(p.excluded_image_ids.as_deref())?,
            browsing_mode: p.browsing_mode.unwrap_or_default(),
            sort: p.sort.unwrap_or_default(),
            period: p.period.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Image;
    use chrono::Utc;

    fn post(id: Id, with_image: bool) -> Post {
        let images = if with_image {
            vec![Image {
                id: id * 10,
                post_id: id,
                index: 0,
                name: None,
                url: format!("https://cdn/{id}.png"),
                hash: None,
                width: None,
                height: None,
                nsfw: false,
                meta: None,
                generation_process: None,
                created_at: Utc::now(),
                resources: vec![],
                tags: vec![],
            }]
        } else {
            vec![]
        };
        Post {
            id,
            user_id: 1,
            username: None,
            model_version_id: None,
            title: None,
            detail: None,
            nsfw: false,
            published_at: Some(Utc::now()),
            created_at: Utc::now(),
            images,
            tags: vec![],
        }
    }

    #[test]
    fn overfetched_page_pops_cursor() {
        let page = paginate(vec![post(5, true), post(4, true), post(3, true)], 2);
        let ids: Vec<Id> = page.items.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![5, 4]);
        assert_eq!(page.next_cursor, Some(3));
    }

    #[test]
    fn exact_page_has_no_cursor() {
        let page = paginate(vec![post(5, true), post(4, true)], 2);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn imageless_candidates_are_dropped_before_counting() {
        let page = paginate(vec![post(5, true), post(4, false), post(3, true)], 2);
        let ids: Vec<Id> = page.items.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![5, 3]);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn params_validate_limit_and_ids() {
        let q = FeedQuery::try_from(FeedParams {
            excluded_tag_ids: Some("1, 2,,3".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(q.limit, DEFAULT_FEED_LIMIT);
        assert_eq!(q.excluded_tag_ids, vec![1, 2, 3]);

        assert!(FeedQuery::try_from(FeedParams { limit: Some(0), ..Default::default() }).is_err());
        assert!(FeedQuery::try_from(FeedParams { limit: Some(201), ..Default::default() }).is_err());
        assert!(FeedQuery::try_from(FeedParams {
            excluded_user_ids: Some("x".into()),
            ..Default::default()
        })
        .is_err());
    }
}
