use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value; // free-form generation metadata
use utoipa::ToSchema;

pub type Id = i64;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct Post {
    pub id: Id,
    pub user_id: Id,
    pub username: Option<String>,
    pub model_version_id: Option<Id>,
    pub title: Option<String>,
    pub detail: Option<String>,
    pub nsfw: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub images: Vec<Image>,
    pub tags: Vec<TagSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct NewPost {
    pub model_version_id: Option<Id>,
    pub title: Option<String>,
    pub detail: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
    pub published_at: Option<DateTime<Utc>>,
}

/// Partial update. `None` leaves a field untouched; an empty title or
/// detail clears the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub detail: Option<String>,
    pub nsfw: Option<bool>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Maps an optional text input onto the stored column: unspecified stays
/// unspecified, empty becomes null.
pub fn normalize_text(input: Option<String>) -> Option<Option<String>> {
    input.map(|s| if s.is_empty() { None } else { Some(s) })
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct Image {
    pub id: Id,
    pub post_id: Id,
    pub index: i32,
    pub name: Option<String>,
    pub url: String,
    pub hash: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub nsfw: bool,
    #[schema(value_type = Option<Object>)]
    pub meta: Option<Value>,
    pub generation_process: Option<ImageGenerationProcess>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ImageResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<TagSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct NewImage {
    #[serde(default)]
    pub post_id: Id, // taken from the route path
    pub url: String,
    pub name: Option<String>,
    pub hash: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default)]
    pub index: i32,
    #[schema(value_type = Option<Object>)]
    pub meta: Option<Value>,
    /// Resource the uploader picked explicitly; merged into detected resources.
    pub model_version_id: Option<Id>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct UpdateImage {
    #[schema(value_type = Option<Object>)]
    pub meta: Option<Value>,
    pub nsfw: Option<bool>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct ReorderImages {
    pub image_ids: Vec<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, sqlx::FromRow)]
pub struct ImageResource {
    pub id: Id,
    pub image_id: Id,
    pub model_version_id: Option<Id>,
    pub name: Option<String>,
    pub detected: bool,
}

/// A resource reference before it is persisted against an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceRef {
    ModelVersion(Id),
    Named(String),
}

impl ResourceRef {
    pub fn model_version_id(&self) -> Option<Id> {
        match self {
            ResourceRef::ModelVersion(id) => Some(*id),
            ResourceRef::Named(_) => None,
        }
    }
    pub fn name(&self) -> Option<&str> {
        match self {
            ResourceRef::ModelVersion(_) => None,
            ResourceRef::Named(n) => Some(n),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct Tag {
    pub id: Id,
    pub name: String,
    pub is_category: bool,
    pub tag_type: TagType,
    pub target: Vec<TagTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq, sqlx::FromRow)]
pub struct TagSummary {
    pub id: Id,
    pub name: String,
    pub is_category: bool,
}

impl From<&Tag> for TagSummary {
    fn from(t: &Tag) -> Self {
        Self { id: t.id, name: t.name.clone(), is_category: t.is_category }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct NewTag {
    pub name: String,
    #[serde(default)]
    pub is_category: bool,
    #[serde(default)]
    pub tag_type: TagType,
    #[serde(default)]
    pub target: Vec<TagTarget>,
}

/// Attach request: an existing tag by `id`, or a (possibly new) tag by `name`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct AddPostTag {
    pub id: Option<Id>,
    #[serde(default)]
    pub name: String,
}

// Closed string enums shared by the JSON API and TEXT columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self { $($name::$variant => $text),+ }
            }
        }
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
        }
        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
pub enum TagType {
    #[default]
    UserGenerated,
    System,
}
text_enum!(TagType { UserGenerated => "UserGenerated", System => "System" });

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
pub enum TagTarget {
    Post,
    Image,
    Model,
}
text_enum!(TagTarget { Post => "Post", Image => "Image", Model => "Model" });

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ImageGenerationProcess {
    Txt2img,
    Img2img,
    Inpainting,
    #[serde(rename = "txt2imgHiRes")]
    Txt2imgHiRes,
}
text_enum!(ImageGenerationProcess {
    Txt2img => "txt2img",
    Img2img => "img2img",
    Inpainting => "inpainting",
    Txt2imgHiRes => "txt2imgHiRes",
});

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
pub enum BrowsingMode {
    #[default]
    All,
    #[serde(rename = "SFW")]
    Sfw,
    #[serde(rename = "NSFW")]
    Nsfw,
}

impl BrowsingMode {
    /// Required nsfw flag, or `None` when every item is allowed.
    pub fn nsfw_filter(&self) -> Option<bool> {
        match self {
            BrowsingMode::All => None,
            BrowsingMode::Sfw => Some(false),
            BrowsingMode::Nsfw => Some(true),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
pub enum PostSort {
    #[default]
    Newest,
    MostReactions,
    MostComments,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
pub enum MetricPeriod {
    Day,
    Week,
    Month,
    Year,
    #[default]
    AllTime,
}

impl MetricPeriod {
    pub fn window(&self) -> Option<Duration> {
        match self {
            MetricPeriod::Day => Some(Duration::days(1)),
            MetricPeriod::Week => Some(Duration::days(7)),
            MetricPeriod::Month => Some(Duration::days(30)),
            MetricPeriod::Year => Some(Duration::days(365)),
            MetricPeriod::AllTime => None,
        }
    }
}

impl PostSort {
    /// Precomputed `post_ranks` column backing a trending sort.
    pub fn rank_column(&self, period: MetricPeriod) -> Option<&'static str> {
        use MetricPeriod::*;
        let col = match (self, period) {
            (PostSort::Newest, _) => return None,
            (PostSort::MostReactions, Day) => "reaction_count_day_rank",
            (PostSort::MostReactions, Week) => "reaction_count_week_rank",
            (PostSort::MostReactions, Month) => "reaction_count_month_rank",
            (PostSort::MostReactions, Year) => "reaction_count_year_rank",
            (PostSort::MostReactions, AllTime) => "reaction_count_all_time_rank",
            (PostSort::MostComments, Day) => "comment_count_day_rank",
            (PostSort::MostComments, Week) => "comment_count_week_rank",
            (PostSort::MostComments, Month) => "comment_count_month_rank",
            (PostSort::MostComments, Year) => "comment_count_year_rank",
            (PostSort::MostComments, AllTime) => "comment_count_all_time_rank",
        };
        Some(col)
    }
}

/// Rank assigned to rows without a precomputed rank (sorts last).
pub const UNRANKED: i32 = i32::MAX;
