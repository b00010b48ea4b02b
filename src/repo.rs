use async_trait::async_trait;

use crate::feed::{FeedQuery, PostsPage};
use crate::models::*;
use crate::resources::ModelFileHash;
use crate::tags::TagSearch;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("invalid input: {0}")] Invalid(String),
    #[error("database error: {0}")] Database(#[from] sqlx::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait PostRepo: Send + Sync {
    async fn create_post(&self, user_id: Id, new: NewPost) -> RepoResult<Post>;
    async fn get_post(&self, id: Id) -> RepoResult<Post>;
    async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post>;
    async fn delete_post(&self, id: Id) -> RepoResult<()>;
    async fn list_posts(&self, query: &FeedQuery) -> RepoResult<PostsPage>;
}

#[async_trait]
pub trait ImageRepo: Send + Sync {
    /// Stores the image and its detected resources atomically.
    async fn add_image(&self, new: NewImage, resources: Vec<ResourceRef>) -> RepoResult<Image>;
    async fn get_image(&self, id: Id) -> RepoResult<Image>;
    async fn update_image(&self, id: Id, upd: UpdateImage) -> RepoResult<Image>;
    /// Assigns `index = position` for every id; all ids must belong to the post.
    async fn reorder_images(&self, post_id: Id, image_ids: &[Id]) -> RepoResult<()>;
    /// Known hashes (lowercase input) of detectable model files.
    async fn find_model_file_hashes(&self, hashes: &[String]) -> RepoResult<Vec<ModelFileHash>>;
}

#[async_trait]
pub trait TagRepo: Send + Sync {
    async fn find_tag(&self, name: &str) -> RepoResult<Tag>;
    async fn create_tag(&self, new: NewTag) -> RepoResult<Tag>;
    async fn add_post_tag(&self, post_id: Id, req: AddPostTag) -> RepoResult<TagSummary>;
    async fn remove_post_tag(&self, post_id: Id, tag_id: Id) -> RepoResult<()>;
    async fn search_tags(&self, search: &TagSearch) -> RepoResult<Vec<TagSummary>>;
}

pub trait Repo: PostRepo + ImageRepo + TagRepo {}

impl<T> Repo for T where T: PostRepo + ImageRepo + TagRepo {}

fn tag_name(raw: &str) -> RepoResult<String> {
    crate::tags::normalize_tag_name(raw).map_err(RepoError::Invalid)
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

    use chrono::Utc;

    use crate::feed::paginate;
    use crate::resources::{generation_process, DETECTABLE_FILE_TYPES};
    use crate::tags::order_prefix_matches;

    struct KnownFile {
        model_version_id: Id,
        file_type: String,
        hash: String,
    }

    #[derive(Default)]
    struct State {
        users: HashMap<Id, String>,
        // children are kept in their own tables and assembled on read
        posts: BTreeMap<Id, Post>,
        images: BTreeMap<Id, Image>,
        resources: BTreeMap<Id, ImageResource>,
        tags: BTreeMap<Id, Tag>,
        post_tags: BTreeSet<(Id, Id)>,  // (post_id, tag_id)
        image_tags: BTreeSet<(Id, Id)>, // (image_id, tag_id)
        model_files: Vec<KnownFile>,
        post_ranks: HashMap<(Id, &'static str), i32>,
        tag_ranks: HashMap<Id, (i32, i32)>, // (day, all time)
        next_id: Id,
    }

    impl State {
        fn next_id(&mut self) -> Id {
            self.next_id += 1;
            self.next_id
        }

        fn tag_summaries<'a>(&'a self, ids: impl Iterator<Item = Id> + 'a) -> Vec<TagSummary> {
            let mut v: Vec<TagSummary> = ids.filter_map(|id| self.tags.get(&id)).map(TagSummary::from).collect();
            v.sort_by(|a, b| a.name.cmp(&b.name));
            v
        }

        fn full_image(&self, img: &Image) -> Image {
            let mut out = img.clone();
            out.resources = self.resources.values().filter(|r| r.image_id == img.id).cloned().collect();
            out.tags = self.tag_summaries(
                self.image_tags.iter().filter(|(i, _)| *i == img.id).map(|(_, t)| *t),
            );
            out
        }

        fn full_post(&self, post: &Post) -> Post {
            let mut out = post.clone();
            out.username = self.users.get(&post.user_id).cloned();
            let mut images: Vec<&Image> = self.images.values().filter(|i| i.post_id == post.id).collect();
            images.sort_by_key(|i| (i.index, i.id));
            out.images = images.into_iter().map(|i| self.full_image(i)).collect();
            out.tags = self.tag_summaries(
                self.post_tags.iter().filter(|(p, _)| *p == post.id).map(|(_, t)| *t),
            );
            out
        }

        fn post_rank(&self, post_id: Id, column: Option<&'static str>) -> i32 {
            column
                .and_then(|c| self.post_ranks.get(&(post_id, c)).copied())
                .unwrap_or(UNRANKED)
        }
    }

    #[derive(Clone, Default)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
    }

    impl InMemRepo {
        pub fn new() -> Self {
            Self::default()
        }

        // A poisoned lock only means another request panicked mid-write; keep serving.
        fn read(&self) -> RwLockReadGuard<'_, State> {
            self.state.read().unwrap_or_else(|e| e.into_inner())
        }
        fn write(&self) -> RwLockWriteGuard<'_, State> {
            self.state.write().unwrap_or_else(|e| e.into_inner())
        }

        // ---- seeding helpers for data owned by other services ----

        pub fn insert_user(&self, id: Id, username: &str) {
            self.write().users.insert(id, username.to_string());
        }

        pub fn register_model_file(&self, model_version_id: Id, file_type: &str, hash: &str) {
            self.write().model_files.push(KnownFile {
                model_version_id,
                file_type: file_type.to_string(),
                hash: hash.to_string(),
            });
        }

        pub fn set_post_rank(&self, post_id: Id, sort: PostSort, period: MetricPeriod, rank: i32) {
            if let Some(col) = sort.rank_column(period) {
                self.write().post_ranks.insert((post_id, col), rank);
            }
        }

        pub fn set_tag_rank(&self, tag_id: Id, day: i32, all_time: i32) {
            self.write().tag_ranks.insert(tag_id, (day, all_time));
        }

        pub fn tag_image(&self, image_id: Id, tag_id: Id) {
            self.write().image_tags.insert((image_id, tag_id));
        }
    }

    #[async_trait]
    impl PostRepo for InMemRepo {
        async fn create_post(&self, user_id: Id, new: NewPost) -> RepoResult<Post> {
            let mut guard = self.write();
            let s = &mut *guard;
            let id = s.next_id();
            let post = Post {
                id,
                user_id,
                username: None,
                model_version_id: new.model_version_id,
                title: normalize_text(new.title).flatten(),
                detail: normalize_text(new.detail).flatten(),
                nsfw: new.nsfw,
                published_at: new.published_at,
                created_at: Utc::now(),
                images: vec![],
                tags: vec![],
            };
            s.posts.insert(id, post.clone());
            Ok(s.full_post(&post))
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let s = self.read();
            s.posts.get(&id).map(|p| s.full_post(p)).ok_or(RepoError::NotFound)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            let mut guard = self.write();
            let s = &mut *guard;
            let post = s.posts.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(title) = normalize_text(upd.title) { post.title = title; }
            if let Some(detail) = normalize_text(upd.detail) { post.detail = detail; }
            if let Some(nsfw) = upd.nsfw { post.nsfw = nsfw; }
            if let Some(at) = upd.published_at { post.published_at = Some(at); }
            let updated = post.clone();
            Ok(s.full_post(&updated))
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            let mut guard = self.write();
            let s = &mut *guard;
            s.posts.remove(&id).ok_or(RepoError::NotFound)?;
            let image_ids: Vec<Id> = s.images.values().filter(|i| i.post_id == id).map(|i| i.id).collect();
            for image_id in &image_ids {
                s.images.remove(image_id);
            }
            s.resources.retain(|_, r| !image_ids.contains(&r.image_id));
            s.image_tags.retain(|(i, _)| !image_ids.contains(i));
            s.post_tags.retain(|(p, _)| *p != id);
            s.post_ranks.retain(|(p, _), _| *p != id);
            Ok(())
        }

        async fn list_posts(&self, q: &FeedQuery) -> RepoResult<PostsPage> {
            let s = self.read();
            let rank_col = q.sort.rank_column(q.period);
            let nsfw = q.browsing_mode.nsfw_filter();
            let since = match q.sort {
                PostSort::Newest => q.period.window().map(|w| Utc::now() - w),
                _ => None,
            };
            let needle = q.query.as_ref().map(|t| t.to_lowercase());

            let mut candidates: Vec<(i32, Post)> = s
                .posts
                .values()
                .filter(|p| p.published_at.is_some())
                .filter(|p| match &needle {
                    Some(n) => p.title.as_ref().map(|t| t.to_lowercase().contains(n)).unwrap_or(false),
                    None => true,
                })
                .filter(|p| match &q.username {
                    Some(u) => s.users.get(&p.user_id) == Some(u),
                    None => true,
                })
                .filter(|p| !q.excluded_user_ids.contains(&p.user_id))
                .filter(|p| nsfw.map(|f| p.nsfw == f).unwrap_or(true))
                .filter(|p| match (since, p.published_at) {
                    (Some(t), Some(at)) => at >= t,
                    _ => true,
                })
                .filter_map(|p| {
                    let lead = s
                        .images
                        .values()
                        .filter(|i| i.post_id == p.id)
                        .filter(|i| !q.excluded_image_ids.contains(&i.id))
                        .filter(|i| nsfw.map(|f| i.nsfw == f).unwrap_or(true))
                        .filter(|i| !q.excluded_tag_ids.iter().any(|t| s.image_tags.contains(&(i.id, *t))))
                        .max_by_key(|i| (i.created_at, i.id))?;
                    let mut item = p.clone();
                    item.username = s.users.get(&p.user_id).cloned();
                    item.images = vec![lead.clone()];
                    Some((s.post_rank(p.id, rank_col), item))
                })
                .collect();

            candidates.sort_by(|(ra, a), (rb, b)| ra.cmp(rb).then(b.id.cmp(&a.id)));
            if let Some(cursor) = q.cursor {
                let cursor_rank = s.post_rank(cursor, rank_col);
                candidates.retain(|(r, p)| *r > cursor_rank || (*r == cursor_rank && p.id <= cursor));
            }
            let fetched = candidates.into_iter().take(q.limit + 1).map(|(_, p)| p).collect();
            Ok(paginate(fetched, q.limit))
        }
    }

    #[async_trait]
    impl ImageRepo for InMemRepo {
        async fn add_image(&self, new: NewImage, resources: Vec<ResourceRef>) -> RepoResult<Image> {
            let mut guard = self.write();
            let s = &mut *guard;
            if !s.posts.contains_key(&new.post_id) { return Err(RepoError::NotFound); }
            let id = s.next_id();
            let image = Image {
                id,
                post_id: new.post_id,
                index: new.index,
                name: new.name,
                url: new.url,
                hash: new.hash,
                width: new.width,
                height: new.height,
                nsfw: new.nsfw,
                generation_process: generation_process(new.meta.as_ref()),
                meta: new.meta,
                created_at: Utc::now(),
                resources: vec![],
                tags: vec![],
            };
            s.images.insert(id, image.clone());
            for r in resources {
                let rid = s.next_id();
                s.resources.insert(rid, ImageResource {
                    id: rid,
                    image_id: id,
                    model_version_id: r.model_version_id(),
                    name: r.name().map(str::to_string),
                    detected: true,
                });
            }
            Ok(s.full_image(&image))
        }

        async fn get_image(&self, id: Id) -> RepoResult<Image> {
            let s = self.read();
            s.images.get(&id).map(|i| s.full_image(i)).ok_or(RepoError::NotFound)
        }

        async fn update_image(&self, id: Id, upd: UpdateImage) -> RepoResult<Image> {
            let mut guard = self.write();
            let s = &mut *guard;
            let image = s.images.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(meta) = upd.meta {
                image.generation_process = generation_process(Some(&meta));
                image.meta = Some(meta);
            }
            if let Some(nsfw) = upd.nsfw { image.nsfw = nsfw; }
            if let Some(name) = normalize_text(upd.name) { image.name = name; }
            let updated = image.clone();
            Ok(s.full_image(&updated))
        }

        async fn reorder_images(&self, post_id: Id, image_ids: &[Id]) -> RepoResult<()> {
            let mut guard = self.write();
            let s = &mut *guard;
            let owned = image_ids
                .iter()
                .all(|id| s.images.get(id).map(|i| i.post_id == post_id).unwrap_or(false));
            if !owned { return Err(RepoError::NotFound); }
            for (position, id) in image_ids.iter().enumerate() {
                if let Some(image) = s.images.get_mut(id) {
                    image.index = position as i32;
                }
            }
            Ok(())
        }

        async fn find_model_file_hashes(&self, hashes: &[String]) -> RepoResult<Vec<ModelFileHash>> {
            let s = self.read();
            Ok(s.model_files
                .iter()
                .filter(|f| DETECTABLE_FILE_TYPES.contains(&f.file_type.as_str()))
                .filter(|f| hashes.iter().any(|h| h.eq_ignore_ascii_case(&f.hash)))
                .map(|f| ModelFileHash { hash: f.hash.clone(), model_version_id: f.model_version_id })
                .collect())
        }
    }

    #[async_trait]
    impl TagRepo for InMemRepo {
        async fn find_tag(&self, name: &str) -> RepoResult<Tag> {
            let name = tag_name(name)?;
            let s = self.read();
            s.tags.values().find(|t| t.name == name).cloned().ok_or(RepoError::NotFound)
        }

        async fn create_tag(&self, new: NewTag) -> RepoResult<Tag> {
            let name = tag_name(&new.name)?;
            let mut guard = self.write();
            let s = &mut *guard;
            if s.tags.values().any(|t| t.name == name) { return Err(RepoError::Conflict); }
            let id = s.next_id();
            let target = if new.target.is_empty() { vec![TagTarget::Post] } else { new.target };
            let tag = Tag { id, name, is_category: new.is_category, tag_type: new.tag_type, target };
            s.tags.insert(id, tag.clone());
            Ok(tag)
        }

        async fn add_post_tag(&self, post_id: Id, req: AddPostTag) -> RepoResult<TagSummary> {
            let name = match req.id { Some(_) => None, None => Some(tag_name(&req.name)?) };
            // single write lock: lookup, create and attach cannot interleave
            let mut guard = self.write();
            let s = &mut *guard;
            if !s.posts.contains_key(&post_id) { return Err(RepoError::NotFound); }
            let existing = match (req.id, &name) {
                (Some(id), _) => Some(s.tags.get(&id).map(|t| t.id).ok_or(RepoError::NotFound)?),
                (None, Some(n)) => s.tags.values().find(|t| &t.name == n).map(|t| t.id),
                (None, None) => None,
            };
            let tag_id = match existing {
                Some(id) => {
                    if let Some(tag) = s.tags.get_mut(&id) {
                        if !tag.target.contains(&TagTarget::Post) {
                            tag.target.push(TagTarget::Post);
                        }
                    }
                    id
                }
                None => {
                    let id = s.next_id();
                    s.tags.insert(id, Tag {
                        id,
                        name: name.unwrap_or_default(),
                        is_category: false,
                        tag_type: TagType::UserGenerated,
                        target: vec![TagTarget::Post],
                    });
                    id
                }
            };
            s.post_tags.insert((post_id, tag_id));
            s.tags.get(&tag_id).map(TagSummary::from).ok_or(RepoError::NotFound)
        }

        async fn remove_post_tag(&self, post_id: Id, tag_id: Id) -> RepoResult<()> {
            self.write().post_tags.remove(&(post_id, tag_id));
            Ok(())
        }

        async fn search_tags(&self, search: &TagSearch) -> RepoResult<Vec<TagSummary>> {
            let s = self.read();
            let eligible = s
                .tags
                .values()
                .filter(|t| t.target.contains(&TagTarget::Post))
                .filter(|t| !search.excluded_tag_ids.contains(&t.id));
            let ranks = |id: Id| s.tag_ranks.get(&id).copied().unwrap_or((UNRANKED, UNRANKED));
            if search.show_trending() {
                let mut trending: Vec<&Tag> = eligible.filter(|t| t.is_category).collect();
                trending.sort_by_key(|t| (ranks(t.id).0, t.id));
                return Ok(trending.into_iter().take(search.limit).map(TagSummary::from).collect());
            }
            let prefix = search.query.as_deref().unwrap_or_default().to_lowercase();
            let matches = eligible
                .filter(|t| t.name.starts_with(&prefix))
                .map(|t| (TagSummary::from(t), ranks(t.id).1))
                .collect();
            Ok(order_prefix_matches(matches).into_iter().take(search.limit).collect())
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use sqlx::{Pool, Postgres, QueryBuilder};

    use crate::feed::paginate;
    use crate::resources::{generation_process, DETECTABLE_FILE_TYPES};

    const POST_COLUMNS: &str =
        "p.id, p.user_id, u.username, p.model_version_id, p.title, p.detail, p.nsfw, p.published_at, p.created_at";
    const IMAGE_COLUMNS: &str = r#"i.id, i.post_id, i."index", i.name, i.url, i.hash, i.width, i.height, i.nsfw, i.meta, i.generation_process, i.created_at"#;
    const TAG_COLUMNS: &str = "id, name, is_category, type AS tag_type, target";
    // keeps 'Post' in a tag's target set exactly once
    const WITH_POST_TARGET: &str =
        "CASE WHEN 'Post' = ANY(tags.target) THEN tags.target ELSE array_append(tags.target, 'Post') END";

    #[derive(sqlx::FromRow)]
    struct PostRow {
        id: Id,
        user_id: Id,
        username: Option<String>,
        model_version_id: Option<Id>,
        title: Option<String>,
        detail: Option<String>,
        nsfw: bool,
        published_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    }

    impl From<PostRow> for Post {
        fn from(r: PostRow) -> Self {
            Post {
                id: r.id,
                user_id: r.user_id,
                username: r.username,
                model_version_id: r.model_version_id,
                title: r.title,
                detail: r.detail,
                nsfw: r.nsfw,
                published_at: r.published_at,
                created_at: r.created_at,
                images: vec![],
                tags: vec![],
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct ImageRow {
        id: Id,
        post_id: Id,
        index: i32,
        name: Option<String>,
        url: String,
        hash: Option<String>,
        width: Option<i32>,
        height: Option<i32>,
        nsfw: bool,
        meta: Option<Value>,
        generation_process: Option<String>,
        created_at: DateTime<Utc>,
    }

    impl From<ImageRow> for Image {
        fn from(r: ImageRow) -> Self {
            Image {
                id: r.id,
                post_id: r.post_id,
                index: r.index,
                name: r.name,
                url: r.url,
                hash: r.hash,
                width: r.width,
                height: r.height,
                nsfw: r.nsfw,
                meta: r.meta,
                generation_process: r.generation_process.and_then(|g| g.parse().ok()),
                created_at: r.created_at,
                resources: vec![],
                tags: vec![],
            }
        }
    }

    /// Feed row: post columns plus its lead image from the lateral join.
    #[derive(sqlx::FromRow)]
    struct FeedRow {
        #[sqlx(flatten)]
        post: PostRow,
        img_id: Option<Id>,
        img_index: Option<i32>,
        img_name: Option<String>,
        img_url: Option<String>,
        img_hash: Option<String>,
        img_width: Option<i32>,
        img_height: Option<i32>,
        img_nsfw: Option<bool>,
        img_meta: Option<Value>,
        img_generation_process: Option<String>,
        img_created_at: Option<DateTime<Utc>>,
    }

    impl From<FeedRow> for Post {
        fn from(r: FeedRow) -> Self {
            let post_id = r.post.id;
            let mut post = Post::from(r.post);
            if let (Some(id), Some(created_at)) = (r.img_id, r.img_created_at) {
                post.images.push(Image::from(ImageRow {
                    id,
                    post_id,
                    index: r.img_index.unwrap_or_default(),
                    name: r.img_name,
                    url: r.img_url.unwrap_or_default(),
                    hash: r.img_hash,
                    width: r.img_width,
                    height: r.img_height,
                    nsfw: r.img_nsfw.unwrap_or_default(),
                    meta: r.img_meta,
                    generation_process: r.img_generation_process,
                    created_at,
                }));
            }
            post
        }
    }

    #[derive(sqlx::FromRow)]
    struct TagRow {
        id: Id,
        name: String,
        is_category: bool,
        tag_type: String,
        target: Vec<String>,
    }

    impl From<TagRow> for Tag {
        fn from(r: TagRow) -> Self {
            Tag {
                id: r.id,
                name: r.name,
                is_category: r.is_category,
                tag_type: r.tag_type.parse().unwrap_or_default(),
                target: r.target.iter().filter_map(|t| t.parse().ok()).collect(),
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct ImageTagRow {
        image_id: Id,
        #[sqlx(flatten)]
        tag: TagSummary,
    }

    fn like_escape(s: &str) -> String {
        s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    }

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

        async fn attach_image_children(&self, images: &mut [Image]) -> RepoResult<()> {
            if images.is_empty() { return Ok(()); }
            let ids: Vec<Id> = images.iter().map(|i| i.id).collect();
            let resources = sqlx::query_as::<_, ImageResource>(
                "SELECT id, image_id, model_version_id, name, detected FROM image_resources WHERE image_id = ANY($1) ORDER BY id",
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
            let tags = sqlx::query_as::<_, ImageTagRow>(r#"
                SELECT ti.image_id, t.id, t.name, t.is_category
                FROM tags_on_image ti JOIN tags t ON t.id = ti.tag_id
                WHERE ti.image_id = ANY($1)
                ORDER BY t.name
            "#)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
            for image in images.iter_mut() {
                image.resources = resources.iter().filter(|r| r.image_id == image.id).cloned().collect();
                image.tags = tags.iter().filter(|t| t.image_id == image.id).map(|t| t.tag.clone()).collect();
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PostRepo for PgRepo {
        async fn create_post(&self, user_id: Id, new: NewPost) -> RepoResult<Post> {
            let id: Id = sqlx::query_scalar(
                "INSERT INTO posts (user_id, model_version_id, title, detail, nsfw, published_at) VALUES ($1,$2,$3,$4,$5,$6) RETURNING id",
            )
            .bind(user_id)
            .bind(new.model_version_id)
            .bind(normalize_text(new.title).flatten())
            .bind(normalize_text(new.detail).flatten())
            .bind(new.nsfw)
            .bind(new.published_at)
            .fetch_one(&self.pool)
            .await?;
            tracing::info!(post_id = id, user_id, "post created");
            self.get_post(id).await
        }

        async fn get_post(&self, id: Id) -> RepoResult<Post> {
            let sql = format!("SELECT {POST_COLUMNS} FROM posts p LEFT JOIN users u ON u.id = p.user_id WHERE p.id = $1");
            let mut post: Post = sqlx::query_as::<_, PostRow>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(RepoError::NotFound)?
                .into();
            let sql = format!(r#"SELECT {IMAGE_COLUMNS} FROM images i WHERE i.post_id = $1 ORDER BY i."index", i.id"#);
            let mut images: Vec<Image> = sqlx::query_as::<_, ImageRow>(&sql)
                .bind(id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(Image::from)
                .collect();
            self.attach_image_children(&mut images).await?;
            post.images = images;
            post.tags = sqlx::query_as::<_, TagSummary>(r#"
                SELECT t.id, t.name, t.is_category
                FROM tags_on_post tp JOIN tags t ON t.id = tp.tag_id
                WHERE tp.post_id = $1
                ORDER BY t.name
            "#)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
            Ok(post)
        }

        async fn update_post(&self, id: Id, upd: UpdatePost) -> RepoResult<Post> {
            // CASE flags distinguish "leave unchanged" from "set to null"
            let title = normalize_text(upd.title);
            let detail = normalize_text(upd.detail);
            let res = sqlx::query(r#"
                UPDATE posts SET
                    title = CASE WHEN $2 THEN $3 ELSE title END,
                    detail = CASE WHEN $4 THEN $5 ELSE detail END,
                    nsfw = COALESCE($6, nsfw),
                    published_at = COALESCE($7, published_at)
                WHERE id = $1
            "#)
            .bind(id)
            .bind(title.is_some())
            .bind(title.flatten())
            .bind(detail.is_some())
            .bind(detail.flatten())
            .bind(upd.nsfw)
            .bind(upd.published_at)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            self.get_post(id).await
        }

        async fn delete_post(&self, id: Id) -> RepoResult<()> {
            // images, resources and tag links cascade
            let res = sqlx::query("DELETE FROM posts WHERE id = $1").bind(id).execute(&self.pool).await?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            tracing::info!(post_id = id, "post deleted");
            Ok(())
        }

        async fn list_posts(&self, q: &FeedQuery) -> RepoResult<PostsPage> {
            let rank = q.sort.rank_column(q.period);
            let nsfw = q.browsing_mode.nsfw_filter();
            let mut qb = QueryBuilder::<Postgres>::new(format!(r#"
                SELECT {POST_COLUMNS},
                       img.id AS img_id, img."index" AS img_index, img.name AS img_name, img.url AS img_url,
                       img.hash AS img_hash, img.width AS img_width, img.height AS img_height, img.nsfw AS img_nsfw,
                       img.meta AS img_meta, img.generation_process AS img_generation_process,
                       img.created_at AS img_created_at
                FROM posts p
                LEFT JOIN users u ON u.id = p.user_id"#));
            if rank.is_some() {
                qb.push(" LEFT JOIN post_ranks r ON r.post_id = p.id");
            }

            // lead image: most recent image surviving the image-level filters
            qb.push(" JOIN LATERAL (SELECT i.* FROM images i WHERE i.post_id = p.id");
            if !q.excluded_image_ids.is_empty() {
                qb.push(" AND NOT (i.id = ANY(").push_bind(q.excluded_image_ids.clone()).push("))");
            }
            if !q.excluded_tag_ids.is_empty() {
                qb.push(" AND NOT EXISTS (SELECT 1 FROM tags_on_image ti WHERE ti.image_id = i.id AND ti.tag_id = ANY(")
                    .push_bind(q.excluded_tag_ids.clone())
                    .push("))");
            }
            if let Some(flag) = nsfw {
                qb.push(" AND i.nsfw = ").push_bind(flag);
            }
            qb.push(" ORDER BY i.created_at DESC, i.id DESC LIMIT 1) img ON TRUE");

            qb.push(" WHERE p.published_at IS NOT NULL");
            if let Some(text) = &q.query {
                qb.push(" AND p.title ILIKE ").push_bind(format!("%{}%", like_escape(text)));
            }
            if let Some(username) = &q.username {
                qb.push(" AND u.username = ").push_bind(username.clone());
            }
            if !q.excluded_user_ids.is_empty() {
                qb.push(" AND NOT (p.user_id = ANY(").push_bind(q.excluded_user_ids.clone()).push("))");
            }
            if let Some(flag) = nsfw {
                qb.push(" AND p.nsfw = ").push_bind(flag);
            }
            if let (PostSort::Newest, Some(window)) = (q.sort, q.period.window()) {
                qb.push(" AND p.published_at >= ").push_bind(Utc::now() - window);
            }

            match (rank, q.cursor) {
                (None, Some(cursor)) => {
                    qb.push(" AND p.id <= ").push_bind(cursor);
                }
                (Some(col), Some(cursor)) => {
                    let ranked = format!("COALESCE(r.{col}, {UNRANKED})");
                    let cursor_rank = format!("COALESCE((SELECT r2.{col} FROM post_ranks r2 WHERE r2.post_id = ");
                    qb.push(format!(" AND ({ranked} > {cursor_rank}"))
                        .push_bind(cursor)
                        .push(format!("), {UNRANKED}) OR ({ranked} = {cursor_rank}"))
                        .push_bind(cursor)
                        .push(format!("), {UNRANKED}) AND p.id <= "))
                        .push_bind(cursor)
                        .push("))");
                }
                (_, None) => {}
            }

            match rank {
                Some(col) => qb.push(format!(" ORDER BY COALESCE(r.{col}, {UNRANKED}) ASC, p.id DESC")),
                None => qb.push(" ORDER BY p.id DESC"),
            };
            qb.push(" LIMIT ").push_bind((q.limit + 1) as i64);

            let rows = qb.build_query_as::<FeedRow>().fetch_all(&self.pool).await?;
            Ok(paginate(rows.into_iter().map(Post::from).collect(), q.limit))
        }
    }

    #[async_trait]
    impl ImageRepo for PgRepo {
        async fn add_image(&self, new: NewImage, resources: Vec<ResourceRef>) -> RepoResult<Image> {
            let mut tx = self.pool.begin().await?;
            let post: Option<Id> = sqlx::query_scalar("SELECT id FROM posts WHERE id = $1")
                .bind(new.post_id)
                .fetch_optional(&mut *tx)
                .await?;
            if post.is_none() { return Err(RepoError::NotFound); }
            let process = generation_process(new.meta.as_ref());
            let image_id: Id = sqlx::query_scalar(r#"
                INSERT INTO images (post_id, "index", name, url, hash, width, height, nsfw, meta, generation_process)
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                RETURNING id
            "#)
            .bind(new.post_id)
            .bind(new.index)
            .bind(&new.name)
            .bind(&new.url)
            .bind(&new.hash)
            .bind(new.width)
            .bind(new.height)
            .bind(new.nsfw)
            .bind(&new.meta)
            .bind(process.map(|p| p.as_str()))
            .fetch_one(&mut *tx)
            .await?;
            for r in &resources {
                sqlx::query("INSERT INTO image_resources (image_id, model_version_id, name, detected) VALUES ($1,$2,$3,TRUE)")
                    .bind(image_id)
                    .bind(r.model_version_id())
                    .bind(r.name())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            tracing::info!(post_id = new.post_id, image_id, resources = resources.len(), "image added");
            self.get_image(image_id).await
        }

        async fn get_image(&self, id: Id) -> RepoResult<Image> {
            let sql = format!("SELECT {IMAGE_COLUMNS} FROM images i WHERE i.id = $1");
            let image: Image = sqlx::query_as::<_, ImageRow>(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(RepoError::NotFound)?
                .into();
            let mut images = [image];
            self.attach_image_children(&mut images).await?;
            let [image] = images;
            Ok(image)
        }

        async fn update_image(&self, id: Id, upd: UpdateImage) -> RepoResult<Image> {
            let process = upd.meta.as_ref().and_then(|m| generation_process(Some(m)));
            let name = normalize_text(upd.name);
            let res = sqlx::query(r#"
                UPDATE images SET
                    meta = CASE WHEN $2 THEN $3 ELSE meta END,
                    generation_process = CASE WHEN $2 THEN $4 ELSE generation_process END,
                    nsfw = COALESCE($5, nsfw),
                    name = CASE WHEN $6 THEN $7 ELSE name END
                WHERE id = $1
            "#)
            .bind(id)
            .bind(upd.meta.is_some())
            .bind(&upd.meta)
            .bind(process.map(|p| p.as_str()))
            .bind(upd.nsfw)
            .bind(name.is_some())
            .bind(name.flatten())
            .execute(&self.pool)
            .await?;
            if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            self.get_image(id).await
        }

        async fn reorder_images(&self, post_id: Id, image_ids: &[Id]) -> RepoResult<()> {
            let mut tx = self.pool.begin().await?;
            for (position, image_id) in image_ids.iter().enumerate() {
                let res = sqlx::query(r#"UPDATE images SET "index" = $1 WHERE id = $2 AND post_id = $3"#)
                    .bind(position as i32)
                    .bind(image_id)
                    .bind(post_id)
                    .execute(&mut *tx)
                    .await?;
                // dropping tx rolls back the indices already assigned
                if res.rows_affected() == 0 { return Err(RepoError::NotFound); }
            }
            tx.commit().await?;
            Ok(())
        }

        async fn find_model_file_hashes(&self, hashes: &[String]) -> RepoResult<Vec<ModelFileHash>> {
            let file_types: Vec<String> = DETECTABLE_FILE_TYPES.iter().map(|t| t.to_string()).collect();
            let recs = sqlx::query_as::<_, ModelFileHash>(r#"
                SELECT h.hash, f.model_version_id
                FROM model_file_hashes h
                JOIN model_files f ON f.id = h.file_id
                WHERE f.type = ANY($1) AND LOWER(h.hash) = ANY($2)
            "#)
            .bind(file_types)
            .bind(hashes.to_vec())
            .fetch_all(&self.pool)
            .await?;
            Ok(recs)
        }
    }

    #[async_trait]
    impl TagRepo for PgRepo {
        async fn find_tag(&self, name: &str) -> RepoResult<Tag> {
            let name = tag_name(name)?;
            let sql = format!("SELECT {TAG_COLUMNS} FROM tags WHERE name = $1");
            let rec = sqlx::query_as::<_, TagRow>(&sql)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(RepoError::NotFound)?;
            Ok(rec.into())
        }

        async fn create_tag(&self, new: NewTag) -> RepoResult<Tag> {
            let name = tag_name(&new.name)?;
            let target: Vec<String> = if new.target.is_empty() {
                vec![TagTarget::Post.to_string()]
            } else {
                new.target.iter().map(|t| t.to_string()).collect()
            };
            let sql = format!(
                "INSERT INTO tags (name, is_category, type, target) VALUES ($1,$2,$3,$4) ON CONFLICT (name) DO NOTHING RETURNING {TAG_COLUMNS}"
            );
            let rec = sqlx::query_as::<_, TagRow>(&sql)
                .bind(name)
                .bind(new.is_category)
                .bind(new.tag_type.as_str())
                .bind(target)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(RepoError::Conflict)?;
            Ok(rec.into())
        }

        async fn add_post_tag(&self, post_id: Id, req: AddPostTag) -> RepoResult<TagSummary> {
            let mut tx = self.pool.begin().await?;
            let post: Option<Id> = sqlx::query_scalar("SELECT id FROM posts WHERE id = $1")
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await?;
            if post.is_none() { return Err(RepoError::NotFound); }
            let tag = match req.id {
                Some(tag_id) => {
                    let sql = format!("UPDATE tags SET target = {WITH_POST_TARGET} WHERE id = $1 RETURNING id, name, is_category");
                    sqlx::query_as::<_, TagSummary>(&sql)
                        .bind(tag_id)
                        .fetch_optional(&mut *tx)
                        .await?
                        .ok_or(RepoError::NotFound)?
                }
                None => {
                    // the unique name constraint serialises concurrent creators
                    let sql = format!(r#"
                        INSERT INTO tags (name, type, target) VALUES ($1, 'UserGenerated', ARRAY['Post'])
                        ON CONFLICT (name) DO UPDATE SET target = {WITH_POST_TARGET}
                        RETURNING id, name, is_category
                    "#);
                    sqlx::query_as::<_, TagSummary>(&sql)
                        .bind(tag_name(&req.name)?)
                        .fetch_one(&mut *tx)
                        .await?
                }
            };
            sqlx::query("INSERT INTO tags_on_post (post_id, tag_id) VALUES ($1,$2) ON CONFLICT DO NOTHING")
                .bind(post_id)
                .bind(tag.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::debug!(post_id, tag_id = tag.id, tag = %tag.name, "tag attached");
            Ok(tag)
        }

        async fn remove_post_tag(&self, post_id: Id, tag_id: Id) -> RepoResult<()> {
            sqlx::query("DELETE FROM tags_on_post WHERE post_id = $1 AND tag_id = $2")
                .bind(post_id)
                .bind(tag_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn search_tags(&self, search: &TagSearch) -> RepoResult<Vec<TagSummary>> {
            let limit = search.limit as i64;
            let recs = if search.show_trending() {
                let sql = format!(r#"
                    SELECT t.id, t.name, t.is_category
                    FROM tags t LEFT JOIN tag_ranks r ON r.tag_id = t.id
                    WHERE 'Post' = ANY(t.target) AND t.is_category AND NOT (t.id = ANY($1))
                    ORDER BY COALESCE(r.post_count_day_rank, {UNRANKED}), t.id
                    LIMIT $2
                "#);
                sqlx::query_as::<_, TagSummary>(&sql)
                    .bind(&search.excluded_tag_ids)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            } else {
                let prefix = search.query.as_deref().unwrap_or_default().to_lowercase();
                let sql = format!(r#"
                    SELECT t.id, t.name, t.is_category
                    FROM tags t LEFT JOIN tag_ranks r ON r.tag_id = t.id
                    WHERE 'Post' = ANY(t.target) AND NOT (t.id = ANY($1)) AND t.name LIKE $2 ESCAPE '\'
                    ORDER BY char_length(t.name), COALESCE(r.post_count_all_time_rank, {UNRANKED}), t.id
                    LIMIT $3
                "#);
                sqlx::query_as::<_, TagSummary>(&sql)
                    .bind(&search.excluded_tag_ids)
                    .bind(format!("{}%", like_escape(&prefix)))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            };
            Ok(recs)
        }
    }
}
