use crate::feed::PostsPage;
use crate::models::{
    AddPostTag, BrowsingMode, Image, ImageGenerationProcess, ImageResource, MetricPeriod, NewImage, NewPost, NewTag,
    Post, PostSort, ReorderImages, Tag, TagSummary, TagTarget, TagType, UpdateImage, UpdatePost,
};
use crate::uploads::{UploadCredential, UploadRequest};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::create_upload,
        crate::routes::list_posts,
        crate::routes::create_post,
        crate::routes::get_post,
        crate::routes::update_post,
        crate::routes::delete_post,
        crate::routes::add_image,
        crate::routes::update_image,
        crate::routes::reorder_images,
        crate::routes::add_post_tag,
        crate::routes::remove_post_tag,
        crate::routes::search_tags,
        crate::routes::create_tag,
    ),
    components(schemas(
        Post, NewPost, UpdatePost, PostsPage,
        Image, NewImage, UpdateImage, ReorderImages, ImageResource, ImageGenerationProcess,
        Tag, TagSummary, NewTag, AddPostTag, TagType, TagTarget,
        BrowsingMode, PostSort, MetricPeriod,
        UploadRequest, UploadCredential,
    )),
    tags(
        (name = "posts", description = "Post and image operations"),
        (name = "tags", description = "Tag operations"),
        (name = "uploads", description = "Presigned uploads"),
    )
)]
pub struct ApiDoc;
