use std::sync::Arc;
use actix_web::{web, HttpResponse};

use crate::auth::{Auth, Role};
use crate::error::ApiError;
use crate::feed::{FeedParams, FeedQuery};
use crate::models::*;
use crate::repo::Repo;
use crate::resources::detect_image_resources;
use crate::tags::{TagSearch, TagSearchParams};
use crate::uploads::{UploadIssuer, UploadRequest};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/uploads").route(web::post().to(create_upload)))
            .service(
                web::resource("/posts")
                    .route(web::get().to(list_posts))
                    .route(web::post().to(create_post)),
            )
            .service(
                web::resource("/posts/{id}")
                    .route(web::get().to(get_post))
                    .route(web::patch().to(update_post))
                    .route(web::delete().to(delete_post)),
            )
            .service(web::resource("/posts/{id}/images").route(web::post().to(add_image)))
            .service(web::resource("/posts/{id}/images/reorder").route(web::post().to(reorder_images)))
            .service(web::resource("/images/{id}").route(web::patch().to(update_image)))
            .service(web::resource("/posts/{id}/tags").route(web::post().to(add_post_tag)))
            .service(web::resource("/posts/{id}/tags/{tag_id}").route(web::delete().to(remove_post_tag)))
            .service(
                web::resource("/tags")
                    .route(web::get().to(search_tags))
                    .route(web::post().to(create_tag)),
            ),
    );
}

#[derive(Clone)]
pub struct AppState { pub repo: Arc<dyn Repo>, pub uploads: UploadIssuer }

/// Loads the post and checks the caller may modify it.
async fn editable_post(data: &AppState, auth: &Auth, post_id: Id) -> Result<Post, ApiError> {
    let post = data.repo.get_post(post_id).await?;
    if post.user_id != auth.user_id()? && !auth.is_moderator() {
        return Err(ApiError::Forbidden);
    }
    Ok(post)
}

#[utoipa::path(
    post,
    path = "/api/v1/uploads",
    request_body = UploadRequest,
    responses(
        (status = 200, description = "Presigned PUT URL", body = UploadCredential),
        (status = 400, description = "Invalid filename or type"),
        (status = 401, description = "Authorization required"),
        (status = 500, description = "Upload storage not configured")
    )
)]
pub async fn create_upload(
    auth: Option<Auth>,
    data: web::Data<AppState>,
    payload: web::Json<UploadRequest>,
) -> Result<HttpResponse, ApiError> {
    let caller = auth.and_then(|a| a.user_id().ok());
    let credential = data.uploads.issue(caller, &payload).await?;
    log::info!("issued upload url key={} bucket={}", credential.key, credential.bucket);
    Ok(HttpResponse::Ok().json(credential))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts",
    params(
        ("limit" = Option<usize>, Query, description = "1..=200, default 50"),
        ("cursor" = Option<Id>, Query, description = "next_cursor of the previous page"),
        ("query" = Option<String>, Query, description = "Title contains (case-insensitive)"),
        ("username" = Option<String>, Query, description = "Exact author username"),
        ("excluded_tag_ids" = Option<String>, Query, description = "Comma separated"),
        ("excluded_user_ids" = Option<String>, Query, description = "Comma separated"),
        ("excluded_image_ids" = Option<String>, Query, description = "Comma separated"),
        ("browsing_mode" = Option<BrowsingMode>, Query, description = "All, SFW or NSFW"),
        ("sort" = Option<PostSort>, Query, description = "Newest, MostReactions or MostComments"),
        ("period" = Option<MetricPeriod>, Query, description = "Metric period")
    ),
    responses(
        (status = 200, description = "Feed page", body = PostsPage),
        (status = 400, description = "Invalid query")
    )
)]
pub async fn list_posts(data: web::Data<AppState>, params: web::Query<FeedParams>) -> Result<HttpResponse, ApiError> {
    let query = FeedQuery::try_from(params.into_inner()).map_err(ApiError::BadRequest)?;
    let page = data.repo.list_posts(&query).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts",
    request_body = NewPost,
    responses(
        (status = 201, description = "Post created", body = Post),
        (status = 401, description = "Authorization required")
    )
)]
pub async fn create_post(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewPost>,
) -> Result<HttpResponse, ApiError> {
    let post = data.repo.create_post(auth.user_id()?, payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(post))
}

#[utoipa::path(
    get,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 200, description = "Post detail", body = Post),
        (status = 404, description = "Not found")
    )
)]
pub async fn get_post(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let post = data.repo.get_post(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    patch,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    request_body = UpdatePost,
    responses(
        (status = 200, description = "Post updated", body = Post),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Not found")
    )
)]
pub async fn update_post(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    editable_post(&data, &auth, id).await?;
    let post = data.repo.update_post(id, payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}",
    params(("id" = Id, Path, description = "Post id")),
    responses(
        (status = 204, description = "Post deleted"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Not found")
    )
)]
pub async fn delete_post(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    editable_post(&data, &auth, id).await?;
    data.repo.delete_post(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/images",
    params(("id" = Id, Path, description = "Post id")),
    request_body = NewImage,
    responses(
        (status = 201, description = "Image added with detected resources", body = Image),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn add_image(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewImage>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    editable_post(&data, &auth, post_id).await?;
    let mut new = payload.into_inner();
    new.post_id = post_id;
    let resources = detect_image_resources(data.repo.as_ref(), new.meta.as_ref(), new.model_version_id).await?;
    let image = data.repo.add_image(new, resources).await?;
    Ok(HttpResponse::Created().json(image))
}

#[utoipa::path(
    patch,
    path = "/api/v1/images/{id}",
    params(("id" = Id, Path, description = "Image id")),
    request_body = UpdateImage,
    responses(
        (status = 200, description = "Image updated", body = Image),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Not found")
    )
)]
pub async fn update_image(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdateImage>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let image = data.repo.get_image(id).await?;
    editable_post(&data, &auth, image.post_id).await?;
    let image = data.repo.update_image(id, payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(image))
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/images/reorder",
    params(("id" = Id, Path, description = "Post id")),
    request_body = ReorderImages,
    responses(
        (status = 204, description = "Images reordered"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Post or image not found")
    )
)]
pub async fn reorder_images(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<ReorderImages>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    editable_post(&data, &auth, post_id).await?;
    data.repo.reorder_images(post_id, &payload.image_ids).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    post,
    path = "/api/v1/posts/{id}/tags",
    params(("id" = Id, Path, description = "Post id")),
    request_body = AddPostTag,
    responses(
        (status = 200, description = "Tag attached", body = TagSummary),
        (status = 400, description = "Empty tag name"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Post or tag not found")
    )
)]
pub async fn add_post_tag(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<AddPostTag>,
) -> Result<HttpResponse, ApiError> {
    let post_id = path.into_inner();
    editable_post(&data, &auth, post_id).await?;
    let tag = data.repo.add_post_tag(post_id, payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(tag))
}

#[utoipa::path(
    delete,
    path = "/api/v1/posts/{id}/tags/{tag_id}",
    params(
        ("id" = Id, Path, description = "Post id"),
        ("tag_id" = Id, Path, description = "Tag id")
    ),
    responses(
        (status = 204, description = "Tag detached"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Post not found")
    )
)]
pub async fn remove_post_tag(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, Id)>,
) -> Result<HttpResponse, ApiError> {
    let (post_id, tag_id) = path.into_inner();
    editable_post(&data, &auth, post_id).await?;
    data.repo.remove_post_tag(post_id, tag_id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[utoipa::path(
    get,
    path = "/api/v1/tags",
    params(
        ("query" = Option<String>, Query, description = "Name prefix; shorter than 2 chars shows trending categories"),
        ("limit" = Option<usize>, Query, description = "1..=100, default 10"),
        ("excluded_tag_ids" = Option<String>, Query, description = "Comma separated")
    ),
    responses(
        (status = 200, description = "Matching tags", body = [TagSummary]),
        (status = 400, description = "Invalid query")
    )
)]
pub async fn search_tags(data: web::Data<AppState>, params: web::Query<TagSearchParams>) -> Result<HttpResponse, ApiError> {
    let search = TagSearch::try_from(params.into_inner()).map_err(ApiError::BadRequest)?;
    let tags = data.repo.search_tags(&search).await?;
    Ok(HttpResponse::Ok().json(tags))
}

#[utoipa::path(
    post,
    path = "/api/v1/tags",
    request_body = NewTag,
    responses(
        (status = 201, description = "Tag created", body = Tag),
        (status = 403, description = "Forbidden – Admins only"),
        (status = 409, description = "Conflict")
    )
)]
pub async fn create_tag(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NewTag>,
) -> Result<HttpResponse, ApiError> {
    if !auth.has_role(Role::Admin) {
        return Err(ApiError::Forbidden);
    }
    let tag = data.repo.create_tag(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(tag))
}
