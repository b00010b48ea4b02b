#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use postboard::{routes::{config, AppState}, auth::{create_jwt, Role}};
use postboard::repo::inmem::InMemRepo;
use postboard::uploads::UploadIssuer;
use std::sync::Arc;
use serial_test::serial;

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

fn owner_token() -> String { create_jwt(7, "alice", vec![Role::User]).unwrap() }
fn stranger_token() -> String { create_jwt(8, "bob", vec![Role::User]).unwrap() }
fn moderator_token() -> String { create_jwt(9, "mod", vec![Role::Moderator]).unwrap() }
fn admin_token() -> String { create_jwt(1, "admin", vec![Role::Admin]).unwrap() }

fn state(repo: InMemRepo) -> actix_web::web::Data<AppState> {
    actix_web::web::Data::new(AppState {
        repo: Arc::new(repo),
        uploads: UploadIssuer::unconfigured(vec!["S3_UPLOAD_KEY".into()]),
    })
}

fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

#[actix_web::test]
#[serial]
async fn test_post_image_tag_flow_routes() {
    setup_env();
    let repo = InMemRepo::new();
    repo.insert_user(7, "alice");
    repo.register_model_file(55, "Model", "deadbeef");
    let app = test::init_service(App::new().app_data(state(repo)).configure(config)).await;

    // feed starts empty
    let req = test::TestRequest::get().uri("/api/v1/posts").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["items"].as_array().unwrap().len(), 0);
    assert!(v["next_cursor"].is_null());

    // anonymous create is rejected
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .set_json(&serde_json::json!({"title": "x"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    // create post
    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"title": "Sunset", "published_at": "2024-01-01T00:00:00Z"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let post: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let post_id = post["id"].as_i64().unwrap();
    assert_eq!(post["user_id"], 7);
    assert_eq!(post["username"], "alice");

    // add image with generation metadata
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/images"))
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({
            "url": "https://cdn/sunset.png",
            "meta": {"Steps": 20, "hashes": {"model": "DEADBEEF", "lora:glow": "0000"}}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let image: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(image["generation_process"], "txt2img");
    let resources = image["resources"].as_array().unwrap();
    assert_eq!(resources.len(), 2);
    assert!(resources.iter().any(|r| r["model_version_id"] == 55));
    assert!(resources.iter().any(|r| r["name"] == "lora:glow"));
    let image_id = image["id"].as_i64().unwrap();

    // strangers cannot touch it, moderators can
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/images/{image_id}"))
        .insert_header(bearer(&stranger_token()))
        .set_json(&serde_json::json!({"nsfw": true}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);
    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/images/{image_id}"))
        .insert_header(bearer(&moderator_token()))
        .set_json(&serde_json::json!({"name": "cover"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);

    // tag it twice with different case
    for name in ["Landscape", "landscape"] {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/posts/{post_id}/tags"))
            .insert_header(bearer(&owner_token()))
            .set_json(&serde_json::json!({"name": name}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 200);
    }

    let req = test::TestRequest::get().uri(&format!("/api/v1/posts/{post_id}")).to_request();
    let full: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(full["tags"].as_array().unwrap().len(), 1);
    assert_eq!(full["images"][0]["name"], "cover");
    let tag_id = full["tags"][0]["id"].as_i64().unwrap();

    // tag search by prefix
    let req = test::TestRequest::get().uri("/api/v1/tags?query=LAND").to_request();
    let tags: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(tags[0]["name"], "landscape");

    // feed now shows the post with its lead image only
    let req = test::TestRequest::get().uri("/api/v1/posts?limit=10&browsing_mode=SFW").to_request();
    let feed: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(feed["items"][0]["id"], post_id);
    assert_eq!(feed["items"][0]["images"].as_array().unwrap().len(), 1);

    // detach tag
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/posts/{post_id}/tags/{tag_id}"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    // stranger cannot delete, owner can
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/posts/{post_id}"))
        .insert_header(bearer(&stranger_token()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/posts/{post_id}"))
        .insert_header(bearer(&owner_token()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);
    let req = test::TestRequest::get().uri(&format!("/api/v1/posts/{post_id}")).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
#[serial]
async fn test_update_and_reorder_routes() {
    setup_env();
    let app = test::init_service(App::new().app_data(state(InMemRepo::new())).configure(config)).await;

    let req = test::TestRequest::post()
        .uri("/api/v1/posts")
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"title": "Draft", "detail": "words"}))
        .to_request();
    let post: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    let post_id = post["id"].as_i64().unwrap();

    let req = test::TestRequest::patch()
        .uri(&format!("/api/v1/posts/{post_id}"))
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"detail": ""}))
        .to_request();
    let updated: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(updated["title"], "Draft");
    assert!(updated["detail"].is_null());

    let mut image_ids = Vec::new();
    for n in 0..2 {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/posts/{post_id}/images"))
            .insert_header(bearer(&owner_token()))
            .set_json(&serde_json::json!({"url": format!("https://cdn/{n}.png")}))
            .to_request();
        let image: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        image_ids.push(image["id"].as_i64().unwrap());
    }
    image_ids.reverse();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/images/reorder"))
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"image_ids": image_ids}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);

    let req = test::TestRequest::get().uri(&format!("/api/v1/posts/{post_id}")).to_request();
    let full: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    let order: Vec<i64> = full["images"].as_array().unwrap().iter().map(|i| i["id"].as_i64().unwrap()).collect();
    assert_eq!(order, image_ids);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/posts/{post_id}/images/reorder"))
        .insert_header(bearer(&owner_token()))
        .set_json(&serde_json::json!({"image_ids": [9999]}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
#[serial]
async fn test_tag_creation_admin_only_and_query_validation() {
    setup_env();
    let app = test::init_service(App::new().app_data(state(InMemRepo::new())).configure(config)).await;

    let body = serde_json::json!({"name": "Style", "is_category": true, "target": ["Post"]});
    let req = test::TestRequest::post()
        .uri("/api/v1/tags")
        .insert_header(bearer(&owner_token()))
        .set_json(&body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let req = test::TestRequest::post()
        .uri("/api/v1/tags")
        .insert_header(bearer(&admin_token()))
        .set_json(&body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 201);
    let req = test::TestRequest::post()
        .uri("/api/v1/tags")
        .insert_header(bearer(&admin_token()))
        .set_json(&body)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 409);

    // empty query falls back to trending categories
    let req = test::TestRequest::get().uri("/api/v1/tags").to_request();
    let tags: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(tags[0]["name"], "style");

    for uri in [
        "/api/v1/tags?limit=0",
        "/api/v1/tags?limit=101",
        "/api/v1/posts?limit=201",
        "/api/v1/posts?excluded_tag_ids=1,x",
    ] {
        let req = test::TestRequest::get().uri(uri).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400, "{uri}");
    }
}
