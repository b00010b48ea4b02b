#![cfg(feature = "inmem-store")]

use actix_web::{test, App};
use async_trait::async_trait;
use postboard::auth::{create_jwt, Role};
use postboard::repo::inmem::InMemRepo;
use postboard::routes::{config, AppState};
use postboard::uploads::{UploadError, UploadIssuer, UploadRequest, UploadSigner, UPLOAD_URL_TTL};
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every presign call instead of talking to S3.
#[derive(Default)]
struct MockSigner {
    calls: Mutex<Vec<(String, Duration)>>,
}

#[async_trait]
impl UploadSigner for MockSigner {
    fn bucket(&self) -> &str {
        "test-bucket"
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<String, UploadError> {
        self.calls.lock().unwrap().push((key.to_string(), ttl));
        Ok(format!("https://s3.test/test-bucket/{key}?X-Amz-Expires={}", ttl.as_secs()))
    }
}

fn setup_env() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

fn request(filename: &str, category: Option<&str>) -> UploadRequest {
    UploadRequest { filename: filename.into(), category: category.map(Into::into) }
}

#[actix_web::test]
async fn issuer_scopes_key_and_uses_one_hour_ttl() {
    let signer = Arc::new(MockSigner::default());
    let issuer = UploadIssuer::new(signer.clone());

    let cred = issuer.issue(Some(42), &request("a.png", Some("avatar"))).await.unwrap();
    assert_eq!(cred.key, "42/avatar/a.png");
    assert_eq!(cred.bucket, "test-bucket");
    assert!(cred.url.contains("42/avatar/a.png"));

    let calls = signer.calls.lock().unwrap();
    assert_eq!(calls.as_slice(), &[("42/avatar/a.png".to_string(), Duration::from_secs(3600))]);
    assert_eq!(UPLOAD_URL_TTL, Duration::from_secs(3600));
}

#[actix_web::test]
async fn configuration_is_checked_before_caller() {
    let issuer = UploadIssuer::unconfigured(vec!["S3_UPLOAD_KEY".into(), "S3_UPLOAD_ENDPOINT".into()]);
    let err = issuer.issue(None, &request("a.png", None)).await.unwrap_err();
    assert_eq!(err, UploadError::MissingSettings(vec!["S3_UPLOAD_KEY".into(), "S3_UPLOAD_ENDPOINT".into()]));

    let signer = Arc::new(MockSigner::default());
    let issuer = UploadIssuer::new(signer.clone());
    assert_eq!(issuer.issue(None, &request("a.png", None)).await.unwrap_err(), UploadError::Unauthorized);
    assert!(matches!(
        issuer.issue(Some(1), &request("../a.png", None)).await.unwrap_err(),
        UploadError::InvalidRequest(_)
    ));
    // rejected requests never reach the signer
    assert!(signer.calls.lock().unwrap().is_empty());
}

#[actix_web::test]
#[serial]
async fn upload_route_status_codes() {
    setup_env();
    let token = create_jwt(42, "alice", vec![Role::User]).unwrap();
    let configured = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(AppState {
                repo: Arc::new(InMemRepo::new()),
                uploads: UploadIssuer::new(Arc::new(MockSigner::default())),
            }))
            .configure(config),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/uploads")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(&serde_json::json!({"filename": "a.png", "type": "avatar"}))
        .to_request();
    let resp = test::call_service(&configured, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["key"], "42/avatar/a.png");
    assert_eq!(v["bucket"], "test-bucket");

    let req = test::TestRequest::post()
        .uri("/api/v1/uploads")
        .set_json(&serde_json::json!({"filename": "a.png"}))
        .to_request();
    assert_eq!(test::call_service(&configured, req).await.status(), 401);

    let req = test::TestRequest::post()
        .uri("/api/v1/uploads")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .set_json(&serde_json::json!({"filename": "dir/a.png"}))
        .to_request();
    assert_eq!(test::call_service(&configured, req).await.status(), 400);

    let unconfigured = test::init_service(
        App::new()
            .app_data(actix_web::web::Data::new(AppState {
                repo: Arc::new(InMemRepo::new()),
                uploads: UploadIssuer::unconfigured(vec!["S3_UPLOAD_BUCKET".into()]),
            }))
            .configure(config),
    )
    .await;
    let req = test::TestRequest::post()
        .uri("/api/v1/uploads")
        .set_json(&serde_json::json!({"filename": "a.png"}))
        .to_request();
    let resp = test::call_service(&unconfigured, req).await;
    assert_eq!(resp.status(), 500);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(v["error"].as_str().unwrap().contains("S3_UPLOAD_BUCKET"));
}
