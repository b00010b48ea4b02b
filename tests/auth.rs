use actix_web::{dev::Payload, test, FromRequest};
use postboard::auth::{create_jwt, Auth, Claims, Role};
use serial_test::serial;
use std::env;

// Helper that guarantees a sufficiently long secret for tests.
fn set_secret() {
    env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

fn claims(sub: &str, roles: Vec<Role>) -> Auth {
    Auth(Claims { sub: sub.into(), username: "u".into(), exp: usize::MAX, roles })
}

#[actix_web::test]
#[serial]
async fn jwt_roundtrip_ok() {
    set_secret();
    let token = create_jwt(42, "tester", vec![Role::User]).expect("token");
    // The Auth extractor is the public way to validate, so use it here.
    let req = test::TestRequest::default()
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_http_request();
    let mut pl = Payload::None;
    let auth = Auth::from_request(&req, &mut pl).await.expect("extract");
    assert_eq!(auth.0.sub, "42");
    assert_eq!(auth.0.username, "tester");
    assert_eq!(auth.user_id().unwrap(), 42);
    assert!(auth.has_role(Role::User));
}

#[actix_web::test]
#[serial]
async fn extractor_rejects_invalid_and_missing_tokens() {
    set_secret();
    let req = test::TestRequest::default()
        .insert_header(("Authorization", "Bearer notatoken"))
        .to_http_request();
    let mut pl = Payload::None;
    assert!(Auth::from_request(&req, &mut pl).await.is_err());

    let req = test::TestRequest::default().to_http_request();
    assert!(Auth::from_request(&req, &mut pl).await.is_err());
}

#[actix_web::test]
#[serial]
async fn token_signed_with_other_secret_is_rejected() {
    env::set_var("JWT_SECRET", "another-secret-that-is-32-bytes-long!");
    let token = create_jwt(1, "a", vec![Role::Admin]).unwrap();
    set_secret();
    let req = test::TestRequest::default()
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_http_request();
    let mut pl = Payload::None;
    assert!(Auth::from_request(&req, &mut pl).await.is_err());
}

#[actix_web::test]
#[serial]
async fn missing_secret_is_an_error_not_a_panic() {
    env::remove_var("JWT_SECRET");
    assert!(create_jwt(1, "a", vec![Role::User]).is_err());
    set_secret();
}

#[std::prelude::v1::test]
fn moderator_check_covers_admin() {
    assert!(claims("1", vec![Role::Admin]).is_moderator());
    assert!(claims("1", vec![Role::Moderator]).is_moderator());
    assert!(!claims("1", vec![Role::User]).is_moderator());
}

#[std::prelude::v1::test]
fn non_numeric_subject_is_unauthorized() {
    assert!(claims("btc:abc", vec![Role::User]).user_id().is_err());
    assert_eq!(claims("17", vec![]).user_id().unwrap(), 17);
}
