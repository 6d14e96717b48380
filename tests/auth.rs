use actix_web::{dev::Payload, test, FromRequest};
use rib_live::auth::{create_jwt, Auth, Claims, Role};
use rib_live::error::ApiError;
use rib_live::models::Tier;
use rib_live::require_role;
use std::env;

fn set_secret() {
    env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}

#[actix_web::test]
#[serial_test::serial]
async fn jwt_roundtrip_ok() {
    set_secret();
    let token = create_jwt("staff:alice", vec![Role::Janitor]).expect("token");
    let req = test::TestRequest::default()
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_http_request();
    let mut pl = Payload::None;
    let auth = Auth::from_request(&req, &mut pl).await.expect("extract");
    assert_eq!(auth.0.sub, "staff:alice");
    assert!(auth.0.has(Role::Janitor));
    assert_eq!(auth.0.identity("10.0.0.9").tier, Tier::Janitor);
}

#[actix_web::test]
#[serial_test::serial]
async fn extractor_rejects_invalid_token() {
    set_secret();
    let req = test::TestRequest::default()
        .insert_header(("Authorization", "Bearer notatoken"))
        .to_http_request();
    let mut pl = Payload::None;
    assert!(Auth::from_request(&req, &mut pl).await.is_err());
}

#[actix_web::test]
async fn extractor_requires_header() {
    let req = test::TestRequest::default().to_http_request();
    let mut pl = Payload::None;
    assert!(Auth::from_request(&req, &mut pl).await.is_err());
}

#[actix_web::test]
#[serial_test::serial]
async fn token_signed_with_other_secret_is_rejected() {
    env::set_var("JWT_SECRET", "another-secret-that-is-32-bytes-long");
    let token = create_jwt("root", vec![Role::Admin]).expect("token");
    set_secret();
    let req = test::TestRequest::default()
        .insert_header(("Authorization", format!("Bearer {}", token)))
        .to_http_request();
    let mut pl = Payload::None;
    assert!(Auth::from_request(&req, &mut pl).await.is_err());
}

#[::std::prelude::v1::test]
fn require_role_macro_enforces_roles() {
    let admin = Auth(Claims { sub: "root".into(), exp: usize::MAX, roles: vec![Role::Admin] });
    let janitor = Auth(Claims { sub: "jan".into(), exp: usize::MAX, roles: vec![Role::Janitor] });

    fn guarded(a: Auth) -> Result<(), ApiError> {
        require_role!(a, Role::Admin | Role::Moderator);
        Ok(())
    }
    assert!(guarded(admin).is_ok());
    assert!(matches!(guarded(janitor), Err(ApiError::Forbidden)));
}

#[::std::prelude::v1::test]
fn moderators_and_admins_share_the_top_tier() {
    let mixed = Claims { sub: "m".into(), exp: 0, roles: vec![Role::Janitor, Role::Moderator] };
    assert_eq!(mixed.identity("10.0.0.1").tier, Tier::Moderator);
    let nobody = Claims { sub: "x".into(), exp: 0, roles: vec![] };
    let id = nobody.identity("10.0.0.1");
    assert_eq!(id.tier, Tier::Normal);
    assert!(id.staff.is_none());
}
