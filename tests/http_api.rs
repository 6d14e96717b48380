#![cfg(feature = "inmem-store")]

mod common;

use actix_web::{test, web, App};
use common::{harness, set_secret};
use rib_live::auth::{create_jwt, Role};
use rib_live::models::{FileKind, ThumbClass};
use rib_live::protocol::{ServerMessage, FRAME_SEPARATOR};
use rib_live::{config, AppState};
use serde_json::json;
use serial_test::serial;

fn token(role: Role) -> String {
    set_secret();
    create_jwt("staff:test", vec![role]).unwrap()
}

#[actix_web::test]
#[serial]
async fn log_slice_is_nul_joined_frames() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    h.reply("10.0.0.2", thread, "one").await;
    h.reply("10.0.0.3", thread, "two").await;
    let state = AppState { services: h.services.clone(), metrics: None };
    let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(config)).await;

    let req = test::TestRequest::post()
        .uri("/json/log")
        .set_json(json!({"id": thread, "start": 2, "end": 4}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body = String::from_utf8(test::read_body(resp).await.to_vec()).unwrap();
    let frames: Vec<&str> = body.split(FRAME_SEPARATOR).collect();
    assert_eq!(frames.len(), 2);
    let seqs: Vec<u64> = frames
        .iter()
        .map(|f| match ServerMessage::decode(f).unwrap() {
            ServerMessage::Update(r) => r.seq,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(seqs, vec![2, 3]);

    // nothing past the end
    let req = test::TestRequest::post()
        .uri("/json/log")
        .set_json(json!({"id": thread, "start": 4, "end": 10}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert!(test::read_body(resp).await.is_empty());

    let req = test::TestRequest::post()
        .uri("/json/log")
        .set_json(json!({"id": thread + 500, "start": 1, "end": 2}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let req = test::TestRequest::post()
        .uri("/json/log")
        .set_json(json!({"id": thread, "start": 5, "end": 2}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert_eq!(test::read_body(resp).await, "invalid range");
}

#[actix_web::test]
#[serial]
async fn image_deposit_requires_admin() {
    let h = harness().await;
    let state = AppState { services: h.services.clone(), metrics: None };
    let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(config)).await;

    let tmp = h.dir.path().join("upload");
    std::fs::write(&tmp, b"x").unwrap();
    let thumb = h.dir.path().join("upload-thumb");
    std::fs::write(&thumb, b"x").unwrap();
    let desc = json!({
        "name": "cat.png", "mime": "image/png", "size": 1, "dims": [1, 1, 1, 1],
        "hash": "abc123", "class": "reply",
        "files": [
            {"kind": FileKind::Src, "tmp": tmp.display().to_string(), "name": "1.png"},
            {"kind": FileKind::Thumb, "tmp": thumb.display().to_string(), "name": "1s.jpg"}
        ]
    });

    let req = test::TestRequest::post().uri("/api/v1/images/allocations").set_json(&desc).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 401);

    let req = test::TestRequest::post()
        .uri("/api/v1/images/allocations")
        .insert_header(("Authorization", format!("Bearer {}", token(Role::Moderator))))
        .set_json(&desc)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 403);

    let req = test::TestRequest::post()
        .uri("/api/v1/images/allocations")
        .insert_header(("Authorization", format!("Bearer {}", token(Role::Admin))))
        .set_json(&desc)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    let alloc = v["token"].as_str().unwrap();
    let (image, hash) = h.services.images.redeem(alloc, ThumbClass::Reply).await.unwrap();
    assert_eq!(image.name, "cat.png");
    assert_eq!(hash, "abc123");
}

#[actix_web::test]
#[serial]
async fn admin_notification_and_purge() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    h.services.sessions.register(tx);
    let state = AppState { services: h.services.clone(), metrics: None };
    let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(config)).await;
    let admin = format!("Bearer {}", token(Role::Admin));

    let req = test::TestRequest::post()
        .uri("/api/v1/admin/notification")
        .insert_header(("Authorization", admin.clone()))
        .set_json(json!({"text": "maintenance at noon"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let v: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(v["delivered"], 1);
    assert_eq!(
        common::drain(&mut rx),
        vec![ServerMessage::Notification("maintenance at noon".into())]
    );

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/admin/threads/{thread}/purge"))
        .insert_header(("Authorization", admin.clone()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert!(h.services.cache.get(thread).is_none());

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/admin/threads/{thread}/purge"))
        .insert_header(("Authorization", admin))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);
}

#[actix_web::test]
async fn health_and_openapi() {
    let h = harness().await;
    let state = AppState { services: h.services.clone(), metrics: None };
    let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(config)).await;

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/docs/openapi.json").to_request()).await;
    assert_eq!(resp.status(), 200);
    let doc: serde_json::Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert!(doc["paths"]["/json/log"].is_object());

    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), 404);
}
