#![cfg(feature = "inmem-store")]

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{harness, harness_with, test_config};
use rib_live::config::Config;
use rib_live::error::PostError;
use rib_live::models::{Identity, Segment, ThumbClass, Tier};
use rib_live::protocol::{BanRequest, NewPost, NewThread};

fn reply(body: &str) -> NewPost {
    NewPost { body: body.into(), ..Default::default() }
}

#[tokio::test]
async fn concurrent_replies_get_unique_increasing_ids() {
    let h = harness_with(Config { debug: true, ..test_config() }).await;
    let thread = h.thread("10.0.0.1", "op").await;

    let mut tasks = Vec::new();
    for i in 0..40 {
        let services = h.services.clone();
        tasks.push(tokio::spawn(async move {
            let reserved = Arc::new(std::sync::Mutex::new(None));
            let slot = reserved.clone();
            let ident = Identity::anonymous(format!("10.1.0.{i}"));
            let inserted = services
                .writer
                .insert_post(&ident, "a", thread, reply("hi"), move |id| *slot.lock().unwrap() = Some(id))
                .await
                .unwrap();
            assert_eq!(*reserved.lock().unwrap(), Some(inserted.post.id));
            inserted.post.id
        }));
    }
    let mut ids = Vec::new();
    for t in tasks {
        ids.push(t.await.unwrap());
    }
    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(ids.iter().all(|&id| id > thread));

    let th = h.services.store.get_thread(thread).await.unwrap();
    assert_eq!(th.post_count, 41);
    assert_eq!(h.services.store.log_len(thread).await.unwrap(), 41);
}

#[tokio::test]
async fn racing_replies_both_succeed_with_adjacent_ids_and_bump() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let before = h.services.store.get_thread(thread).await.unwrap().bump_time;

    let w1 = h.services.writer.clone();
    let w2 = h.services.writer.clone();
    let (a, b) = tokio::join!(
        async move { w1.insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, reply("one"), |_| {}).await },
        async move { w2.insert_post(&Identity::anonymous("10.0.0.3"), "a", thread, reply("two"), |_| {}).await },
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    let mut ids = [a.post.id, b.post.id];
    ids.sort();
    assert_eq!(ids[1], ids[0] + 1);
    assert!(a.bumped && b.bumped);

    let th = h.services.store.get_thread(thread).await.unwrap();
    assert!(th.bump_time >= before);
    assert_eq!(th.reply_count(), 2);
}

#[tokio::test]
async fn sage_and_bump_limit_stop_bumping() {
    let h = harness_with(Config { bump_limit: 2, ..test_config() }).await;
    let thread = h.thread("10.0.0.1", "op").await;
    let w = &h.services.writer;

    let saged = NewPost { email: Some("sage".into()), ..reply("quiet") };
    let r = w.insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, saged, |_| {}).await.unwrap();
    assert!(r.post.sage);
    assert!(!r.bumped);

    let r = w.insert_post(&Identity::anonymous("10.0.0.3"), "a", thread, reply("two"), |_| {}).await.unwrap();
    assert!(r.bumped);
    let bump = h.services.store.get_thread(thread).await.unwrap().bump_time;

    let r = w.insert_post(&Identity::anonymous("10.0.0.4"), "a", thread, reply("three"), |_| {}).await.unwrap();
    assert!(!r.bumped, "thread already has bump_limit replies");
    assert_eq!(h.services.store.get_thread(thread).await.unwrap().bump_time, bump);
}

#[tokio::test]
async fn body_exactly_at_limit_is_accepted_one_more_is_rejected() {
    let h = harness_with(Config { max_body_len: 50, ..test_config() }).await;
    let thread = h.thread("10.0.0.1", "op").await;
    let w = &h.services.writer;

    let at_limit = "é".repeat(50);
    w.insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, reply(&at_limit), |_| {})
        .await
        .unwrap();

    let over = "é".repeat(51);
    let err = w
        .insert_post(&Identity::anonymous("10.0.0.3"), "a", thread, reply(&over), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PostError::TooLong));
    assert_eq!(err.to_string(), "too long");
}

#[tokio::test]
async fn whitespace_only_reply_without_image_is_rejected() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let err = h
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, reply(" \n\t "), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PostError::Empty));

    let token = h.image_token(ThumbClass::Reply).await;
    let with_image = NewPost { image: Some(token), ..reply("  ") };
    let r = h
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, with_image, |_| {})
        .await
        .unwrap();
    assert!(r.post.image.is_some());
}

#[tokio::test]
async fn link_to_missing_post_stays_literal_text() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let missing = thread + 1000;
    let body = format!(">>{missing} hello");
    let r = h
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, reply(&body), |_| {})
        .await
        .unwrap();
    assert_eq!(r.post.body, vec![Segment::Text(body.clone())]);
    // insertThread + insertPost, no backlink
    assert_eq!(h.services.store.log_len(thread).await.unwrap(), 2);
}

#[tokio::test]
async fn confirmed_link_writes_backlink_on_target() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let r = h
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, reply(&format!(">>{thread} agreed")), |_| {})
        .await
        .unwrap();
    assert!(matches!(&r.post.body[0], Segment::Link { link } if link.id == thread));

    let op = h.services.store.get_post(thread).await.unwrap();
    assert_eq!(op.post.backlinks.get(&r.post.id), Some(&thread));
    assert_eq!(h.services.store.log_len(thread).await.unwrap(), 3);
}

#[tokio::test]
async fn thread_needs_image_and_respects_cooldown() {
    let h = harness().await;
    let w = &h.services.writer;
    let ident = Identity::anonymous("10.0.0.9");

    let bare = NewThread { subject: None, post: reply("no image") };
    assert!(matches!(w.insert_thread(&ident, "a", bare, |_| {}).await, Err(PostError::NoImage)));

    let wrong = h.image_token(ThumbClass::Reply).await;
    let req = NewThread { subject: None, post: NewPost { image: Some(wrong), ..reply("x") } };
    assert!(matches!(w.insert_thread(&ident, "a", req, |_| {}).await, Err(PostError::Image(_))));

    h.thread("10.0.0.9", "first").await;
    let token = h.image_token(ThumbClass::Thread).await;
    let again = NewThread { subject: None, post: NewPost { image: Some(token), ..reply("second") } };
    assert!(matches!(w.insert_thread(&ident, "a", again, |_| {}).await, Err(PostError::TooSoon)));
}

#[tokio::test]
async fn locked_and_unknown_threads_reject_replies() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let w = &h.services.writer;
    let anon = Identity::anonymous("10.0.0.2");
    let moderator = Identity::staff("10.0.0.3", Tier::Moderator, "mod");

    assert!(matches!(w.lock_thread(&anon, thread, true).await, Err(PostError::Forbidden)));
    w.lock_thread(&moderator, thread, true).await.unwrap();
    assert!(matches!(
        w.insert_post(&anon, "a", thread, reply("late"), |_| {}).await,
        Err(PostError::Locked)
    ));
    assert!(matches!(
        w.insert_post(&anon, "a", thread + 50, reply("lost"), |_| {}).await,
        Err(PostError::NoThread)
    ));
    assert!(matches!(
        w.insert_post(&anon, "b", thread, reply("wrong board"), |_| {}).await,
        Err(PostError::NoThread)
    ));
}

#[tokio::test]
async fn banned_poster_cannot_post() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let offender = h.reply("10.0.0.66", thread, "spam").await;
    let moderator = Identity::staff("10.0.0.3", Tier::Moderator, "mod");

    let req = BanRequest { id: offender, reason: "spam".into(), duration: 3600 };
    h.services.writer.ban(&moderator, &req).await.unwrap();
    assert!(h.services.store.get_post(offender).await.unwrap().post.banned);

    let err = h
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.66"), "a", thread, reply("again"), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PostError::Banned));
}

#[tokio::test]
async fn read_only_rejects_everything() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let ro = harness_with(Config { read_only: true, ..test_config() }).await;
    let err = ro
        .services
        .writer
        .insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, reply("x"), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, PostError::ReadOnly));
}

#[tokio::test]
async fn open_post_edits_then_closes_with_parsed_body() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let w = &h.services.writer;
    let req = NewPost { open: true, password: Some("hunter2".into()), ..reply("draft") };
    let r = w.insert_post(&Identity::anonymous("10.0.0.2"), "a", thread, req, |_| {}).await.unwrap();
    assert!(r.post.editing);

    let open = w.reclaim(r.post.id, "hunter2").await.unwrap();
    assert!(w.reclaim(r.post.id, "wrong").await.is_err());
    w.append_body(&open, &format!(" >>{thread}")).await.unwrap();
    w.backspace(&open).await.unwrap();
    w.append_body(&open, &thread.to_string().chars().last().unwrap().to_string()).await.unwrap();
    w.splice_body(&open, 0, 5, "final").await.unwrap();
    w.close_post(&open).await.unwrap();

    let rec = h.services.store.get_post(r.post.id).await.unwrap();
    assert!(!rec.post.editing);
    assert_eq!(rec.post.text, format!("final >>{thread}"));
    assert!(matches!(rec.post.body.last(), Some(Segment::Link { link }) if link.id == thread));
    assert!(rec.password.is_none(), "closing forgets the reclaim password");
    assert!(matches!(w.append_body(&open, "more").await, Err(PostError::Edit(_))));

    let op = h.services.store.get_post(thread).await.unwrap();
    assert!(op.post.backlinks.contains_key(&r.post.id));
}

#[tokio::test]
async fn janitor_deletes_and_spoilers() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let janitor = Identity::staff("10.0.0.5", Tier::Janitor, "jan");
    let w = &h.services.writer;

    assert!(matches!(w.delete_post(&Identity::anonymous("10.0.0.2"), thread).await, Err(PostError::Forbidden)));
    w.spoiler_image(&janitor, thread).await.unwrap();
    w.delete_post(&janitor, thread).await.unwrap();
    let op = h.services.store.get_post(thread).await.unwrap();
    assert!(op.post.deleted);
    assert!(op.post.image.unwrap().spoiler);
}

#[tokio::test]
async fn purge_removes_thread_everywhere() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let reply_id = h.reply("10.0.0.2", thread, "bye").await;

    let removed = h.services.writer.purge_thread(thread).await.unwrap();
    assert_eq!(removed, 2);
    assert!(h.services.cache.get(thread).is_none());
    assert!(h.services.cache.get(reply_id).is_none());
    assert!(h.services.store.get_post(reply_id).await.is_err());
    assert!(!h.services.fanout.is_active(thread));
}
