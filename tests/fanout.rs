#![cfg(feature = "inmem-store")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{drain, harness, harness_with, test_config};
use rib_live::config::Config;
use rib_live::fanout::{FanoutError, Listener};
use rib_live::models::{Identity, PostId, Tier};
use rib_live::protocol::{NewPost, ServerMessage, Update};
use tokio::sync::mpsc;

fn listener(session: u64, ip: &str, tier: Tier) -> (Listener, mpsc::UnboundedReceiver<Arc<str>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Listener { session, ip: ip.into(), tier, outbox: tx }, rx)
}

fn seqs(msgs: &[ServerMessage]) -> Vec<u64> {
    msgs.iter()
        .filter_map(|m| match m {
            ServerMessage::Update(r) => Some(r.seq),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn concurrent_publishes_arrive_in_log_order() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let (l, mut rx) = listener(1, "10.0.0.2", Tier::Normal);
    h.services.fanout.listen(thread, l, 1).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let fanout = h.services.fanout.clone();
        tasks.push(tokio::spawn(async move {
            fanout.publish(thread, Update::LockThread { locked: false }, None).await.unwrap()
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let received = seqs(&drain(&mut rx));
    assert_eq!(received, (2..=21).collect::<Vec<_>>());

    let log = h.services.store.read_log(thread, 1, 100).await.unwrap();
    assert_eq!(log.iter().map(|e| e.seq).collect::<Vec<_>>(), (1..=21).collect::<Vec<_>>());
}

#[tokio::test]
async fn listen_replays_missed_entries_after_the_ack() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    for i in 0..6 {
        h.reply(&format!("10.0.1.{i}"), thread, "more").await;
    }
    let (l, mut rx) = listener(1, "10.0.0.2", Tier::Normal);
    let ack = h.services.fanout.listen(thread, l, 3).await.unwrap();
    assert_eq!(ack.ctr, 7);
    assert!(ack.replay);

    let msgs = drain(&mut rx);
    assert!(matches!(msgs[0], ServerMessage::Synchronize(ref a) if a.ctr == 7));
    assert_eq!(seqs(&msgs), vec![4, 5, 6, 7]);
    assert!(matches!(msgs.last(), Some(ServerMessage::SyncCount(1))));
}

#[tokio::test]
async fn large_gaps_are_left_to_the_backlog() {
    let h = harness_with(Config { replay_limit: 2, debug: true, ..test_config() }).await;
    let thread = h.thread("10.0.0.1", "op").await;
    for _ in 0..4 {
        h.reply("10.0.0.1", thread, "more").await;
    }
    let (l, mut rx) = listener(1, "10.0.0.2", Tier::Normal);
    let ack = h.services.fanout.listen(thread, l, 1).await.unwrap();
    assert_eq!(ack.ctr, 5);
    assert!(!ack.replay);
    assert!(seqs(&drain(&mut rx)).is_empty());
}

#[tokio::test]
async fn counter_ahead_of_server_is_rejected() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let (l, _rx) = listener(1, "10.0.0.2", Tier::Normal);
    assert!(matches!(
        h.services.fanout.listen(thread, l, 9).await,
        Err(FanoutError::InvalidCounter)
    ));
}

#[tokio::test]
async fn staff_tiers_see_extended_payloads() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let (normal, mut normal_rx) = listener(1, "10.0.0.2", Tier::Normal);
    let (janitor, mut janitor_rx) = listener(2, "10.0.0.3", Tier::Janitor);
    let (moderator, mut moderator_rx) = listener(3, "10.0.0.4", Tier::Moderator);
    for l in [normal, janitor, moderator] {
        h.services.fanout.listen(thread, l, 1).await.unwrap();
    }
    for rx in [&mut normal_rx, &mut janitor_rx, &mut moderator_rx] {
        drain(rx);
    }

    let req = NewPost { body: "hello".into(), ..Default::default() };
    h.services
        .writer
        .insert_post(&Identity::anonymous("192.0.2.7"), "a", thread, req, |_| {})
        .await
        .unwrap();

    let only_update = |rx: &mut mpsc::UnboundedReceiver<Arc<str>>| match drain(rx).pop() {
        Some(ServerMessage::Update(r)) => r,
        other => panic!("expected update, got {other:?}"),
    };
    let n = only_update(&mut normal_rx);
    assert_eq!((n.ip, n.hint), (None, None));
    let j = only_update(&mut janitor_rx);
    assert!(j.ip.is_none());
    assert!(j.hint.as_deref().is_some_and(|h| !h.contains("192.0.2.7")));
    let m = only_update(&mut moderator_rx);
    assert_eq!(m.ip.as_deref(), Some("192.0.2.7"));

    // the log keeps the base payload only
    let entry = h.services.store.read_log(thread, 2, 3).await.unwrap().remove(0);
    assert!(!entry.payload.contains("192.0.2.7"));
}

#[tokio::test]
async fn online_count_is_unique_ips() {
    let h = harness().await;
    let thread = h.thread("10.0.0.1", "op").await;
    let (a, mut rx) = listener(1, "10.0.0.2", Tier::Normal);
    let (b, _rb) = listener(2, "10.0.0.2", Tier::Normal);
    let (c, _rc) = listener(3, "10.0.0.3", Tier::Normal);
    for l in [a, b, c] {
        h.services.fanout.listen(thread, l, 1).await.unwrap();
    }
    assert_eq!(h.services.fanout.online(thread).await, 2);
    let counts: Vec<usize> = drain(&mut rx)
        .into_iter()
        .filter_map(|m| match m {
            ServerMessage::SyncCount(n) => Some(n),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![1, 1, 2]);
}

async fn idle_thread(h: &common::Harness) -> PostId {
    let thread = h.thread("10.0.0.1", "op").await;
    let (l, _rx) = listener(1, "10.0.0.2", Tier::Normal);
    h.services.fanout.listen(thread, l, 1).await.unwrap();
    h.services.fanout.unlisten(thread, 1).await;
    thread
}

#[tokio::test(start_paused = true)]
async fn idle_fanout_is_torn_down_after_timeout() {
    let h = harness().await;
    let thread = idle_thread(&h).await;
    assert!(h.services.fanout.is_active(thread));

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(h.services.fanout.is_active(thread));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!h.services.fanout.is_active(thread));
}

#[tokio::test(start_paused = true)]
async fn returning_listener_cancels_teardown() {
    let h = harness().await;
    let thread = idle_thread(&h).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    let (l, _rx) = listener(2, "10.0.0.3", Tier::Normal);
    h.services.fanout.listen(thread, l, 1).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.services.fanout.is_active(thread));

    // publishing after teardown transparently recreates the fanout
    h.services.fanout.unlisten(thread, 2).await;
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!h.services.fanout.is_active(thread));
    let seq = h.services.fanout.publish(thread, Update::LockThread { locked: true }, None).await.unwrap();
    assert_eq!(seq, 2);
}
