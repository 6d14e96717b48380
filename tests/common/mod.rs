#![allow(dead_code)]

use std::sync::Arc;

use rib_live::config::Config;
use rib_live::media::FsMediaStore;
use rib_live::models::{FileKind, Identity, ImageDescriptor, PostId, TempFile, ThumbClass};
use rib_live::protocol::{NewPost, NewThread, ServerMessage};
use rib_live::store::inmem::InMemStore;
use rib_live::services::Services;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct Harness {
    pub services: Arc<Services>,
    pub dir: TempDir,
    uploads: std::sync::atomic::AtomicUsize,
}

pub fn test_config() -> Config {
    Config { boards: vec!["a".into(), "b".into()], ..Config::default() }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(mut cfg: Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    cfg.media_dir = dir.path().join("media");
    let media = Arc::new(FsMediaStore::new(cfg.media_dir.clone(), "/media"));
    let services = Services::build(cfg, Arc::new(InMemStore::new()), media).await.unwrap();
    Harness { services, dir, uploads: Default::default() }
}

impl Harness {
    /// Writes fake pipeline output to disk and deposits it.
    pub async fn image_token(&self, class: ThumbClass) -> String {
        let n = self.uploads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let tmp = self.dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();
        let src = tmp.join(format!("src-{n}"));
        let thumb = tmp.join(format!("thumb-{n}"));
        std::fs::write(&src, b"full").unwrap();
        std::fs::write(&thumb, b"thumb").unwrap();
        let desc = ImageDescriptor {
            name: format!("upload-{n}.png"),
            mime: "image/png".into(),
            size: 4,
            dims: [800, 600, 250, 188],
            hash: format!("{n:040x}"),
            class,
            files: vec![
                TempFile { kind: FileKind::Src, tmp: src.display().to_string(), name: format!("{n}.png") },
                TempFile { kind: FileKind::Thumb, tmp: thumb.display().to_string(), name: format!("{n}s.jpg") },
            ],
        };
        self.services.images.deposit(desc).await.unwrap()
    }

    /// Creates a thread on board `a` as `ip` and returns its id.
    pub async fn thread(&self, ip: &str, body: &str) -> PostId {
        let token = self.image_token(ThumbClass::Thread).await;
        let req = NewThread {
            subject: Some("live".into()),
            post: NewPost { body: body.into(), image: Some(token), ..Default::default() },
        };
        self.services
            .writer
            .insert_thread(&Identity::anonymous(ip), "a", req, |_| {})
            .await
            .unwrap()
            .post
            .id
    }

    pub async fn reply(&self, ip: &str, thread: PostId, body: &str) -> PostId {
        let req = NewPost { body: body.into(), ..Default::default() };
        self.services
            .writer
            .insert_post(&Identity::anonymous(ip), "a", thread, req, |_| {})
            .await
            .unwrap()
            .post
            .id
    }
}

/// Decodes every frame currently queued in `rx`, splitting concatenations.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<str>>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        match ServerMessage::decode(&frame).unwrap() {
            ServerMessage::Concat(parts) => out.extend(parts),
            msg => out.push(msg),
        }
    }
    out
}

pub fn set_secret() {
    std::env::set_var("JWT_SECRET", "test-secret-must-be-32-bytes-long!!");
}
