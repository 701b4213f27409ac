//! Shared fixtures for unit and scenario tests

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use crate::ripper::config_loader::{Settings, SettingsManager};
use crate::ripper::engine::RipperEngine;
use crate::ripper::event_bus::{DEFAULT_SUBSCRIBER_CAPACITY, EventBus};
use crate::ripper::hosts::default_registry;
use crate::ripper::models::{Image, ImageStatus, Post, PostStatus};
use crate::ripper::store::MemoryStore;


pub use fake_transport::FakeTransport;

pub const PROXY: &str = "https://forum.example";

pub fn post(post_id: &str, total: u32) -> Post {
    Post {
        id: 0,
        post_id: post_id.to_string(),
        thread_id: "1".to_string(),
        title: format!("Gallery {}", post_id),
        url: format!("{}/threads/1/?p={}", PROXY, post_id),
        thread_title: "Thread".to_string(),
        forum: "Pictures".to_string(),
        submitter: String::new(),
        total,
        done: 0,
        status: PostStatus::Stopped,
        download_directory: None,
        thanked: false,
        hosts: vec!["imagetwist.com".to_string()],
        previews: Vec::new(),
        alt_titles: Vec::new(),
        added_at: Utc::now(),
    }
}

pub fn image(post_id: &str, url: &str, index: u32) -> Image {
    Image {
        id: 0,
        post_id: post_id.to_string(),
        url: url.to_string(),
        thumb_url: format!("{}/thumb", url),
        host: "imagetwist.com".to_string(),
        index,
        current: 0,
        total: 0,
        status: ImageStatus::Stopped,
    }
}

/// XML description of one post whose images are the given page URLs
pub fn post_xml(thread_id: &str, post_id: &str, title: &str, pages: &[String]) -> String {
    let images: String = pages
        .iter()
        .map(|page| format!(r#"<image main_url="{}" thumb_url="{}/thumb"/>"#, page, page))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<tree>
  <forum id="1" title="Pictures"/>
  <user id="1" hash="token"/>
  <thread id="{thread_id}" title="Thread {thread_id}"/>
  <post id="{post_id}" number="1" title="{title}">{images}</post>
</tree>"#
    )
}

/// XML description of a thread with `posts` posts of one image each
pub fn thread_xml(thread_id: &str, posts: &[&str]) -> String {
    let body: String = posts
        .iter()
        .enumerate()
        .map(|(i, post_id)| {
            format!(
                r#"<post id="{post_id}" number="{}" title="Post {post_id}"><image main_url="https://imagetwist.com/{post_id}" thumb_url="https://t.imagetwist.com/{post_id}.jpg"/></post>"#,
                i + 1
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<tree>
  <forum id="1" title="Pictures"/>
  <thread id="{thread_id}" title="Thread {thread_id}"/>
  {body}
</tree>"#
    )
}

pub fn post_scan_url(post_id: &str) -> String {
    format!("{}/vr.php?p={}", PROXY, post_id)
}

pub fn thread_scan_url(thread_id: &str) -> String {
    format!("{}/vr.php?t={}", PROXY, thread_id)
}

/// Serve an imagetwist page whose image is `file_url`
pub fn serve_imagetwist_page(transport: &FakeTransport, page_url: &str, file_url: &str, name: &str) {
    transport.add_page(
        page_url,
        &format!(r#"<html><body><img class="img" src="{}" alt="{}"></body></html>"#, file_url, name),
    );
}

/// Engine over a fake transport, in-memory store and temp directories
pub struct Harness {
    pub engine: Arc<RipperEngine>,
    pub transport: Arc<FakeTransport>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut Settings)) -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY, configure)
    }

    /// Engine whose event bus gives each subscriber `capacity` slots
    pub fn with_capacity(capacity: usize, configure: impl FnOnce(&mut Settings)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let settings = test_settings(dir.path(), configure);
        let bus = EventBus::with_capacity(capacity);
        let settings = Arc::new(SettingsManager::in_memory(settings, bus.clone()));
        let transport = Arc::new(FakeTransport::new());
        let engine = RipperEngine::new(
            settings,
            Arc::new(MemoryStore::new()),
            transport.clone(),
            default_registry(),
            bus,
        );
        Self {
            engine: Arc::new(engine),
            transport,
            dir,
        }
    }

    pub fn downloads(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }

    pub fn temp(&self) -> std::path::PathBuf {
        self.dir.path().join("tmp")
    }

    /// Serve a post of `count` images hosted on imagetwist; returns the page URLs
    pub fn serve_post(&self, post_id: &str, count: usize) -> Vec<String> {
        let pages: Vec<String> = (1..=count)
            .map(|i| format!("https://imagetwist.com/{}_{}", post_id, i))
            .collect();
        for (i, page) in pages.iter().enumerate() {
            let file = format!("https://i.imagetwist.com/{}/{}.jpg", post_id, i + 1);
            serve_imagetwist_page(&self.transport, page, &file, &format!("photo{}", i + 1));
            self.transport.add_file(&file, b"0123456789abcdef", "image/jpeg");
        }
        self.transport.add_page(
            &post_scan_url(post_id),
            &post_xml("1", post_id, &format!("Gallery {}", post_id), &pages),
        );
        pages
    }

    pub fn post_link(&self, post_id: &str) -> String {
        format!("{}/threads/1/?p={}", PROXY, post_id)
    }

    /// Poll until `check` holds or fail after a generous timeout
    pub async fn wait_for(&self, what: &str, check: impl Fn(&RipperEngine) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !check(&self.engine) {
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub fn test_settings(root: &Path, configure: impl FnOnce(&mut Settings)) -> Settings {
    let mut settings = Settings::default();
    settings.upstream.proxy = PROXY.to_string();
    settings.download.download_directory = root.join("downloads").to_string_lossy().to_string();
    settings.download.temp_directory = root.join("tmp").to_string_lossy().to_string();
    settings.download.auto_start = true;
    settings.upstream.fetch_metadata = false;
    settings.connection.max_concurrent = 2;
    settings.connection.max_attempts = 2;
    settings.connection.retry_base_delay_ms = 1;
    settings.connection.retry_max_delay_ms = 2;
    settings.connection.progress_interval_ms = 0;
    settings.logging.log_directory = root.join("logs").to_string_lossy().to_string();
    settings.storage.database_file = String::new();
    configure(&mut settings);
    settings
}
