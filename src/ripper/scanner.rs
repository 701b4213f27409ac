//! Gallery scanning
//!
//! Turns a thread or post reference into structured records by requesting
//! the forum's XML gallery description (`vr.php`) and walking its elements
//! in document order:
//!
//! ```xml
//! <tree>
//!   <forum title="..."/> <user hash="..."/> <thread id="..." title="..."/>
//!   <post id="..." number="..." title="...">
//!     <image main_url="..." thumb_url="..."/>
//!   </post>
//! </tree>
//! ```
//!
//! Images whose host has no registered resolver are skipped with a warning.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use roxmltree::{Document, Node};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ripper::config_loader::SettingsManager;
use crate::ripper::document;
use crate::ripper::error::{RipperError, RipperResult};
use crate::ripper::hosts::HostRegistry;
use crate::ripper::models::{Image, ImageStatus, MultiPostItem, Post, PostStatus};
use crate::ripper::retry::RetryPolicy;
use crate::ripper::transport::Transport;

/// Thumbnails kept per post for previews
const MAX_PREVIEWS: usize = 4;

/// Text runs containing any of these words are link captions, not titles
const NOT_A_TITLE: [&str; 5] = ["download", "link", "rapidgator", "filefactory", "filefox"];

/// A parsed single post and its downloadable images
#[derive(Debug, Clone, PartialEq)]
pub struct PostScanResult {
    pub post: Post,
    pub images: Vec<Image>,
}

/// Canonical forum URL of a post
pub fn post_url(proxy: &str, thread_id: &str, post_id: &str) -> String {
    format!(
        "{}/threads/{}/?p={}&viewfull=1#post{}",
        proxy.trim_end_matches('/'),
        thread_id,
        post_id,
        post_id
    )
}

fn attr(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_document(xml: &str) -> RipperResult<Document<'_>> {
    Document::parse(xml).map_err(|e| RipperError::Scan(format!("malformed gallery description: {}", e)))
}

/// Thread-level metadata that precedes the post elements
#[derive(Default)]
struct ThreadMeta {
    forum: String,
    submitter: String,
    title: String,
}

/// Accumulates the images of one `<post>` element
struct PostImages<'r> {
    hosts: &'r HostRegistry,
    post_id: String,
    images: Vec<Image>,
    previews: Vec<String>,
    host_names: BTreeSet<String>,
    declared: u32,
}

impl<'r> PostImages<'r> {
    fn new(hosts: &'r HostRegistry, post_id: &str) -> Self {
        Self {
            hosts,
            post_id: post_id.to_string(),
            images: Vec::new(),
            previews: Vec::new(),
            host_names: BTreeSet::new(),
            declared: 0,
        }
    }

    fn push(&mut self, node: Node<'_, '_>) {
        self.declared += 1;
        let thumb_url = attr(node, "thumb_url").unwrap_or_default();
        if !thumb_url.is_empty() && self.previews.len() < MAX_PREVIEWS && !self.previews.contains(&thumb_url) {
            self.previews.push(thumb_url.clone());
        }

        let Some(main_url) = attr(node, "main_url") else {
            return;
        };
        match self.hosts.find(&main_url) {
            Some(host) => {
                debug!(host = host.host(), url = %main_url, "Found supported host");
                self.host_names.insert(host.host().to_string());
                self.images.push(Image {
                    id: 0,
                    post_id: self.post_id.clone(),
                    url: main_url,
                    thumb_url,
                    host: host.host().to_string(),
                    index: self.declared,
                    current: 0,
                    total: 0,
                    status: ImageStatus::Stopped,
                });
            }
            None => warn!(url = %main_url, "Unsupported host, skipping image"),
        }
    }
}

fn read_thread_meta(meta: &mut ThreadMeta, node: Node<'_, '_>) {
    match node.tag_name().name().to_ascii_lowercase().as_str() {
        "forum" => meta.forum = attr(node, "title").unwrap_or_default(),
        "user" => meta.submitter = attr(node, "hash").or_else(|| attr(node, "name")).unwrap_or_default(),
        "thread" => meta.title = attr(node, "title").unwrap_or_default(),
        _ => {}
    }
}

fn images_of<'r>(post: Node<'_, '_>, hosts: &'r HostRegistry, post_id: &str) -> PostImages<'r> {
    let mut images = PostImages::new(hosts, post_id);
    for child in post.descendants().filter(|n| n.has_tag_name("image")) {
        images.push(child);
    }
    images
}

/// Parse the description of a single post
pub fn parse_post(
    xml: &str,
    thread_id: &str,
    post_id: &str,
    proxy: &str,
    hosts: &HostRegistry,
) -> RipperResult<PostScanResult> {
    let document = parse_document(xml)?;
    let mut meta = ThreadMeta::default();
    let mut parsed: Option<PostScanResult> = None;

    for node in document.descendants().filter(|n| n.is_element()) {
        if node.has_tag_name("post") {
            if parsed.is_some() {
                continue;
            }
            let title = attr(node, "title").unwrap_or_else(|| meta.title.clone());
            let collected = images_of(node, hosts, post_id);
            let post = Post {
                id: 0,
                post_id: post_id.to_string(),
                thread_id: thread_id.to_string(),
                title,
                url: post_url(proxy, thread_id, post_id),
                thread_title: meta.title.clone(),
                forum: meta.forum.clone(),
                submitter: meta.submitter.clone(),
                total: collected.images.len() as u32,
                done: 0,
                status: PostStatus::Stopped,
                download_directory: None,
                thanked: false,
                hosts: collected.host_names.into_iter().collect(),
                previews: collected.previews,
                alt_titles: Vec::new(),
                added_at: Utc::now(),
            };
            parsed = Some(PostScanResult { post, images: collected.images });
        } else {
            read_thread_meta(&mut meta, node);
        }
    }

    match parsed {
        None => Err(RipperError::Scan(format!("no post found for post {}", post_id))),
        Some(result) if result.images.is_empty() => Err(RipperError::Scan(format!(
            "post {} has no images from supported hosts",
            post_id
        ))),
        Some(result) => Ok(result),
    }
}

/// Parse the description of a whole thread into candidate posts
pub fn parse_thread(
    xml: &str,
    thread_id: &str,
    proxy: &str,
    hosts: &HostRegistry,
) -> RipperResult<Vec<MultiPostItem>> {
    let document = parse_document(xml)?;
    let mut meta = ThreadMeta::default();
    let mut items = Vec::new();

    for node in document.descendants().filter(|n| n.is_element()) {
        if node.has_tag_name("post") {
            let Some(post_id) = attr(node, "id") else {
                warn!(thread_id, "Post element without id, skipping");
                continue;
            };
            let number = attr(node, "number")
                .and_then(|n| n.parse().ok())
                .unwrap_or(items.len() as u32 + 1);
            let collected = images_of(node, hosts, &post_id);
            if collected.declared == 0 {
                continue;
            }
            items.push(MultiPostItem {
                thread_id: thread_id.to_string(),
                title: attr(node, "title").unwrap_or_else(|| meta.title.clone()),
                url: post_url(proxy, thread_id, &post_id),
                post_id,
                number,
                image_count: collected.declared,
                previews: collected.previews,
                hosts: collected.host_names.into_iter().collect(),
            });
        } else {
            read_thread_meta(&mut meta, node);
        }
    }

    Ok(items)
}

/// Fetches gallery descriptions through the retry policy
pub struct GalleryScanner {
    transport: Arc<dyn Transport>,
    hosts: Arc<HostRegistry>,
    settings: Arc<SettingsManager>,
    shutdown: CancellationToken,
}

impl GalleryScanner {
    pub fn new(
        transport: Arc<dyn Transport>,
        hosts: Arc<HostRegistry>,
        settings: Arc<SettingsManager>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            hosts,
            settings,
            shutdown,
        }
    }

    async fn fetch_description(&self, query: &str, label: &str) -> RipperResult<String> {
        let settings = self.settings.settings();
        let url = format!("{}/vr.php?{}", settings.upstream.proxy.trim_end_matches('/'), query);
        let policy = RetryPolicy::from_settings(&settings.connection);
        info!("Requesting {}", url);
        policy
            .run(&self.shutdown, label, || self.transport.get_text(&url, &[]))
            .await
    }

    /// Scan one post into a Post and its Images
    pub async fn scan_post(&self, thread_id: &str, post_id: &str) -> RipperResult<PostScanResult> {
        debug!(thread_id, post_id, "Scanning post");
        let xml = self
            .fetch_description(&format!("p={}", post_id), "post scan")
            .await
            .map_err(|e| wrap_scan_error(e, &format!("post {}", post_id)))?;
        let proxy = self.settings.settings().upstream.proxy;
        parse_post(&xml, thread_id, post_id, &proxy, &self.hosts)
    }

    /// Fetch the rendered post and read the alternative titles from its body
    pub async fn fetch_alt_titles(&self, post_id: &str) -> RipperResult<Vec<String>> {
        let settings = self.settings.settings();
        let url = format!("{}/threads/?p={}", settings.upstream.proxy.trim_end_matches('/'), post_id);
        let policy = RetryPolicy::from_settings(&settings.connection);
        debug!("Requesting {}", url);
        let html = policy
            .run(&self.shutdown, "metadata fetch", || self.transport.get_text(&url, &[]))
            .await
            .map_err(|e| wrap_scan_error(e, &format!("post page {}", post_id)))?;
        parse_alt_titles(&html, post_id)
    }

    /// Scan a whole thread into candidate posts
    pub async fn scan_thread(&self, thread_id: &str) -> RipperResult<Vec<MultiPostItem>> {
        debug!(thread_id, "Scanning thread");
        let xml = self
            .fetch_description(&format!("t={}", thread_id), "thread scan")
            .await
            .map_err(|e| wrap_scan_error(e, &format!("thread {}", thread_id)))?;
        let proxy = self.settings.settings().upstream.proxy;
        parse_thread(&xml, thread_id, &proxy, &self.hosts)
    }
}

/// Alternative gallery names written at the top of a post's message body
pub fn parse_alt_titles(html: &str, post_id: &str) -> RipperResult<Vec<String>> {
    let css = format!("div#post_message_{}", post_id);
    let texts = document::leading_texts(html, &css)?
        .ok_or_else(|| RipperError::Scan(format!("no message body found for post {}", post_id)))?;
    let mut titles: Vec<String> = Vec::new();
    for text in texts {
        let lower = text.to_lowercase();
        if NOT_A_TITLE.iter().any(|word| lower.contains(word)) || titles.contains(&text) {
            continue;
        }
        titles.push(text);
    }
    Ok(titles)
}

fn wrap_scan_error(error: RipperError, subject: &str) -> RipperError {
    match error {
        RipperError::Cancelled | RipperError::Scan(_) => error,
        other => RipperError::Scan(format!("failed to fetch {}: {}", subject, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::hosts::default_registry;

    const POST_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
        <tree>
          <forum id="10" title="Pictures"/>
          <user id="2" hash="abc123"/>
          <thread id="77" title="Summer Set"/>
          <post id="900" number="1" title="">
            <image main_url="https://imagetwist.com/a1/one.jpg" thumb_url="https://t.imagetwist.com/1.jpg"/>
            <image main_url="https://unknown.example/two.jpg" thumb_url="https://t.unknown/2.jpg"/>
            <image main_url="https://pixhost.to/show/3" thumb_url="https://t.pixhost.to/3.jpg"/>
          </post>
        </tree>"#;

    #[test]
    fn test_parse_post_skips_unsupported_hosts() {
        let result = parse_post(POST_XML, "77", "900", "https://forum.example", &default_registry()).unwrap();

        assert_eq!(result.post.title, "Summer Set");
        assert_eq!(result.post.forum, "Pictures");
        assert_eq!(result.post.total, 2);
        assert_eq!(result.images.len(), 2);
        assert_eq!(result.images[0].index, 1);
        assert_eq!(result.images[1].index, 3);
        assert_eq!(result.post.hosts, vec!["imagetwist.com".to_string(), "pixhost.to".to_string()]);
        assert_eq!(result.post.previews.len(), 3);
        assert_eq!(
            result.post.url,
            "https://forum.example/threads/77/?p=900&viewfull=1#post900"
        );
        assert!(result.images.iter().all(|i| i.status == ImageStatus::Stopped));
    }

    #[test]
    fn test_post_without_supported_images_is_scan_error() {
        let xml = r#"<tree><thread title="t"/><post id="1"><image main_url="https://nope.example/a" thumb_url="x"/></post></tree>"#;
        let err = parse_post(xml, "1", "1", "https://forum.example", &default_registry()).unwrap_err();
        assert!(matches!(err, RipperError::Scan(_)));
    }

    #[test]
    fn test_missing_post_and_malformed_xml_are_scan_errors() {
        let registry = default_registry();
        assert!(matches!(
            parse_post("<tree><thread title=\"t\"/></tree>", "1", "1", "p", &registry),
            Err(RipperError::Scan(_))
        ));
        assert!(matches!(
            parse_post("<tree><post>", "1", "1", "p", &registry),
            Err(RipperError::Scan(_))
        ));
    }

    #[test]
    fn test_parse_thread_lists_posts() {
        let xml = r#"<tree>
            <thread id="5" title="Big Thread"/>
            <post id="51" number="1" title="First">
              <image main_url="https://imagetwist.com/x" thumb_url="https://t/1"/>
              <image main_url="https://imx.to/i/y" thumb_url="https://t/2"/>
            </post>
            <post id="52" number="2">
              <image main_url="https://pixhost.to/show/z" thumb_url="https://t/3"/>
            </post>
            <post id="53" number="3"/>
          </tree>"#;

        let items = parse_thread(xml, "5", "https://forum.example/", &default_registry()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].post_id, "51");
        assert_eq!(items[0].title, "First");
        assert_eq!(items[0].image_count, 2);
        assert_eq!(items[0].hosts, vec!["imagetwist.com".to_string(), "imx.to".to_string()]);
        assert_eq!(items[1].title, "Big Thread");
        assert_eq!(items[1].number, 2);
        assert_eq!(items[1].url, "https://forum.example/threads/5/?p=52&viewfull=1#post52");
    }

    #[test]
    fn test_alt_titles_skip_link_captions_and_repeats() {
        let html = r#"<html><body>
            <div id="post_message_900">
              <b>Beach Day</b><br>
              Sunset Shoot<br>
              Download links below<br>
              Beach Day<br>
              <a href="https://imagetwist.com/a1">one</a>
              Not a title
            </div>
          </body></html>"#;
        let titles = parse_alt_titles(html, "900").unwrap();
        assert_eq!(titles, vec!["Beach Day".to_string(), "Sunset Shoot".to_string()]);

        assert!(matches!(parse_alt_titles(html, "901"), Err(RipperError::Scan(_))));
    }
}
