//! Site resolvers: map an image's source page to a direct file URL
//!
//! Each supported image host is one `SiteResolver` variant. Variants are
//! held in a `HostRegistry` keyed by their domain string; dispatch picks
//! the first registered variant whose `matches` predicate accepts the URL.
//! Adding a host means registering another variant.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::ripper::error::{RipperError, RipperResult};
use crate::ripper::models::Image;
use crate::ripper::transport::Transport;

pub mod acidimg;
pub mod imagebam;
pub mod imx;
pub mod selector;

pub use acidimg::AcidimgHost;
pub use imagebam::ImagebamHost;
pub use imx::ImxHost;

/// Display name and direct asset URL of a resolved image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameUrl {
    pub name: String,
    pub url: String,
}

/// Collaborators a resolver may use while fetching host pages
pub struct ResolveContext<'a> {
    pub transport: &'a dyn Transport,
}

impl ResolveContext<'_> {
    pub async fn fetch_page(&self, url: &str) -> RipperResult<String> {
        self.transport.get_text(url, &[]).await
    }

    /// GET a host page with extra request headers
    pub async fn fetch_page_with(&self, url: &str, headers: &[(String, String)]) -> RipperResult<String> {
        self.transport.get_text(url, headers).await
    }

    pub async fn submit_form(&self, url: &str, form: &[(String, String)]) -> RipperResult<String> {
        self.transport.post_form(url, form, &[]).await
    }
}

/// One supported image host
#[async_trait]
pub trait SiteResolver: Send + Sync {
    /// Domain string identifying this variant
    fn host(&self) -> &str;

    fn matches(&self, url: &str) -> bool {
        url.contains(self.host())
    }

    /// Fetch the image's page and extract its name and direct URL
    async fn resolve(&self, image: &Image, ctx: &ResolveContext<'_>) -> RipperResult<NameUrl>;
}

impl fmt::Debug for dyn SiteResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SiteResolver({})", self.host())
    }
}

/// Ordered set of resolver variants, unique by domain
#[derive(Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<Arc<dyn SiteResolver>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variant; returns false if one with the same domain already exists
    pub fn register(&mut self, resolver: Arc<dyn SiteResolver>) -> bool {
        if self.hosts.iter().any(|h| h.host() == resolver.host()) {
            debug!(host = resolver.host(), "Host already registered");
            return false;
        }
        self.hosts.push(resolver);
        true
    }

    /// First variant whose predicate accepts `url`
    pub fn find(&self, url: &str) -> Option<Arc<dyn SiteResolver>> {
        self.hosts.iter().find(|h| h.matches(url)).cloned()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.host().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Dispatch `image` to its matching variant
    pub async fn resolve(&self, image: &Image, ctx: &ResolveContext<'_>) -> RipperResult<NameUrl> {
        let resolver = self
            .find(&image.url)
            .ok_or_else(|| RipperError::UnsupportedHost(image.url.clone()))?;
        debug!(host = resolver.host(), url = %image.url, "Resolving image");
        resolver.resolve(image, ctx).await
    }
}

/// Registry with every built-in host
pub fn default_registry() -> HostRegistry {
    let mut registry = HostRegistry::new();
    registry.register(Arc::new(AcidimgHost));
    registry.register(Arc::new(ImagebamHost));
    registry.register(Arc::new(ImxHost));
    for host in selector::builtin_hosts() {
        registry.register(Arc::new(host));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_dispatches_by_domain() {
        let registry = default_registry();
        assert_eq!(
            registry.find("https://imagetwist.com/abc123/photo.jpg").map(|h| h.host().to_string()),
            Some("imagetwist.com".to_string())
        );
        assert_eq!(
            registry.find("https://www.imagebam.com/view/ME1").map(|h| h.host().to_string()),
            Some("imagebam.com".to_string())
        );
        assert!(registry.find("https://unknown-host.example/x").is_none());
    }

    #[test]
    fn test_registration_is_idempotent_by_domain() {
        let mut registry = default_registry();
        let before = registry.len();
        assert!(!registry.register(Arc::new(ImxHost)));
        assert_eq!(registry.len(), before);
    }

    #[tokio::test]
    async fn test_resolve_without_match_is_unsupported_host() {
        let registry = HostRegistry::new();
        let transport = crate::ripper::tests::FakeTransport::new();
        let ctx = ResolveContext { transport: &transport };
        let image = crate::ripper::tests::image("1", "https://nowhere.example/x", 1);

        let err = registry.resolve(&image, &ctx).await.unwrap_err();
        assert!(matches!(err, RipperError::UnsupportedHost(_)));
    }
}
