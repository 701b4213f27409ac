//! Hosts whose image page exposes the asset through a single element

use async_trait::async_trait;
use tracing::debug;

use super::{NameUrl, ResolveContext, SiteResolver};
use crate::ripper::document::{default_image_name, require_first, select_first};
use crate::ripper::error::RipperResult;
use crate::ripper::models::Image;

/// Where the display name of an image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    /// An attribute of the image element itself
    Attr(&'static str),
    /// Text of another element on the page
    Text(&'static str),
    /// Last segment of the asset URL
    UrlSegment,
}

/// How to turn the image link into the page that is actually fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRewrite {
    None,
    ForceHttps,
    AppendQuery(&'static str),
}

impl PageRewrite {
    fn apply(&self, url: &str) -> String {
        match self {
            PageRewrite::None => url.to_string(),
            PageRewrite::ForceHttps => url.replacen("http://", "https://", 1),
            PageRewrite::AppendQuery(query) => {
                let separator = if url.contains('?') { '&' } else { '?' };
                format!("{}{}{}", url, separator, query)
            }
        }
    }
}

/// Table-driven resolver: fetch the page, select the image node, read `src`
#[derive(Debug, Clone)]
pub struct SelectorHost {
    host: &'static str,
    image_selector: &'static str,
    name_source: NameSource,
    rewrite: PageRewrite,
}

impl SelectorHost {
    pub const fn new(host: &'static str, image_selector: &'static str, name_source: NameSource) -> Self {
        Self {
            host,
            image_selector,
            name_source,
            rewrite: PageRewrite::None,
        }
    }

    pub fn with_rewrite(mut self, rewrite: PageRewrite) -> Self {
        self.rewrite = rewrite;
        self
    }

    /// Extract name and URL from an already fetched page
    pub fn extract(&self, html: &str, page_url: &str) -> RipperResult<NameUrl> {
        let node = require_first(html, self.image_selector, page_url)?;
        let url = node.require_attr("src", page_url)?.to_string();

        let name = match self.name_source {
            NameSource::Attr(attr) => node.attr(attr).map(str::to_string),
            NameSource::Text(selector) => select_first(html, selector)?
                .and_then(|n| n.non_empty_text().map(str::to_string)),
            NameSource::UrlSegment => None,
        }
        .unwrap_or_else(|| default_image_name(&url));

        Ok(NameUrl { name, url })
    }
}

#[async_trait]
impl SiteResolver for SelectorHost {
    fn host(&self) -> &str {
        self.host
    }

    async fn resolve(&self, image: &Image, ctx: &ResolveContext<'_>) -> RipperResult<NameUrl> {
        let page_url = self.rewrite.apply(&image.url);
        debug!(host = self.host, selector = self.image_selector, "Looking up image node in {}", page_url);
        let html = ctx.fetch_page(&page_url).await?;
        self.extract(&html, &page_url)
    }
}

/// Built-in single-element hosts
pub fn builtin_hosts() -> Vec<SelectorHost> {
    vec![
        SelectorHost::new("imagetwist.com", "img.img", NameSource::Attr("alt")),
        SelectorHost::new("imgbox.com", "img#img", NameSource::Attr("title")),
        SelectorHost::new("pixhost.to", "img#image", NameSource::Attr("alt")),
        SelectorHost::new("dpic.me", "img#pic", NameSource::Attr("alt"))
            .with_rewrite(PageRewrite::ForceHttps),
        SelectorHost::new("turboimagehost.com", "img#imageid", NameSource::Text("div.titleFullS h1")),
        SelectorHost::new("pimpandhost.com", "img.original", NameSource::Attr("alt"))
            .with_rewrite(PageRewrite::AppendQuery("size=original")),
        SelectorHost::new("imagevenue.com", "a[data-toggle=\"full\"] img", NameSource::Attr("alt")),
    ]
}
