//! imagebam.com: an interstitial page must be acknowledged with a cookie

use async_trait::async_trait;
use tracing::debug;

use super::{NameUrl, ResolveContext, SiteResolver};
use crate::ripper::document::{default_image_name, require_first, select_first};
use crate::ripper::error::RipperResult;
use crate::ripper::models::Image;

const IMG_SELECTOR: &str = "img.main-image";
const CONTINUE_SELECTOR: &str = "#continue a";
const INTERSTITIAL_COOKIE: &str = "nsfw_inter=1";

#[derive(Debug, Clone, Copy, Default)]
pub struct ImagebamHost;

impl ImagebamHost {
    fn extract(html: &str, page_url: &str) -> RipperResult<NameUrl> {
        let node = require_first(html, IMG_SELECTOR, page_url)?;
        let url = node.require_attr("src", page_url)?.to_string();
        let name = node
            .attr("alt")
            .map(str::to_string)
            .unwrap_or_else(|| default_image_name(&url));
        Ok(NameUrl { name, url })
    }
}

#[async_trait]
impl SiteResolver for ImagebamHost {
    fn host(&self) -> &str {
        "imagebam.com"
    }

    async fn resolve(&self, image: &Image, ctx: &ResolveContext<'_>) -> RipperResult<NameUrl> {
        let mut html = ctx.fetch_page(&image.url).await?;
        if select_first(&html, CONTINUE_SELECTOR)?.is_some() {
            debug!(url = %image.url, "Acknowledging interstitial page");
            let cookie = vec![("Cookie".to_string(), INTERSTITIAL_COOKIE.to_string())];
            html = ctx.fetch_page_with(&image.url, &cookie).await?;
        }
        Self::extract(&html, &image.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::tests::{image, FakeTransport};

    #[tokio::test]
    async fn test_interstitial_is_skipped_with_cookie() {
        let transport = FakeTransport::new();
        let page = "https://www.imagebam.com/view/ME1";
        transport.add_page(page, r##"<div id="continue"><a href="#">Continue to your image</a></div>"##);
        transport.add_page_with_cookie(
            page,
            INTERSTITIAL_COOKIE,
            r#"<img class="main-image" src="https://images.imagebam.com/ab/cd/x.jpg" alt="x.jpg">"#,
        );
        let ctx = ResolveContext { transport: &transport };

        let resolved = ImagebamHost.resolve(&image("1", page, 1), &ctx).await.unwrap();
        assert_eq!(resolved.url, "https://images.imagebam.com/ab/cd/x.jpg");
        assert_eq!(transport.requests(page), 2);
    }
}
