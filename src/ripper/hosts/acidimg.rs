//! acidimg.cc: the image only appears after submitting the continue form

use async_trait::async_trait;
use tracing::debug;

use super::{NameUrl, ResolveContext, SiteResolver};
use crate::ripper::document::{default_image_name, require_first};
use crate::ripper::error::RipperResult;
use crate::ripper::models::Image;

const IMG_SELECTOR: &str = "img.centred";

#[derive(Debug, Clone, Copy, Default)]
pub struct AcidimgHost;

impl AcidimgHost {
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
impl SiteResolver for AcidimgHost {
    fn host(&self) -> &str {
        "acidimg.cc"
    }

    async fn resolve(&self, image: &Image, ctx: &ResolveContext<'_>) -> RipperResult<NameUrl> {
        debug!(url = %image.url, "Submitting continue form");
        let form = vec![("imgContinue".to_string(), "Continue to image ... ".to_string())];
        let html = ctx.submit_form(&image.url, &form).await?;
        Self::extract(&html, &image.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::tests::{image, FakeTransport};

    #[tokio::test]
    async fn test_resolves_after_continue_form() {
        let transport = FakeTransport::new();
        transport.add_form_response(
            "https://acidimg.cc/img-1.html",
            r#"<img class="centred" src="https://acidimg.cc/big/1.jpg" alt="Dune">"#,
        );
        let ctx = ResolveContext { transport: &transport };

        let resolved = AcidimgHost
            .resolve(&image("1", "https://acidimg.cc/img-1.html", 1), &ctx)
            .await
            .unwrap();
        assert_eq!(resolved.name, "Dune");
        assert_eq!(resolved.url, "https://acidimg.cc/big/1.jpg");
        assert_eq!(transport.form_posts("https://acidimg.cc/img-1.html"), 1);
    }
}
