//! imx.to: the full-size URL is derived from the thumbnail, no page fetch

use async_trait::async_trait;

use super::{NameUrl, ResolveContext, SiteResolver};
use crate::ripper::document::default_image_name;
use crate::ripper::error::{RipperError, RipperResult};
use crate::ripper::models::Image;

const THUMB_SEGMENT: &str = "/u/t/";
const FULL_SEGMENT: &str = "/u/i/";

#[derive(Debug, Clone, Copy, Default)]
pub struct ImxHost;

impl ImxHost {
    fn full_size_url(thumb_url: &str) -> RipperResult<String> {
        if !thumb_url.contains(THUMB_SEGMENT) {
            return Err(RipperError::Extraction(format!(
                "thumbnail '{}' has no recognisable path",
                thumb_url
            )));
        }
        Ok(thumb_url.replacen(THUMB_SEGMENT, FULL_SEGMENT, 1))
    }
}

#[async_trait]
impl SiteResolver for ImxHost {
    fn host(&self) -> &str {
        "imx.to"
    }

    async fn resolve(&self, image: &Image, _ctx: &ResolveContext<'_>) -> RipperResult<NameUrl> {
        let url = Self::full_size_url(&image.thumb_url)?;
        Ok(NameUrl {
            name: default_image_name(&url),
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_size_derived_from_thumbnail() {
        assert_eq!(
            ImxHost::full_size_url("https://image.imx.to/u/t/2024/05/01/abc.jpg").unwrap(),
            "https://image.imx.to/u/i/2024/05/01/abc.jpg"
        );
        assert!(ImxHost::full_size_url("https://imx.to/other/abc.jpg").is_err());
    }
}
