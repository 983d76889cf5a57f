//! Web page and oEmbed fetchers used for website and YouTube attachments.

use anyhow::{anyhow, Result};
use html2text::from_read;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::{LazyLock, OnceLock};

pub(crate) static SHARED_HTTP: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .user_agent("Mozilla/5.0 (compatible; Corral/0.1)")
        .pool_max_idle_per_host(2)
        .build()
        .expect("failed to build HTTP client")
});

const NOEMBED_ENDPOINT: &str = "https://noembed.com/embed";

/// A fetched page flattened to readable text
#[derive(Debug, Clone)]
pub struct WebPage {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
}

impl WebPage {
    /// Attachment body: source URL on the first line, then a title heading
    /// and the page text.
    pub fn to_markdown(&self) -> String {
        let title = self.title.as_deref().unwrap_or(&self.url);
        format!("{}\n\n# {}\n\n{}", self.url, title, self.text)
    }

    /// File name stem for the cached copy of this page.
    pub fn file_stem(&self) -> String {
        let raw = self.title.as_deref().unwrap_or("website");
        let stem: String = raw
            .chars()
            .map(|c| if c.is_alphanumeric() || c == ' ' || c == '-' { c } else { '_' })
            .collect();
        let stem = stem.trim();
        if stem.is_empty() {
            "website".to_string()
        } else {
            stem.chars().take(80).collect()
        }
    }
}

/// oEmbed metadata as returned by noembed
#[derive(Debug, Clone, Deserialize)]
pub struct OEmbed {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// GET for a page, without a per-request timeout.
fn page_request(url: &str) -> reqwest::RequestBuilder {
    SHARED_HTTP.get(url)
}

/// Fetch `url` and convert its HTML to wrapped plain text.
pub async fn fetch_page(url: &str) -> Result<WebPage> {
    let response = page_request(url).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("page fetch failed with {}", response.status()));
    }
    let html = response.text().await?;
    let page = page_from_html(url, &html);
    if page.text.is_empty() {
        return Err(anyhow!("page did not return readable content"));
    }
    Ok(page)
}

pub(crate) fn page_from_html(url: &str, html: &str) -> WebPage {
    WebPage {
        url: url.to_string(),
        title: extract_title(html),
        text: from_read(html.as_bytes(), 80).trim().to_string(),
    }
}

/// Look up oEmbed metadata for a video or page URL.
pub async fn fetch_oembed(url: &str) -> Result<OEmbed> {
    let endpoint = format!("{}?url={}", NOEMBED_ENDPOINT, urlencoding::encode(url));
    let response = SHARED_HTTP.get(endpoint).send().await?;
    if !response.status().is_success() {
        return Err(anyhow!("oEmbed lookup failed with {}", response.status()));
    }
    let data: OEmbed = response.json().await?;
    if let Some(err) = &data.error {
        return Err(anyhow!("oEmbed lookup failed: {}", err));
    }
    Ok(data)
}

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"))
}

/// Extract <title> from HTML
pub fn extract_title(html: &str) -> Option<String> {
    title_regex()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| html_decode(m.as_str().trim()))
        .filter(|t| !t.is_empty())
}

/// Simple HTML entity decoding
pub fn html_decode(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title() {
        let html = "<html><head><title>\n  Fish &amp; Chips </title></head></html>";
        assert_eq!(extract_title(html), Some("Fish & Chips".to_string()));
        assert_eq!(extract_title("<p>no title</p>"), None);
    }

    #[test]
    fn test_html_decode() {
        assert_eq!(html_decode("Hello &amp; World"), "Hello & World");
        assert_eq!(html_decode("&lt;tag&gt;"), "<tag>");
        assert_eq!(html_decode("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_page_markdown_layout() {
        let page = page_from_html(
            "https://example.com/a",
            "<html><head><title>Example</title></head><body><p>Hello there</p></body></html>",
        );
        let md = page.to_markdown();
        assert!(md.starts_with("https://example.com/a\n\n# Example\n\n"));
        assert!(md.contains("Hello there"));
    }

    #[test]
    fn test_page_request_has_no_timeout() {
        let request = page_request("https://example.com/a").build().unwrap();
        assert_eq!(request.timeout(), None);
    }

    #[test]
    fn test_file_stem_is_filesystem_safe() {
        let page = WebPage {
            url: "https://example.com".into(),
            title: Some("A/B: notes?".into()),
            text: String::new(),
        };
        assert_eq!(page.file_stem(), "A_B_ notes_");

        let untitled = WebPage {
            url: "https://example.com".into(),
            title: None,
            text: String::new(),
        };
        assert_eq!(untitled.file_stem(), "website");
    }
}
