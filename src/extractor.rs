use crate::config::{RescrapeConfig, ScrapingConfig};
use crate::fetch::{FetchedPage, PageFetcher};
use crate::pdf::{self, PdfText};
use crate::scraper::{self, ContentScraper, ScrapedPage};
use crate::types::{Extraction, UrlType};
use crate::{FetchError, RescrapeError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use url::Url;

static ARXIV_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"arxiv\.org/(?:abs|pdf)/([0-9]{4}\.[0-9]{4,5}(?:v[0-9]+)?)").expect("valid arXiv id pattern")
});

/// Turns a URL into normalized text. The batch driver depends on this seam only.
#[async_trait]
pub trait Extract: Send + Sync {
    async fn extract(&self, url: &str, declared_type: Option<UrlType>) -> Result<Extraction, FetchError>;
}

/// Picks the handler for a URL. Domain rules win over the declared type, which wins over the path suffix.
pub fn detect_type(url: &str, declared_type: Option<UrlType>) -> UrlType {
    let parsed = Url::parse(url).ok();
    let host = parsed
        .as_ref()
        .and_then(|u| u.host_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if host_matches(&host, "arxiv.org") {
        UrlType::Arxiv
    } else if host_matches(&host, "researchgate.net") {
        UrlType::ResearchGate
    } else if let Some(declared) = declared_type {
        declared
    } else if parsed.is_some_and(|u| u.path().to_ascii_lowercase().ends_with(".pdf")) {
        UrlType::Pdf
    } else {
        UrlType::Html
    }
}

/// `domain` itself or any subdomain of it.
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).is_some_and(|rest| rest.ends_with('.'))
}

/// Parses the paper id (with optional version) from an arXiv abstract or PDF URL.
pub fn arxiv_id(url: &str) -> Option<String> {
    ARXIV_ID
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// The `ContentExtractor` struct fetches a URL and produces normalized plain text,
/// dispatching on the detected content type.
pub struct ContentExtractor {
    fetcher: PageFetcher,
    scraper: ContentScraper,
    config: ScrapingConfig,
    max_content_chars: usize,
}

impl ContentExtractor {
    pub fn new(config: &RescrapeConfig) -> Result<Self, RescrapeError> {
        let fetcher = PageFetcher::new(&config.scraping, config.processing.fetch_timeout())?;
        let scraper = ContentScraper::default().with_min_content_length(config.processing.min_content_length);

        Ok(Self {
            fetcher,
            scraper,
            config: config.scraping.clone(),
            max_content_chars: config.processing.max_content_chars,
        })
    }

    /// Rejects URLs that must never be fetched.
    fn check_url(&self, url: &str) -> Result<(), FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::UnsupportedType(format!("invalid URL: {}", e)))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::UnsupportedType(format!("scheme '{}'", parsed.scheme())));
        }

        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
        if let Some(domain) = self.config.skip_domains.iter().find(|d| host_matches(&host, d)) {
            info!(%domain, "Skipping domain");
            return Err(FetchError::UnsupportedType(format!("skipped domain {}", domain)));
        }

        Ok(())
    }

    /// Abstract page on each mirror, then the PDF as last resort.
    async fn extract_arxiv(&self, url: &str) -> Result<Extraction, FetchError> {
        let Some(id) = arxiv_id(url) else {
            warn!("[ARXIV] Could not extract paper ID, using generic extraction");
            return self.extract_page(url, UrlType::Html).await;
        };

        let mut last_error = None;
        let mut fetched_bytes = 0;

        for mirror in &self.config.arxiv_mirrors {
            let abs_url = format!("{}/abs/{}", mirror.trim_end_matches('/'), id);
            match self.fetcher.fetch(&abs_url).await {
                Ok(page) => {
                    fetched_bytes = page.body.len();
                    if let Some(scraped) = scraper::extract_arxiv(&page.text()) {
                        info!(strategy = %abs_url, "[ARXIV] Extracted abstract page");
                        return Ok(self.finish(url, scraped, UrlType::Arxiv, fetched_bytes));
                    }
                    debug!(strategy = %abs_url, "[ARXIV] No title/abstract markup");
                }
                Err(e) => {
                    debug!(strategy = %abs_url, error = %e, "[ARXIV] Strategy failed");
                    last_error = Some(e);
                }
            }
        }

        if let Some(mirror) = self.config.arxiv_mirrors.first() {
            let pdf_url = format!("{}/pdf/{}", mirror.trim_end_matches('/'), id);
            match self.fetcher.fetch(&pdf_url).await {
                Ok(page) if page.is_pdf() => {
                    return Ok(self.extract_pdf(url, page, UrlType::Arxiv).await);
                }
                Ok(page) => fetched_bytes = page.body.len(),
                Err(FetchError::BodyTooLarge { limit, pdf: true }) => {
                    return Ok(oversized_pdf(url, UrlType::Arxiv, limit));
                }
                Err(e) => {
                    debug!(strategy = %pdf_url, error = %e, "[ARXIV] Strategy failed");
                    last_error = Some(e);
                }
            }
        }

        warn!("[ARXIV] All strategies failed");
        match last_error {
            Some(e) if fetched_bytes == 0 => Err(e),
            _ => Ok(Extraction::new(url, String::new(), UrlType::Arxiv, fetched_bytes)),
        }
    }

    async fn extract_page(&self, url: &str, detected: UrlType) -> Result<Extraction, FetchError> {
        let page = match self.fetcher.fetch(url).await {
            Err(FetchError::BodyTooLarge { limit, pdf: true }) => return Ok(oversized_pdf(url, UrlType::Pdf, limit)),
            other => other?,
        };

        if page.is_pdf() {
            return Ok(self.extract_pdf(url, page, UrlType::Pdf).await);
        }

        let raw_length = page.body.len();
        let html = page.text();
        let scraped = match detected {
            UrlType::ResearchGate => self.scraper.extract_researchgate(&html),
            _ => self.scraper.extract(&html),
        };

        // A URL declared as PDF that served HTML is reported as what it is.
        let detected = if detected == UrlType::Pdf { UrlType::Html } else { detected };
        Ok(self.finish(url, scraped, detected, raw_length))
    }

    async fn extract_pdf(&self, url: &str, page: FetchedPage, detected: UrlType) -> Extraction {
        let raw_length = page.body.len();
        match pdf::extract_text(page.body, self.config.max_pdf_bytes).await {
            PdfText::Text(text) => Extraction::new(url, self.truncate(text), detected, raw_length),
            PdfText::Unavailable(reason) => Extraction::soft(url, detected, raw_length, reason),
        }
    }

    fn finish(&self, url: &str, scraped: ScrapedPage, detected: UrlType, raw_length: usize) -> Extraction {
        let mut extraction = scraped.into_extraction(url, detected, raw_length);
        extraction.text = self.truncate(std::mem::take(&mut extraction.text));
        extraction
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.max_content_chars {
            text
        } else {
            text.chars().take(self.max_content_chars).collect()
        }
    }
}

/// A PDF over the ceiling was fetched fine but cannot be read; that is a soft failure.
fn oversized_pdf(url: &str, detected: UrlType, limit: usize) -> Extraction {
    Extraction::soft(url, detected, 0, format!("PDF too large (limit {} bytes)", limit))
}

#[async_trait]
impl Extract for ContentExtractor {
    #[instrument(skip(self))]
    async fn extract(&self, url: &str, declared_type: Option<UrlType>) -> Result<Extraction, FetchError> {
        self.check_url(url)?;

        let detected = detect_type(url, declared_type);
        debug!(?detected, "Dispatching extractor");

        let extraction = match detected {
            UrlType::Arxiv => self.extract_arxiv(url).await?,
            other => self.extract_page(url, other).await?,
        };

        info!(
            chars = extraction.text.chars().count(),
            detected = %extraction.detected_type,
            "Extracted"
        );
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor_for(mirror: &str) -> ContentExtractor {
        let mut config = RescrapeConfig::default();
        config.scraping.arxiv_mirrors = vec![mirror.to_string()];
        config.processing.fetch_timeout_seconds = 5;
        ContentExtractor::new(&config).unwrap()
    }

    #[test]
    fn test_detect_type() {
        assert_eq!(detect_type("https://arxiv.org/abs/2401.12345", None), UrlType::Arxiv);
        assert_eq!(detect_type("https://www.researchgate.net/publication/1", None), UrlType::ResearchGate);
        assert_eq!(detect_type("https://example.com/paper.PDF?dl=1", None), UrlType::Pdf);
        assert_eq!(detect_type("https://example.com/post", None), UrlType::Html);
        assert_eq!(detect_type("https://example.com/download", Some(UrlType::Pdf)), UrlType::Pdf);
        assert_eq!(detect_type("https://arxiv.org/pdf/2401.12345", Some(UrlType::Pdf)), UrlType::Arxiv);
        assert_eq!(detect_type("https://export.arxiv.org/abs/2401.12345", None), UrlType::Arxiv);
    }

    #[test]
    fn test_detect_type_uses_host_only() {
        assert_eq!(detect_type("https://blog.example.com/post?ref=arxiv.org", None), UrlType::Html);
        assert_eq!(detect_type("https://example.com/researchgate.net/paper", None), UrlType::Html);
        assert_eq!(detect_type("https://notarxiv.org/abs/2401.12345", None), UrlType::Html);
        assert_eq!(detect_type("https://example.com/report.pdf#page=2", None), UrlType::Pdf);
    }

    #[test]
    fn test_arxiv_id() {
        assert_eq!(arxiv_id("https://arxiv.org/abs/2401.12345").as_deref(), Some("2401.12345"));
        assert_eq!(arxiv_id("https://arxiv.org/pdf/2506.09954v2").as_deref(), Some("2506.09954v2"));
        assert_eq!(arxiv_id("https://arxiv.org/list/cs.AI/recent"), None);
    }

    #[tokio::test]
    async fn test_skip_domain_and_scheme_are_rejected_without_fetch() {
        let extractor = extractor_for("http://127.0.0.1:1");

        let skipped = extractor.extract("https://go.gale.com/ps/i.do?id=1", None).await.unwrap_err();
        assert!(matches!(skipped, FetchError::UnsupportedType(ref r) if r.contains("go.gale.com")));

        let ftp = extractor.extract("ftp://example.com/file", None).await.unwrap_err();
        assert!(matches!(ftp, FetchError::UnsupportedType(_)));
        assert!(!ftp.is_retryable());
    }

    #[tokio::test]
    async fn test_arxiv_uses_abstract_markup() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/abs/2401.12345")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(
                r#"<html><body><h1 class="title"><span class="descriptor">Title:</span>A Paper</h1>
                <blockquote class="abstract"><span class="descriptor">Abstract:</span>We did things.</blockquote>
                </body></html>"#,
            )
            .create_async()
            .await;

        let extraction = extractor_for(&server.url())
            .extract("https://arxiv.org/abs/2401.12345", None)
            .await
            .unwrap();

        assert_eq!(extraction.detected_type, UrlType::Arxiv);
        assert_eq!(extraction.text, "Title: A Paper\n\nAbstract: We did things.");
        assert!(extraction.soft_failure.is_none());
    }

    #[tokio::test]
    async fn test_arxiv_falls_through_to_error_when_every_strategy_fails() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/abs/2401.00001").with_status(503).create_async().await;
        server.mock("GET", "/pdf/2401.00001").with_status(503).create_async().await;

        let err = extractor_for(&server.url())
            .extract("https://arxiv.org/abs/2401.00001", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Http { status: Some(503), .. }));
    }

    #[tokio::test]
    async fn test_unreadable_pdf_is_a_soft_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/scan.pdf")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body("%PDF-1.4\nnot a real document")
            .create_async()
            .await;

        let url = format!("{}/scan.pdf", server.url());
        let extraction = extractor_for(&server.url()).extract(&url, None).await.unwrap();

        assert_eq!(extraction.detected_type, UrlType::Pdf);
        assert!(extraction.text.is_empty());
        assert!(extraction.soft_failure.is_some());
    }

    #[tokio::test]
    async fn test_oversized_pdf_is_a_soft_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/huge.pdf")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body(b"%PDF-1.4\n".repeat(200))
            .create_async()
            .await;
        server
            .mock("GET", "/huge.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<p>padding</p>".repeat(200))
            .create_async()
            .await;

        let mut config = RescrapeConfig::default();
        config.scraping.max_pdf_bytes = 512;
        config.scraping.max_body_bytes = 512;
        let extractor = ContentExtractor::new(&config).unwrap();

        let pdf = extractor.extract(&format!("{}/huge.pdf", server.url()), None).await.unwrap();
        assert_eq!(pdf.detected_type, UrlType::Pdf);
        assert!(pdf.soft_failure.unwrap().contains("too large"));

        let html = extractor.extract(&format!("{}/huge.html", server.url()), None).await.unwrap_err();
        assert_eq!(html, FetchError::BodyTooLarge { limit: 512, pdf: false });
    }

    #[tokio::test]
    async fn test_generic_html() {
        let mut server = mockito::Server::new_async().await;
        let paragraph = "Rust ownership rules keep memory safe without a garbage collector. ".repeat(3);
        server
            .mock("GET", "/post")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(format!(
                "<html><head><title>Ownership</title></head><body><article><p>{paragraph}</p></article></body></html>"
            ))
            .create_async()
            .await;

        let url = format!("{}/post", server.url());
        let extraction = extractor_for(&server.url()).extract(&url, None).await.unwrap();

        assert_eq!(extraction.detected_type, UrlType::Html);
        assert!(extraction.text.starts_with("Title: Ownership\n\nContent: Rust ownership"));
        assert_eq!(extraction.metadata.get("title").unwrap(), "Ownership");
    }
}
