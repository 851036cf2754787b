use crate::config::ScrapingConfig;
use crate::{FetchError, RescrapeError};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{redirect, Client};
use std::time::Duration;
use tracing::{debug, instrument, warn};

static META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i-u)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9_.:-]+)"#).expect("valid charset pattern")
});

/// How far into an HTML document a `<meta charset>` declaration is looked for.
const CHARSET_SNIFF_BYTES: usize = 2048;

/// A fetched HTTP body, before any extraction.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects.
    pub final_url: String,
    /// The `Content-Type` header, lowercased, without parameters.
    pub content_type: Option<String>,
    /// The `charset` parameter of `Content-Type`, if any.
    pub charset: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedPage {
    pub fn is_pdf(&self) -> bool {
        self.content_type.as_deref() == Some("application/pdf") || self.body.starts_with(b"%PDF")
    }

    /// Decodes the body using the header charset, then a `<meta charset>` declaration,
    /// then UTF-8. Undeclared bodies that are not valid UTF-8 are read as Windows-1252.
    pub fn text(&self) -> String {
        let declared = self
            .charset
            .clone()
            .or_else(|| sniff_meta_charset(&self.body))
            .and_then(|label| Encoding::for_label(label.trim().as_bytes()));

        match declared {
            Some(encoding) => encoding.decode(&self.body).0.into_owned(),
            None => {
                let (text, malformed) = UTF_8.decode_with_bom_removal(&self.body);
                if malformed {
                    WINDOWS_1252.decode(&self.body).0.into_owned()
                } else {
                    text.into_owned()
                }
            }
        }
    }
}

/// The `PageFetcher` struct performs the HTTP side of extraction.
/// It only fetches; retries and pacing belong to the batch driver.
pub struct PageFetcher {
    /// The HTTP client used for making requests.
    client: Client,
    /// Body ceiling for HTML and other text.
    max_body_bytes: usize,
    /// Body ceiling for anything that may be a PDF.
    max_pdf_bytes: usize,
}

impl PageFetcher {
    /// Creates a new `PageFetcher` with the given scraping settings and per-request timeout.
    pub fn new(config: &ScrapingConfig, timeout: Duration) -> Result<Self, RescrapeError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(timeout)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .gzip(true)
            .build()
            .map_err(RescrapeError::ClientError)?;

        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
            max_pdf_bytes: config.max_pdf_bytes,
        })
    }

    /// Fetches a single URL.
    ///
    /// Non-success statuses become `FetchError::Http`; media types that can carry
    /// no article text become `FetchError::UnsupportedType`. Bodies over the size
    /// ceiling become `FetchError::BodyTooLarge`, rejected on `Content-Length` when the
    /// server sends one and otherwise as soon as the streamed body crosses the limit.
    #[instrument(skip(self))]
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut response = self.client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,application/pdf,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.5,ja;q=0.3")
            .header("Connection", "keep-alive")
            .header("Upgrade-Insecure-Requests", "1")
            .send()
            .await?;

        let status = response.status();
        debug!("Response status: {}", status);

        if !status.is_success() {
            return Err(FetchError::Http {
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        let final_url = response.url().to_string();
        let header = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = header.as_deref().map(media_type);
        let charset = header.as_deref().and_then(charset_param);

        if let Some(ct) = content_type.as_deref() {
            if !is_extractable(ct) {
                return Err(FetchError::UnsupportedType(ct.to_string()));
            }
        }

        let declared_pdf = content_type.as_deref() == Some("application/pdf");
        let maybe_pdf = matches!(content_type.as_deref(), None | Some("application/pdf" | "application/octet-stream"));
        let limit = if maybe_pdf { self.max_pdf_bytes } else { self.max_body_bytes };

        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                warn!(length, limit, "Body exceeds size ceiling, not downloading");
                return Err(FetchError::BodyTooLarge { limit, pdf: declared_pdf });
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                warn!(read = body.len() + chunk.len(), limit, "Body exceeds size ceiling, aborting download");
                let pdf = declared_pdf || body.starts_with(b"%PDF") || chunk.starts_with(b"%PDF");
                return Err(FetchError::BodyTooLarge { limit, pdf });
            }
            body.extend_from_slice(&chunk);
        }
        debug!(bytes = body.len(), "Fetched body");

        Ok(FetchedPage {
            final_url,
            content_type,
            charset,
            body,
        })
    }
}

/// `text/html; charset=Shift_JIS` -> `text/html`.
fn media_type(header: &str) -> String {
    header.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

/// `text/html; charset="Shift_JIS"` -> `Shift_JIS`.
fn charset_param(header: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
    })
}

fn sniff_meta_charset(body: &[u8]) -> Option<String> {
    let head = &body[..body.len().min(CHARSET_SNIFF_BYTES)];
    META_CHARSET
        .captures(head)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

/// Media types worth handing to an extractor.
fn is_extractable(content_type: &str) -> bool {
    content_type.is_empty()
        || content_type.starts_with("text/")
        || content_type == "application/pdf"
        || content_type == "application/octet-stream"
        || content_type.contains("xml")
        || content_type.contains("html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fetcher() -> PageFetcher {
        PageFetcher::new(&ScrapingConfig::default(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_html() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html><body><p>Hello</p></body></html>")
            .create_async()
            .await;

        let page = fetcher().fetch(&format!("{}/page", server.url())).await.unwrap();

        mock.assert_async().await;
        assert_eq!(page.content_type.as_deref(), Some("text/html"));
        assert!(page.text().contains("<p>Hello</p>"));
        assert!(!page.is_pdf());
    }

    #[tokio::test]
    async fn test_http_status_is_mapped() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/missing").with_status(404).create_async().await;
        server.mock("GET", "/down").with_status(503).create_async().await;

        let f = fetcher();
        let missing = f.fetch(&format!("{}/missing", server.url())).await.unwrap_err();
        let down = f.fetch(&format!("{}/down", server.url())).await.unwrap_err();

        assert!(matches!(missing, FetchError::Http { status: Some(404), .. }));
        assert!(!missing.is_retryable());
        assert!(matches!(down, FetchError::Http { status: Some(503), .. }));
        assert!(down.is_retryable());
    }

    #[tokio::test]
    async fn test_images_are_unsupported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/logo.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body([0x89u8, b'P', b'N', b'G'])
            .create_async()
            .await;

        let err = fetcher().fetch(&format!("{}/logo.png", server.url())).await.unwrap_err();
        assert_eq!(err, FetchError::UnsupportedType("image/png".into()));
    }

    #[tokio::test]
    async fn test_redirect_loop() {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();
        server
            .mock("GET", "/a")
            .with_status(302)
            .with_header("location", &format!("{url}/b"))
            .create_async()
            .await;
        server
            .mock("GET", "/b")
            .with_status(302)
            .with_header("location", &format!("{url}/a"))
            .create_async()
            .await;

        let err = fetcher().fetch(&format!("{url}/a")).await.unwrap_err();
        assert_eq!(err, FetchError::RedirectLoop);
    }

    fn page(charset: Option<&str>, body: Vec<u8>) -> FetchedPage {
        FetchedPage {
            final_url: String::new(),
            content_type: Some("text/html".into()),
            charset: charset.map(str::to_string),
            body,
        }
    }

    // 日本語 in Shift_JIS
    const SJIS: [u8; 6] = [0x93, 0xfa, 0x96, 0x7b, 0x8c, 0xea];

    #[test]
    fn test_latin1_fallback() {
        assert_eq!(page(None, vec![b'c', b'a', b'f', 0xe9]).text(), "café");
    }

    #[test]
    fn test_header_charset_is_honoured() {
        assert_eq!(page(Some("Shift_JIS"), SJIS.to_vec()).text(), "日本語");
    }

    #[test]
    fn test_meta_charset_is_sniffed() {
        let mut body = b"<html><head><meta http-equiv=\"Content-Type\" content=\"text/html; charset=EUC-JP\"></head><body>".to_vec();
        // 日本 in EUC-JP
        body.extend_from_slice(&[0xc6, 0xfc, 0xcb, 0xdc]);
        assert!(page(None, body).text().ends_with("<body>日本"));
    }

    #[test]
    fn test_content_type_parsing() {
        assert_eq!(media_type("Text/HTML; charset=\"Shift_JIS\""), "text/html");
        assert_eq!(charset_param("text/html; charset=\"Shift_JIS\"").as_deref(), Some("Shift_JIS"));
        assert_eq!(charset_param("text/html"), None);
    }

    #[tokio::test]
    async fn test_charset_from_response_header() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ja")
            .with_status(200)
            .with_header("content-type", "text/html; charset=Shift_JIS")
            .with_body(SJIS)
            .create_async()
            .await;

        let page = fetcher().fetch(&format!("{}/ja", server.url())).await.unwrap();
        assert_eq!(page.charset.as_deref(), Some("Shift_JIS"));
        assert_eq!(page.text(), "日本語");
    }

    fn small_fetcher() -> PageFetcher {
        let config = ScrapingConfig {
            max_body_bytes: 64,
            max_pdf_bytes: 128,
            ..ScrapingConfig::default()
        };
        PageFetcher::new(&config, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_oversized_bodies_are_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<p>".repeat(100))
            .create_async()
            .await;
        server
            .mock("GET", "/streamed.html")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_chunked_body(|w| {
                for _ in 0..10 {
                    w.write_all(b"<p>0123456789</p>")?;
                }
                Ok(())
            })
            .create_async()
            .await;
        server
            .mock("GET", "/big.pdf")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_body(b"%PDF-1.4\n".repeat(50))
            .create_async()
            .await;

        let f = small_fetcher();
        let html = f.fetch(&format!("{}/big.html", server.url())).await.unwrap_err();
        assert_eq!(html, FetchError::BodyTooLarge { limit: 64, pdf: false });

        let streamed = f.fetch(&format!("{}/streamed.html", server.url())).await.unwrap_err();
        assert_eq!(streamed, FetchError::BodyTooLarge { limit: 64, pdf: false });

        let pdf = f.fetch(&format!("{}/big.pdf", server.url())).await.unwrap_err();
        assert_eq!(pdf, FetchError::BodyTooLarge { limit: 128, pdf: true });
        assert!(!pdf.is_retryable());
    }
}
