use crate::types::{Extraction, UrlType};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Elements whose text is page chrome rather than article body.
const BOILERPLATE_TAGS: [&str; 9] = [
    "nav", "header", "footer", "aside", "script", "style", "noscript", "form", "button",
];

/// Text and metadata pulled out of one HTML document.
#[derive(Debug, Clone, Default)]
pub struct ScrapedPage {
    /// Composed `Title:` / `Description:` / `Content:` text, blocks separated by blank lines.
    pub text: String,
    pub metadata: HashMap<String, String>,
    /// Non-empty blocks of article body; header lines such as `Title:` do not count.
    pub body_blocks: usize,
}

impl ScrapedPage {
    /// Wraps the page as an extraction, carrying the body structure over.
    pub fn into_extraction(self, url: &str, detected_type: UrlType, raw_length: usize) -> Extraction {
        let mut extraction = Extraction::new(url, self.text, detected_type, raw_length);
        extraction.metadata = self.metadata;
        extraction.body_paragraphs = self.body_blocks;
        extraction
    }
}

/// The `ContentScraper` struct is responsible for extracting content and metadata from HTML documents.
/// It uses CSS selectors to identify the relevant parts of the document and skips page chrome.
pub struct ContentScraper {
    /// A list of CSS selectors used to extract the main content from the HTML document, best first.
    selectors: Vec<Selector>,
    /// A map of metadata keys to CSS selectors used to extract metadata from the HTML document.
    metadata_selectors: Vec<(String, Selector)>,
    /// Body text shorter than this makes the scraper try the next selector.
    min_content_length: usize,
}

impl Default for ContentScraper {
    /// Provides default values for the `ContentScraper` struct.
    ///
    /// # Returns
    ///
    /// A `ContentScraper` instance with default selectors.
    fn default() -> Self {
        let default_selectors = [
            "article p, article li",
            "main p, main li",
            "div.content p, div.content li",
            "div.article-body p",
            "div.markdown-body",
            "div.mw-parser-output p",
            "p, li",
        ];

        let metadata_selectors = [
            ("title", "title, h1.title, .article-title"),
            ("description", "meta[name='description'], meta[property='og:description']"),
            ("keywords", "meta[name='keywords']"),
            ("author", "meta[name='author'], .author"),
            ("date", "meta[name='date'], .date, time"),
        ];

        Self::new(default_selectors, metadata_selectors, crate::DEFAULT_MIN_CONTENT_LENGTH)
    }
}

impl ContentScraper {
    /// Creates a new `ContentScraper` with the given content and metadata selectors.
    ///
    /// # Arguments
    ///
    /// * `content_selectors` - CSS selectors for the main content, tried in order.
    /// * `metadata_selectors` - Metadata keys with their corresponding CSS selectors.
    /// * `min_content_length` - The body length a selector must reach to be accepted outright.
    ///
    /// # Returns
    ///
    /// A new instance of `ContentScraper`.
    pub fn new(
        content_selectors: impl IntoIterator<Item = impl AsRef<str>>,
        metadata_selectors: impl IntoIterator<Item = (impl Into<String>, impl AsRef<str>)>,
        min_content_length: usize,
    ) -> Self {
        let selectors = content_selectors
            .into_iter()
            .filter_map(|s| Selector::parse(s.as_ref()).ok())
            .collect();

        let metadata_selectors = metadata_selectors
            .into_iter()
            .filter_map(|(key, sel)| {
                Selector::parse(sel.as_ref())
                    .ok()
                    .map(|selector| (key.into(), selector))
            })
            .collect();

        Self {
            selectors,
            metadata_selectors,
            min_content_length,
        }
    }

    pub fn with_min_content_length(mut self, min_content_length: usize) -> Self {
        self.min_content_length = min_content_length;
        self
    }

    /// Extracts title, description and body text from a generic HTML page.
    ///
    /// Returns an empty `text` when the page yields nothing at all; judging whether
    /// what was found is enough is left to the classifier.
    #[instrument(skip(self, html), fields(html_length = html.len()))]
    pub fn extract(&self, html: &str) -> ScrapedPage {
        let document = Html::parse_document(html);
        let metadata = self.extract_metadata(&document);
        let body = self.extract_content(&document);

        let mut parts = Vec::new();
        if let Some(title) = metadata.get("title") {
            parts.push(format!("Title: {}", title));
        }
        if let Some(description) = metadata.get("description") {
            parts.push(format!("Description: {}", description));
        }
        if !body.is_empty() {
            parts.push(format!("Content: {}", body));
        }

        debug!(parts = parts.len(), body_chars = body.chars().count(), "Generic extraction done");

        ScrapedPage {
            text: parts.join("\n\n"),
            metadata,
            body_blocks: body.lines().filter(|l| !l.trim().is_empty()).count(),
        }
    }

    /// Extracts title and abstract from a ResearchGate publication page,
    /// falling back to the generic extractor when neither is present.
    pub fn extract_researchgate(&self, html: &str) -> ScrapedPage {
        let document = Html::parse_document(html);
        let title = first_text(&document, "h1");
        let description = first_attr(&document, "meta[name='description'], meta[property='og:description']", "content");

        let mut parts = Vec::new();
        if let Some(title) = &title {
            parts.push(format!("Title: {}", title));
        }
        if let Some(description) = &description {
            parts.push(format!("Description: {}", description));
        }

        if parts.is_empty() {
            debug!("No ResearchGate metadata, using generic extraction");
            return self.extract(html);
        }

        let mut metadata = HashMap::new();
        if let Some(title) = title {
            metadata.insert("title".to_string(), title);
        }
        if let Some(description) = description {
            metadata.insert("description".to_string(), description);
        }

        ScrapedPage {
            body_blocks: parts.len(),
            text: parts.join("\n\n"),
            metadata,
        }
    }

    /// Extracts the main content from the HTML document using the configured selectors.
    ///
    /// The first selector whose text reaches the length floor wins; otherwise the
    /// longest non-empty candidate is used.
    fn extract_content(&self, document: &Html) -> String {
        let mut best = String::new();

        for selector in &self.selectors {
            let content = self.extract_text_by_selector(document, selector);
            if content.is_empty() {
                continue;
            }
            let length = content.chars().count();
            if length >= self.min_content_length {
                return content;
            }
            if length > best.chars().count() {
                best = content;
            }
        }

        best
    }

    /// Extracts metadata from the HTML document using the configured selectors.
    fn extract_metadata(&self, document: &Html) -> HashMap<String, String> {
        let mut metadata = HashMap::new();

        for (key, selector) in &self.metadata_selectors {
            if let Some(value) = self.extract_metadata_value(document, selector) {
                metadata.insert(key.clone(), value);
            }
        }

        metadata
    }

    /// Extracts a metadata value from the HTML document using the given selector.
    fn extract_metadata_value(&self, document: &Html, selector: &Selector) -> Option<String> {
        document
            .select(selector)
            .next()
            .and_then(|element| {
                // First try content attribute (for meta tags)
                if let Some(content) = element.value().attr("content") {
                    let content = clean_text(content);
                    return (!content.is_empty()).then_some(content);
                }

                // Then try text content
                let text = clean_text(&element.text().collect::<Vec<_>>().join(" "));
                (!text.is_empty()).then_some(text)
            })
    }

    /// Collects the text of every matching element outside page chrome, one line per element.
    fn extract_text_by_selector(&self, document: &Html, selector: &Selector) -> String {
        let blocks: Vec<String> = document
            .select(selector)
            .filter(|element| !is_boilerplate(element))
            .map(|element| clean_text(&element.text().collect::<Vec<_>>().join(" ")))
            .filter(|s| !s.is_empty())
            .collect();

        blocks.join("\n")
    }
}

/// Extracts title, authors and abstract from an arXiv abstract page's structured markup.
///
/// Falls back to the `citation_*` meta tags arXiv also publishes. Returns `None` when
/// neither a title nor an abstract can be found.
pub fn extract_arxiv(html: &str) -> Option<ScrapedPage> {
    let document = Html::parse_document(html);

    let title = first_text(&document, "h1.title")
        .map(|t| strip_descriptor(&t, "Title:"))
        .filter(|t| !t.is_empty())
        .or_else(|| first_attr(&document, "meta[name='citation_title']", "content"));

    let authors = select_texts(&document, "div.authors a");
    let authors = if authors.is_empty() {
        select_attrs(&document, "meta[name='citation_author']", "content")
    } else {
        authors
    };

    let abstract_text = first_text(&document, "blockquote.abstract")
        .map(|t| strip_descriptor(&t, "Abstract:"))
        .filter(|t| !t.is_empty())
        .or_else(|| first_attr(&document, "meta[name='citation_abstract']", "content"));

    if title.is_none() && abstract_text.is_none() {
        return None;
    }

    let mut parts = Vec::new();
    let mut metadata = HashMap::new();
    if let Some(title) = title {
        parts.push(format!("Title: {}", title));
        metadata.insert("title".to_string(), title);
    }
    if !authors.is_empty() {
        let joined = authors.join(", ");
        parts.push(format!("Authors: {}", joined));
        metadata.insert("author".to_string(), joined);
    }
    if let Some(abstract_text) = abstract_text {
        parts.push(format!("Abstract: {}", abstract_text));
    }

    Some(ScrapedPage {
        body_blocks: parts.len(),
        text: parts.join("\n\n"),
        metadata,
    })
}

fn is_boilerplate(element: &ElementRef) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| BOILERPLATE_TAGS.contains(&a.value().name()))
}

fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .map(|e| clean_text(&e.text().collect::<Vec<_>>().join(" ")))
        .find(|t| !t.is_empty())
}

fn first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    select_attrs(document, selector, attr).into_iter().next()
}

fn select_texts(document: &Html, selector: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .map(|e| clean_text(&e.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !t.is_empty())
        .collect()
}

fn select_attrs(document: &Html, selector: &str, attr: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|e| e.value().attr(attr))
        .map(clean_text)
        .filter(|t| !t.is_empty())
        .collect()
}

fn strip_descriptor(text: &str, descriptor: &str) -> String {
    text.trim()
        .strip_prefix(descriptor)
        .unwrap_or(text)
        .trim()
        .to_string()
}

/// Collapses runs of whitespace into single spaces. Non-ASCII text is kept as is.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
