use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Worksheet columns A–K, shared by Main and Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Timestamp,
    FinalUrl,
    Content,
    Status,
    ErrorStatus,
    Keywords,
    FlowStatus,
    Terms,
    Genre,
    History,
    Type,
}

/// Column order on the sheet. Reordering columns only touches this table.
pub const COLUMN_ORDER: [Column; 11] = [
    Column::Timestamp,
    Column::FinalUrl,
    Column::Content,
    Column::Status,
    Column::ErrorStatus,
    Column::Keywords,
    Column::FlowStatus,
    Column::Terms,
    Column::Genre,
    Column::History,
    Column::Type,
];

impl Column {
    /// Zero-based position of the column on the sheet.
    pub fn index(self) -> usize {
        COLUMN_ORDER
            .iter()
            .position(|c| *c == self)
            .unwrap_or_default()
    }

    /// Spreadsheet column letter (A, B, ...).
    pub fn letter(self) -> char {
        (b'A' + self.index() as u8) as char
    }
}

/// Processing stage stored in the Status column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Status {
    #[default]
    Blank,
    Pending,
    Processing,
    Done,
    Error,
    Step1,
    /// Any value this tool does not interpret; kept verbatim.
    Other(String),
}

impl Status {
    pub fn as_str(&self) -> &str {
        match self {
            Status::Blank => "",
            Status::Pending => "PENDING",
            Status::Processing => "PROCESSING",
            Status::Done => "DONE",
            Status::Error => "ERROR",
            Status::Step1 => "STEP1",
            Status::Other(s) => s,
        }
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "" => Status::Blank,
            "PENDING" => Status::Pending,
            "PROCESSING" => Status::Processing,
            "DONE" => Status::Done,
            "ERROR" => Status::Error,
            "STEP1" => Status::Step1,
            _ => Status::Other(trimmed.to_string()),
        }
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        Status::from(s.as_str())
    }
}

impl From<Status> for String {
    fn from(s: Status) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared or detected content type stored in the Type column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UrlType {
    Html,
    Pdf,
    Arxiv,
    ResearchGate,
    Unknown,
}

impl UrlType {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlType::Html => "html",
            UrlType::Pdf => "pdf",
            UrlType::Arxiv => "arxiv",
            UrlType::ResearchGate => "researchgate",
            UrlType::Unknown => "unknown",
        }
    }
}

impl FromStr for UrlType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "html" => UrlType::Html,
            "pdf" => UrlType::Pdf,
            "arxiv" => UrlType::Arxiv,
            "researchgate" => UrlType::ResearchGate,
            _ => UrlType::Unknown,
        })
    }
}

impl fmt::Display for UrlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One worksheet row. Main and Error share this schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Row {
    pub timestamp: String,
    pub final_url: String,
    pub content: String,
    pub status: Status,
    pub error_status: String,
    pub keywords: String,
    pub flow_status: String,
    pub terms: String,
    pub genre: String,
    pub history: String,
    #[serde(rename = "type")]
    pub url_type: String,
}

impl Row {
    /// Builds a row from raw cells in sheet order. Short rows are padded with blanks.
    pub fn from_cells<S: AsRef<str>>(cells: &[S]) -> Self {
        let cell = |c: Column| {
            cells
                .get(c.index())
                .map(|s| s.as_ref().to_string())
                .unwrap_or_default()
        };

        Self {
            timestamp: cell(Column::Timestamp),
            final_url: cell(Column::FinalUrl).trim().to_string(),
            content: cell(Column::Content),
            status: Status::from(cell(Column::Status)),
            error_status: cell(Column::ErrorStatus),
            keywords: cell(Column::Keywords),
            flow_status: cell(Column::FlowStatus),
            terms: cell(Column::Terms),
            genre: cell(Column::Genre),
            history: cell(Column::History),
            url_type: cell(Column::Type),
        }
    }

    /// The row's cells in sheet order.
    pub fn to_cells(&self) -> Vec<String> {
        COLUMN_ORDER.iter().map(|c| self.get(*c).to_string()).collect()
    }

    pub fn get(&self, column: Column) -> &str {
        match column {
            Column::Timestamp => &self.timestamp,
            Column::FinalUrl => &self.final_url,
            Column::Content => &self.content,
            Column::Status => self.status.as_str(),
            Column::ErrorStatus => &self.error_status,
            Column::Keywords => &self.keywords,
            Column::FlowStatus => &self.flow_status,
            Column::Terms => &self.terms,
            Column::Genre => &self.genre,
            Column::History => &self.history,
            Column::Type => &self.url_type,
        }
    }

    /// The declared type, if the Type column names one this tool knows.
    pub fn declared_type(&self) -> Option<UrlType> {
        match self.url_type.parse::<UrlType>() {
            Ok(UrlType::Unknown) | Err(_) => None,
            Ok(t) => Some(t),
        }
    }
}

/// The `Extraction` struct is the normalized result of fetching one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    /// The URL that was requested.
    pub url: String,
    /// Normalized plain text. Empty when nothing usable was found.
    pub text: String,
    /// The type the extractor settled on.
    pub detected_type: UrlType,
    /// Size of the fetched body in bytes.
    pub raw_length: usize,
    /// Set when the fetch worked but extraction could only give up gracefully (e.g. image-only PDF).
    pub soft_failure: Option<String>,
    /// Title, description and similar page metadata.
    pub metadata: HashMap<String, String>,
    /// Paragraphs of article body, not counting composed header lines.
    pub body_paragraphs: usize,
    /// The timestamp when the content was extracted.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Extraction {
    /// Paragraph count is taken from the text's non-empty lines; extractors that compose
    /// header lines overwrite it with the body alone.
    pub fn new(url: &str, text: String, detected_type: UrlType, raw_length: usize) -> Self {
        let body_paragraphs = text.lines().filter(|l| !l.trim().is_empty()).count();
        Self {
            url: url.to_string(),
            text,
            detected_type,
            raw_length,
            soft_failure: None,
            metadata: HashMap::new(),
            body_paragraphs,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn soft(url: &str, detected_type: UrlType, raw_length: usize, reason: impl Into<String>) -> Self {
        Self {
            soft_failure: Some(reason.into()),
            ..Self::new(url, String::new(), detected_type, raw_length)
        }
    }
}
