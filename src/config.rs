use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// The `RescrapeConfig` struct holds every setting the batch run consumes.
/// It is built once, then handed to each component explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RescrapeConfig {
    /// Batch sizing, time budget and per-row limits.
    pub processing: ProcessingConfig,
    /// HTTP and extraction settings.
    pub scraping: ScrapingConfig,
    /// Localized phrase lists used to recognise failure pages and refusals.
    pub markers: MarkerConfig,
    /// Thresholds for the summary quality check.
    pub validation: ValidationConfig,
    /// The configuration settings for the Language Model (LLM).
    pub llm_config: LLMConfig,
    /// Worksheet names.
    pub sheets: SheetsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Error rows taken per batch, in sheet order.
    pub max_rows_per_batch: usize,
    /// Wall-clock budget of one batch. No row starts once it is spent.
    pub max_execution_time_seconds: u64,
    /// Courtesy pause between rows.
    pub request_delay_seconds: f64,
    /// Per-request timeout for page fetches.
    pub fetch_timeout_seconds: u64,
    /// Text shorter than this is suspect unless it has paragraph structure.
    pub min_content_length: usize,
    /// Pause before the single retry of a transient fetch error.
    pub retry_backoff_seconds: f64,
    /// Extracted text is cut to this many characters before summarization.
    pub max_content_chars: usize,
    /// Content cells written by a run are cut to this many characters.
    pub content_max_chars: usize,
    /// ErrorStatus diagnostics are cut to this many characters.
    pub error_status_max_chars: usize,
    /// A run lock older than this is treated as left behind by a crashed run.
    pub lock_stale_after_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    /// The user agent string to be used in HTTP requests.
    pub user_agent: String,
    /// Domains that are never fetched.
    pub skip_domains: Vec<String>,
    /// Base URLs tried, in order, for arXiv abstract pages.
    pub arxiv_mirrors: Vec<String>,
    pub max_redirects: usize,
    /// HTML and text bodies larger than this are not downloaded.
    pub max_body_bytes: usize,
    /// PDF bodies larger than this are not downloaded or parsed.
    pub max_pdf_bytes: usize,
}

/// Locale code to regex pattern lists. Patterns match case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Phrases that mark a page as unavailable, blocked or missing.
    pub soft_failure: BTreeMap<String, Vec<String>>,
    /// Phrases a model uses when it refuses or apologises instead of summarizing.
    pub refusal: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Lowest passing quality score.
    pub min_score: f32,
    /// Most non-critical issues a passing summary may carry.
    pub max_issues: usize,
    /// A summary at least this fraction of the source length is an echo.
    pub echo_ratio: f32,
    /// Summaries shorter than this are treated as truncated.
    pub min_summary_chars: usize,
}

/// The `LLMConfig` struct holds the configuration settings for the Language Model (LLM).
/// It includes the endpoint URL, model, temperature, and maximum number of tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    /// The endpoint URL for the LLM API.
    pub endpoint: String,
    /// The model name sent with each request.
    pub model: String,
    /// The temperature setting for the LLM, controlling the randomness of the output.
    pub temperature: f32,
    /// The maximum number of tokens allowed in the LLM response.
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    /// Prompt with a `{content}` placeholder for the article text.
    pub prompt_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetsConfig {
    pub main_sheet: String,
    pub error_sheet: String,
}

/// The summarization prompt. Output format downstream depends on it, so edit with care.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "以下の記事の内容を日本語で300文字程度に要約してください。\
要約のみを出力し、前置きや補足は書かないでください。\n\n記事:\n{content}";

impl Default for RescrapeConfig {
    fn default() -> Self {
        Self {
            processing: ProcessingConfig::default(),
            scraping: ScrapingConfig::default(),
            markers: MarkerConfig::default(),
            validation: ValidationConfig::default(),
            llm_config: LLMConfig::default(),
            sheets: SheetsConfig::default(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_rows_per_batch: crate::DEFAULT_MAX_ROWS_PER_BATCH,
            max_execution_time_seconds: crate::DEFAULT_MAX_EXECUTION_TIME.as_secs(),
            request_delay_seconds: 1.0,
            fetch_timeout_seconds: crate::DEFAULT_TIMEOUT.as_secs(),
            min_content_length: crate::DEFAULT_MIN_CONTENT_LENGTH,
            retry_backoff_seconds: 2.0,
            max_content_chars: 10_000,
            content_max_chars: 1_000,
            error_status_max_chars: 500,
            lock_stale_after_seconds: 900,
        }
    }
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            user_agent: String::from(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
            ),
            skip_domains: vec![String::from("go.gale.com")],
            arxiv_mirrors: vec![
                String::from("https://arxiv.org"),
                String::from("https://export.arxiv.org"),
            ],
            max_redirects: 10,
            max_body_bytes: 5 * 1024 * 1024,
            max_pdf_bytes: 20 * 1024 * 1024,
        }
    }
}

fn patterns(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for MarkerConfig {
    fn default() -> Self {
        let mut soft_failure = BTreeMap::new();
        soft_failure.insert(
            "ja".to_string(),
            patterns(&[
                "本文が取得できませんでした",
                "アクセスできません",
                "エラーが発生しました",
                "ページが見つかりません",
                "接続できません",
            ]),
        );
        soft_failure.insert(
            "en".to_string(),
            patterns(&[
                r"could not.*fetch",
                r"unable to.*retrieve",
                r"failed to.*load",
                r"error.*occurred",
                r"page not found",
                r"access denied",
                r"connection.*failed",
                r"timeout.*error",
                r"404.*not found",
                r"500.*internal server error",
                r"503.*service unavailable",
            ]),
        );
        soft_failure.insert(
            "zh".to_string(),
            patterns(&["无法获取", "获取失败", "连接失败", "页面不存在", "访问被拒绝"]),
        );

        let mut refusal = BTreeMap::new();
        refusal.insert(
            "ja".to_string(),
            patterns(&[
                "申し訳(ありません|ございません)",
                "要約(することが)?できません",
                "お手伝いできません",
                "内容が(提供されていません|含まれていません)",
            ]),
        );
        refusal.insert(
            "en".to_string(),
            patterns(&[
                r"i'?m sorry",
                r"i apologi[sz]e",
                r"i (cannot|can't|am unable to) (summari[sz]e|help|assist|access)",
                r"as an ai( language model)?",
                r"no (article|content) (was )?provided",
            ]),
        );
        refusal.insert(
            "zh".to_string(),
            patterns(&["抱歉", "对不起", "无法总结", "作为一个?AI"]),
        );

        Self {
            soft_failure,
            refusal,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_score: 0.3,
            max_issues: 2,
            echo_ratio: 0.95,
            min_summary_chars: 20,
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("http://localhost:11434/api/generate"),
            model: String::from("llama3.2:latest"),
            temperature: 0.1,
            max_tokens: 2048,
            timeout_seconds: 120,
            prompt_template: String::from(DEFAULT_PROMPT_TEMPLATE),
        }
    }
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            main_sheet: String::from("Main"),
            error_sheet: String::from("Error"),
        }
    }
}

impl RescrapeConfig {
    /// Loads the configuration in layers: built-in defaults, then the optional file,
    /// then `RESCRAPE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&RescrapeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                ::config::Environment::with_prefix("RESCRAPE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

impl ProcessingConfig {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_seconds)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.request_delay_seconds.max(0.0))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_seconds.max(0.0))
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_seconds)
    }
}

impl LLMConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_batch_limits() {
        let config = RescrapeConfig::default();
        assert_eq!(config.processing.max_rows_per_batch, 15);
        assert_eq!(config.processing.max_execution_time(), Duration::from_secs(240));
        assert_eq!(config.processing.lock_stale_after(), Duration::from_secs(900));
        assert_eq!(config.sheets.main_sheet, "Main");
        assert_eq!(config.sheets.error_sheet, "Error");
        assert!(config.llm_config.prompt_template.contains("{content}"));
        assert!(config.markers.soft_failure.contains_key("ja"));
        assert!(config.markers.soft_failure.contains_key("en"));
        assert!(config.markers.soft_failure.contains_key("zh"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[processing]\nmax_rows_per_batch = 3\n\n[sheets]\nerror_sheet = \"Errors\""
        )
        .unwrap();

        let config = RescrapeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.processing.max_rows_per_batch, 3);
        assert_eq!(config.sheets.error_sheet, "Errors");
        // untouched keys keep their defaults
        assert_eq!(config.processing.max_execution_time_seconds, 240);
        assert_eq!(config.sheets.main_sheet, "Main");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = RescrapeConfig::load(Some(Path::new("/nonexistent/rescrape.toml")));
        assert!(result.is_err());
    }
}
