use crate::classifier::{FailureClassifier, MarkerSet, Outcome};
use crate::config::{ProcessingConfig, RescrapeConfig, SheetsConfig};
use crate::extractor::Extract;
use crate::llm::Summarize;
use crate::store::RowStore;
use crate::types::{Extraction, Row, Status, UrlType};
use crate::validator::SummaryValidator;
use crate::{FetchError, Result, StoreErrorKind, SummarizationError, FETCH_FAILURE_MARKER};
use indicatif::ProgressBar;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Where a row is in its pass through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStage {
    Pending,
    Fetching,
    Classifying,
    Summarizing,
    Validating,
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Success,
    SoftFail,
    HardFail,
}

/// The computed fate of one processed row, applied to the store at commit time.
#[derive(Debug, Clone)]
pub struct BatchVerdict {
    /// Position in the Error sheet snapshot taken at batch start.
    pub row_index: usize,
    pub url: String,
    pub outcome: VerdictKind,
    /// Last successfully fetched text, if any.
    pub extracted_text: Option<String>,
    pub summary: Option<String>,
    pub diagnostic: Option<String>,
    pub detected_type: Option<UrlType>,
    pub score: Option<f32>,
}

/// Why the batch stopped before its last selected row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TimeCeiling,
    QuotaExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowOutcome {
    Success,
    SoftFail,
    HardFail,
    /// Not started this run; left untouched in Error.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowReport {
    pub row_index: usize,
    pub url: String,
    pub outcome: RowOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub selected: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub soft_failed: usize,
    pub hard_failed: usize,
    pub skipped: usize,
    pub elapsed_seconds: f64,
    pub stop_reason: Option<StopReason>,
    pub rows: Vec<RowReport>,
}

impl BatchReport {
    /// URLs of the rows that ended with `outcome`, in sheet order.
    pub fn urls_with(&self, outcome: RowOutcome) -> Vec<&str> {
        self.rows
            .iter()
            .filter(|r| r.outcome == outcome)
            .map(|r| r.url.as_str())
            .collect()
    }
}

/// Drives one bounded run over the Error sheet.
///
/// Rows are processed one at a time in sheet order. All store mutations are
/// computed against the snapshot read at batch start and applied at the end:
/// appends and in-place updates first, then deletes from the highest index down.
pub struct BatchOrchestrator<S, E, L> {
    store: S,
    extractor: E,
    classifier: FailureClassifier,
    validator: SummaryValidator<L>,
    processing: ProcessingConfig,
    sheets: SheetsConfig,
    extract_timeout: Duration,
    summarize_timeout: Duration,
    progress: ProgressBar,
}

impl<S: RowStore, E: Extract, L: Summarize> BatchOrchestrator<S, E, L> {
    pub fn new(config: &RescrapeConfig, store: S, extractor: E, summarizer: L) -> Result<Self> {
        let markers = MarkerSet::new(&config.markers.soft_failure)?;
        let classifier = FailureClassifier::new(markers, config.processing.min_content_length);
        let validator = SummaryValidator::new(
            summarizer,
            config.llm_config.prompt_template.clone(),
            &config.markers,
            config.validation.clone(),
        )?;

        // arXiv may try every mirror plus the PDF within one extraction.
        let requests_per_extraction = config.scraping.arxiv_mirrors.len() as u32 + 1;

        Ok(Self {
            store,
            extractor,
            classifier,
            validator,
            processing: config.processing.clone(),
            sheets: config.sheets.clone(),
            extract_timeout: config.processing.fetch_timeout() * requests_per_extraction,
            summarize_timeout: config.llm_config.timeout(),
            progress: ProgressBar::hidden(),
        })
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one batch and commits its results.
    ///
    /// Row-level failures never abort the run. A store failure does, and the
    /// returned error names the sheet, index and operation that failed.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let started = Instant::now();
        let ceiling = self.processing.max_execution_time();

        let snapshot = self.store.read_all(&self.sheets.error_sheet).await?;
        let total = snapshot.len();
        let selected: Vec<(usize, Row)> = snapshot
            .into_iter()
            .enumerate()
            .filter(|(_, row)| is_eligible(row))
            .take(self.processing.max_rows_per_batch)
            .collect();

        info!(selected = selected.len(), total, "Starting batch");
        self.progress.set_length(selected.len() as u64);

        let mut verdicts = Vec::with_capacity(selected.len());
        let mut stop_reason = None;

        for (position, (index, row)) in selected.iter().enumerate() {
            if position > 0 {
                let delay = self.processing.request_delay();
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }

            if started.elapsed() >= ceiling {
                warn!(
                    elapsed = ?started.elapsed(),
                    remaining = selected.len() - position,
                    "Time ceiling reached, leaving remaining rows for the next run"
                );
                stop_reason = Some(StopReason::TimeCeiling);
                break;
            }

            self.progress.set_message(row.final_url.clone());
            let span = info_span!("row", index = *index, url = %row.final_url);
            let (verdict, quota_exhausted) = self.process_row(*index, row).instrument(span).await;
            verdicts.push(verdict);
            self.progress.inc(1);

            if quota_exhausted {
                warn!("Summarization quota exhausted, stopping batch");
                stop_reason = Some(StopReason::QuotaExhausted);
                break;
            }
        }

        self.commit(&selected, &verdicts).await?;

        let report = build_report(&selected, &verdicts, stop_reason, started.elapsed());
        self.progress.finish_with_message(format!(
            "{} moved, {} soft, {} hard, {} skipped",
            report.succeeded, report.soft_failed, report.hard_failed, report.skipped
        ));
        info!(
            succeeded = report.succeeded,
            soft_failed = report.soft_failed,
            hard_failed = report.hard_failed,
            skipped = report.skipped,
            elapsed_seconds = report.elapsed_seconds,
            "Batch finished"
        );

        Ok(report)
    }

    /// Fetch → classify → (summarize → validate). The flag reports summarization quota exhaustion.
    async fn process_row(&self, index: usize, row: &Row) -> (BatchVerdict, bool) {
        let url = row.final_url.as_str();
        let mut verdict = BatchVerdict {
            row_index: index,
            url: url.to_string(),
            outcome: VerdictKind::HardFail,
            extracted_text: None,
            summary: None,
            diagnostic: None,
            detected_type: None,
            score: None,
        };
        debug!(stage = ?RowStage::Pending);

        debug!(stage = ?RowStage::Fetching);
        let result = self.extract_with_retry(url, row.declared_type()).await;
        if let Ok(extraction) = &result {
            verdict.detected_type = Some(extraction.detected_type);
            if !extraction.text.trim().is_empty() {
                verdict.extracted_text = Some(extraction.text.clone());
            }
        }

        debug!(stage = ?RowStage::Classifying);
        let text = match (self.classifier.classify(&result), result) {
            (Outcome::Success, Ok(extraction)) => extraction.text,
            (Outcome::SoftFail(reason), _) => {
                info!(%reason, "Soft failure");
                verdict.outcome = VerdictKind::SoftFail;
                verdict.diagnostic = Some(reason);
                return (verdict, false);
            }
            (Outcome::HardFail(reason), _) => {
                info!(%reason, "Hard failure");
                verdict.diagnostic = Some(reason);
                return (verdict, false);
            }
            // classify never reports success for an error
            (Outcome::Success, Err(e)) => {
                verdict.diagnostic = Some(e.to_string());
                return (verdict, false);
            }
        };

        debug!(stage = ?RowStage::Summarizing);
        let summary = match timeout(self.summarize_timeout, self.validator.summarize(&text)).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => return (summarization_failed(verdict, &e), e == SummarizationError::QuotaExceeded),
            Err(_) => return (summarization_failed(verdict, &SummarizationError::Timeout), false),
        };

        debug!(stage = ?RowStage::Validating);
        let report = self.validator.validate(&text, &summary);
        verdict.score = Some(report.score);
        if report.passed() {
            info!(score = report.score, "Success");
            verdict.outcome = VerdictKind::Success;
            verdict.summary = Some(summary);
        } else {
            let reason = report.reason.unwrap_or_default();
            info!(score = report.score, %reason, "Summary rejected");
            verdict.outcome = VerdictKind::SoftFail;
            verdict.diagnostic = Some(format!("summary validation failed: {}", reason));
        }

        (verdict, false)
    }

    /// One extraction, retried once after a short backoff if the failure is transient.
    async fn extract_with_retry(&self, url: &str, declared: Option<UrlType>) -> std::result::Result<Extraction, FetchError> {
        match self.extract_once(url, declared).await {
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Transient fetch error, retrying once");
                sleep(self.processing.retry_backoff()).await;
                self.extract_once(url, declared).await
            }
            other => other,
        }
    }

    async fn extract_once(&self, url: &str, declared: Option<UrlType>) -> std::result::Result<Extraction, FetchError> {
        timeout(self.extract_timeout, self.extractor.extract(url, declared))
            .await
            .unwrap_or(Err(FetchError::Timeout))
    }

    /// Applies verdicts: appends and updates in selection order, then deletes in descending index order.
    async fn commit(&self, selected: &[(usize, Row)], verdicts: &[BatchVerdict]) -> Result<()> {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let mut deletes = Vec::new();

        for ((index, row), verdict) in selected.iter().zip(verdicts) {
            match verdict.outcome {
                VerdictKind::Success => {
                    let main_row = self.main_row(row, verdict, &now);
                    match self.store.append(&self.sheets.main_sheet, main_row).await {
                        Ok(()) => {}
                        Err(e) if matches!(e.kind, StoreErrorKind::DuplicateUrl(_)) => {
                            warn!(url = %row.final_url, "Already present in Main, removing from Error only");
                        }
                        Err(e) => {
                            error!(url = %row.final_url, error = %e, "Append to Main failed; nothing deleted from Error yet");
                            return Err(e.into());
                        }
                    }
                    deletes.push(*index);
                }
                VerdictKind::SoftFail | VerdictKind::HardFail => {
                    let error_row = self.error_row(row, verdict, &now);
                    self.store
                        .update(&self.sheets.error_sheet, *index, error_row)
                        .await
                        .map_err(|e| {
                            error!(url = %row.final_url, error = %e, "Error sheet update failed");
                            e
                        })?;
                }
            }
            debug!(index = *index, stage = ?RowStage::Committed);
        }

        deletes.sort_unstable_by(|a, b| b.cmp(a));
        for index in deletes {
            self.store
                .delete(&self.sheets.error_sheet, index)
                .await
                .map_err(|e| {
                    error!(index, error = %e, "Delete from Error failed; row is now in both sheets");
                    e
                })?;
        }

        Ok(())
    }

    fn main_row(&self, row: &Row, verdict: &BatchVerdict, now: &str) -> Row {
        Row {
            timestamp: now.to_string(),
            final_url: row.final_url.clone(),
            content: truncate(verdict.summary.as_deref().unwrap_or_default(), self.processing.content_max_chars),
            status: Status::Done,
            error_status: String::new(),
            keywords: String::new(),
            flow_status: String::new(),
            terms: String::new(),
            genre: String::new(),
            history: format!("Processed: {}", now),
            url_type: verdict
                .detected_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| row.url_type.clone()),
        }
    }

    fn error_row(&self, row: &Row, verdict: &BatchVerdict, now: &str) -> Row {
        let diagnostic = verdict.diagnostic.as_deref().unwrap_or("processing failed");
        let mut updated = row.clone();
        updated.timestamp = now.to_string();
        updated.status = Status::Error;

        if verdict.outcome == VerdictKind::SoftFail {
            updated.error_status = truncate(
                &format!("{} {}", FETCH_FAILURE_MARKER, diagnostic),
                self.processing.error_status_max_chars,
            );
            updated.content = match &verdict.extracted_text {
                Some(text) => truncate(text, self.processing.content_max_chars),
                None => FETCH_FAILURE_MARKER.to_string(),
            };
        } else {
            updated.error_status = truncate(diagnostic, self.processing.error_status_max_chars);
        }

        updated
    }
}

/// Rows with a URL whose Status is blank or ERROR, as the scheduled script selects them.
fn is_eligible(row: &Row) -> bool {
    !row.final_url.is_empty() && matches!(row.status, Status::Blank | Status::Error)
}

fn summarization_failed(mut verdict: BatchVerdict, e: &SummarizationError) -> BatchVerdict {
    warn!(error = %e, "Summarization failed");
    verdict.outcome = VerdictKind::HardFail;
    verdict.diagnostic = Some(format!("summarization failed: {}", e));
    verdict
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn build_report(
    selected: &[(usize, Row)],
    verdicts: &[BatchVerdict],
    stop_reason: Option<StopReason>,
    elapsed: Duration,
) -> BatchReport {
    let count = |kind: VerdictKind| verdicts.iter().filter(|v| v.outcome == kind).count();

    let rows = selected
        .iter()
        .enumerate()
        .map(|(position, (index, row))| match verdicts.get(position) {
            Some(v) => RowReport {
                row_index: *index,
                url: v.url.clone(),
                outcome: match v.outcome {
                    VerdictKind::Success => RowOutcome::Success,
                    VerdictKind::SoftFail => RowOutcome::SoftFail,
                    VerdictKind::HardFail => RowOutcome::HardFail,
                },
                diagnostic: v.diagnostic.clone(),
            },
            None => RowReport {
                row_index: *index,
                url: row.final_url.clone(),
                outcome: RowOutcome::Skipped,
                diagnostic: None,
            },
        })
        .collect();

    BatchReport {
        selected: selected.len(),
        processed: verdicts.len(),
        succeeded: count(VerdictKind::Success),
        soft_failed: count(VerdictKind::SoftFail),
        hard_failed: count(VerdictKind::HardFail),
        skipped: selected.len() - verdicts.len(),
        elapsed_seconds: elapsed.as_secs_f64(),
        stop_reason,
        rows,
    }
}
