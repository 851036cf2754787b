use mockito::Matcher;
use rescrape::{
    config::RescrapeConfig,
    extractor::ContentExtractor,
    llm::LLMProcessor,
    orchestrator::RowOutcome,
    BatchOrchestrator, MemoryRowStore, Row, Status, FETCH_FAILURE_MARKER,
};
use std::sync::Arc;

const SUMMARY: &str = "疎な注意機構により長文処理のメモリ使用量を半減させ、密な注意と同等の精度を保つ手法を提案した論文。";

fn error_row(url: &str) -> Row {
    Row {
        timestamp: "2024-01-01 00:00:00".to_string(),
        final_url: url.to_string(),
        status: Status::Error,
        error_status: "HTTP error 503".to_string(),
        ..Row::default()
    }
}

fn config_for(server: &mockito::ServerGuard) -> RescrapeConfig {
    let mut config = RescrapeConfig::default();
    config.processing.request_delay_seconds = 0.0;
    config.processing.retry_backoff_seconds = 0.0;
    config.processing.fetch_timeout_seconds = 5;
    config.scraping.arxiv_mirrors = vec![server.url()];
    config.llm_config.endpoint = format!("{}/api/generate", server.url());
    config
}

#[tokio::test]
async fn test_full_batch_against_mock_sites() {
    let mut server = mockito::Server::new_async().await;

    server
        .mock("GET", "/abs/2401.12345")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(
            r#"<html><body>
            <h1 class="title"><span class="descriptor">Title:</span>Sparse Attention for Long Documents</h1>
            <div class="authors"><a href="/a/one">A. One</a>, <a href="/a/two">B. Two</a></div>
            <blockquote class="abstract"><span class="descriptor">Abstract:</span>
            We show that learned routing halves attention memory on long inputs.</blockquote>
            </body></html>"#,
        )
        .create_async()
        .await;

    server
        .mock("GET", "/denied")
        .with_status(200)
        .with_header("content-type", "text/html")
        .with_body(
            "<html><head><title>Forbidden</title></head><body><main><p>Access denied. \
             You do not have permission to view this document from your current network.</p></main></body></html>",
        )
        .create_async()
        .await;

    server.mock("GET", "/missing").with_status(404).create_async().await;

    let llm = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(serde_json::json!({ "stream": false })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "response": SUMMARY }).to_string())
        .expect(1)
        .create_async()
        .await;

    let arxiv_url = "https://arxiv.org/abs/2401.12345";
    let denied_url = format!("{}/denied", server.url());
    let missing_url = format!("{}/missing", server.url());

    let store = Arc::new(
        MemoryRowStore::new()
            .with_sheet("Main", vec![])
            .with_sheet(
                "Error",
                vec![error_row(arxiv_url), error_row(&denied_url), error_row(&missing_url)],
            )
            .reject_duplicate_urls("Main"),
    );

    let config = config_for(&server);
    let orchestrator = BatchOrchestrator::new(
        &config,
        store.clone(),
        ContentExtractor::new(&config).unwrap(),
        LLMProcessor::new(config.llm_config.clone()).unwrap(),
    )
    .unwrap();

    let report = orchestrator.run_batch().await.unwrap();

    assert_eq!(report.selected, 3);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.soft_failed, 1);
    assert_eq!(report.hard_failed, 1);
    assert_eq!(report.urls_with(RowOutcome::Success), vec![arxiv_url]);
    llm.assert_async().await;

    let main = store.rows("Main");
    assert_eq!(main.len(), 1);
    assert_eq!(main[0].final_url, arxiv_url);
    assert_eq!(main[0].content, SUMMARY);
    assert_eq!(main[0].status, Status::Done);
    assert_eq!(main[0].url_type, "arxiv");

    let errors = store.rows("Error");
    assert_eq!(errors.len(), 2);

    let denied = &errors[0];
    assert_eq!(denied.final_url, denied_url);
    assert_eq!(denied.status, Status::Error);
    assert!(denied.error_status.starts_with(FETCH_FAILURE_MARKER));
    assert!(denied.content.contains("Access denied"));
    assert_ne!(denied.timestamp, "2024-01-01 00:00:00");

    let missing = &errors[1];
    assert_eq!(missing.final_url, missing_url);
    assert!(missing.error_status.contains("404"));
    assert!(missing.content.is_empty());
}

#[tokio::test]
async fn test_workbook_file_survives_a_run() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/gone").with_status(410).create_async().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workbook.json");
    let gone_url = format!("{}/gone", server.url());

    MemoryRowStore::new()
        .with_sheet("Main", vec![])
        .with_sheet("Error", vec![error_row(&gone_url)])
        .save(&path)
        .unwrap();

    let store = Arc::new(MemoryRowStore::load(&path).unwrap());
    let config = config_for(&server);
    let orchestrator = BatchOrchestrator::new(
        &config,
        store.clone(),
        ContentExtractor::new(&config).unwrap(),
        LLMProcessor::new(config.llm_config.clone()).unwrap(),
    )
    .unwrap();

    let report = orchestrator.run_batch().await.unwrap();
    assert_eq!(report.hard_failed, 1);
    store.save(&path).unwrap();

    let reloaded = MemoryRowStore::load(&path).unwrap();
    let rows = reloaded.rows("Error");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].error_status.contains("410"));
    assert!(reloaded.rows("Main").is_empty());
}
