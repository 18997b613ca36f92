use std::path::Path;
use std::process::{Command, Output};

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_roster(dir: &Path, server_uri: &str, authorities: &[&str]) -> std::path::PathBuf {
    let sites: Vec<serde_json::Value> = authorities
        .iter()
        .map(|authority| {
            json!({
                "authority": authority,
                "url_template":
                    format!("{server_uri}/{authority}/records?from={{from}}&to={{to}}"),
            })
        })
        .collect();
    let roster = json!({ "version": 1, "sites": sites });

    let roster_path = dir.join("sites.json");
    std::fs::write(&roster_path, serde_json::to_string_pretty(&roster).unwrap()).unwrap();
    roster_path
}

async fn run_binary(args: Vec<String>, envs: Vec<(String, String)>) -> Output {
    tokio::task::spawn_blocking(move || {
        let mut command = Command::new(env!("CARGO_BIN_EXE_paceforge"));
        command.args(&args);
        // A hermetic environment: no ambient MORPH_* settings leak in.
        for name in [
            "MORPH_AUTHORITIES",
            "MORPH_EXPECT_BAD",
            "MORPH_DISABLE_THREADS",
            "MORPH_MAX_WORKERS",
            "MORPH_DAYS",
            "MORPH_EVERYTIME",
            "MORPH_MAX_PERIOD",
            "MORPH_PROCESS_SEQUENTIALLY",
            "MORPH_AUSTRALIAN_PROXY",
            "MORPH_TIMEOUT",
            "DEBUG",
            "MORPH_DEBUG",
            "VACUUM",
            "PACEFORGE_SITES",
            "PACEFORGE_DATA_DIR",
            "HTTP_PROXY",
            "HTTPS_PROXY",
            "ALL_PROXY",
            "http_proxy",
            "https_proxy",
            "all_proxy",
        ] {
            command.env_remove(name);
        }
        // One "everything" window per site keeps the run to one request.
        command.env("MORPH_DAYS", "1");
        for (name, value) in envs {
            command.env(name, value);
        }
        command.output().expect("spawning the paceforge binary")
    })
    .await
    .unwrap()
}

fn base_args(roster: &Path, data_dir: &Path) -> Vec<String> {
    vec![
        "--sites".to_string(),
        roster.display().to_string(),
        "--data-dir".to_string(),
        data_dir.display().to_string(),
        "--sequential".to_string(),
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_full_run_persists_valid_records_and_exits_zero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ballina/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "council_reference": "DA-2025-001",
                "address": "12 Swift St, Ballina NSW",
                "description": "Dwelling alterations",
                "info_url": "https://da.ballina.example/DA-2025-001"
            },
            {
                "council_reference": "DA-2025-002",
                "address": "",
                "description": "Missing address, must be dropped",
                "info_url": "https://da.ballina.example/DA-2025-002"
            }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bega/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "council_reference": "2025/0441",
                "address": "3 Auckland St, Bega NSW",
                "description": "Shed",
                "info_url": "https://da.bega.example/2025-0441"
            }
        ])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let roster = write_roster(dir.path(), &server.uri(), &["ballina", "bega"]);
    let data_dir = dir.path().join("data");

    let output = run_binary(base_args(&roster, &data_dir), vec![]).await;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let data = std::fs::read_to_string(data_dir.join("data.json")).unwrap();
    assert!(data.contains("DA-2025-001"));
    assert!(data.contains("2025/0441"));
    assert!(!data.contains("DA-2025-002"), "invalid record was persisted");

    let summary = std::fs::read_to_string(data_dir.join("scrape-summary.json")).unwrap();
    assert!(summary.contains("\"records_saved\": 2"));
    let log = std::fs::read_to_string(data_dir.join("scrape-log.json")).unwrap();
    assert!(log.contains("ballina"));
    assert!(log.contains("bega"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn an_unexpected_failure_exits_nonzero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken/records"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let roster = write_roster(dir.path(), &server.uri(), &["broken"]);
    let data_dir = dir.path().join("data");

    let output = run_binary(base_args(&roster, &data_dir), vec![]).await;
    assert_eq!(output.status.code(), Some(1));

    let log = std::fs::read_to_string(data_dir.join("scrape-log.json")).unwrap();
    assert!(log.contains("\"status\": \"failed\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn an_expected_failure_still_exits_zero() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky/records"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let roster = write_roster(dir.path(), &server.uri(), &["flaky"]);
    let data_dir = dir.path().join("data");

    let output = run_binary(
        base_args(&roster, &data_dir),
        vec![("MORPH_EXPECT_BAD".to_string(), "flaky".to_string())],
    )
    .await;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn the_authority_filter_limits_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/only/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    // The "absent" site has no mock; fetching it would fail the run.
    let roster = write_roster(dir.path(), &server.uri(), &["only", "absent"]);
    let data_dir = dir.path().join("data");

    let output = run_binary(
        base_args(&roster, &data_dir),
        vec![("MORPH_AUTHORITIES".to_string(), "only".to_string())],
    )
    .await;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
