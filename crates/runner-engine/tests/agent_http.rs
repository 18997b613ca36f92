use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use paceforge_core::Authority;
use paceforge_engine::{
    execute_inline, AgentCommand, AgentConfig, EngineError, PoliteAgent, Scheduler,
    SchedulerConfig, ThrottleConfig,
};

fn quick_agent(authority: &str) -> Arc<PoliteAgent> {
    Arc::new(
        PoliteAgent::new(
            Authority::new(authority),
            AgentConfig {
                throttle: ThrottleConfig {
                    min_delay: Duration::from_millis(20),
                    max_delay: Duration::from_millis(20),
                    max_load_pct: 0.0,
                    crawl_delay: None,
                    compliant: true,
                },
                ..AgentConfig::default()
            },
        )
        .expect("agent construction"),
    )
}

#[tokio::test]
async fn get_returns_the_page_and_records_the_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/applications"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("three records")
                .insert_header("content-type", "text/html; charset=utf-8"),
        )
        .mount(&server)
        .await;

    let agent = quick_agent("ballina");
    let url = Url::parse(&format!("{}/applications", server.uri())).unwrap();

    let payload = execute_inline(&agent, AgentCommand::Get(url)).await.unwrap();
    assert_eq!(payload.status, 200);
    assert_eq!(payload.body, "three records");
    assert!(payload
        .content_type
        .as_deref()
        .unwrap_or_default()
        .starts_with("text/html"));
    assert!(agent.next_allowed_at().is_some());
}

#[tokio::test]
async fn post_submits_the_form_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_string_contains("date_from=2025-02-01"))
        .respond_with(ResponseTemplate::new(200).set_body_string("results"))
        .mount(&server)
        .await;

    let agent = quick_agent("bega");
    let url = Url::parse(&format!("{}/search", server.uri())).unwrap();
    let command = AgentCommand::Post {
        url,
        form: vec![("date_from".to_string(), "2025-02-01".to_string())],
    };

    let payload = execute_inline(&agent, command).await.unwrap();
    assert_eq!(payload.body, "results");
}

#[tokio::test]
async fn an_unreachable_host_surfaces_a_transport_error() {
    let agent = quick_agent("offline");
    let url = Url::parse("http://127.0.0.1:9/nothing").unwrap();

    let err = execute_inline(&agent, AgentCommand::Get(url))
        .await
        .expect_err("request must fail");
    match err {
        EngineError::Transport { authority, .. } => {
            assert_eq!(authority, Authority::new("offline"));
        }
        other => panic!("expected a transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn scheduled_fetches_pace_themselves_between_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let mut scheduler = Scheduler::new(SchedulerConfig {
        poll_period: Duration::from_millis(5),
        ..SchedulerConfig::default()
    });
    let agent = quick_agent("paced");
    let url = Url::parse(&format!("{}/page", server.uri())).unwrap();

    let started = Instant::now();
    scheduler
        .register_operation(Authority::new("paced"), move |mut ctx| async move {
            for _ in 0..2 {
                let payload = ctx.execute(&agent, AgentCommand::Get(url.clone())).await?;
                anyhow::ensure!(payload.status == 200);
            }
            anyhow::Ok(())
        })
        .await
        .unwrap();

    let exceptions = scheduler.run_operations().await;
    assert!(exceptions.is_empty(), "exceptions: {exceptions:?}");

    // The second fetch had to wait out the 20ms politeness delay.
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
