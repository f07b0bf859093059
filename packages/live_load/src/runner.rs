use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::checks::{RunMetrics, RunSummary};
use crate::config::Settings;
use crate::session;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// Run `settings.vus` independent virtual users until `settings.duration`
/// has passed, then summarise.
pub async fn run(settings: Arc<Settings>) -> Result<RunSummary> {
    let client = http_client()?;
    let metrics = Arc::new(RunMetrics::new());
    let deadline = Instant::now() + settings.duration;

    info!(
        target_url = %settings.endpoint.http_url(),
        vus = settings.vus,
        duration_secs = settings.duration.as_secs(),
        "starting load run"
    );

    let mut tasks = JoinSet::new();
    for vu in 0..settings.vus {
        let client = client.clone();
        let settings = settings.clone();
        let metrics = metrics.clone();
        tasks.spawn(
            async move { virtual_user(&client, &settings, &metrics, deadline).await }
                .instrument(info_span!("vu", vu)),
        );
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "virtual user task failed");
        }
    }

    let summary = metrics.summary();
    info!(
        sessions = summary.sessions.started,
        failed = summary.sessions.failed,
        "load run finished"
    );
    Ok(summary)
}

/// Repeat whole sessions until the run deadline. A failed session is
/// recorded and the next iteration starts from a fresh page fetch. No
/// session outlives the run deadline.
async fn virtual_user(
    client: &reqwest::Client,
    settings: &Settings,
    metrics: &RunMetrics,
    deadline: Instant,
) {
    let mut iteration = 0u64;
    while Instant::now() < deadline {
        iteration += 1;
        metrics.session_started();
        match session::run_session(client, settings, metrics, deadline).await {
            Ok(report) => {
                metrics.session_completed();
                debug!(
                    iteration,
                    topic = %report.topic,
                    events = report.events_sent,
                    received = report.frames_received,
                    "session finished"
                );
            }
            Err(err) => {
                metrics.session_failed(err.error_code());
                warn!(iteration, error_code = err.error_code(), error = %err, "session failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use live_channel::{Endpoint, ExchangePlan};

    fn settings(host: String, vus: usize) -> Settings {
        Settings {
            endpoint: Endpoint::new(host, false),
            vus,
            duration: Duration::from_millis(200),
            session_budget: Duration::from_millis(100),
            plan: ExchangePlan {
                event_name: "run_code".into(),
                field: "code".into(),
                samples: vec!["(+ 1 2)".to_string()].into(),
                max_messages: 1,
                pace: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn unreachable_target_fails_sessions_without_aborting() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let summary = run(Arc::new(settings(addr.to_string(), 2))).await.unwrap();
        assert!(summary.sessions.started >= 2);
        assert_eq!(summary.sessions.completed, 0);
        assert_eq!(summary.sessions.failed, summary.sessions.started);
        assert!(summary.failures.contains_key("http"));
        assert!(!summary.all_passed());
    }

    #[tokio::test]
    async fn silent_target_stops_at_the_run_deadline() {
        use axum::{Router, extract::ws::WebSocketUpgrade, response::Html, routing::get};

        const PAGE: &str = r#"<html><head><meta name="csrf-token" content="abc"></head>
<body><div id="phx-1" data-phx-main data-phx-session="s" data-phx-static="t"></div></body></html>"#;

        // Accepts the socket and reads until the client leaves.
        let router = Router::new()
            .route("/", get(|| async { Html(PAGE) }))
            .route(
                "/live/websocket",
                get(|upgrade: WebSocketUpgrade| async move {
                    upgrade.on_upgrade(|mut socket| async move {
                        while let Some(Ok(_)) = socket.recv().await {}
                    })
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut s = settings(addr.to_string(), 2);
        s.duration = Duration::from_millis(300);
        s.session_budget = Duration::from_secs(30);

        let started = Instant::now();
        let summary = tokio::time::timeout(Duration::from_secs(5), run(Arc::new(s)))
            .await
            .expect("run outlived its duration")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(summary.sessions.started, 2);
        assert_eq!(summary.sessions.completed, 2);
        // Each join was still unanswered when the run ended.
        let join = summary
            .checks
            .iter()
            .find(|c| c.name == crate::checks::JOIN_REPLY_OK)
            .unwrap();
        assert_eq!((join.passed, join.failed), (0, 2));
        assert!(!summary.all_passed());
    }

    #[tokio::test]
    async fn zero_duration_runs_nothing() {
        let mut s = settings("127.0.0.1:1".to_string(), 3);
        s.duration = Duration::ZERO;
        let summary = run(Arc::new(s)).await.unwrap();
        assert_eq!(summary.sessions.started, 0);
        assert!(summary.all_passed());
    }
}
