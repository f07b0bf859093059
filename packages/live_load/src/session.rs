//! One simulated browser: fetch the page, scrape the join credentials, open
//! the LiveView socket and let a [`SessionDriver`] pace the exchange.

use futures::{SinkExt, StreamExt};
use live_channel::{Action, Bootstrap, ChannelError, Endpoint, ReplyKind, SessionDriver, Topic};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{
    self, Message,
    client::IntoClientRequest,
    handshake::client::Request,
    http::{HeaderValue, StatusCode, header::ORIGIN},
};
use tracing::{debug, warn};

use crate::checks::{self, RunMetrics};
use crate::config::Settings;

/// How long to wait for our close frame to go out.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("bootstrap fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid origin header: {0}")]
    InvalidOrigin(String),

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("session deadline passed during {stage}")]
    Timeout { stage: &'static str },
}

impl SessionError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Http(_) => "http",
            Self::InvalidOrigin(_) => "invalid_origin",
            Self::Transport(_) => "transport",
            Self::Channel(err) => err.error_code(),
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// What a finished session did.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub topic: Topic,
    pub events_sent: usize,
    pub frames_received: u64,
}

/// GET the application root and extract the join credentials.
pub async fn fetch_bootstrap(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    metrics: &RunMetrics,
) -> Result<Bootstrap, SessionError> {
    let response = client.get(endpoint.http_url()).send().await?;
    let status = response.status();
    let body = response.text().await?;

    metrics
        .checks
        .record(checks::HTTP_OK, status == reqwest::StatusCode::OK);
    metrics.checks.record(
        checks::CSRF_PRESENT,
        body.contains(r#"meta name="csrf-token""#),
    );

    let bootstrap = Bootstrap::extract(&body);
    metrics
        .checks
        .record(checks::CREDENTIALS_FOUND, bootstrap.is_ok());
    Ok(bootstrap?)
}

/// Handshake request for the channel socket, with the page's origin.
pub fn socket_request(endpoint: &Endpoint, csrf_token: &str) -> Result<Request, SessionError> {
    let mut request = endpoint.socket_url(csrf_token).into_client_request()?;
    let origin = endpoint.origin();
    let value =
        HeaderValue::from_str(&origin).map_err(|_| SessionError::InvalidOrigin(origin.clone()))?;
    request.headers_mut().insert(ORIGIN, value);
    Ok(request)
}

/// Run one full session against the configured endpoint.
///
/// The session budget starts now and covers the page fetch, the handshake
/// and the exchange. It never reaches past `run_deadline`.
pub async fn run_session(
    client: &reqwest::Client,
    settings: &Settings,
    metrics: &RunMetrics,
    run_deadline: Instant,
) -> Result<SessionReport, SessionError> {
    let deadline = (Instant::now() + settings.session_budget).min(run_deadline);
    let endpoint = &settings.endpoint;

    let bootstrap = tokio::time::timeout_at(deadline, fetch_bootstrap(client, endpoint, metrics))
        .await
        .map_err(|_| SessionError::Timeout { stage: "bootstrap" })??;
    let driver = SessionDriver::new(&bootstrap, endpoint.http_url(), settings.plan.clone());

    let request = socket_request(endpoint, &bootstrap.credentials.csrf_token)?;
    let connected =
        match tokio::time::timeout_at(deadline, tokio_tungstenite::connect_async(request)).await {
            Ok(connected) => connected,
            Err(_) => {
                metrics.checks.record(checks::WS_UPGRADED, false);
                debug!(topic = %driver.topic(), "websocket handshake did not finish in time");
                let phase = driver.phase();
                return Err(ChannelError::Transport { phase }.into());
            }
        };
    metrics.checks.record(
        checks::WS_UPGRADED,
        matches!(&connected, Ok((_, resp)) if resp.status() == StatusCode::SWITCHING_PROTOCOLS),
    );
    let (ws_stream, _) = connected?;
    debug!(topic = %driver.topic(), "websocket connection opened");

    exchange(ws_stream, driver, deadline, metrics).await
}

/// Drive `driver` over an open socket until it closes or `deadline` passes.
pub async fn exchange<S>(
    ws_stream: WebSocketStream<S>,
    mut driver: SessionDriver,
    deadline: Instant,
    metrics: &RunMetrics,
) -> Result<SessionReport, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let topic = driver.topic().clone();
    let mut frames_received = 0u64;

    let deadline = tokio::time::sleep_until(deadline);
    tokio::pin!(deadline);
    let pace = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(pace);
    let mut pace_armed = false;

    let mut pending: VecDeque<Action> = driver.opened().into();

    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Send(frame) => {
                    debug!(%topic, event = %frame.event, msg_ref = ?frame.msg_ref, "sending frame");
                    ws_write.send(Message::Text(frame.encode().into())).await?;
                    metrics.frame_sent();
                }
                Action::Pause(delay) => {
                    pace.as_mut()
                        .reset(tokio::time::Instant::now() + delay);
                    pace_armed = true;
                }
                Action::Check(check) => {
                    let name = match check.kind {
                        ReplyKind::Join => checks::JOIN_REPLY_OK,
                        ReplyKind::Event => checks::EVENT_REPLY_OK,
                    };
                    metrics.checks.record(name, check.passed());
                    if let Err(err) = check.result() {
                        warn!(%topic, seq = check.seq, error_code = err.error_code(), "{err}");
                    }
                }
                Action::Close => {
                    // The peer may already be gone; "close sent" style errors are expected.
                    if let Ok(Err(err)) = tokio::time::timeout(CLOSE_TIMEOUT, ws_write.close()).await
                    {
                        debug!(%topic, error = %err, "error while closing websocket");
                    }
                    driver.transport_closed()?;
                    debug!(%topic, "websocket connection closed");
                    return Ok(SessionReport {
                        topic,
                        events_sent: driver.sent_events(),
                        frames_received,
                    });
                }
            }
        }

        let actions = tokio::select! {
            msg = ws_read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    frames_received += 1;
                    metrics.frame_received();
                    debug!(%topic, message = %text.as_str(), "received message");
                    driver.received(text.as_str())?
                }
                Some(Ok(Message::Close(_))) | None => {
                    driver.transport_closed()?;
                    return Ok(SessionReport {
                        topic,
                        events_sent: driver.sent_events(),
                        frames_received,
                    });
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(err)) => {
                    debug!(%topic, error = %err, "websocket read failed");
                    driver.transport_closed()?;
                    return Err(err.into());
                }
            },
            () = &mut pace, if pace_armed => {
                pace_armed = false;
                driver.pace_elapsed()
            }
            () = &mut deadline => driver.deadline_elapsed(),
        };
        pending.extend(actions);
    }
}
