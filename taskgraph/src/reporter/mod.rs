//! Pushes run progress to an HTTP endpoint.
//!
//! The reporter is advisory: every request failure is logged and otherwise
//! ignored, and the run behaves the same with or without it.
//!
//! Endpoints, relative to [`ReporterConfig::base_url`]:
//!
//! - `POST /api/push_structure` once, with the boxed tree drawing.
//! - `GET /api/get_interval` each round; the server may slow us down.
//! - `POST /api/push_status` with one [`StageSnapshot`] per stage.
//! - `POST /api/push_errors` with the fail records added since the last push.

use crate::config::ReporterConfig;
use crate::graph::{snapshot_all, StageSnapshot};
use crate::stage::Stage;
use crate::task::FailRecord;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const MAX_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct IntervalReply {
    interval: f64,
}

#[derive(Debug, Serialize)]
struct StructurePayload<'a> {
    structure: &'a [String],
}

/// Clamps a server-provided interval to 1..=60 seconds.
fn clamp_interval(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds).clamp(MIN_INTERVAL, MAX_INTERVAL))
}

/// HTTP client for the reporting endpoint.
#[derive(Debug, Clone)]
pub struct ReporterClient {
    client: Client,
    base_url: String,
    fallback_interval: Duration,
}

impl ReporterClient {
    /// Builds a client from the configuration.
    pub fn new(config: &ReporterConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fallback_interval: config.interval().clamp(MIN_INTERVAL, MAX_INTERVAL),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) {
        let url = self.url(path);
        match self.client.post(&url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(url = %url, status = %resp.status(), "Reporter push rejected"),
            Err(e) => warn!(url = %url, error = %e, "Reporter push failed"),
        }
    }

    /// Sends the graph drawing.
    pub async fn push_structure(&self, structure: &[String]) {
        self.post("/api/push_structure", &StructurePayload { structure }).await;
    }

    /// Sends stage snapshots.
    pub async fn push_status(&self, snapshots: &[StageSnapshot]) {
        self.post("/api/push_status", snapshots).await;
    }

    /// Sends fail records.
    pub async fn push_errors(&self, records: &[FailRecord]) {
        self.post("/api/push_errors", records).await;
    }

    /// Asks the server how long to wait, falling back to the configured
    /// interval.
    pub async fn get_interval(&self) -> Duration {
        let url = self.url("/api/get_interval");
        let reply = match self.client.get(&url).send().await {
            Ok(resp) => resp.json::<IntervalReply>().await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(reply) => clamp_interval(reply.interval).unwrap_or(self.fallback_interval),
            Err(e) => {
                debug!(url = %url, error = %e, "Using the configured report interval");
                self.fallback_interval
            }
        }
    }
}

/// Background reporting task for one run.
#[derive(Debug)]
pub struct Reporter {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Reporter {
    /// Starts pushing progress for `stages` until [`Reporter::finish`].
    ///
    /// Returns `None` when the HTTP client cannot be built.
    pub fn spawn(
        config: &ReporterConfig,
        stages: Vec<Stage>,
        records: Arc<Mutex<Vec<FailRecord>>>,
        structure: Vec<String>,
    ) -> Option<Self> {
        let client = match ReporterClient::new(config) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Reporter disabled");
                return None;
            }
        };
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            client.push_structure(&structure).await;
            let mut sent = 0;
            loop {
                let interval = client.get_interval().await;
                push_round(&client, &stages, &records, &mut sent).await;
                tokio::select! {
                    _ = &mut stopped => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            push_round(&client, &stages, &records, &mut sent).await;
        });

        Some(Self { stop, handle })
    }

    /// Makes the final push and waits for the task to end.
    pub async fn finish(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Reporter task failed");
        }
    }
}

/// Pushes the stage snapshots and the fail records after index `sent`.
async fn push_round(
    client: &ReporterClient,
    stages: &[Stage],
    records: &Mutex<Vec<FailRecord>>,
    sent: &mut usize,
) {
    client.push_status(&snapshot_all(stages)).await;
    let fresh: Vec<FailRecord> = records
        .lock()
        .get(*sent..)
        .map(<[FailRecord]>::to_vec)
        .unwrap_or_default();
    if !fresh.is_empty() {
        client.push_errors(&fresh).await;
        *sent += fresh.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageFunction;
    use crate::task::{TaskError, TaskKey};
    use serde_json::{json, Value};

    #[test]
    fn test_clamp_interval() {
        assert_eq!(clamp_interval(0.2), Some(MIN_INTERVAL));
        assert_eq!(clamp_interval(500.0), Some(MAX_INTERVAL));
        assert_eq!(clamp_interval(3.0), Some(Duration::from_secs(3)));
        assert_eq!(clamp_interval(-1.0), None);
        assert_eq!(clamp_interval(f64::NAN), None);
    }

    #[tokio::test]
    async fn test_interval_from_server_and_fallback() {
        let mut server = mockito::Server::new_async().await;
        let config = ReporterConfig::new(server.url()).with_interval(7.0);
        let client = ReporterClient::new(&config).unwrap();

        let ok = server
            .mock("GET", "/api/get_interval")
            .with_body(r#"{"interval": 2}"#)
            .create_async()
            .await;
        assert_eq!(client.get_interval().await, Duration::from_secs(2));
        ok.assert_async().await;
        ok.remove_async().await;

        let bad = server
            .mock("GET", "/api/get_interval")
            .with_status(500)
            .create_async()
            .await;
        assert_eq!(client.get_interval().await, Duration::from_secs(7));
        bad.assert_async().await;
    }

    #[tokio::test]
    async fn test_reporter_pushes_everything() {
        let mut server = mockito::Server::new_async().await;
        let structure = server
            .mock("POST", "/api/push_structure")
            .match_body(mockito::Matcher::PartialJson(json!({"structure": ["tree"]})))
            .create_async()
            .await;
        let interval = server
            .mock("GET", "/api/get_interval")
            .with_body(r#"{"interval": 60}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        let status = server
            .mock("POST", "/api/push_status")
            .expect_at_least(2)
            .create_async()
            .await;
        let errors = server
            .mock("POST", "/api/push_errors")
            .match_body(mockito::Matcher::Regex("ReadTimeout".to_string()))
            .expect_at_least(1)
            .create_async()
            .await;

        let stage = Stage::new("A", StageFunction::named("f"));
        let records = Arc::new(Mutex::new(vec![FailRecord::new(
            "A[f]",
            &TaskKey::of(&json!(1)),
            &TaskError::new("ReadTimeout", "slow"),
        )]));
        let reporter = Reporter::spawn(
            &ReporterConfig::new(server.url()),
            vec![stage],
            records,
            vec!["tree".to_string()],
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        reporter.finish().await;

        structure.assert_async().await;
        interval.assert_async().await;
        status.assert_async().await;
        errors.assert_async().await;
    }

    #[tokio::test]
    async fn test_reporter_pushes_each_error_once() {
        let mut server = mockito::Server::new_async().await;
        let _interval = server
            .mock("GET", "/api/get_interval")
            .with_body(r#"{"interval": 60}"#)
            .create_async()
            .await;
        let _status = server.mock("POST", "/api/push_status").create_async().await;
        let _structure = server.mock("POST", "/api/push_structure").create_async().await;
        let first = server
            .mock("POST", "/api/push_errors")
            .match_body(mockito::Matcher::Regex("ReadTimeout".to_string()))
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/api/push_errors")
            .match_body(mockito::Matcher::Regex("ConnectError".to_string()))
            .expect(1)
            .create_async()
            .await;

        let record = |task: Value, kind: &str| {
            FailRecord::new("A[f]", &TaskKey::of(&task), &TaskError::new(kind, "down"))
        };
        let records = Arc::new(Mutex::new(vec![record(json!(1), "ReadTimeout")]));
        let reporter = Reporter::spawn(
            &ReporterConfig::new(server.url()),
            vec![Stage::new("A", StageFunction::named("f"))],
            records.clone(),
            Vec::new(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        records.lock().push(record(json!(2), "ConnectError"));
        reporter.finish().await;

        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_harmless() {
        let config = ReporterConfig::new("http://127.0.0.1:9").with_interval(1.0);
        let reporter = Reporter::spawn(
            &config,
            Vec::new(),
            Arc::new(Mutex::new(Vec::new())),
            Vec::new(),
        )
        .unwrap();
        reporter.finish().await;
    }
}
