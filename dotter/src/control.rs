//! The HTTP control interface.
//!
//! Exposes the [`Scheduler`] lifecycle over a small JSON API:
//!
//! * `GET /config` reports the latest task's deadline and interval, empty
//!   until a task has been started.
//! * `POST /reset` replaces the running task and resets the line counter.
//! * `POST /stop` stops the running task.
//!
//! Any query parameter bound to an empty value is rejected before routing.
//!
//! ## Metrics
//!
//! `requests_received`: Total requests received, labeled by route
//! `connection.current`: Connections currently served
//! `connection.limit`: Configured connection limit
//!

use std::{collections::BTreeMap, convert::Infallible, fmt, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::scheduler::{self, CounterReset, Scheduler};

fn default_concurrent_requests_max() -> usize {
    100
}

/// Errors produced by [`Control`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Configuration for [`Control`]
pub struct Config {
    /// address -- IP plus port -- to bind to
    pub binding_addr: SocketAddr,
    /// number of concurrent HTTP connections to allow
    pub concurrent_requests_max: usize,
}

impl Config {
    /// Create a new [`Config`] with the default connection limit.
    #[must_use]
    pub fn new(binding_addr: SocketAddr) -> Self {
        Self {
            binding_addr,
            concurrent_requests_max: default_concurrent_requests_max(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResetRequest {
    /// minutes
    #[serde(default)]
    timeout: u64,
    /// milliseconds
    #[serde(default)]
    interval: u64,
    burst_size: Option<u32>,
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

#[derive(Debug)]
/// The HTTP control server.
pub struct Control {
    httpd_addr: SocketAddr,
    concurrency_limit: usize,
    scheduler: Arc<Scheduler>,
    shutdown: dotter_signal::Watcher,
}

impl Control {
    /// Create a new [`Control`] server instance
    #[must_use]
    pub fn new(
        config: &Config,
        scheduler: Arc<Scheduler>,
        shutdown: dotter_signal::Watcher,
    ) -> Self {
        Self {
            httpd_addr: config.binding_addr,
            concurrency_limit: config.concurrent_requests_max,
            scheduler,
            shutdown,
        }
    }

    /// Run [`Control`] to completion
    ///
    /// Binds the configured address and serves until a shutdown signal is
    /// received.
    ///
    /// # Errors
    ///
    /// Function will return an error if the address cannot be bound.
    pub async fn run(self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.httpd_addr).await?;
        info!("control interface listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound `listener` until a shutdown
    /// signal is received.
    ///
    /// # Errors
    ///
    /// None at present, connection level errors are logged and dropped.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        let Self {
            concurrency_limit,
            scheduler,
            shutdown,
            ..
        } = self;
        let sem = Arc::new(Semaphore::new(concurrency_limit));
        let mut join_set = JoinSet::new();

        gauge!("connection.limit").set(concurrency_limit as f64);

        let shutdown_fut = shutdown.recv();
        pin!(shutdown_fut);
        loop {
            let claimed_permits = concurrency_limit - sem.available_permits();
            gauge!("connection.current").set(claimed_permits as f64);

            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("Shutdown signal received, stopping accept loop.");
                    break;
                }

                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {addr}");

                    let sem = Arc::clone(&sem);
                    let scheduler = Arc::clone(&scheduler);

                    join_set.spawn(async move {
                        let permit = match sem.try_acquire() {
                            Ok(p) => p,
                            Err(TryAcquireError::Closed) => {
                                error!("Semaphore closed");
                                return;
                            }
                            Err(TryAcquireError::NoPermits) => {
                                warn!("control interface over connection capacity, load shedding");
                                drop(stream);
                                return;
                            }
                        };

                        let service = hyper::service::service_fn(move |req| {
                            srv(req, Arc::clone(&scheduler))
                        });
                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            error!("Error serving {addr}: {e}");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(listener);
        // Keep-alive connections would otherwise hold shutdown open, and with
        // them their handle on the scheduler.
        join_set.shutdown().await;
        Ok(())
    }
}

/// Route a single request.
///
/// Generic over the body so that it can be driven without a socket.
pub(crate) async fn srv<B>(
    req: Request<B>,
    scheduler: Arc<Scheduler>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: fmt::Display,
{
    if let Some(response) = reject_empty_params(req.uri().query()) {
        return Ok(response);
    }

    let (parts, body) = req.into_parts();
    let response = match (&parts.method, parts.uri.path()) {
        (&Method::GET, "/config") => {
            counter!("requests_received", "route" => "config").increment(1);
            current_config(&scheduler)
        }
        (&Method::POST, "/reset") => {
            counter!("requests_received", "route" => "reset").increment(1);
            match body.collect().await {
                Ok(collected) => reset(&collected.to_bytes(), &scheduler).await,
                Err(e) => message(StatusCode::BAD_REQUEST, &format!("failed to read body: {e}")),
            }
        }
        (&Method::POST, "/stop") => {
            counter!("requests_received", "route" => "stop").increment(1);
            if !scheduler.stop().await {
                debug!("stop requested while idle");
            }
            message(StatusCode::OK, "success")
        }
        (_, "/config" | "/reset" | "/stop") => {
            counter!("requests_received", "route" => "unknown").increment(1);
            message(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        (method, path) => {
            debug!("Unknown route: {method} {path}");
            counter!("requests_received", "route" => "unknown").increment(1);
            message(StatusCode::NOT_FOUND, "not found")
        }
    };
    Ok(response)
}

fn reject_empty_params(query: Option<&str>) -> Option<Response<Full<Bytes>>> {
    let query = query?;
    match serde_qs::from_str::<BTreeMap<String, String>>(query) {
        Ok(params) => params
            .iter()
            .find(|(_, value)| value.is_empty())
            .map(|(key, _)| {
                message(
                    StatusCode::BAD_REQUEST,
                    &format!("params[{key}] is required!"),
                )
            }),
        Err(e) => Some(message(
            StatusCode::BAD_REQUEST,
            &format!("malformed query: {e}"),
        )),
    }
}

fn current_config(scheduler: &Scheduler) -> Response<Full<Bytes>> {
    // One read, so state and snapshot always agree.
    let state = scheduler.state();
    let Some(snapshot) = state.snapshot() else {
        return json_response(
            StatusCode::OK,
            &json!({
                "deadline": "",
                "interval": "",
                "state": state.name(),
            }),
        );
    };

    match snapshot.deadline.format(&Rfc3339) {
        Ok(deadline) => json_response(
            StatusCode::OK,
            &json!({
                "deadline": deadline,
                "interval": snapshot.interval_millis,
                "timeout": snapshot.timeout_minutes,
                "burst_size": snapshot.burst_size,
                "state": state.name(),
            }),
        ),
        Err(e) => {
            error!("Could not format deadline: {e}");
            message(StatusCode::INTERNAL_SERVER_ERROR, "could not format deadline")
        }
    }
}

async fn reset(body: &[u8], scheduler: &Scheduler) -> Response<Full<Bytes>> {
    let request: ResetRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => return message(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    if request.timeout == 0 || request.interval == 0 {
        return message(StatusCode::BAD_REQUEST, "timeout, interval is required");
    }

    let mut config = scheduler::Config::new(request.interval, request.timeout);
    if let Some(burst_size) = request.burst_size {
        config = config.with_burst_size(burst_size);
    }

    match scheduler.restart(config, CounterReset::Reset).await {
        Ok(snapshot) => {
            info!(
                generation = snapshot.generation,
                interval_millis = snapshot.interval_millis,
                timeout_minutes = snapshot.timeout_minutes,
                burst_size = snapshot.burst_size,
                "burst task reset"
            );
            message(StatusCode::OK, "success")
        }
        Err(scheduler::Error::ShuttingDown) => message(
            StatusCode::SERVICE_UNAVAILABLE,
            &scheduler::Error::ShuttingDown.to_string(),
        ),
        Err(e) => message(StatusCode::BAD_REQUEST, &e.to_string()),
    }
}

fn message(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &Message { message })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => {
            error!("Error serializing response: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"message":"internal error"}"#.to_vec(),
            )
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{Method, Request, StatusCode};
    use http_body_util::{BodyExt, Full};
    use serde_json::Value;
    use tokio::time::{Duration, sleep};

    use super::srv;
    use crate::{
        counter::LineCounter,
        emitter::test::CountingSink,
        scheduler::{self, Scheduler, State, StopReason},
    };

    fn scheduler() -> (Arc<Scheduler>, dotter_signal::Broadcaster) {
        let (shutdown, broadcaster) = dotter_signal::signal();
        let (scheduler, _failures) = Scheduler::new(
            Arc::new(CountingSink::default()),
            Arc::new(LineCounter::new()),
            shutdown,
        );
        (Arc::new(scheduler), broadcaster)
    }

    async fn call(
        scheduler: &Arc<Scheduler>,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .expect("request must build");
        let response = srv(request, Arc::clone(scheduler))
            .await
            .expect("routing is infallible");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("full body is infallible")
            .to_bytes();
        let value = serde_json::from_slice(&bytes).expect("responses are json");
        (status, value)
    }

    #[tokio::test(start_paused = true)]
    async fn config_is_empty_when_idle() {
        let (scheduler, _shutdown) = scheduler();
        let (status, body) = call(&scheduler, Method::GET, "/config", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deadline"], "");
        assert_eq!(body["interval"], "");
        assert_eq!(body["state"], "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_then_stop_drives_the_scheduler() {
        let (scheduler, _shutdown) = scheduler();

        let (status, body) = call(
            &scheduler,
            Method::POST,
            "/reset",
            r#"{"timeout": 1, "interval": 100, "burst_size": 10}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "success");

        sleep(Duration::from_millis(350)).await;
        assert_eq!(scheduler.counter().get(), 30);

        let (status, running) = call(&scheduler, Method::GET, "/config", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(running["interval"], 100);
        assert_eq!(running["timeout"], 1);
        assert_eq!(running["burst_size"], 10);
        assert_eq!(running["state"], "running");
        assert!(running["deadline"].as_str().is_some_and(|d| !d.is_empty()));

        let (status, body) = call(&scheduler, Method::POST, "/stop", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "success");

        sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.counter().get(), 30);

        let (_, stopped) = call(&scheduler, Method::GET, "/config", "").await;
        assert_eq!(stopped["state"], "stopped");
        assert_eq!(stopped["interval"], 100);
        assert_eq!(stopped["deadline"], running["deadline"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_rejects_zero_fields_and_keeps_running_task() {
        let (scheduler, _shutdown) = scheduler();
        let snapshot = scheduler
            .start(scheduler::Config::new(100, 1).with_burst_size(1))
            .await
            .expect("valid config must start");

        let (status, body) = call(
            &scheduler,
            Method::POST,
            "/reset",
            r#"{"timeout": 0, "interval": 5}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "timeout, interval is required");

        let (status, _) = call(&scheduler, Method::POST, "/reset", r#"{"timeout": 3}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(scheduler.state(), State::Running(snapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_rejects_malformed_body_and_oversized_burst() {
        let (scheduler, _shutdown) = scheduler();

        let (status, body) = call(&scheduler, Method::POST, "/reset", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));

        let (status, _) = call(
            &scheduler,
            Method::POST,
            "/reset",
            r#"{"timeout": 1, "interval": 100, "burst_size": 150001}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(scheduler.state(), State::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_zeroes_the_counter() {
        let (scheduler, _shutdown) = scheduler();
        scheduler
            .start(scheduler::Config::new(100, 1).with_burst_size(10))
            .await
            .expect("valid config must start");
        sleep(Duration::from_millis(250)).await;
        assert_eq!(scheduler.counter().get(), 20);

        let (status, _) = call(
            &scheduler,
            Method::POST,
            "/reset",
            r#"{"timeout": 1, "interval": 100, "burst_size": 10}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scheduler.counter().get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_never_started_succeeds() {
        let (scheduler, _shutdown) = scheduler();
        let (status, body) = call(&scheduler, Method::POST, "/stop", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "success");
        assert_eq!(scheduler.state(), State::Idle);

        let (status, _) = call(&scheduler, Method::POST, "/stop", "").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_query_parameter_is_rejected_before_routing() {
        let (scheduler, _shutdown) = scheduler();
        let (status, body) = call(
            &scheduler,
            Method::POST,
            "/reset?name=",
            r#"{"timeout": 1, "interval": 100}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "params[name] is required!");
        assert_eq!(scheduler.state(), State::Idle);

        let (status, _) = call(&scheduler, Method::GET, "/config?verbose=1", "").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_routes_and_methods() {
        let (scheduler, _shutdown) = scheduler();
        let (status, _) = call(&scheduler, Method::GET, "/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&scheduler, Method::GET, "/stop", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_visible_through_config() {
        let (scheduler, _shutdown) = scheduler();
        let mut state = scheduler.subscribe();
        scheduler
            .start(scheduler::Config::new(1_000, 1).with_burst_size(1))
            .await
            .expect("valid config must start");

        let stopped = *state
            .wait_for(|s| !s.is_running())
            .await
            .expect("scheduler is alive");
        assert!(matches!(
            stopped,
            State::Stopped {
                reason: StopReason::Deadline,
                ..
            }
        ));

        let (_, body) = call(&scheduler, Method::GET, "/config", "").await;
        assert_eq!(body["state"], "stopped");
        assert_eq!(body["interval"], 1_000);
        assert!(body["deadline"].as_str().is_some_and(|d| !d.is_empty()));
    }
}
