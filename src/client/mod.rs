use std::time::{Duration, Instant};

use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body as HyperBody, Client, Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, ConfigError};
use crate::metrics::{
    tagged, MetricRegistry, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED, HTTP_REQ_OUTCOME,
};
use crate::models::metrics::MetricKind;

pub type HttpsClient = Client<HttpsConnector<HttpConnector>>;

pub fn build_client() -> HttpsClient {
    let https = HttpsConnector::new();
    Client::builder().build::<_, HyperBody>(https)
}

/// A request with every template already rendered.
#[derive(Debug, Clone)]
pub struct RenderedRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RenderedBody>,
}

#[derive(Debug, Clone)]
pub struct RenderedBody {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    HttpError,
    TransportError,
    Timeout,
    Cancelled,
}

impl RequestOutcome {
    pub const ALL: [RequestOutcome; 5] = [
        RequestOutcome::Success,
        RequestOutcome::HttpError,
        RequestOutcome::TransportError,
        RequestOutcome::Timeout,
        RequestOutcome::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::HttpError => "http_error",
            RequestOutcome::TransportError => "transport_error",
            RequestOutcome::Timeout => "timeout",
            RequestOutcome::Cancelled => "cancelled",
        }
    }

    fn classify(result: &Result<HttpResponse, ClientError>) -> Self {
        match result {
            Ok(resp) if resp.status.is_client_error() || resp.status.is_server_error() => {
                RequestOutcome::HttpError
            }
            Ok(_) => RequestOutcome::Success,
            Err(ClientError::Timeout) => RequestOutcome::Timeout,
            Err(ClientError::Cancelled) => RequestOutcome::Cancelled,
            Err(_) => RequestOutcome::TransportError,
        }
    }

    pub fn is_failure(self) -> bool {
        self != RequestOutcome::Success
    }
}

/// Metric series names for one step, built once per plan.
#[derive(Debug, Clone)]
pub struct StepSeries {
    step: String,
    reqs: String,
    duration: String,
    failed: String,
    outcomes: Vec<String>,
}

impl StepSeries {
    pub fn new(step: &str) -> Self {
        let tags = [("step", step)];
        Self {
            step: step.to_string(),
            reqs: tagged(HTTP_REQS, &tags),
            duration: tagged(HTTP_REQ_DURATION, &tags),
            failed: tagged(HTTP_REQ_FAILED, &tags),
            outcomes: RequestOutcome::ALL
                .iter()
                .map(|o| tagged(HTTP_REQ_OUTCOME, &[("step", step), ("outcome", o.as_str())]))
                .collect(),
        }
    }

    pub fn declare(&self, registry: &MetricRegistry) -> Result<(), ConfigError> {
        for name in [HTTP_REQS, self.reqs.as_str()] {
            registry.declare(name, MetricKind::Counter)?;
        }
        for name in [HTTP_REQ_DURATION, self.duration.as_str()] {
            registry.declare(name, MetricKind::Trend)?;
        }
        for name in [HTTP_REQ_FAILED, self.failed.as_str()] {
            registry.declare(name, MetricKind::Rate)?;
        }
        for name in &self.outcomes {
            registry.declare(name, MetricKind::Counter)?;
        }
        Ok(())
    }

    fn outcome(&self, outcome: RequestOutcome) -> &str {
        let idx = RequestOutcome::ALL
            .iter()
            .position(|o| *o == outcome)
            .unwrap_or_default();
        &self.outcomes[idx]
    }

    fn record(&self, registry: &MetricRegistry, outcome: RequestOutcome, elapsed: Duration) {
        registry.add_counter(HTTP_REQS, 1);
        registry.add_counter(&self.reqs, 1);
        registry.add_trend(HTTP_REQ_DURATION, elapsed);
        registry.add_trend(&self.duration, elapsed);
        registry.add_rate(HTTP_REQ_FAILED, outcome.is_failure());
        registry.add_rate(&self.failed, outcome.is_failure());
        registry.add_counter(self.outcome(outcome), 1);
    }
}

/// One dispatched request and what came back.
#[derive(Debug)]
pub struct Exchange {
    pub result: Result<HttpResponse, ClientError>,
    pub outcome: RequestOutcome,
    pub elapsed: Duration,
}

pub async fn send_request(
    client: &HttpsClient,
    request: &RenderedRequest,
) -> Result<HttpResponse, ClientError> {
    let uri: Uri = request
        .url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ClientError::InvalidRequest(e.to_string()))?;

    let mut req_builder = Request::builder().method(request.method.clone()).uri(uri);

    let has_content_type = request
        .headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));

    for (key, value) in &request.headers {
        req_builder = req_builder.header(key.as_str(), value.as_str());
    }

    let body = match &request.body {
        Some(body) => {
            if !has_content_type {
                req_builder = req_builder.header(CONTENT_TYPE, body.content_type);
            }
            HyperBody::from(body.bytes.clone())
        }
        None => HyperBody::empty(),
    };

    let hyper_request = req_builder
        .body(body)
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

    let response = client.request(hyper_request).await.map_err(map_hyper_error)?;
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(map_hyper_error)?;

    Ok(HttpResponse { status, body })
}

fn map_hyper_error(e: hyper::Error) -> ClientError {
    if e.is_connect() {
        ClientError::Connect
    } else if e.is_timeout() {
        ClientError::Timeout
    } else if e.is_closed() || e.is_incomplete_message() {
        ClientError::Closed
    } else {
        ClientError::Other(e.to_string())
    }
}

/// Dispatches a request, measuring dispatch-to-full-body latency, and records
/// the observation under the step's series whatever the outcome. A request
/// still in flight when `hard_stop` fires is recorded as cancelled.
pub async fn execute(
    client: &HttpsClient,
    registry: &MetricRegistry,
    series: &StepSeries,
    request: &RenderedRequest,
    request_timeout: Duration,
    hard_stop: &CancellationToken,
) -> Exchange {
    let start = Instant::now();
    let result = tokio::select! {
        biased;
        _ = hard_stop.cancelled() => Err(ClientError::Cancelled),
        res = timeout(request_timeout, send_request(client, request)) => {
            res.unwrap_or(Err(ClientError::Timeout))
        }
    };
    finish(registry, series, request, result, start.elapsed())
}

/// Records a request that never reached the wire (e.g. an unrenderable URL).
pub fn reject(
    registry: &MetricRegistry,
    series: &StepSeries,
    request_url: &str,
    error: ClientError,
) -> Exchange {
    let request = RenderedRequest {
        method: Method::GET,
        url: request_url.to_string(),
        headers: Vec::new(),
        body: None,
    };
    finish(registry, series, &request, Err(error), Duration::ZERO)
}

fn finish(
    registry: &MetricRegistry,
    series: &StepSeries,
    request: &RenderedRequest,
    result: Result<HttpResponse, ClientError>,
    elapsed: Duration,
) -> Exchange {
    let outcome = RequestOutcome::classify(&result);
    series.record(registry, outcome, elapsed);

    match &result {
        Ok(resp) => tracing::debug!(
            step = %series.step,
            method = %request.method,
            url = %request.url,
            status = resp.status.as_u16(),
            duration_ms = elapsed.as_millis() as u64,
            "request completed"
        ),
        Err(e) => tracing::debug!(
            step = %series.step,
            method = %request.method,
            url = %request.url,
            error = %e,
            duration_ms = elapsed.as_millis() as u64,
            "request failed"
        ),
    }

    Exchange {
        result,
        outcome,
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metrics::MetricSnapshot;

    fn response(status: u16) -> Result<HttpResponse, ClientError> {
        Ok(HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body: Bytes::new(),
        })
    }

    #[test]
    fn classifies_outcomes() {
        assert_eq!(RequestOutcome::classify(&response(200)), RequestOutcome::Success);
        assert_eq!(RequestOutcome::classify(&response(302)), RequestOutcome::Success);
        assert_eq!(RequestOutcome::classify(&response(404)), RequestOutcome::HttpError);
        assert_eq!(RequestOutcome::classify(&response(503)), RequestOutcome::HttpError);
        assert_eq!(
            RequestOutcome::classify(&Err(ClientError::Timeout)),
            RequestOutcome::Timeout
        );
        assert_eq!(
            RequestOutcome::classify(&Err(ClientError::Connect)),
            RequestOutcome::TransportError
        );
        assert_eq!(
            RequestOutcome::classify(&Err(ClientError::Cancelled)),
            RequestOutcome::Cancelled
        );
    }

    #[test]
    fn rejected_request_is_still_observed() {
        let registry = MetricRegistry::new();
        let series = StepSeries::new("login");
        series.declare(&registry).unwrap();

        let exchange = reject(
            &registry,
            &series,
            "::not a url::",
            ClientError::InvalidRequest("bad uri".into()),
        );
        assert_eq!(exchange.outcome, RequestOutcome::TransportError);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counter(HTTP_REQS), 1);
        assert_eq!(snapshot.counter("http_reqs{step:login}"), 1);
        assert_eq!(snapshot.rate(HTTP_REQ_FAILED), Some(1.0));
        assert_eq!(
            snapshot.counter("http_req_outcome{step:login,outcome:transport_error}"),
            1
        );
        assert!(matches!(
            snapshot.get("http_req_duration{step:login}"),
            Some(MetricSnapshot::Trend(t)) if t.count() == 1
        ));
    }

    #[tokio::test]
    async fn connection_refused_is_a_transport_failure() {
        let registry = MetricRegistry::new();
        let series = StepSeries::new("register");
        let client = build_client();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let request = RenderedRequest {
            method: Method::GET,
            url: format!("http://127.0.0.1:{port}/auth/register"),
            headers: Vec::new(),
            body: None,
        };
        let exchange = execute(
            &client,
            &registry,
            &series,
            &request,
            Duration::from_secs(2),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(exchange.outcome, RequestOutcome::TransportError);
        assert_eq!(exchange.result.unwrap_err(), ClientError::Connect);
        assert_eq!(registry.snapshot().rate(HTTP_REQ_FAILED), Some(1.0));
    }

    #[tokio::test]
    async fn hard_stop_cancels_in_flight_request() {
        let registry = MetricRegistry::new();
        let series = StepSeries::new("orders");
        let client = build_client();
        let hard_stop = CancellationToken::new();
        hard_stop.cancel();

        let request = RenderedRequest {
            method: Method::GET,
            url: "http://10.255.255.1:81/orders".into(),
            headers: Vec::new(),
            body: None,
        };
        let exchange = execute(
            &client,
            &registry,
            &series,
            &request,
            Duration::from_secs(30),
            &hard_stop,
        )
        .await;

        assert_eq!(exchange.outcome, RequestOutcome::Cancelled);
        assert_eq!(
            registry
                .snapshot()
                .counter("http_req_outcome{step:orders,outcome:cancelled}"),
            1
        );
    }
}
