//! WebSocket control surface: a controller sends a plan document, the worker
//! runs it and answers with JSON events.

use std::sync::Arc;

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::executor::{run_load_test, RunReport};
use crate::metrics::MetricRegistry;
use crate::models::dsl_model::TestPlan;
use crate::scenario;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Accepted { name: String, max_vus: usize },
    ConfigError { message: String },
    Busy,
    Stopping,
    Completed { report: Box<RunReport> },
}

#[derive(Message)]
#[rtype(result = "()")]
struct RunFinished(Box<RunReport>);

pub struct WsSession {
    engine: Handle,
    running: Option<CancellationToken>,
}

impl WsSession {
    pub fn new(engine: Handle) -> Self {
        Self {
            engine,
            running: None,
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, event: &WorkerEvent) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(e) => tracing::error!(error = %e, "failed to serialize worker event"),
        }
    }

    fn start_run(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        if self.running.is_some() {
            Self::send(ctx, &WorkerEvent::Busy);
            return;
        }

        let registry = Arc::new(MetricRegistry::new());
        let compiled = serde_json::from_str::<TestPlan>(text)
            .map_err(ConfigError::from)
            .and_then(|plan| scenario::compile(plan, &registry));
        let plan = match compiled {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "rejected plan from controller");
                Self::send(ctx, &WorkerEvent::ConfigError { message: e.to_string() });
                return;
            }
        };

        Self::send(
            ctx,
            &WorkerEvent::Accepted {
                name: plan.name.clone(),
                max_vus: plan.max_vus,
            },
        );

        let hard_stop = CancellationToken::new();
        self.running = Some(hard_stop.clone());
        let addr = ctx.address();
        self.engine.spawn(async move {
            let report = run_load_test(plan, registry, hard_stop).await;
            addr.do_send(RunFinished(Box::new(report)));
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        tracing::info!("controller connected");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(run) = self.running.take() {
            tracing::warn!("controller disconnected, cancelling run");
            run.cancel();
        }
    }
}

impl Handler<RunFinished> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: RunFinished, ctx: &mut Self::Context) {
        self.running = None;
        Self::send(ctx, &WorkerEvent::Completed { report: msg.0 });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) if text.trim() == "stop" => {
                if let Some(run) = &self.running {
                    run.cancel();
                    Self::send(ctx, &WorkerEvent::Stopping);
                }
            }
            Ok(ws::Message::Text(text)) => self.start_run(&text, ctx),
            Ok(ws::Message::Ping(bytes)) => ctx.pong(&bytes),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "websocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    engine: web::Data<Handle>,
) -> Result<HttpResponse, Error> {
    ws::start(WsSession::new(engine.get_ref().clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let accepted = serde_json::to_value(WorkerEvent::Accepted {
            name: "brokerx".into(),
            max_vus: 20,
        })
        .unwrap();
        assert_eq!(
            accepted,
            serde_json::json!({ "event": "accepted", "name": "brokerx", "max_vus": 20 })
        );

        let rejected = serde_json::to_value(WorkerEvent::ConfigError {
            message: "scenario has no steps".into(),
        })
        .unwrap();
        assert_eq!(rejected["event"], "config_error");
    }
}
