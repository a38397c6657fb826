use std::fs;
use std::process::ExitCode;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use loadforge::cli::{Cli, Command, RunArgs, ServeArgs};
use loadforge::error::ConfigError;
use loadforge::executor::{run_plan, summary::print_summary};
use loadforge::models::dsl_model::TestPlan;
use loadforge::ws;

const EXIT_THRESHOLDS_FAILED: u8 = 99;
const EXIT_CONFIG_ERROR: u8 = 104;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Serve(args) => serve(args).map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            if let Some(config) = e.downcast_ref::<ConfigError>() {
                tracing::error!(error = %config, "invalid test plan");
                ExitCode::from(EXIT_CONFIG_ERROR)
            } else {
                tracing::error!(error = ?e, "fatal error");
                ExitCode::FAILURE
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_plan(args: &RunArgs) -> Result<TestPlan, ConfigError> {
    let raw = fs::read_to_string(&args.plan)?;
    let mut plan: TestPlan = serde_json::from_str(&raw)?;
    if let Some(base_url) = &args.base_url {
        plan.base_url = base_url.clone();
    }
    Ok(plan)
}

fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let plan = load_plan(&args)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let report = runtime.block_on(async {
        let hard_stop = CancellationToken::new();
        let on_signal = hard_stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping run");
                on_signal.cancel();
            }
        });
        run_plan(plan, hard_stop).await
    })?;

    print_summary(&report);
    if let Some(path) = &args.summary_export {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "report exported");
    }

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_THRESHOLDS_FAILED)
    })
}

fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let engine = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("loadforge-engine")
        .build()
        .context("failed to start engine runtime")?;
    let handle = engine.handle().clone();

    tracing::info!(bind = %args.bind, "worker listening on ws://{}/ws", args.bind);
    actix_web::rt::System::new().block_on(async move {
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(handle.clone()))
                .route("/ws", web::get().to(ws::ws_handler))
        })
        .bind(&args.bind)?
        .run()
        .await
    })?;

    engine.shutdown_background();
    Ok(())
}
