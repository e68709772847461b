mod api;
mod backoff;
mod catalog;
mod config;
mod errors;
mod ingester;
mod notify;
mod offline;
mod pipeline;
mod session;
mod storage;
#[cfg(test)]
mod testing;

use crate::api::http::server::{listen, serve, HttpOptions};
use crate::api::http::service::{IngesterService, ServingService};
use crate::config::Setting;
use crate::ingester::push_ingester::PushIngester;
use crate::ingester::Ingester;
use crate::pipeline::Pipeline;
use clap::Parser as ClapParser;
use std::process;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

#[derive(ClapParser, Debug)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "livecast.toml")]
    config: String,
}

fn main() {
    // Initialize tracing
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::Layer::default()
                .with_target(false)
                .with_thread_names(false)
                .with_ansi(true)
                .with_line_number(false)
                .with_file(false)
                .with_thread_ids(false),
        );
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("unable to set a global logger instance: {}", e);
        process::exit(1);
    }

    let args = Cli::parse();
    let setting = match Setting::from_file(&args.config) {
        Ok(setting) => setting,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let runtime = match common::runtime::build(setting.runtime.threads) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(start(setting)) {
        error!("{}", e);
        process::exit(1);
    }

    info!("done");
}

async fn start(setting: Setting) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let pipeline = Arc::new(Pipeline::build(&setting)?);
    pipeline.start().await?;

    let notifier = Arc::new(Notify::new());
    common::systemd::run(notifier.clone());

    let options = HttpOptions {
        max_buffer_size: setting.ingest.max_buffer_size,
        shutdown_timeout: setting.http.shutdown_timeout,
    };
    let ingest_listener = listen(setting.ingest.addr.clone())?;
    let http_listener = listen(setting.http.addr.clone())?;

    let mut set = JoinSet::new();

    let ingester = Arc::new(PushIngester::new(
        Arc::clone(&pipeline.sessions),
        setting.session.liveness_timeout,
    )) as Arc<dyn Ingester + Send + Sync>;
    let notifier_clone = notifier.clone();
    set.spawn(async move {
        let result = serve("ingester", notifier_clone.clone(), ingest_listener, options, move |remote| {
            IngesterService::new(Arc::clone(&ingester), remote)
        })
        .await;
        if let Err(e) = result {
            notifier_clone.notify_waiters();
            error!("ingester server: {}", e);
        }
    });

    let service = ServingService::new(
        Arc::clone(&pipeline.catalog),
        Arc::clone(&pipeline.sessions),
        Arc::clone(&pipeline.storage),
        setting.http.webroot.clone(),
    );
    let options = HttpOptions {
        max_buffer_size: setting.http.max_buffer_size,
        ..options
    };
    let notifier_clone = notifier.clone();
    set.spawn(async move {
        let result = serve("http", notifier_clone.clone(), http_listener, options, move |_| {
            service.clone()
        })
        .await;
        if let Err(e) = result {
            notifier_clone.notify_waiters();
            error!("http server: {}", e);
        }
    });

    // Live uploads only end once their session does, so stop the pipeline
    // while the servers drain.
    let notifier_clone = notifier.clone();
    let pipeline_clone = Arc::clone(&pipeline);
    set.spawn(async move {
        notifier_clone.notified().await;
        pipeline_clone.shutdown().await;
    });

    common::systemd::ready();
    set.join_all().await;

    Ok(())
}
