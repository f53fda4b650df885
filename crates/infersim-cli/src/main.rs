use axum::Router;
use clap::{Args, Parser, Subcommand};
use infersim_common::config::SimConfig;
use opentelemetry_otlp::WithExportConfig;
use tokio_util::sync::CancellationToken;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "infersim", version, about = "LLM inference server simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the simulator HTTP server
    Serve(ServeArgs),
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long)]
    model: Option<String>,
    /// Generation mode: "echo" or "random"
    #[arg(long)]
    mode: Option<String>,
    /// KV cache capacity in blocks
    #[arg(long)]
    kv_cache_size: Option<usize>,
    /// ZMQ endpoint for kv events; omit to disable publishing
    #[arg(long)]
    zmq_endpoint: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Version => println!("{}", env!("CARGO_PKG_VERSION")),
    }
}

async fn serve(args: ServeArgs) {
    let mut config = SimConfig::load();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(size) = args.kv_cache_size {
        config.kv_cache_size = size;
    }
    if let Some(endpoint) = args.zmq_endpoint {
        config.zmq_endpoint = endpoint;
    }
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        std::process::exit(2);
    }

    let port = config.port;
    let (app, helper): (Router, _) = match infersim_api::build(config).await {
        Ok(built) => built,
        Err(e) => {
            eprintln!("failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let sender_task = {
        let helper = helper.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { helper.run(cancel).await })
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await.unwrap();
    tracing::info!("listening on http://0.0.0.0:{}", port);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap();

    cancel.cancel();
    match sender_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("event sender exited with error: {}", e),
        Err(e) => tracing::warn!("event sender task failed: {}", e),
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
