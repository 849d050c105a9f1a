use anyhow::Context as _;
use blackbox_gateway::config::{Cli, LogFormat};
use blackbox_gateway::oauth::HttpTokenExchanger;
use blackbox_gateway::registry::BackendRegistry;
use blackbox_gateway::rmcp_backend::RmcpConnector;
use blackbox_gateway::server::GatewayServer;
use blackbox_gateway::{Gateway, callback};
use clap::Parser as _;
use rmcp::ServiceExt as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let registry = Arc::new(
        BackendRegistry::load(&cli.config)
            .with_context(|| format!("load backends from {}", cli.config.display()))?,
    );
    tracing::info!(
        config = %cli.config.display(),
        backends = registry.list_ids().len(),
        "backend registry loaded"
    );

    let gateway = Arc::new(Gateway::new(
        registry,
        Arc::new(RmcpConnector {
            http_connect_timeout: cli.http_connect_timeout(),
        }),
        Arc::new(HttpTokenExchanger::default()),
        cli.authorization_ttl(),
    ));

    let shutdown = CancellationToken::new();
    let callback_task = match cli.callback_bind {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind oauth callback listener on {addr}"))?;
            Some(tokio::spawn(callback::serve(
                listener,
                gateway.clone(),
                shutdown.clone(),
            )))
        }
        None => None,
    };

    let service = GatewayServer::new(gateway.clone())
        .serve(rmcp::transport::stdio())
        .await
        .context("start mcp stdio server")?;
    tracing::info!("serving mcp over stdio");

    tokio::select! {
        res = service.waiting() => match res {
            Ok(reason) => tracing::info!(?reason, "stdio session ended"),
            Err(e) => tracing::warn!(error = %e, "stdio session ended with error"),
        },
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
    }

    shutdown.cancel();
    if let Some(task) = callback_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "oauth callback listener failed"),
            Err(e) => tracing::warn!(error = %e, "oauth callback task panicked"),
        }
    }
    gateway.shutdown().await;
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let res = match cli.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = res {
        eprintln!("tracing subscriber already installed: {e}");
    }
}
