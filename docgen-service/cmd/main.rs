use anyhow::{Context, Result};
use clap::Parser;
use dalvis_platform_core::config::{ServiceArgs, load_config};
use dalvis_platform_core::error::BootstrapError;
use dalvis_platform_core::tracing::{
    init_default_tracing, init_tracing_from_config, startup_tracing_guard,
};
use docgen_service::ApplicationBootstrap;

#[tokio::main]
async fn main() {
    let args = ServiceArgs::parse();

    if let Err(err) = run(args).await {
        init_default_tracing();
        let code = err
            .downcast_ref::<BootstrapError>()
            .map(BootstrapError::exit_code)
            .unwrap_or(1);
        tracing::error!(error = ?err, exit_code = code, "docgen-service exited");
        std::process::exit(code);
    }
}

async fn run(args: ServiceArgs) -> Result<()> {
    // 加载配置，命令行参数优先级最高
    let mut app_config = {
        let _guard = startup_tracing_guard();
        load_config(args.config_path()).context("loading configuration")?
    };
    args.apply(&mut app_config);

    let config = ApplicationBootstrap::prepare(app_config)?;
    init_tracing_from_config(&config.logging);

    ApplicationBootstrap::create_bootstrapper(config)?
        .start()
        .await?;
    Ok(())
}
