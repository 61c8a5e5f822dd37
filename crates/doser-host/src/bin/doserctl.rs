use clap::Parser;
use doser_chain::sim::SimChain;
use doser_host::cli::Cli;
use doser_host::{commands, AppContext, ChainPool, HostConfig};
use static_cell::StaticCell;
use tracing_subscriber::EnvFilter;

static CHAIN: StaticCell<SimChain> = StaticCell::new();
static POOL: StaticCell<ChainPool<'static>> = StaticCell::new();

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = HostConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    if config.chain.is_empty() {
        anyhow::bail!("the chain needs at least one module");
    }

    let chain: &'static SimChain = CHAIN.init(AppContext::build_chain(&config));
    let pool: &'static ChainPool<'static> = POOL.init(AppContext::build_pool(&config, chain));
    let ctx = AppContext::new(config, chain, pool);

    ctx.drive(commands::execute(&ctx, &cli.command, cli.json)).await
}
