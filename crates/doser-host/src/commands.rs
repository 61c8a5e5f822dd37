use std::time::Duration;

use anyhow::{anyhow, Context};
use doser_icd::{DoserStatus, ModuleRecord};

use crate::cli::Commands;
use crate::context::AppContext;

pub async fn execute(
    ctx: &AppContext<'_>,
    command: &Commands,
    json: bool,
) -> anyhow::Result<()> {
    let count = ctx
        .pool
        .connect()
        .await
        .map_err(|e| anyhow!("chain enumeration failed: {e:?}"))?;
    tracing::info!(count, "chain connected");

    match command {
        Commands::Discover => {
            print_modules(ctx.pool.backend().layout().modules(), json)?
        }
        Commands::Status => print_status(&ctx.pool.status(), json)?,
        Commands::Dose { address, amount_ml, flow_rate } => {
            let mut doser = ctx
                .pool
                .lend(*address)
                .with_context(|| format!("doser {address} is not available"))?;
            println!(
                "Dosing {amount_ml} ml from doser {address} at {flow_rate} ml/min"
            );
            doser
                .dose(*amount_ml, *flow_rate)
                .await
                .map_err(|e| anyhow!("doser {address} failed: {e:?}"))?;
            println!("Done");
        }
        Commands::Run { address, flow_rate, hold_ms } => {
            for &address in address {
                match ctx.dosers.start(address, *flow_rate) {
                    Ok(()) => println!("Doser {address} running"),
                    Err(e) => println!("Doser {address} not started: {e}"),
                }
            }
            tokio::time::sleep(Duration::from_millis(*hold_ms)).await;
            print_status(&ctx.pool.status(), json)?;
            let stopped = ctx.dosers.reset();
            println!("Stopped {stopped} dosers");
        }
    }

    Ok(())
}

fn print_modules(modules: &[ModuleRecord], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(modules)?);
        return Ok(());
    }
    for (i, module) in modules.iter().enumerate() {
        let addresses = module.addresses();
        println!(
            "module {i}: {} dosers, addresses {}..{}, max {} ml/min",
            module.num_dosers, addresses.start, addresses.end, module.max_flow_rate
        );
    }
    Ok(())
}

fn print_status(status: &[DoserStatus], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }
    println!("{:>7} {:>8} {:>8} {:>4} {:>7}", "address", "max", "flow", "on", "leased");
    for doser in status {
        println!(
            "{:>7} {:>8} {:>8} {:>4} {:>7}",
            doser.address, doser.max_flow_rate, doser.flow_rate, doser.on, doser.leased
        );
    }
    Ok(())
}
