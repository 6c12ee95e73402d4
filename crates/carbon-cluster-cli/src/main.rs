mod cli;

use anyhow::{Context, Result};
use carbon_cluster::{
    ClusterConfiguration, ClusterContext, ClusterError, ClusterMessage, ClusteringAgent,
    LoggingMembershipListener,
};
use clap::Parser;
use cli::{Cli, Commands};
use colored::*;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let result = match cli.command.clone() {
        Commands::Run { status_interval } => run(&cli.config, status_interval).await,
        Commands::Check => check(&cli.config),
        Commands::Send {
            topic,
            payload,
            wait,
        } => send(&cli.config, &topic, &payload, wait).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red(), e);
        process::exit(1);
    }
}

fn load_configuration(path: &Path) -> Result<Arc<ClusterConfiguration>> {
    let configuration = ClusterConfiguration::from_source(path)
        .with_context(|| format!("Invalid cluster topology {}", path.display()))?;
    Ok(Arc::new(configuration))
}

async fn start_agent(path: &Path) -> Result<(Arc<ClusterContext>, ClusteringAgent)> {
    let configuration = load_configuration(path)?;
    let context = ClusterContext::new(configuration)?;
    context
        .add_membership_listener(Arc::new(LoggingMembershipListener))
        .await;

    let agent = ClusteringAgent::new();
    agent
        .init(context.clone())
        .await
        .context("Could not join the cluster")?;
    Ok((context, agent))
}

async fn run(path: &Path, status_interval: Option<u64>) -> Result<()> {
    let (context, agent) = start_agent(path).await?;

    if let Some(local) = agent.local_member() {
        println!("{} {}", "Joined cluster as".green(), local);
    }

    match status_interval.filter(|secs| *secs > 0) {
        Some(secs) => {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => print_members(&context).await,
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }

    agent.shutdown().await;
    println!("{}", "Left the cluster".yellow());
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let configuration = load_configuration(path)?;
    let settings = configuration.settings()?;

    println!("{} {}", "Topology".bold(), path.display());
    println!("  enabled:           {}", settings.enabled);
    println!("  membership scheme: {}", settings.scheme_kind()?);
    println!("  domain:            {}", settings.domain);
    match settings.local_member.port {
        Some(port) => println!("  receiver port:     {}", port),
        None => println!(
            "  receiver ports:    {}+{}",
            settings.local_member.port_range_start, settings.local_member.port_range_size
        ),
    }
    for member in &settings.wka.members {
        println!("  well-known member: {}", member);
    }

    if configuration.should_initialize(&settings.membership_scheme)? {
        println!("{}", "Clustering will be initialized".green());
    } else {
        println!("{}", "Clustering is disabled".yellow());
    }
    Ok(())
}

async fn send(path: &Path, topic: &str, payload: &str, wait: u64) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;
    let (context, agent) = start_agent(path).await?;

    tokio::time::sleep(Duration::from_secs(wait)).await;
    print_members(&context).await;

    let message = ClusterMessage::new(topic, payload);
    let outcome = agent.send_message(&message).await;
    agent.shutdown().await;

    match outcome {
        Ok(report) => {
            println!(
                "{} message {} to {} member(s)",
                "Delivered".green(),
                report.message_id,
                report.delivered.len()
            );
            for response in &report.responses {
                println!("  {} {}: {}", "reply".cyan(), response.member.address, response.payload);
            }
            Ok(())
        }
        Err(ClusterError::MessageFailed(failure)) => {
            for delivered in &failure.delivered {
                println!("  {} {}", "ok".green(), delivered.address);
            }
            for failed in &failure.failures {
                println!(
                    "  {} {} [{}]: {}",
                    "failed".red(),
                    failed.member.address,
                    failed.kind,
                    failed.reason
                );
            }
            anyhow::bail!(
                "Message {} failed for {} member(s)",
                failure.message_id,
                failure.failures.len()
            )
        }
        Err(e) => Err(e.into()),
    }
}

async fn print_members(context: &ClusterContext) {
    let members = context.get_primary_cluster_members().await;
    println!("{} ({})", "Members".bold(), members.len());
    for member in members {
        println!("  {} {}", member.address, member.id);
    }
}

fn setup_logging(verbose: bool, quiet: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    if quiet {
        return;
    }

    let level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
