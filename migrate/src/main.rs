mod cli;

use crate::cli::{Cli, Commands};
use anyhow::Context;
use clap::Parser;
use deployments::migrations::{self, Migrator, Version};
use deployments::store::postgres::PgClient;
use deployments::{Config, DataStore, TenantId};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::new().context("error: failed to construct config")?;
    let client = PgClient::connect(&config).await?;
    let store = DataStore::new(Arc::new(client), &config.db_name);
    let target: Version = deployments::VERSION
        .parse()
        .context("invalid package version")?;

    match cli.command {
        Commands::Migrate {
            automigrate,
            tenant,
        } => {
            let migrator = Migrator::new(migrations::all(), target, automigrate || config.automigrate);
            match tenant {
                Some(tenant) => {
                    let tenant = TenantId::new(&tenant)?;
                    migrations::provision_tenant(&store, &migrator, &tenant).await?;
                }
                None => migrations::migrate_all(&store, &migrator).await?,
            }
            info!(%target, "migrations complete");
        }
        Commands::Check => {
            let migrator = Migrator::new(migrations::all(), target, false);
            let outdated = migrator.outdated(&store).await?;
            if outdated.is_empty() {
                println!("all databases are at {target}");
                return Ok(());
            }
            for (db, current) in &outdated {
                println!("{db}: {current} -> {target}");
            }
            anyhow::bail!("{} database(s) need migrating", outdated.len());
        }
        Commands::ListTenants => {
            for tenant in migrations::list_tenants(&store).await? {
                println!("{tenant}");
            }
        }
    }

    Ok(())
}
