use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Migrates the default database and every tenant database
    Migrate {
        /// applies pending migrations instead of only checking for them
        #[arg(long, default_value = "false")]
        automigrate: bool,
        /// migrates only this tenant's database, creating it if needed
        #[arg(long)]
        tenant: Option<String>,
    },
    /// Lists databases that are behind this build's schema version
    Check,
    /// Lists tenants with a database of their own
    ListTenants,
}
