//! Command-line argument structures.
//!
//! Isolates clap derivations so `main.rs` stays focused on runtime logic.
//! CLI flags are the highest-precedence configuration layer: whatever is
//! set here overrides the file and the environment.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

/// Options that apply to every sub-command.
#[derive(Parser, Default, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file (YAML)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Forge base URL, e.g. https://gitlab.example.com
    #[arg(long, global = true)]
    pub host: Option<String>,
    /// Account to authenticate as
    #[arg(long, global = true)]
    pub account: Option<String>,
}

#[derive(Parser)]
#[command(
    name = "glcrawl",
    about = "Crawl a GitLab-style forge into a resumable JSONL tree",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a crawl session
    Crawl(CrawlArgs),
    /// Manage stored accounts
    Account(AccountArgs),
}

/// Parameters accepted by the `crawl` sub-command.
#[derive(Parser, Debug, Default, Clone)]
pub struct CrawlArgs {
    /// Steps to run, in order (areas, users, resources, repository);
    /// defaults to all four
    #[arg(long = "step", value_name = "STEP")]
    pub steps: Vec<String>,
    /// Output root directory
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
    /// Access token override (otherwise taken from the account store)
    #[arg(long, value_name = "TOKEN")]
    pub access_token: Option<String>,
    /// Project-parallel workers
    #[arg(long, value_name = "N")]
    pub max_concurrency: Option<usize>,
    /// Ignore any existing resume state and start fresh
    #[arg(long)]
    pub no_resume: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct AccountArgs {
    #[command(subcommand)]
    pub command: AccountCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AccountCommand {
    /// Store a user and its credential for a host
    Add(AccountAddArgs),
    /// List stored accounts
    List,
    /// Remove a stored account
    Remove(AccountRemoveArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AccountAddArgs {
    /// Provider-scoped account identifier (e.g. the username)
    #[arg(long)]
    pub account_id: String,
    /// Host name the credential belongs to
    #[arg(long, default_value = "gitlab")]
    pub provider: String,
    /// Display name of the owning user
    #[arg(long)]
    pub name: String,
    /// Email of the owning user
    #[arg(long)]
    pub email: String,
    #[arg(long)]
    pub access_token: Option<String>,
    #[arg(long)]
    pub refresh_token: Option<String>,
    /// Access-token lifetime in seconds from now
    #[arg(long, value_name = "SECS")]
    pub expires_in: Option<i64>,
}

#[derive(Parser, Debug, Clone)]
pub struct AccountRemoveArgs {
    /// Provider-scoped account identifier
    pub account_id: String,
}

impl GlobalArgs {
    /// Overlay these flags onto a loaded configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.gitlab.host = host.clone();
        }
        if let Some(account) = &self.account {
            config.gitlab.account = Some(account.clone());
        }
    }
}

impl CrawlArgs {
    /// Overlay these flags onto a loaded configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(dir) = &self.output_dir {
            config.output.root_dir = dir.clone();
        }
        if let Some(token) = &self.access_token {
            config.gitlab.access_token = Some(token.clone());
        }
        if let Some(workers) = self.max_concurrency {
            config.gitlab.max_concurrency = workers;
        }
        if self.no_resume {
            config.resume.enabled = false;
        }
    }
}
