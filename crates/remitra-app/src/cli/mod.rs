use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "remitra",
    version,
    author,
    about = "Remittance extraction pipeline and export"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            command: None,
            verbose: 0,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Split a remittance document into page jobs and dispatch workers.
    Ingest(IngestArgs),
    /// Show a document's status, optionally with its page jobs.
    Status(StatusArgs),
    /// Print the deduplicated, ordered line items for a document.
    Items(ItemsArgs),
    /// Apply field-level edits to one line item.
    Amend(AmendArgs),
    /// Show the check-total reconciliation for a document.
    Reconcile(ReconcileArgs),
    /// Run one recovery sweep pass.
    Sweep,
    /// Generate a remittance file for reconciled documents.
    Export(ExportArgs),
    /// Release a document's export lock.
    Unlock(UnlockArgs),
    /// Reset a document and its page jobs for another extraction run.
    Reprocess(ReprocessArgs),
    /// Inspect or grant tenant page credits.
    Credits(CreditsArgs),
    /// Inspect or update a tenant's billing profile.
    Profile(ProfileArgs),
}

/// Which of the two object stores holds the source document.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceStore {
    Primary,
    Secondary,
}

/// Split one uploaded document into page jobs.
#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Document identifier; created on first ingest.
    #[arg(long)]
    pub document_id: String,
    /// Owning tenant.
    #[arg(long)]
    pub tenant: String,
    /// Fetch the source document from a direct URL.
    #[arg(long, conflicts_with_all = ["bucket", "key", "file"])]
    pub url: Option<String>,
    /// Source bucket (with --key) in one of the object stores.
    #[arg(long, requires = "key")]
    pub bucket: Option<String>,
    /// Source object key within --bucket.
    #[arg(long, requires = "bucket")]
    pub key: Option<String>,
    /// Object store holding --bucket/--key.
    #[arg(long, value_enum, default_value_t = SourceStore::Primary)]
    pub store: SourceStore,
    /// Read the source document from a local file.
    #[arg(long, conflicts_with_all = ["url", "bucket", "key"])]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(value_name = "DOCUMENT_ID")]
    pub document_id: String,
    /// Also list the document's page jobs.
    #[arg(long)]
    pub jobs: bool,
}

#[derive(Debug, Args)]
pub struct ItemsArgs {
    #[arg(value_name = "DOCUMENT_ID")]
    pub document_id: String,
}

/// Field-level edit of one line item, addressed by its composite identity.
#[derive(Debug, Args)]
pub struct AmendArgs {
    #[arg(long)]
    pub document_id: String,
    #[arg(long)]
    pub page: u32,
    #[arg(long)]
    pub ordinal: u32,
    #[arg(long)]
    pub claim_number: Option<String>,
    #[arg(long)]
    pub patient_name: Option<String>,
    #[arg(long)]
    pub member_id: Option<String>,
    #[arg(long)]
    pub procedure_code: Option<String>,
    /// Service date (YYYY-MM-DD).
    #[arg(long)]
    pub service_date: Option<String>,
    #[arg(long)]
    pub billed: Option<String>,
    #[arg(long)]
    pub paid: Option<String>,
    #[arg(long)]
    pub patient_responsibility: Option<String>,
}

#[derive(Debug, Args)]
pub struct ReconcileArgs {
    #[arg(value_name = "DOCUMENT_ID")]
    pub document_id: String,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Tenant whose billing profile signs the file.
    #[arg(long)]
    pub tenant: String,
    /// One or more reconciled document ids.
    #[arg(required = true, value_name = "DOCUMENT_ID")]
    pub document_ids: Vec<String>,
    /// Write the encoded file here instead of stdout.
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct UnlockArgs {
    #[arg(value_name = "DOCUMENT_ID")]
    pub document_id: String,
}

#[derive(Debug, Args)]
pub struct ReprocessArgs {
    #[arg(value_name = "DOCUMENT_ID")]
    pub document_id: String,
}

#[derive(Debug, Args)]
pub struct CreditsArgs {
    #[command(subcommand)]
    pub command: CreditsCommands,
}

#[derive(Debug, Subcommand)]
pub enum CreditsCommands {
    /// Show a tenant's balance.
    Balance {
        #[arg(value_name = "TENANT")]
        tenant: String,
    },
    /// Add page credits to a tenant.
    Grant {
        #[arg(value_name = "TENANT")]
        tenant: String,
        #[arg(value_name = "AMOUNT")]
        amount: u64,
    },
}

#[derive(Debug, Args)]
pub struct ProfileArgs {
    #[command(subcommand)]
    pub command: ProfileCommands,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    /// Print a tenant's billing profile.
    Show {
        #[arg(value_name = "TENANT")]
        tenant: String,
    },
    /// Create or replace a tenant's billing profile.
    Set {
        #[arg(value_name = "TENANT")]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        tax_id: Option<String>,
        #[arg(long)]
        provider_id: Option<String>,
        /// Address lines, repeatable.
        #[arg(long = "address")]
        address: Vec<String>,
    },
}
