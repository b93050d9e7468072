use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing_subscriber::{filter::LevelFilter, fmt};

use remitra_app::cli::{
    AmendArgs, Cli, Commands, CreditsCommands, ExportArgs, IngestArgs, ProfileCommands,
    SourceStore,
};
use remitra_app::config::{self, AppConfig};
use remitra_app::error::AppError;
use remitra_app::paths::AppPaths;
use remitra_app::services::{
    CreditLedger, ExportService, ExtractionWorker, FsObjectStore, HttpExtractionClient,
    IngestRequest, ItemEdits, ItemKey, ItemStore, JobRef, JobStore, ObjectStore, Orchestrator,
    OrchestratorConfig, PageSource, ProfileStore, RetryPolicy, ReviewStatus, StoreKind,
    SweepConfig, Sweeper, TaskDispatcher, TenantProfile, TokioDispatcher, open_state_env,
};

const UPLOAD_BUCKET: &str = "uploads";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

/// Durable stores shared by every command.
struct Stores {
    paths: AppPaths,
    jobs: JobStore,
    ledger: CreditLedger,
    items: Arc<ItemStore>,
    profiles: ProfileStore,
}

fn open_stores(config: &AppConfig) -> Result<Stores, AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let env = open_state_env(&paths)?;
    let jobs = JobStore::open(&env)?;
    let ledger = CreditLedger::open(&env)?;
    let items = Arc::new(ItemStore::open(paths.items_db_path()?)?);
    let profiles = ProfileStore::open(&env)?;
    Ok(Stores {
        paths,
        jobs,
        ledger,
        items,
        profiles,
    })
}

fn object_stores(stores: &Stores) -> Result<(Arc<dyn ObjectStore>, Arc<dyn ObjectStore>), AppError> {
    let primary: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        stores.paths.object_store_root(StoreKind::Primary.slug())?,
    ));
    let secondary: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
        stores.paths.object_store_root(StoreKind::Secondary.slug())?,
    ));
    Ok((primary, secondary))
}

fn build_worker(
    config: &AppConfig,
    stores: &Stores,
    objects: Arc<dyn ObjectStore>,
) -> Result<Arc<ExtractionWorker>, AppError> {
    let client = Arc::new(HttpExtractionClient::from_env(
        config.extraction.model.clone(),
        config.extraction.requests_per_second,
    )?);
    let retry = RetryPolicy {
        max_calls: config.extraction.max_calls.max(1),
        ..RetryPolicy::default()
    };
    Ok(Arc::new(ExtractionWorker::new(
        stores.jobs.clone(),
        stores.ledger.clone(),
        objects,
        Arc::clone(&stores.items),
        client,
        retry,
    )))
}

fn sweep_config(config: &AppConfig) -> SweepConfig {
    SweepConfig {
        queued_stale_ms: config.sweep.queued_stale_ms,
        retry_cooldown_ms: config.sweep.retry_cooldown_ms,
        document_stale_ms: config.sweep.document_stale_ms,
        batch_limit: config.sweep.batch_limit,
        pacing: Duration::from_millis(config.sweep.pacing_ms),
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let Some(command) = cli.command else {
        Cli::print_help();
        return Ok(());
    };

    let config = config::load()?;
    let stores = open_stores(&config)?;

    match command {
        Commands::Ingest(args) => ingest(&config, &stores, args).await,
        Commands::Status(args) => {
            let document = stores
                .jobs
                .get_document(&args.document_id)?
                .ok_or_else(|| AppError::DocumentNotFound(args.document_id.clone()))?;
            println!("{}", serde_json::to_string_pretty(&document)?);
            if args.jobs {
                let jobs = stores.jobs.jobs_for_document(&args.document_id)?;
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            }
            Ok(())
        }
        Commands::Items(args) => {
            let items = stores.items.items_for_document(&args.document_id)?;
            println!("{}", serde_json::to_string_pretty(&items)?);
            Ok(())
        }
        Commands::Amend(args) => amend(&stores, args),
        Commands::Reconcile(args) => {
            let row = stores.items.reconciliation(&args.document_id)?;
            println!("{}", serde_json::to_string_pretty(&row)?);
            Ok(())
        }
        Commands::Sweep => {
            let (primary, _) = object_stores(&stores)?;
            let worker = build_worker(&config, &stores, primary)?;
            let sweeper = Sweeper::new(
                stores.jobs.clone(),
                stores.ledger.clone(),
                worker,
                sweep_config(&config),
            );
            let report = sweeper.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Export(args) => export(&stores, args),
        Commands::Unlock(args) => {
            let service = ExportService::new(
                stores.jobs.clone(),
                Arc::clone(&stores.items),
                stores.profiles.clone(),
            );
            service.unlock(&args.document_id)?;
            println!("unlocked {}", args.document_id);
            Ok(())
        }
        Commands::Reprocess(args) => reprocess(&config, &stores, &args.document_id).await,
        Commands::Credits(args) => {
            match args.command {
                CreditsCommands::Balance { tenant } => {
                    println!("{}", stores.ledger.balance(&tenant)?);
                }
                CreditsCommands::Grant { tenant, amount } => {
                    let balance = stores.ledger.grant(&tenant, amount)?;
                    println!("{tenant}: {balance}");
                }
            }
            Ok(())
        }
        Commands::Profile(args) => {
            match args.command {
                ProfileCommands::Show { tenant } => {
                    let profile = stores
                        .profiles
                        .get(&tenant)?
                        .ok_or(AppError::ProfileNotFound(tenant))?;
                    println!("{}", serde_json::to_string_pretty(&profile)?);
                }
                ProfileCommands::Set {
                    tenant,
                    name,
                    tax_id,
                    provider_id,
                    address,
                } => {
                    stores.profiles.put(&TenantProfile {
                        tenant_id: tenant.clone(),
                        name,
                        tax_id,
                        provider_id,
                        address,
                    })?;
                    println!("profile saved for {tenant}");
                }
            }
            Ok(())
        }
    }
}

async fn ingest(config: &AppConfig, stores: &Stores, args: IngestArgs) -> Result<(), AppError> {
    let (primary, secondary) = object_stores(stores)?;

    let source = if let Some(url) = args.url {
        PageSource::Url(url)
    } else if let (Some(bucket), Some(key)) = (args.bucket, args.key) {
        let store = match args.store {
            SourceStore::Primary => StoreKind::Primary,
            SourceStore::Secondary => StoreKind::Secondary,
        };
        PageSource::Object { store, bucket, key }
    } else if let Some(file) = args.file {
        stage_local_file(&primary, &args.document_id, &file).await?
    } else {
        return Err(AppError::InvalidArgument(
            "one of --url, --bucket/--key, or --file is required".to_string(),
        ));
    };

    let worker = build_worker(config, stores, Arc::clone(&primary))?;
    let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(TokioDispatcher::new(
        worker,
        Duration::from_millis(config.dispatch.confirm_timeout_ms),
    ));
    let orchestrator = Orchestrator::new(
        stores.jobs.clone(),
        stores.ledger.clone(),
        primary,
        secondary,
        dispatcher,
        OrchestratorConfig::builder()
            .max_pages(config.limits.max_pages)
            .max_attempts(config.limits.max_attempts)
            .render_width(config.limits.render_width)
            .batch_size(config.dispatch.batch_size)
            .batch_delay(Duration::from_millis(config.dispatch.batch_delay_ms))
            .build(),
    );

    let summary = orchestrator
        .ingest(IngestRequest {
            document_id: args.document_id,
            tenant_id: args.tenant,
            source,
        })
        .await?;
    println!(
        "{}: {} pages, {} jobs created, {} dispatched",
        summary.document_id, summary.page_count, summary.jobs_created, summary.jobs_dispatched
    );
    Ok(())
}

async fn stage_local_file(
    primary: &Arc<dyn ObjectStore>,
    document_id: &str,
    file: &PathBuf,
) -> Result<PageSource, AppError> {
    let bytes = tokio::fs::read(file).await.map_err(|source| AppError::Io {
        path: file.clone(),
        source,
    })?;
    let key = format!("{document_id}/source.pdf");
    primary
        .put(UPLOAD_BUCKET, &key, bytes.into())
        .await?;
    Ok(PageSource::Object {
        store: StoreKind::Primary,
        bucket: UPLOAD_BUCKET.to_string(),
        key,
    })
}

fn amend(stores: &Stores, args: AmendArgs) -> Result<(), AppError> {
    let key = ItemKey {
        document_id: args.document_id.clone(),
        page_number: args.page,
        ordinal: args.ordinal,
    };
    let edits = ItemEdits {
        claim_number: args.claim_number,
        patient_name: args.patient_name,
        member_id: args.member_id,
        procedure_code: args.procedure_code,
        service_date: parse_opt(args.service_date.as_deref(), parse_date)?,
        billed_amount: parse_opt(args.billed.as_deref(), parse_amount)?,
        paid_amount: parse_opt(args.paid.as_deref(), parse_amount)?,
        patient_responsibility: parse_opt(args.patient_responsibility.as_deref(), parse_amount)?,
        ..ItemEdits::default()
    };
    let updated = stores.items.update_item(&key, &edits)?;
    println!("{}", serde_json::to_string_pretty(&updated)?);

    // Edits re-trigger exception evaluation on the owning document.
    let report = stores.items.evaluate_document(&args.document_id)?;
    let status = if report.needs_review() {
        ReviewStatus::NeedsReview
    } else {
        ReviewStatus::Reviewed
    };
    stores.jobs.set_review(
        &args.document_id,
        status,
        report.review_reasons,
        report.found_revenue,
    )?;
    Ok(())
}

fn export(stores: &Stores, args: ExportArgs) -> Result<(), AppError> {
    let service = ExportService::new(
        stores.jobs.clone(),
        Arc::clone(&stores.items),
        stores.profiles.clone(),
    );
    let result = service.generate(&args.tenant, &args.document_ids)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, &result.content).map_err(|source| AppError::Io {
                path: path.clone(),
                source,
            })?;
            println!(
                "batch {} written to {} ({} transaction sets)",
                result.batch_id,
                path.display(),
                result.totals.len()
            );
        }
        None => {
            print!("{}", result.content);
            eprintln!(
                "batch {} ({} transaction sets)",
                result.batch_id,
                result.totals.len()
            );
        }
    }
    Ok(())
}

async fn reprocess(config: &AppConfig, stores: &Stores, document_id: &str) -> Result<(), AppError> {
    use remitra_app::services::DocumentStatus;

    let document = stores
        .jobs
        .get_document(document_id)?
        .ok_or_else(|| AppError::DocumentNotFound(document_id.to_string()))?;

    // A fully failed document had its charge refunded; reprocessing it is a
    // fresh consumption.
    if document.status == DocumentStatus::Failed && document.page_count > 0 {
        let required = u64::from(document.page_count);
        if !stores.ledger.charge(&document.tenant_id, required)? {
            let available = stores.ledger.balance(&document.tenant_id)?;
            return Err(AppError::InsufficientCredits {
                required,
                available,
            });
        }
    }

    let jobs = stores.jobs.reset_for_reprocess(document_id)?;
    let (primary, _) = object_stores(stores)?;
    let worker = build_worker(config, stores, primary)?;
    let dispatcher = TokioDispatcher::new(
        worker,
        Duration::from_millis(config.dispatch.confirm_timeout_ms),
    );
    let mut dispatched = 0u32;
    for job in &jobs {
        let job_ref = JobRef {
            document_id: job.document_id.clone(),
            page_number: job.page_number,
            tenant_id: job.tenant_id.clone(),
        };
        if dispatcher.dispatch(job_ref).await.is_ok() {
            dispatched += 1;
        }
    }
    println!("{document_id}: {} jobs re-queued, {dispatched} dispatched", jobs.len());
    Ok(())
}

fn parse_opt<T>(
    value: Option<&str>,
    parse: impl Fn(&str) -> Result<T, AppError>,
) -> Result<Option<T>, AppError> {
    value.map(parse).transpose()
}

fn parse_amount(raw: &str) -> Result<Decimal, AppError> {
    Decimal::from_str(raw)
        .map_err(|_| AppError::InvalidArgument(format!("invalid amount `{raw}`")))
}

fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::from_str(raw)
        .map_err(|_| AppError::InvalidArgument(format!("invalid date `{raw}` (expected YYYY-MM-DD)")))
}
