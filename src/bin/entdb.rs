//! `entdb` binary: serve the pipeline, inspect schemas, restore tenants.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use entdb::config::Config;
use entdb::recovery::RestoreTool;
use entdb::schema::{check_compatibility, SchemaRegistry};
use entdb::store::{SnippetExtractors, TenantStores};
use entdb::wal::log::DiskWalConfig;
use entdb::wal::DiskWal;
use entdb::{Server, TenantId, WalPosition};

#[derive(Parser)]
#[command(name = "entdb", version, about = "Multi-tenant event-sourced graph database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline (coordinator, applier, archiver,
    /// snapshotter) until killed.
    Serve(ServeArgs),
    /// Schema inspection and compatibility checks.
    #[command(subcommand)]
    Schema(SchemaCommand),
    /// Rebuild a tenant from snapshot + archive + live WAL.
    Restore(RestoreArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Path to the TOML config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Schema document (JSON); overrides `registry.schema_module`.
    #[arg(long)]
    schema: Option<PathBuf>,
}

#[derive(Subcommand)]
enum SchemaCommand {
    /// Print a schema document and its fingerprint.
    Show {
        #[arg(long)]
        schema: PathBuf,
    },
    /// Diff a candidate schema against a deployed baseline; exits
    /// non-zero on breaking changes.
    Check {
        #[arg(long)]
        baseline: PathBuf,
        #[arg(long)]
        candidate: PathBuf,
    },
}

#[derive(Args)]
struct RestoreArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    schema: Option<PathBuf>,
    /// Tenant to rebuild.
    #[arg(long)]
    tenant: String,
    /// Stop replay at this offset (within the tenant's partition);
    /// omit for full recovery.
    #[arg(long)]
    offset: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Schema(command) => schema(command),
        Command::Restore(args) => restore(args),
    }
}

fn serve(args: ServeArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = Config::load_or_default(args.config.as_deref())?;
    entdb::telemetry::init(&config.logging);

    let registry = load_registry(args.schema.as_deref().or(config.registry.schema_module.as_deref()))?;
    let handle = Server::start(config, registry, SnippetExtractors::new())?;
    tracing::info!("serving; schema fingerprint {}", handle.registry().fingerprint()?);

    // Transport handlers attach to the handle out-of-crate; keep the
    // process alive until killed.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}

fn schema(command: SchemaCommand) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match command {
        SchemaCommand::Show { schema } => {
            let mut registry = load_registry(Some(&schema))?;
            let fingerprint = registry.freeze()?;
            println!("{}", registry.to_json()?);
            println!("fingerprint: {fingerprint}");
            Ok(ExitCode::SUCCESS)
        }
        SchemaCommand::Check {
            baseline,
            candidate,
        } => {
            let baseline = load_registry(Some(&baseline))?.to_doc();
            let candidate = load_registry(Some(&candidate))?.to_doc();
            let changes = check_compatibility(&baseline, &candidate);
            let mut breaking = 0usize;
            for change in &changes {
                println!("{change}");
                if change.is_breaking() {
                    breaking += 1;
                }
            }
            if breaking > 0 {
                eprintln!("{breaking} breaking change(s)");
                return Ok(ExitCode::FAILURE);
            }
            println!("compatible ({} change(s))", changes.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn restore(args: RestoreArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = Config::load_or_default(args.config.as_deref())?;
    entdb::telemetry::init(&config.logging);
    let tenant = TenantId::parse(args.tenant)?;

    let mut registry = load_registry(
        args.schema.as_deref().or(config.registry.schema_module.as_deref()),
    )?;
    registry.freeze()?;
    let registry = Arc::new(registry);

    let wal = Arc::new(DiskWal::open(
        config.wal_dir(),
        DiskWalConfig {
            partitions: config.wal.partitions,
            max_record_bytes: config.wal.max_record_bytes,
            segment_max_bytes: config.wal.segment_max_bytes,
            sync_on_append: true,
        },
    )?);
    let stores = Arc::new(TenantStores::new(config.store_data_dir()));
    let objects = Arc::new(entdb::objstore::FsObjectStore::new(config.objstore_root()));

    let tool = RestoreTool::new(
        stores,
        objects,
        wal.clone(),
        registry,
        Arc::new(SnippetExtractors::new()),
        config.snapshot.object_prefix.clone(),
        config.archive.object_prefix.clone(),
    );
    let target = args.offset.map(|offset| {
        let partition = entdb::wal::Wal::partition_for_key(wal.as_ref(), &tenant);
        WalPosition::new(partition, offset)
    });
    let report = tool.restore_tenant(&tenant, target, None)?;
    println!(
        "restored {}: snapshot={:?} archive_events={} live_events={} final={:?}",
        report.tenant_id,
        report.snapshot_position,
        report.archive_replayed,
        report.live_replayed,
        report.final_position
    );
    Ok(ExitCode::SUCCESS)
}

fn load_registry(path: Option<&std::path::Path>) -> Result<SchemaRegistry, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Err("no schema document given (use --schema or registry.schema_module)".into());
    };
    let json = std::fs::read_to_string(path)?;
    Ok(SchemaRegistry::from_json(&json)?)
}
