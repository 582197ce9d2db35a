use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use gdi_geocode::{load_snapshot, SNAPSHOT_FORMAT_VERSION};
use gdi_proximity::{MatchConfig, ProximityRequest, DEFAULT_THRESHOLD_M};
use gdi_sync::{SyncConfig, SyncPipeline};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gdi")]
#[command(about = "Government data ingest: schema-evolving loads, geocoding and proximity matching")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every enabled source once, then recompute proximity matches.
    Sync,
    /// Recompute one proximity match set between two persisted tables.
    Match {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        #[arg(long, default_value_t = DEFAULT_THRESHOLD_M)]
        meters: f64,
        /// Only match rows whose values in this column are equal.
        #[arg(long)]
        group_column: Option<String>,
    },
    /// Show what the geocode snapshot holds.
    CacheStats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            let inserted: u64 = summary.units.iter().map(|u| u.rows_inserted).sum();
            println!(
                "sync complete: run_id={} units={} rows_inserted={} located={} missed={} match_sets={} reports={}",
                summary.run_id,
                summary.units.len(),
                inserted,
                summary.geocoding.records_located,
                summary.geocoding.records_missed,
                summary.matches.len(),
                summary.reports_dir
            );
            if let Some(reason) = &summary.aborted {
                bail!("sync aborted: {reason}");
            }
            if !summary.is_success() {
                warn!("sync finished with failures; see {}/run_summary.md", summary.reports_dir);
            }
        }
        Commands::Match {
            source,
            target,
            meters,
            group_column,
        } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let request = ProximityRequest {
                source_table: source,
                target_table: target,
                config: MatchConfig {
                    threshold_meters: meters,
                    require_same_group: group_column.is_some(),
                },
                group_column,
            };
            let report = pipeline.run_match(&request).await?;
            println!(
                "{} -> {} ({}): matches={} excluded_source={} excluded_target={}",
                report.source_table,
                report.target_table,
                report.match_type,
                report.matches,
                report.excluded_source,
                report.excluded_target
            );
        }
        Commands::CacheStats => {
            let entries = load_snapshot(&config.geocode_cache).await?;
            let newest = entries.values().map(|e| e.cached_at).max();
            println!(
                "geocode snapshot {}: format_version={} entries={} newest={}",
                config.geocode_cache.display(),
                SNAPSHOT_FORMAT_VERSION,
                entries.len(),
                newest.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
            );
        }
    }

    Ok(())
}
