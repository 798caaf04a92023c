use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use marquee_core::{AffinityVariant, UserId};
use marquee_sync::{AggregateOutcome, ImportConfig, ImportRunSummary, VariantReport, MAX_BATCH_SIZE};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marquee")]
#[command(about = "Movie catalog importer and genre-affinity summaries")]
struct Cli {
    /// Directory holding movies.csv, ratings.csv, tags.csv and links.csv.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Rows per upsert statement.
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every enabled dataset, then rebuild the affinity summaries.
    Import {
        #[arg(long)]
        skip_aggregates: bool,
    },
    /// Rebuild the affinity summaries from the ratings already stored.
    Aggregate {
        /// Recompute even if the summary table already has rows.
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,
    },
    /// Create the database and tables, then exit.
    Schema,
    /// Show how a user rates other genres given how they rated `genre`.
    Affinity {
        user: UserId,
        genre: String,
        /// Use the high-rated summary instead of the low-rated one.
        #[arg(long)]
        high: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    Low,
    High,
}

impl From<VariantArg> for AffinityVariant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::Low => AffinityVariant::Low,
            VariantArg::High => AffinityVariant::High,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

fn print_import(summary: &ImportRunSummary) {
    println!(
        "import complete: run_id={} reports={}",
        summary.run_id, summary.reports_dir
    );
    for source in &summary.sources {
        println!(
            "  {:<8} {:?} written={} skipped_rows={} existing={}",
            source.dataset.to_string(),
            source.outcome,
            source.rows_written,
            source.skipped_rows,
            source.existing_rows
        );
    }
}

fn print_aggregates(reports: &[VariantReport]) -> Result<()> {
    let mut failed = 0usize;
    for report in reports {
        match (&report.outcome, &report.error) {
            (Some(AggregateOutcome::Skipped { existing_rows }), _) => println!(
                "aggregate {}: skipped, summary already has {existing_rows} rows",
                report.variant
            ),
            (
                Some(AggregateOutcome::Completed {
                    users,
                    summary_rows,
                    ..
                }),
                _,
            ) => println!(
                "aggregate {}: {summary_rows} rows for {users} users in {}ms",
                report.variant, report.elapsed_ms
            ),
            (None, error) => {
                failed += 1;
                println!(
                    "aggregate {}: failed: {}",
                    report.variant,
                    error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    if failed > 0 {
        bail!("{failed} aggregate variant(s) failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ImportConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
    }

    match cli.command.unwrap_or(Commands::Import {
        skip_aggregates: false,
    }) {
        Commands::Import { skip_aggregates } => {
            let summary = marquee_sync::run_import(config.clone()).await?;
            print_import(&summary);
            if !skip_aggregates {
                let reports =
                    marquee_sync::run_aggregates(&config, &AffinityVariant::ALL, false).await?;
                print_aggregates(&reports)?;
            }
        }
        Commands::Aggregate { force, variant } => {
            let variants: Vec<AffinityVariant> = match variant {
                Some(v) => vec![v.into()],
                None => AffinityVariant::ALL.to_vec(),
            };
            let reports = marquee_sync::run_aggregates(&config, &variants, force).await?;
            print_aggregates(&reports)?;
        }
        Commands::Schema => {
            marquee_sync::apply_schema(&config).await?;
            println!("schema applied");
        }
        Commands::Affinity { user, genre, high } => {
            let variant = if high {
                AffinityVariant::High
            } else {
                AffinityVariant::Low
            };
            let rows = marquee_sync::lookup_affinities(&config, variant, user, &genre).await?;
            if rows.is_empty() {
                println!("no {variant} summary rows for user {user} and {genre}");
            }
            for row in rows {
                println!(
                    "{:<20} avg={:.2} n={}",
                    row.other_genre, row.avg_other_rating, row.rating_count
                );
            }
        }
    }

    Ok(())
}
