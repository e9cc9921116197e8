use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use menumap_core::{SelectionCursor, REGION_SLUGS};
use menumap_harvest::{export_bundle, HarvestConfig, HarvestPlan, Harvester};
use menumap_store::{load_tree, save_tree};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "menumap")]
#[command(about = "Regional storefront menu & deals harvester")]
struct Cli {
    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest a region into the catalog snapshot.
    Harvest {
        /// Region slug to harvest (see `regions`).
        #[arg(long)]
        region: String,
        /// Restrict the listings pass to one subregion.
        #[arg(long)]
        subregion: Option<String>,
        #[arg(long)]
        skip_menus: bool,
        #[arg(long)]
        skip_deals: bool,
    },
    /// Export the CSV bundle for a selected region/subregion.
    Export {
        #[arg(long)]
        region: String,
        #[arg(long)]
        subregion: String,
    },
    /// List the supported region slugs.
    Regions,
    /// List a subregion's listings from the snapshot.
    Listings {
        #[arg(long)]
        region: String,
        #[arg(long)]
        subregion: String,
        /// Only listings that report menu items.
        #[arg(long)]
        with_menu_only: bool,
    },
    /// Show per-subregion counts from the snapshot.
    Status,
}

fn init_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    let config = HarvestConfig::from_env();

    match cli.command {
        Commands::Harvest {
            region,
            subregion,
            skip_menus,
            skip_deals,
        } => {
            let tree = load_tree(&config.snapshot_path()).await?;
            let mut harvester = Harvester::from_config(tree, &config)?;
            let plan = HarvestPlan {
                region,
                subregion,
                menus: !skip_menus,
                deals: !skip_deals,
            };
            let report = harvester.run(&plan).await?;
            save_tree(&config.snapshot_path(), harvester.tree()).await?;
            println!(
                "harvest complete: run_id={} region={} subregions={} listings={} menu_items={} deals={} failed_units={} skipped_records={}",
                report.run_id,
                report.region,
                report.subregions_discovered,
                report.listings_merged,
                report.menu_items_merged,
                report.deals_merged,
                report.units_failed,
                report.records_skipped
            );
        }
        Commands::Export { region, subregion } => {
            let tree = load_tree(&config.snapshot_path()).await?;
            let mut cursor = SelectionCursor::new();
            if !cursor.select_region(&tree, &region) || !cursor.select_subregion(&tree, &subregion)
            {
                anyhow::bail!("selection failed; harvest {region}/{subregion} first");
            }
            let run_id = Uuid::new_v4();
            let dir = config.exports_dir().join(run_id.to_string());
            let manifest = export_bundle(&tree, &region, &subregion, &dir, run_id)?;
            println!(
                "export complete: run_id={} dir={} files={}",
                run_id,
                dir.display(),
                manifest.files.len()
            );
        }
        Commands::Regions => {
            for region in REGION_SLUGS {
                println!("- {region}");
            }
            println!("region count: {}", REGION_SLUGS.len());
        }
        Commands::Listings {
            region,
            subregion,
            with_menu_only,
        } => {
            let tree = load_tree(&config.snapshot_path()).await?;
            let node = tree
                .subregion(&region, &subregion)
                .with_context(|| format!("subregion {region}/{subregion} not loaded"))?;
            let listings = node
                .listings
                .as_ref()
                .with_context(|| format!("no listings harvested for {region}/{subregion}"))?;
            let mut total = 0usize;
            for (slug, listing) in listings {
                if with_menu_only && listing.menu_items_count.unwrap_or(0) == 0 {
                    continue;
                }
                println!("- {slug}");
                total += 1;
            }
            println!("listing count: {total}");
        }
        Commands::Status => {
            let tree = load_tree(&config.snapshot_path()).await?;
            if tree.is_empty() {
                println!("snapshot is empty; nothing harvested yet");
                return Ok(());
            }
            for (region, subregions) in tree.regions() {
                println!("{region}");
                for (slug, subregion) in subregions {
                    let listings = subregion.listings.as_ref().map_or(0, |l| l.len());
                    let menu_items: usize = subregion.listings.as_ref().map_or(0, |listings| {
                        listings
                            .values()
                            .map(|listing| listing.menu.as_ref().map_or(0, |menu| menu.len()))
                            .sum()
                    });
                    let deals = subregion.deals.as_ref().map_or(0, |d| d.len());
                    println!("  {slug}: listings={listings} menu_items={menu_items} deals={deals}");
                }
            }
        }
    }

    Ok(())
}
