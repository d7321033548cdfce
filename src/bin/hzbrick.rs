use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hzbrick::{BrickFactory, ByteOrder, ComputeContext, Dims3, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hzbrick")]
#[command(author, version, about = "Partition a volume into HZ-ordered bricks")]
#[command(propagate_version = true)]
struct Cli {
    /// Worker threads for the compute pool (0 = one per core)
    #[arg(long, global = true, default_value_t = 0)]
    threads: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition the volume and print the brick layout without writing anything
    Plan {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        bricking: BrickingArgs,
    },

    /// Partition the volume and write the bricks and metadata.json
    Brick {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        bricking: BrickingArgs,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Flat binary volume file
    #[arg(long, conflicts_with = "stack", requires = "dims")]
    raw: Option<PathBuf>,

    /// Extents of the raw volume
    #[arg(long, num_args = 3, value_names = ["W", "H", "D"])]
    dims: Option<Vec<u32>>,

    /// Bits per sample of the raw volume (8 or 16)
    #[arg(long, default_value_t = 8)]
    bits: u32,

    /// Raw 16-bit samples are big-endian
    #[arg(long)]
    big_endian: bool,

    /// Directory of TIFF/PNG slices
    #[arg(long, required_unless_present = "raw")]
    stack: Option<PathBuf>,
}

#[derive(Args)]
struct BrickingArgs {
    /// JSON settings file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Smallest brick edge (power of two)
    #[arg(long)]
    min: Option<u32>,

    /// Largest brick edge (power of two)
    #[arg(long)]
    max: Option<u32>,

    /// Rescale 16-bit samples to 8 bits
    #[arg(long)]
    map_to_8bpp: bool,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl BrickingArgs {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_json_file(path)
                .with_context(|| format!("loading settings from {}", path.display()))?,
            None => Settings::default(),
        };
        if let Some(min) = self.min {
            settings.set_min_brick_size(min)?;
        }
        if let Some(max) = self.max {
            settings.set_max_brick_size(max)?;
        }
        if self.map_to_8bpp {
            settings.map_to_8bpp = true;
        }
        if let Some(output) = &self.output {
            settings.output_path = output.clone();
        }
        settings.validate()?;
        Ok(settings)
    }
}

async fn open_factory(
    threads: usize,
    input: &InputArgs,
    bricking: &BrickingArgs,
) -> Result<BrickFactory> {
    let ctx = Arc::new(ComputeContext::new(threads)?);
    let factory = BrickFactory::new(bricking.settings()?, ctx)?;

    let names = match (&input.raw, &input.stack) {
        (Some(raw), _) => {
            let dims = match input.dims.as_deref() {
                Some(&[w, h, d]) => Dims3::new(w, h, d),
                _ => bail!("--raw needs --dims W H D"),
            };
            let order = if input.big_endian {
                ByteOrder::BigEndian
            } else {
                ByteOrder::LittleEndian
            };
            factory.open_raw(raw, dims, input.bits, order)?
        }
        (None, Some(stack)) => factory.open_image_stack(stack).await?,
        (None, None) => bail!("either --raw or --stack is required"),
    };
    tracing::info!("Volume has {} slices", names.len());
    Ok(factory)
}

fn plan(factory: &BrickFactory) -> Result<()> {
    let partition = factory.partitions()?;
    let octree = factory.octree()?;
    let (_, size) = factory.result_file_size()?;

    println!("{}", partition.summary());
    println!(
        "octree: {} nodes, {} leaves, depth {}",
        octree.total_nodes(),
        octree.leaf_count(),
        octree.depth()
    );
    println!("output: {} in {}", size, factory.output_path().display());
    for (i, brick) in partition.bricks.iter().enumerate() {
        println!("{:>6}  {}", i, brick);
    }
    Ok(())
}

async fn brick(factory: &BrickFactory) -> Result<()> {
    let progress = factory.progress();
    let poller = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            if progress.is_done() {
                break;
            }
            tracing::info!(
                "slice {}/{}, bricks {}/{} ({:.1}%)",
                progress.slices_completed(),
                progress.total_slices(),
                progress.bricks_completed(),
                progress.total_bricks(),
                progress.fraction() * 100.0
            );
        }
    });

    let result = factory.generate_bricks().await;
    poller.abort();
    let report = result?;

    println!(
        "wrote {} bricks ({} bytes) from {} slices to {}",
        report.bricks_written,
        report.bytes_allocated,
        report.slices_processed,
        factory.output_path().display()
    );
    Ok(())
}

/// `RUST_LOG` directives when given and valid, `info` otherwise
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(log_filter(rust_log.as_deref()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { input, bricking } => {
            let factory = open_factory(cli.threads, &input, &bricking).await?;
            plan(&factory)
        }
        Commands::Brick { input, bricking } => {
            let factory = open_factory(cli.threads, &input, &bricking).await?;
            brick(&factory).await
        }
    }
}
