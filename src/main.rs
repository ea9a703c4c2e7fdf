use clap::Parser;
use log::{debug, info, warn};
use rustc_hash::FxHashSet;
use std::error::Error;
use std::path::PathBuf;
use umaplook::{
    aggregate, list_available_strains, transform, AggregationMode, Bounds, ColorMode, DataStore,
    Dataset, DiskCache, ExpressionCache, ExpressionLoader, ExpressionVector, GeneRecord,
    LoaderConfig, MemoryCache, RenderOptions, Scene, ScatterView, TransformMode, ZarrBackend,
};

#[derive(Parser)]
#[command(name = "umaplook")]
#[command(about = "Render a gene expression scatter of a 2D cell embedding.", long_about = None)]
struct Args {
    // Data Options
    /// Dataset base location: an http(s) URL or a local directory.
    #[arg(short = 'd', long = "data", value_name = "URL|DIR", env = "UMAPLOOK_DATA")]
    data: String,

    /// Strain to load (defaults to --default-strain).
    #[arg(short = 's', long = "strain", value_name = "NAME")]
    strain: Option<String>,

    /// Print the strains listed in the dataset manifest and exit.
    #[arg(long = "list-strains")]
    list_strains: bool,

    /// Strain used when none is given and when the manifest is unavailable.
    #[arg(
        long = "default-strain",
        value_name = "NAME",
        default_value = umaplook::loader::DEFAULT_STRAIN
    )]
    default_strain: String,

    // Gene Options
    /// Genes to display, by id or symbol, comma separated.
    #[arg(short = 'g', long = "genes", value_name = "GENES", value_delimiter = ',')]
    genes: Vec<String>,

    /// Genes to highlight; other points are drawn subdued.
    #[arg(long = "highlight", value_name = "GENES", value_delimiter = ',')]
    highlight: Vec<String>,

    /// How several genes are combined: sum, average, min or max.
    #[arg(short = 'A', long = "aggregate", value_name = "MODE", default_value = "sum")]
    aggregation: AggregationMode,

    /// Transform applied after aggregation: linear or log1p.
    #[arg(short = 'T', long = "transform", value_name = "MODE", default_value = "linear")]
    transform: TransformMode,

    // Color Options
    /// Color points by time, cell-type or expression.
    #[arg(short = 'c', long = "color-by", value_name = "MODE", default_value = "time")]
    color_by: ColorMode,

    /// Scale point opacity by the displayed expression.
    #[arg(long = "alpha-by-expression")]
    alpha_by_expression: bool,

    /// Don't paint the legend.
    #[arg(long = "no-legend")]
    no_legend: bool,

    /// Fixed data bounds MIN_X,MIN_Y,MAX_X,MAX_Y (default: fit the points).
    #[arg(long = "bounds", value_name = "BOUNDS", allow_hyphen_values = true)]
    bounds: Option<Bounds>,

    // View Options
    /// Set the width in pixels of the output image.
    #[arg(short = 'x', long = "width", value_name = "N", default_value_t = 800)]
    width: u32,

    /// Set the height in pixels of the output image.
    #[arg(short = 'y', long = "height", value_name = "N", default_value_t = 600)]
    height: u32,

    /// Padding in pixels around the plot area.
    #[arg(long = "padding", value_name = "N", default_value_t = 20.0)]
    padding: f64,

    /// Point radius in pixels.
    #[arg(long = "point-radius", value_name = "N", default_value_t = 2.5)]
    point_radius: f64,

    /// Wheel zoom at X,Y by DELTA (negative zooms in). Repeatable.
    #[arg(
        long = "zoom",
        value_name = "X,Y,DELTA",
        value_parser = parse_triple,
        allow_hyphen_values = true
    )]
    zoom: Vec<(f64, f64, f64)>,

    /// Drag the view by DX,DY pixels. Repeatable.
    #[arg(
        long = "pan",
        value_name = "DX,DY",
        value_parser = parse_pair,
        allow_hyphen_values = true
    )]
    pan: Vec<(f64, f64)>,

    /// Hover the pointer at X,Y and print the tooltip.
    #[arg(long = "hover", value_name = "X,Y", value_parser = parse_pair)]
    hover: Option<(f64, f64)>,

    // Cache Options
    /// Directory of the persistent expression cache.
    #[arg(
        long = "cache-dir",
        value_name = "DIR",
        env = "UMAPLOOK_CACHE",
        default_value = ".umaplook-cache"
    )]
    cache_dir: PathBuf,

    /// Keep fetched vectors in memory only.
    #[arg(long = "no-disk-cache")]
    no_disk_cache: bool,

    /// Empty the cache before loading.
    #[arg(long = "clear-cache")]
    clear_cache: bool,

    /// Print the number of cached vectors when done.
    #[arg(long = "cache-stats")]
    cache_stats: bool,

    /// Write the rendered frame to this PNG FILE.
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: Option<PathBuf>,

    // Threading
    /// Number of threads to use for parallel operations.
    #[arg(short = 't', long = "threads", value_name = "N")]
    threads: Option<usize>,

    // Logging
    /// Verbosity level (0 = error, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1)]
    verbose: u8,
}

fn parse_floats(s: &str, n: usize) -> Result<Vec<f64>, String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("'{}': {}", p, e)))
        .collect::<Result<_, _>>()?;
    if values.len() != n {
        return Err(format!("expected {} comma separated numbers, got '{}'", n, s));
    }
    Ok(values)
}

fn parse_pair(s: &str) -> Result<(f64, f64), String> {
    let v = parse_floats(s, 2)?;
    Ok((v[0], v[1]))
}

fn parse_triple(s: &str) -> Result<(f64, f64, f64), String> {
    let v = parse_floats(s, 3)?;
    Ok((v[0], v[1], v[2]))
}

type BoxError = Box<dyn Error>;

fn resolve_genes(dataset: &Dataset, names: &[String]) -> Result<Vec<usize>, BoxError> {
    names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .map(|n| {
            dataset
                .gene_index(n.trim())
                .ok_or_else(|| format!("unknown gene '{}'", n).into())
        })
        .collect()
}

async fn run(args: &Args) -> Result<(), BoxError> {
    let store = DataStore::new(&args.data);

    if args.list_strains {
        for strain in list_available_strains(&store, &args.default_strain).await {
            println!("{}", strain);
        }
        return Ok(());
    }

    if args.no_disk_cache {
        render(args, store, MemoryCache::new()).await
    } else {
        debug!("Using cache directory {:?}", args.cache_dir);
        render(args, store, DiskCache::new(&args.cache_dir)).await
    }
}

async fn render<C: ExpressionCache>(
    args: &Args,
    store: DataStore,
    cache: C,
) -> Result<(), BoxError> {
    let config = LoaderConfig {
        default_strain: args.default_strain.clone(),
    };
    let mut loader = ExpressionLoader::new(ZarrBackend::new(store.clone()), cache, &config);
    if let Some(strain) = &args.strain {
        loader.set_strain(strain);
    }
    if args.clear_cache {
        info!("Clearing expression cache...");
        loader.clear_cache().await;
    }

    info!("Loading {} from {}...", loader.strain(), store.describe());
    let dataset = Dataset::load(&store, loader.strain()).await?;
    info!(
        "Loaded {} cells and {} genes",
        dataset.cell_count(),
        dataset.gene_count()
    );

    let selected = resolve_genes(&dataset, &args.genes)?;
    let highlighted = resolve_genes(&dataset, &args.highlight)?;
    let mut wanted: Vec<usize> = selected.clone();
    wanted.extend(&highlighted);

    let loaded = if wanted.is_empty() {
        Default::default()
    } else {
        info!("Loading expression for {} genes...", wanted.len());
        loader.load_for_display(&wanted).await?.unwrap_or_default()
    };
    if !loaded.failed_indices.is_empty() {
        warn!("Failed to load genes {:?}", loaded.failed_indices);
    }

    let vectors: Vec<ExpressionVector> = selected
        .iter()
        .filter_map(|i| loaded.data.get(i).cloned())
        .collect();
    let combined = if vectors.is_empty() {
        None
    } else {
        Some(transform(&aggregate(&vectors, args.aggregation)?, args.transform))
    };
    if args.color_by == ColorMode::Expression && combined.is_none() {
        warn!("No expression loaded; coloring every point as unexpressed");
    }

    let mut seen = FxHashSet::default();
    let gene_records: Vec<GeneRecord> = wanted
        .iter()
        .filter(|i| seen.insert(**i))
        .filter_map(|&i| {
            let values = loaded.data.get(&i)?.clone();
            let symbol = dataset.gene_symbol(i).unwrap_or(&dataset.gene_ids[i]).to_string();
            Some(GeneRecord { symbol, values })
        })
        .collect();

    let scene = Scene {
        points: dataset.points(),
        color_mode: args.color_by,
        color_values: combined.clone(),
        alpha_values: if args.alpha_by_expression { combined } else { None },
        overlay_active: !highlighted.is_empty(),
        bounds: args.bounds,
        gene_records,
        gene_count: vectors.len(),
        aggregation: args.aggregation,
        transform: args.transform,
    };
    let options = RenderOptions {
        width: args.width,
        height: args.height,
        padding: args.padding,
        point_radius: args.point_radius,
        show_legend: !args.no_legend,
        ..RenderOptions::default()
    };

    info!("Rendering image...");
    let mut view = ScatterView::new(options, scene);
    for &(dx, dy) in &args.pan {
        view.pan(dx, dy);
    }
    for &(x, y, delta) in &args.zoom {
        view.wheel(x, y, delta);
        view.on_frame();
    }
    if let Some((x, y)) = args.hover {
        view.pointer_move(x, y);
        view.on_frame();
        match view.tooltip() {
            Some(tip) => {
                for line in tip.lines() {
                    println!("{}", line);
                }
            }
            None => println!("no point within reach of {},{}", x, y),
        }
    }

    if let Some(out) = &args.out {
        info!("Saving to {:?}...", out);
        if view.draw_surface().is_none() {
            warn!("Empty drawing surface, nothing to save");
        } else {
            view.export_png(out)?;
        }
    }

    loader.flush().await;
    if args.cache_stats {
        println!("cached vectors: {}", loader.cache_stats().await.cached_count);
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    if let Some(threads) = args.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            eprintln!("Error setting up thread pool: {}", e);
            std::process::exit(1);
        }
    }

    info!("Starting visualization...");

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(&args)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    info!("Done.");
}
