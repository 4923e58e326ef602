use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::comm::{Communicator, LocalGroup, SingleRank};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "openpmd-pipe",
    version,
    about = "Copy an openPMD-style series from one backend to another",
    long_about = "`openpmd-pipe` reads a series iteration by iteration and writes it to another location,
redistributing the chunks of every dataset over a group of cooperating ranks.

Locations ending in .json are JSON documents; memory://<name> selects an in-process series.
In-process series vanish with the process, so memory:// is accepted as --outfile only.

EXIT CODES:
    0 - Series copied
    1 - Errors occurred (including missing --infile/--outfile)
    2 - Invalid command line

EXAMPLES:
    # Copy a series, splitting every dataset over 4 ranks
    openpmd-pipe --infile in.json --outfile out.json --ranks 4 --summary

    # Keep whole chunks and balance them by size
    openpmd-pipe --infile in.json --outfile out.json --chunk-distribution binpacking"
)]
struct Args {
    // Series
    /// Source series location
    #[arg(long, value_name = "LOCATION", help_heading = "Series")]
    infile: Option<String>,

    /// Destination series location
    #[arg(long, value_name = "LOCATION", help_heading = "Series")]
    outfile: Option<String>,

    /// JSON configuration of the source, e.g. '{"backend": "json"}'
    #[arg(
        long,
        default_value = "{}",
        value_name = "JSON",
        help_heading = "Series"
    )]
    inconfig: String,

    /// JSON configuration of the destination, e.g. '{"pretty": true}'
    #[arg(
        long,
        default_value = "{}",
        value_name = "JSON",
        help_heading = "Series"
    )]
    outconfig: String,

    // Distribution
    /// Chunk distribution strategy
    ///
    /// One of: roundrobin, binpacking, slicedataset, hostname_<inner>_<outer>
    #[arg(
        long,
        env = "OPENPMD_CHUNK_DISTRIBUTION",
        default_value = "hostname_binpacking_slicedataset",
        value_name = "NAME",
        help_heading = "Distribution"
    )]
    chunk_distribution: String,

    /// What ranks publish as their host for host-aware strategies
    #[arg(
        long,
        value_enum,
        default_value_t = common::Placement::Hostname,
        help_heading = "Distribution"
    )]
    placement: common::Placement,

    /// Number of cooperating ranks, run as concurrent tasks of this process
    #[arg(
        long,
        default_value = "1",
        value_name = "N",
        value_parser = clap::value_parser!(u16).range(1..),
        help_heading = "Distribution"
    )]
    ranks: u16,

    // Diagnostics
    /// Directory for per-rank timing logs (PIPE_times_<rank>.txt)
    #[arg(long, value_name = "DIR", help_heading = "Diagnostics")]
    timing_dir: Option<PathBuf>,

    /// Log every chunk a rank takes over (needs -v)
    #[arg(long, help_heading = "Diagnostics")]
    debug_chunks: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Diagnostics")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Diagnostics")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Diagnostics")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

/// Everything a rank needs, shared by all ranks.
#[derive(Debug)]
struct Job {
    infile: String,
    outfile: String,
    inconfig: common::SeriesConfig,
    outconfig: common::SeriesConfig,
    placement: common::Placement,
    timing_dir: Option<PathBuf>,
    settings: common::Settings,
}

async fn run_rank(comm: Arc<dyn Communicator>, job: Arc<Job>) -> Result<common::Summary> {
    let rank = comm.rank();
    let out_ranks = common::RankDirectory::collect(comm.as_ref(), job.placement).await?;
    let mut src = common::backend::open_reader(&job.infile, &job.inconfig, comm.clone()).await?;
    let mut dst = common::backend::open_writer(&job.outfile, &job.outconfig, comm.clone()).await?;
    let mut timing = match &job.timing_dir {
        Some(dir) => common::timing::TimingLog::create(dir, rank, comm.size()).await,
        None => common::timing::TimingLog::disabled(),
    };
    let pipe = common::Pipe::new(comm, out_ranks, job.settings.clone());
    let summary = pipe
        .run(src.as_mut(), dst.as_mut(), &mut timing)
        .await
        .with_context(|| format!("rank {rank} failed"))?;
    Ok(summary)
}

async fn async_main(args: Args, infile: String, outfile: String) -> Result<common::Summary> {
    let inconfig = common::SeriesConfig::parse(&args.inconfig)?;
    // nothing in a fresh process can have produced an in-memory series
    let in_kind = common::backend::backend_kind(&infile, &inconfig)?;
    if in_kind == common::config::BackendKind::Memory {
        return Err(common::PipeError::Configuration(format!(
            "cannot read {infile:?}: in-memory series are not shared between processes"
        ))
        .into());
    }
    let job = Arc::new(Job {
        infile,
        outfile,
        inconfig,
        outconfig: common::SeriesConfig::parse(&args.outconfig)?,
        placement: args.placement,
        timing_dir: args.timing_dir,
        settings: common::Settings {
            strategy: args.chunk_distribution.parse()?,
            debug_chunks: args.debug_chunks,
        },
    });
    tracing::info!(
        "piping {} -> {} on {} ranks using {}",
        &job.infile,
        &job.outfile,
        args.ranks,
        &job.settings.strategy
    );
    if args.ranks == 1 {
        return run_rank(Arc::new(SingleRank), job).await;
    }
    let mut join_set = tokio::task::JoinSet::new();
    for member in LocalGroup::new(usize::from(args.ranks)) {
        join_set.spawn(run_rank(Arc::new(member), job.clone()));
    }
    let mut summary = common::Summary::default();
    // the first failure ends the run, dropping the set aborts the remaining ranks
    while let Some(res) = join_set.join_next().await {
        summary = summary + res??;
    }
    Ok(summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (Some(infile), Some(outfile)) = (args.infile.clone(), args.outfile.clone()) else {
        eprintln!("Please specify parameters --infile and --outfile.");
        std::process::exit(1);
    };
    let func = {
        let args = args.clone();
        || async_main(args, infile, outfile)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
