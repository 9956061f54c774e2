use clap::Parser;
use plotpress::{NullSink, Phase3, Phase3Config, PlotContext};
use std::path::PathBuf;

/// Run Phase 3 table compression over a plot work directory.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Work directory holding the Phase 1/2 outputs and `plot.manifest`
    #[arg(short, long)]
    dir: PathBuf,

    /// Worker threads (defaults to all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Fixed heap budget in MiB (defaults to the minimum for the plot)
    #[arg(long)]
    heap_mb: Option<usize>,

    /// Carry window of extra l-entries loaded per bucket
    #[arg(long, default_value_t = 1024)]
    extra_l_entries: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut ctx = PlotContext::read_manifest(&args.dir)?;

    let mut cfg = Phase3Config::default().extra_l_entries(args.extra_l_entries);
    if let Some(n) = args.threads {
        cfg = cfg.threads(n);
    }
    if let Some(mb) = args.heap_mb {
        cfg = cfg.heap_size(mb * 1024 * 1024);
    }

    let mut phase = Phase3::new(&args.dir, &mut ctx, cfg, NullSink)?;
    phase.run()?;
    phase.finish()?;

    ctx.write_manifest(&args.dir)?;
    eprintln!(
        "Compressed tables 2-7; entry counts now {:?}",
        ctx.entry_counts
    );

    Ok(())
}
