use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcpmux", about = "A multiplexing gateway for the Model Context Protocol", version)]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short = 'f', long = "config")]
	config: PathBuf,

	/// Log filter, e.g. "info" or "mcpmux=debug". Overrides RUST_LOG.
	#[arg(long)]
	log_filter: Option<String>,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let filter = match &args.log_filter {
		Some(f) => EnvFilter::try_new(f).context("parsing --log-filter")?,
		None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
	};
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let cfg = mcpmux::config::Config::from_file(&args.config)?;

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("building runtime")?
		.block_on(mcpmux::app::run(cfg))
}
