use anyhow::Result;
use bpfman_purger::{commands::purge::PurgeArgs, telemetry};
use clap::Parser;

#[derive(Parser)]
#[command(name = "bpfman-purger")]
#[command(about = "Remove every bpfman resource from a Kubernetes cluster", long_about = None)]
#[command(version = env!("PURGER_VERSION"))]
struct Cli {
	#[command(flatten)]
	args: PurgeArgs,
}

fn main() -> Result<()> {
	let cli = Cli::parse();
	let _telemetry = telemetry::init(cli.args.verbose)?;
	bpfman_purger::commands::purge::run(cli.args)
}
