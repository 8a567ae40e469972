//! The purge command: connect, remove every app resource, report.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
	config::PurgeConfig,
	k8s::{client::ClusterConnection, dynamic::KubeClusterApi},
	purge::{self, PurgeReport, Verification},
};

#[derive(Args, Debug, Default)]
pub struct PurgeArgs {
	/// Enable debug logging
	#[arg(short, long)]
	pub verbose: bool,

	/// YAML file overriding the built-in bpfman settings
	#[arg(short, long)]
	pub config: Option<PathBuf>,

	/// Kubeconfig to use instead of the in-cluster service account
	#[arg(long)]
	pub kubeconfig: Option<PathBuf>,

	/// Kubeconfig context to use
	#[arg(long)]
	pub context: Option<String>,

	/// Deadline for the whole run in seconds
	#[arg(long)]
	pub timeout: Option<u64>,
}

impl PurgeArgs {
	/// Load the config file (or defaults) and apply CLI overrides.
	pub fn load_config(&self) -> Result<PurgeConfig> {
		let mut config = PurgeConfig::load(self.config.as_deref())?;
		if let Some(timeout) = self.timeout {
			config.timeout_seconds = timeout;
			config.validate().context("invalid --timeout")?;
		}
		Ok(config)
	}
}

/// Run the purge command.
pub fn run(args: PurgeArgs) -> Result<()> {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("failed to create tokio runtime")?;
	runtime.block_on(run_async(args))
}

/// Connect and purge.
///
/// Only configuration and connection problems are errors; a failed or
/// incomplete purge is logged and still counts as a finished run.
#[instrument(skip_all)]
pub async fn run_async(args: PurgeArgs) -> Result<()> {
	let config = args.load_config()?;
	info!(app = %config.app, timeout = ?config.timeout(), "starting purger");

	let connection =
		ClusterConnection::from_environment(args.kubeconfig.as_deref(), args.context.as_deref())
			.await
			.context("failed to create Kubernetes client")?;

	match connection.client().apiserver_version().await {
		Ok(version) => info!(
			cluster = connection.cluster_identifier(),
			version = %version.git_version,
			"connected to Kubernetes"
		),
		Err(e) => warn!(
			cluster = connection.cluster_identifier(),
			error = %e,
			"failed to read server version"
		),
	}

	let cancel = CancellationToken::new();
	let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

	let api = Arc::new(KubeClusterApi::new(connection.client().clone()));
	let result = purge::run(api, &config, cancel).await;
	signals.abort();

	match result {
		Ok(report) => log_summary(&report),
		Err(e) => error!(error = %e, "purge failed"),
	}
	Ok(())
}

fn log_summary(report: &PurgeReport) {
	info!(
		discovered = report.discovered,
		deleted = report.deleted(),
		failed = report.failed(),
		"purge complete"
	);
	match &report.verification {
		Verification::Clean => info!("cluster is clean"),
		Verification::Remaining(remaining) => {
			warn!(count = remaining.len(), "resources remain after purge")
		}
		Verification::Skipped(reason) => warn!(reason = %reason, "cleanup was not verified"),
	}
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			warn!(error = %e, "failed to install Ctrl+C handler");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(e) => {
				warn!(error = %e, "failed to install SIGTERM handler");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
	warn!("received shutdown signal, cancelling");
	cancel.cancel();
}
