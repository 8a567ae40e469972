//! Kubernetes cluster connection management.

use std::{path::Path, time::Duration};

use kube::{
	config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
	Client, Config,
};
use thiserror::Error;
use tracing::instrument;

/// Default timeout for Kubernetes API requests.
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when connecting to a Kubernetes cluster.
#[derive(Debug, Error)]
pub enum ConnectionError {
	#[error("failed to load kubeconfig")]
	Kubeconfig(#[from] KubeconfigError),

	#[error("failed to create kubernetes client")]
	Kube(#[from] kube::Error),
}

/// Represents a connection to a Kubernetes cluster.
#[derive(Clone)]
pub struct ClusterConnection {
	client: Client,
	/// Human-readable identifier for the cluster (context name or in-cluster).
	cluster_identifier: String,
}

impl std::fmt::Debug for ClusterConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClusterConnection")
			.field("cluster_identifier", &self.cluster_identifier)
			.finish_non_exhaustive()
	}
}

impl ClusterConnection {
	/// Connect using the ambient environment.
	///
	/// - Without an explicit kubeconfig or context, the in-cluster service
	///   account is tried first.
	/// - Otherwise the kubeconfig at `kubeconfig_path` is used, falling back to
	///   `$KUBECONFIG` or `~/.kube/config`.
	#[instrument(skip_all)]
	pub async fn from_environment(
		kubeconfig_path: Option<&Path>,
		context: Option<&str>,
	) -> Result<Self, ConnectionError> {
		if kubeconfig_path.is_none() && context.is_none() {
			match Config::incluster() {
				Ok(config) => return Self::from_config(config, "in-cluster".to_string()),
				Err(e) => {
					tracing::debug!(error = %e, "not running in a cluster, using kubeconfig");
				}
			}
		}

		let kubeconfig = match kubeconfig_path {
			Some(path) => Kubeconfig::read_from(path)?,
			None => Kubeconfig::read()?,
		};
		Self::from_kubeconfig(kubeconfig, context).await
	}

	/// Connect using an already loaded kubeconfig.
	///
	/// `context` selects a context by name; the kubeconfig's current context
	/// is used otherwise.
	#[instrument(skip_all)]
	pub async fn from_kubeconfig(
		kubeconfig: Kubeconfig,
		context: Option<&str>,
	) -> Result<Self, ConnectionError> {
		let cluster_identifier = context
			.map(str::to_string)
			.or_else(|| kubeconfig.current_context.clone())
			.map(|name| format!("context:{name}"))
			.unwrap_or_else(|| "kubeconfig".to_string());

		let config = Config::from_custom_kubeconfig(
			kubeconfig,
			&KubeConfigOptions {
				context: context.map(str::to_string),
				..Default::default()
			},
		)
		.await?;

		Self::from_config(config, cluster_identifier)
	}

	fn from_config(mut config: Config, cluster_identifier: String) -> Result<Self, ConnectionError> {
		config.read_timeout = Some(DEFAULT_API_TIMEOUT);
		let client = Client::try_from(config)?;
		Ok(Self {
			client,
			cluster_identifier,
		})
	}

	/// Get a reference to the underlying kube client.
	pub fn client(&self) -> &Client {
		&self.client
	}

	/// Get the cluster identifier.
	pub fn cluster_identifier(&self) -> &str {
		&self.cluster_identifier
	}
}
