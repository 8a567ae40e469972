//! The purge engine: discover every app resource, delete them category by
//! category, then check that nothing is left.

pub mod delete;
pub mod discovery;
pub mod matcher;
pub mod rate;
pub mod resource;

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
	sync::{Semaphore, SemaphorePermit},
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use self::{
	delete::{delete_all, DeletionReport},
	discovery::{discover_all, DiscoveryError},
	matcher::ResourceMatcher,
	rate::RateController,
	resource::Category,
};
use crate::{
	config::PurgeConfig,
	k8s::api::{ApiError, ClusterApi, ResourceIdentity},
};

/// Shared handles for one purge run.
///
/// Cloning is cheap; every clone observes the same rate state, request
/// limit and cancellation.
#[derive(Clone)]
pub struct PurgeContext {
	api: Arc<dyn ClusterApi>,
	rate: Arc<RateController>,
	matcher: Arc<ResourceMatcher>,
	requests: Arc<Semaphore>,
}

impl PurgeContext {
	pub fn new(api: Arc<dyn ClusterApi>, config: &PurgeConfig, cancel: CancellationToken) -> Self {
		Self {
			api,
			rate: Arc::new(RateController::new(&config.rate_limit, cancel)),
			matcher: Arc::new(ResourceMatcher::new(config)),
			requests: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
		}
	}

	pub fn api(&self) -> &dyn ClusterApi {
		self.api.as_ref()
	}

	pub fn rate(&self) -> &RateController {
		&self.rate
	}

	pub fn matcher(&self) -> &ResourceMatcher {
		&self.matcher
	}

	pub fn cancellation(&self) -> &CancellationToken {
		self.rate.cancellation()
	}

	/// Run one API call through the rate controller.
	pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, ApiError>>,
	{
		self.rate.execute(op).await
	}

	/// Wait for one of the bounded request slots used by fan-out discovery.
	pub async fn request_slot(&self) -> Result<SemaphorePermit<'_>, ApiError> {
		tokio::select! {
			biased;
			() = self.cancellation().cancelled() => Err(ApiError::Cancelled),
			permit = self.requests.acquire() => permit.map_err(|_| ApiError::Cancelled),
		}
	}
}

/// Deletion results of one category.
#[derive(Debug)]
pub struct PhaseReport {
	pub category: Category,
	/// Resources the phase tried to delete.
	pub attempted: usize,
	pub report: DeletionReport,
}

/// Result of the post-deletion discovery pass.
#[derive(Debug)]
pub enum Verification {
	/// Nothing belonging to the app was found.
	Clean,
	/// These resources survived the purge.
	Remaining(Vec<ResourceIdentity>),
	/// Verification could not run.
	Skipped(String),
}

#[derive(Debug)]
pub struct PurgeReport {
	/// Resources found by the initial discovery.
	pub discovered: usize,
	pub phases: Vec<PhaseReport>,
	pub verification: Verification,
}

impl PurgeReport {
	pub fn deleted(&self) -> usize {
		self.phases.iter().map(|p| p.report.deleted.len()).sum()
	}

	pub fn failed(&self) -> usize {
		self.phases.iter().map(|p| p.report.errors.len()).sum()
	}

	pub fn is_clean(&self) -> bool {
		matches!(self.verification, Verification::Clean)
	}
}

/// Cancel `cancel` once `deadline` has elapsed.
pub fn spawn_deadline(cancel: CancellationToken, deadline: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		tokio::select! {
			() = cancel.cancelled() => {}
			() = tokio::time::sleep(deadline) => {
				warn!(deadline = ?deadline, "deadline elapsed, cancelling operations");
				cancel.cancel();
			}
		}
	})
}

/// Purge the cluster behind `api`, bounded by the configured deadline.
///
/// Only a failure of the initial discovery is returned as an error; deletion
/// problems and survivors are part of the report.
pub async fn run(
	api: Arc<dyn ClusterApi>,
	config: &PurgeConfig,
	cancel: CancellationToken,
) -> Result<PurgeReport, DiscoveryError> {
	let deadline = spawn_deadline(cancel.clone(), config.timeout());
	let ctx = PurgeContext::new(api, config, cancel);
	let result = purge(&ctx).await;
	deadline.abort();
	result
}

/// Discover, delete in category order, and verify.
#[instrument(skip_all)]
pub async fn purge(ctx: &PurgeContext) -> Result<PurgeReport, DiscoveryError> {
	info!("step 1: discovering resources");
	let resources = discover_all(ctx).await?;

	if resources.is_empty() {
		info!("no resources found - cluster appears clean");
		return Ok(PurgeReport {
			discovered: 0,
			phases: Vec::new(),
			verification: Verification::Clean,
		});
	}

	let discovered = resources.len();
	info!(count = discovered, "found resources total");

	let mut by_category = resources.categorize(|r| ctx.matcher().category(r));
	let mut phases = Vec::new();

	for (step, category) in Category::DELETION_ORDER.into_iter().enumerate() {
		info!(step = step + 2, "deleting {category}");

		if ctx.cancellation().is_cancelled() {
			warn!("run cancelled, skipping remaining deletions");
			break;
		}

		let batch = by_category.remove(&category).unwrap_or_default();
		if batch.is_empty() {
			continue;
		}

		let attempted = batch.len();
		info!(count = attempted, "found {category} to delete");
		let report = delete_all(ctx, batch).await;
		for err in &report.errors {
			warn!(error = %err, "failed to delete some {category}");
		}
		phases.push(PhaseReport {
			category,
			attempted,
			report,
		});
	}

	info!(step = Category::DELETION_ORDER.len() + 2, "final verification");
	let verification = verify(ctx).await;

	Ok(PurgeReport {
		discovered,
		phases,
		verification,
	})
}

/// Re-run discovery and report whatever is still there.
#[instrument(skip_all)]
pub async fn verify(ctx: &PurgeContext) -> Verification {
	if ctx.cancellation().is_cancelled() {
		warn!("run cancelled, skipping cleanup verification");
		return Verification::Skipped("run cancelled".to_string());
	}

	match discover_all(ctx).await {
		Ok(remaining) if remaining.is_empty() => {
			info!("cleanup verification: no resources remaining - SUCCESS");
			Verification::Clean
		}
		Ok(remaining) => {
			warn!(
				count = remaining.len(),
				"cleanup verification: resources still remain"
			);
			for resource in remaining.iter() {
				warn!("  - {resource}");
			}
			Verification::Remaining(remaining.into_iter().collect())
		}
		Err(e) => {
			warn!(error = %e, "failed to verify cleanup");
			Verification::Skipped(e.to_string())
		}
	}
}
