//! Deleting resources, stripping finalizers when they block removal.

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

use super::PurgeContext;
use crate::k8s::api::{ApiError, DeleteResponse, ResourceIdentity};

/// Deletions are immediate; the purge never waits out grace periods.
pub const GRACE_PERIOD_SECONDS: u32 = 0;

/// How a resource ended up removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
	/// The first delete request was accepted. The object may still linger
	/// while the server runs its finalizers.
	Deleted,
	/// The first delete failed; finalizers were removed and the retry
	/// succeeded.
	DeletedAfterFinalizers,
	/// The first delete failed, there were no finalizers, and the retry
	/// succeeded.
	DeletedOnRetry,
	/// The first delete failed and the resource could no longer be fetched.
	AlreadyGone,
}

#[derive(Debug, Error)]
pub enum DeleteError {
	#[error("failed to remove finalizers from {resource}: {error}")]
	RemoveFinalizers {
		resource: ResourceIdentity,
		error: ApiError,
	},
	#[error("failed to delete {resource} after removing finalizers: {error}")]
	DeleteAfterFinalizers {
		resource: ResourceIdentity,
		error: ApiError,
	},
	#[error("failed to delete {resource}: {error}")]
	Delete {
		resource: ResourceIdentity,
		error: ApiError,
	},
	#[error("deletion of {resource} cancelled")]
	Cancelled { resource: ResourceIdentity },
	#[error("deletion task panicked")]
	TaskPanicked(#[source] JoinError),
}

impl DeleteError {
	fn from_api(
		resource: &ResourceIdentity,
		error: ApiError,
		wrap: fn(ResourceIdentity, ApiError) -> Self,
	) -> Self {
		let resource = resource.clone();
		match error {
			ApiError::Cancelled => Self::Cancelled { resource },
			error => wrap(resource, error),
		}
	}
}

/// Results of deleting one batch.
#[derive(Debug, Default)]
pub struct DeletionReport {
	pub deleted: Vec<(ResourceIdentity, DeleteOutcome)>,
	pub errors: Vec<DeleteError>,
}

/// Delete every resource in `resources` concurrently.
///
/// One failure never stops the others; all of them end up in the report.
pub async fn delete_all(ctx: &PurgeContext, resources: Vec<ResourceIdentity>) -> DeletionReport {
	let mut tasks = JoinSet::new();
	for resource in resources {
		let ctx = ctx.clone();
		tasks.spawn(async move {
			let result = delete_resource(&ctx, &resource).await;
			(resource, result)
		});
	}

	let mut report = DeletionReport::default();
	while let Some(joined) = tasks.join_next().await {
		match joined {
			Ok((resource, Ok(outcome))) => report.deleted.push((resource, outcome)),
			Ok((_, Err(e))) => report.errors.push(e),
			Err(e) => report.errors.push(DeleteError::TaskPanicked(e)),
		}
	}
	report
}

/// Remove one resource.
///
/// A plain delete is tried first. An accepted delete is left to the server,
/// even when finalizers keep the object around for a while. If the delete
/// itself fails, the object is fetched: a failed fetch means it is already
/// gone, otherwise its finalizers are cleared (if any) and the delete is
/// retried once.
#[instrument(skip(ctx), fields(resource = %resource))]
pub async fn delete_resource(
	ctx: &PurgeContext,
	resource: &ResourceIdentity,
) -> Result<DeleteOutcome, DeleteError> {
	info!("deleting {resource}");

	match ctx
		.call(|| ctx.api().delete(resource, GRACE_PERIOD_SECONDS))
		.await
	{
		Ok(DeleteResponse::Gone) => {
			info!("successfully deleted {resource}");
			return Ok(DeleteOutcome::Deleted);
		}
		Ok(DeleteResponse::Pending { finalizers }) => {
			info!(?finalizers, "deleted {resource}, server is running its finalizers");
			return Ok(DeleteOutcome::Deleted);
		}
		Err(ApiError::Cancelled) => {
			return Err(DeleteError::Cancelled {
				resource: resource.clone(),
			})
		}
		Err(e) => debug!(error = %e, "delete failed, inspecting {resource}"),
	}

	let object = match ctx.call(|| ctx.api().get(resource)).await {
		Ok(object) => object,
		Err(ApiError::Cancelled) => {
			return Err(DeleteError::Cancelled {
				resource: resource.clone(),
			})
		}
		Err(e) => {
			info!(error = %e, "could not get {resource} (may not exist)");
			return Ok(DeleteOutcome::AlreadyGone);
		}
	};

	if object.finalizers().is_empty() {
		ctx.call(|| ctx.api().delete(resource, GRACE_PERIOD_SECONDS))
			.await
			.map_err(|e| {
				DeleteError::from_api(resource, e, |resource, error| DeleteError::Delete {
					resource,
					error,
				})
			})?;
		info!("successfully deleted {resource}");
		return Ok(DeleteOutcome::DeletedOnRetry);
	}

	info!(finalizers = ?object.finalizers(), "found finalizers on {resource}");
	remove_finalizers(ctx, resource).await?;
	ctx.call(|| ctx.api().delete(resource, GRACE_PERIOD_SECONDS))
		.await
		.map_err(|e| {
			DeleteError::from_api(resource, e, |resource, error| {
				DeleteError::DeleteAfterFinalizers { resource, error }
			})
		})?;
	info!("successfully deleted {resource} after removing finalizers");
	Ok(DeleteOutcome::DeletedAfterFinalizers)
}

async fn remove_finalizers(
	ctx: &PurgeContext,
	resource: &ResourceIdentity,
) -> Result<(), DeleteError> {
	ctx.call(|| ctx.api().clear_finalizers(resource))
		.await
		.map_err(|e| {
			warn!(error = %e, "failed to remove finalizers from {resource}");
			DeleteError::from_api(resource, e, |resource, error| DeleteError::RemoveFinalizers {
				resource,
				error,
			})
		})?;
	info!("removed finalizers from {resource}");
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::{collections::BTreeMap, sync::Arc};

	use assert_matches::assert_matches;
	use tokio_util::sync::CancellationToken;

	use super::*;
	use crate::{
		config::PurgeConfig,
		k8s::{api::CrdObject, ResourceKind},
		test_utils::{Call, MemoryCluster},
	};

	fn context(cluster: MemoryCluster) -> (Arc<MemoryCluster>, PurgeContext) {
		let cluster = Arc::new(cluster);
		let ctx = PurgeContext::new(
			cluster.clone(),
			&PurgeConfig::default(),
			CancellationToken::new(),
		);
		(cluster, ctx)
	}

	fn secret(name: &str) -> ResourceIdentity {
		ResourceIdentity::new(
			ResourceKind::new("", "v1", "secrets"),
			name,
			Some("bpfman".to_string()),
			"Secret",
		)
	}

	#[tokio::test(start_paused = true)]
	async fn test_plain_delete() {
		let target = secret("bpfman-cert");
		let (cluster, ctx) = context(MemoryCluster::new().with_object(
			target.clone(),
			BTreeMap::new(),
			&[],
		));

		let outcome = delete_resource(&ctx, &target).await.unwrap();

		assert_eq!(outcome, DeleteOutcome::Deleted);
		assert!(!cluster.contains(&target));
		assert_eq!(cluster.calls(), vec![Call::Delete(target)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_delete_with_finalizers_strips_then_retries() {
		let target = secret("bpfman-cert");
		let (cluster, ctx) = context(
			MemoryCluster::new()
				.with_object(target.clone(), BTreeMap::new(), &["bpfman.io/finalizer"])
				.fail_deletes("bpfman-cert", 1),
		);

		let outcome = delete_resource(&ctx, &target).await.unwrap();

		assert_eq!(outcome, DeleteOutcome::DeletedAfterFinalizers);
		assert!(!cluster.contains(&target));
		assert_eq!(
			cluster.calls(),
			vec![
				Call::Delete(target.clone()),
				Call::Get(target.clone()),
				Call::ClearFinalizers(target.clone()),
				Call::Delete(target),
			]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_delete_without_finalizers_retries_once() {
		let target = secret("bpfman-cert");
		let (cluster, ctx) = context(
			MemoryCluster::new()
				.with_object(target.clone(), BTreeMap::new(), &[])
				.fail_deletes("bpfman-cert", 1),
		);

		let outcome = delete_resource(&ctx, &target).await.unwrap();

		assert_eq!(outcome, DeleteOutcome::DeletedOnRetry);
		assert_eq!(
			cluster.calls(),
			vec![
				Call::Delete(target.clone()),
				Call::Get(target.clone()),
				Call::Delete(target),
			]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_accepted_delete_leaves_finalizers_to_the_server() {
		let target = secret("bpfman-cert");
		let (cluster, ctx) = context(MemoryCluster::new().with_object(
			target.clone(),
			BTreeMap::new(),
			&["bpfman.io/finalizer"],
		));

		let outcome = delete_resource(&ctx, &target).await.unwrap();

		assert_eq!(outcome, DeleteOutcome::Deleted);
		assert!(cluster.contains(&target));
		assert_eq!(cluster.calls(), vec![Call::Delete(target)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_crd_cleanup_finalizer_is_kept() {
		let crd = CrdObject {
			name: "widgets.example.io".to_string(),
			group: "example.io".to_string(),
			version: Some("v1".to_string()),
			plural: "widgets".to_string(),
			kind: "Widget".to_string(),
			finalizers: vec!["customresourcecleanup.apiextensions.k8s.io".to_string()],
		};
		let target = crd.identity();
		let (cluster, ctx) = context(
			MemoryCluster::new()
				.with_crd(crd, BTreeMap::new())
				.fail_updates("widgets.example.io"),
		);

		let outcome = delete_resource(&ctx, &target).await.unwrap();

		assert_eq!(outcome, DeleteOutcome::Deleted);
		assert!(cluster.contains(&target));
		assert_eq!(cluster.calls(), vec![Call::Delete(target)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_missing_resource_counts_as_deleted() {
		let target = secret("already-gone");
		let (_, ctx) = context(MemoryCluster::new());

		let outcome = delete_resource(&ctx, &target).await.unwrap();
		assert_eq!(outcome, DeleteOutcome::AlreadyGone);

		// second purge of the same resource behaves the same
		let outcome = delete_resource(&ctx, &target).await.unwrap();
		assert_eq!(outcome, DeleteOutcome::AlreadyGone);
	}

	#[tokio::test(start_paused = true)]
	async fn test_finalizer_update_failure_is_reported() {
		let target = secret("bpfman-cert");
		let (cluster, ctx) = context(
			MemoryCluster::new()
				.with_object(target.clone(), BTreeMap::new(), &["bpfman.io/finalizer"])
				.fail_deletes("bpfman-cert", 1)
				.fail_updates("bpfman-cert"),
		);

		let err = delete_resource(&ctx, &target).await.unwrap_err();

		assert_matches!(
			err,
			DeleteError::RemoveFinalizers { ref resource, error: ApiError::Status { code: 409, .. } }
				if resource == &target
		);
		assert!(cluster.contains(&target));
	}

	#[tokio::test(start_paused = true)]
	async fn test_batch_collects_every_failure() {
		let ok = secret("bpfman-ok");
		let stuck = secret("bpfman-stuck");
		let (cluster, ctx) = context(
			MemoryCluster::new()
				.with_object(ok.clone(), BTreeMap::new(), &[])
				.with_object(stuck.clone(), BTreeMap::new(), &["a.io/finalizer"])
				.fail_deletes("bpfman-stuck", 1)
				.fail_updates("bpfman-stuck"),
		);

		let report = delete_all(&ctx, vec![stuck.clone(), ok.clone()]).await;

		assert_eq!(report.deleted, vec![(ok.clone(), DeleteOutcome::Deleted)]);
		assert_eq!(report.errors.len(), 1);
		assert!(!cluster.contains(&ok));
		assert!(cluster.contains(&stuck));
	}

	#[tokio::test(start_paused = true)]
	async fn test_cancelled_delete() {
		let target = secret("bpfman-cert");
		let cancel = CancellationToken::new();
		let cluster = Arc::new(MemoryCluster::new().with_object(
			target.clone(),
			BTreeMap::new(),
			&[],
		));
		let ctx = PurgeContext::new(cluster.clone(), &PurgeConfig::default(), cancel.clone());
		cancel.cancel();

		let err = delete_resource(&ctx, &target).await.unwrap_err();
		assert_matches!(err, DeleteError::Cancelled { .. });
		assert!(cluster.contains(&target));
		assert!(cluster.calls().is_empty());
	}
}
