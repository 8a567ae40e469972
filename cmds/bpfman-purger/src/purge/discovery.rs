//! Finding every resource that belongs to the app.
//!
//! Three independent branches run concurrently: CRDs plus their instances,
//! generic resources by label, and generic resources by name. Their results
//! are merged into one deduplicated [`ResourceSet`].

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

use super::{resource::ResourceSet, PurgeContext};
use crate::k8s::{
	api::{ApiError, GenericObject, ResourceIdentity},
	ResourceKind,
};

#[derive(Debug, Error)]
pub enum DiscoveryError {
	#[error("discovery cancelled")]
	Cancelled,
	#[error("failed to list CustomResourceDefinitions")]
	ListCrds(#[source] ApiError),
	#[error("discovery task panicked")]
	TaskPanicked(#[source] JoinError),
}

/// A built-in resource type searched during generic discovery.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
	pub group: &'static str,
	pub version: &'static str,
	pub plural: &'static str,
	pub kind: &'static str,
}

impl CatalogEntry {
	const fn new(
		group: &'static str,
		version: &'static str,
		plural: &'static str,
		kind: &'static str,
	) -> Self {
		Self {
			group,
			version,
			plural,
			kind,
		}
	}

	pub fn resource_kind(&self) -> ResourceKind {
		ResourceKind::new(self.group, self.version, self.plural)
	}
}

/// Resource types that may carry app labels or names.
pub const GENERIC_RESOURCES: &[CatalogEntry] = &[
	CatalogEntry::new("", "v1", "services", "Service"),
	CatalogEntry::new("", "v1", "serviceaccounts", "ServiceAccount"),
	CatalogEntry::new("", "v1", "configmaps", "ConfigMap"),
	CatalogEntry::new("", "v1", "secrets", "Secret"),
	CatalogEntry::new("", "v1", "namespaces", "Namespace"),
	CatalogEntry::new("apps", "v1", "deployments", "Deployment"),
	CatalogEntry::new("apps", "v1", "daemonsets", "DaemonSet"),
	CatalogEntry::new("apps", "v1", "replicasets", "ReplicaSet"),
	CatalogEntry::new("rbac.authorization.k8s.io", "v1", "roles", "Role"),
	CatalogEntry::new("rbac.authorization.k8s.io", "v1", "rolebindings", "RoleBinding"),
	CatalogEntry::new("rbac.authorization.k8s.io", "v1", "clusterroles", "ClusterRole"),
	CatalogEntry::new(
		"rbac.authorization.k8s.io",
		"v1",
		"clusterrolebindings",
		"ClusterRoleBinding",
	),
	CatalogEntry::new("operators.coreos.com", "v1alpha1", "subscriptions", "Subscription"),
	CatalogEntry::new(
		"operators.coreos.com",
		"v1alpha1",
		"clusterserviceversions",
		"ClusterServiceVersion",
	),
	CatalogEntry::new("operators.coreos.com", "v1alpha1", "catalogsources", "CatalogSource"),
	CatalogEntry::new("operators.coreos.com", "v1", "operatorgroups", "OperatorGroup"),
	CatalogEntry::new("monitoring.coreos.com", "v1", "servicemonitors", "ServiceMonitor"),
];

type DiscoveryTasks = JoinSet<Result<Vec<ResourceIdentity>, DiscoveryError>>;

/// Run every discovery branch and merge the results.
///
/// Individual list failures are logged and skipped. The run fails only when
/// it is cancelled, the cluster-wide CRD list fails, or a task panics.
#[instrument(skip_all)]
pub async fn discover_all(ctx: &PurgeContext) -> Result<ResourceSet, DiscoveryError> {
	let (crds, by_label, by_name) = tokio::join!(
		discover_crds_and_instances(ctx),
		discover_generic_by_label(ctx),
		discover_generic_by_name(ctx),
	);

	let mut all = crds?;
	all.merge(by_label?);
	all.merge(by_name?);

	info!(total = all.len(), "discovery complete");
	for (plural, count) in all.counts_by_type() {
		info!(resource = plural, count, "  discovered");
	}
	Ok(all)
}

/// App CRDs found by label and by name, followed by every instance of them.
async fn discover_crds_and_instances(ctx: &PurgeContext) -> Result<ResourceSet, DiscoveryError> {
	let (by_label, by_name) = tokio::join!(crds_by_label(ctx), crds_by_name(ctx));

	let mut crds = ResourceSet::new();
	crds.merge(by_label?);
	crds.merge(by_name?);
	debug!(count = crds.len(), "matching CRDs");

	let instances = discover_instances(ctx, &crds).await?;
	crds.merge(instances);
	Ok(crds)
}

async fn crds_by_label(ctx: &PurgeContext) -> Result<Vec<ResourceIdentity>, DiscoveryError> {
	let mut found = Vec::new();
	for selector in ctx.matcher().label_selectors() {
		let result = ctx.call(|| ctx.api().list_crds(Some(selector.as_str()))).await;
		let crds = tolerate(result, |e| {
			warn!(selector = %selector, error = %e, "failed to list CRDs by label");
		})?;
		for crd in crds {
			info!(crd = %crd.name, group = %crd.group, selector = %selector, "found CRD by label");
			found.push(crd.identity());
		}
	}
	Ok(found)
}

async fn crds_by_name(ctx: &PurgeContext) -> Result<Vec<ResourceIdentity>, DiscoveryError> {
	let crds = match ctx.call(|| ctx.api().list_crds(None)).await {
		Ok(crds) => crds,
		Err(ApiError::Cancelled) => return Err(DiscoveryError::Cancelled),
		Err(e) => return Err(DiscoveryError::ListCrds(e)),
	};

	Ok(crds
		.into_iter()
		.filter(|crd| ctx.matcher().matches_crd(crd))
		.inspect(|crd| info!(crd = %crd.name, group = %crd.group, "found CRD by name"))
		.map(|crd| crd.identity())
		.collect())
}

/// Every object of every CRD in `crds`, one task per CRD.
async fn discover_instances(
	ctx: &PurgeContext,
	crds: &ResourceSet,
) -> Result<Vec<ResourceIdentity>, DiscoveryError> {
	let mut tasks = DiscoveryTasks::new();
	for crd in crds.iter() {
		let ctx = ctx.clone();
		let name = crd.name.clone();
		tasks.spawn(async move {
			let result = crd_instances(&ctx, &name).await;
			let instances = tolerate(result, |e| {
				warn!(crd = %name, error = %e, "failed to list CRD instances");
			})?;
			if !instances.is_empty() {
				info!(crd = %name, count = instances.len(), "found CRD instances");
			}
			Ok(instances)
		});
	}
	join_all(tasks).await
}

async fn crd_instances(ctx: &PurgeContext, name: &str) -> Result<Vec<ResourceIdentity>, ApiError> {
	let crd = ctx.call(|| ctx.api().get_crd(name)).await?;
	let kind = crd.instance_kind()?;
	let objects = ctx.call(|| ctx.api().list(&kind, None)).await?;
	Ok(objects
		.iter()
		.map(|object| object.identity(&kind, &crd.kind))
		.collect())
}

/// Catalogue resources carrying any of the app labels.
async fn discover_generic_by_label(
	ctx: &PurgeContext,
) -> Result<Vec<ResourceIdentity>, DiscoveryError> {
	let mut tasks = DiscoveryTasks::new();
	for entry in GENERIC_RESOURCES {
		for selector in ctx.matcher().label_selectors() {
			let ctx = ctx.clone();
			let selector = selector.clone();
			tasks.spawn(async move {
				let kind = entry.resource_kind();
				let result = list_bounded(&ctx, &kind, Some(selector.as_str())).await;
				let objects = tolerate(result, |e| {
					debug!(resource = %kind, selector = %selector, error = %e, "failed to list by label");
				})?;
				Ok(objects
					.iter()
					.map(|object| object.identity(&kind, entry.kind))
					.collect())
			});
		}
	}
	join_all(tasks).await
}

/// Catalogue resources whose name matches the app heuristics.
async fn discover_generic_by_name(
	ctx: &PurgeContext,
) -> Result<Vec<ResourceIdentity>, DiscoveryError> {
	let mut tasks = DiscoveryTasks::new();
	for entry in GENERIC_RESOURCES {
		let ctx = ctx.clone();
		tasks.spawn(async move {
			let kind = entry.resource_kind();
			let result = list_bounded(&ctx, &kind, None).await;
			let objects = tolerate(result, |e| {
				debug!(resource = %kind, error = %e, "failed to list by name");
			})?;
			Ok(objects
				.iter()
				.filter(|object| ctx.matcher().matches_name(&object.name))
				.map(|object| object.identity(&kind, entry.kind))
				.collect())
		});
	}
	join_all(tasks).await
}

/// List under one of the bounded request slots.
async fn list_bounded(
	ctx: &PurgeContext,
	kind: &ResourceKind,
	selector: Option<&str>,
) -> Result<Vec<GenericObject>, ApiError> {
	let _slot = ctx.request_slot().await?;
	ctx.call(|| ctx.api().list(kind, selector)).await
}

/// Turn a failed lookup into an empty result after reporting it, unless the
/// run was cancelled.
fn tolerate<T: Default>(
	result: Result<T, ApiError>,
	report: impl FnOnce(&ApiError),
) -> Result<T, DiscoveryError> {
	match result {
		Ok(value) => Ok(value),
		Err(ApiError::Cancelled) => Err(DiscoveryError::Cancelled),
		Err(e) => {
			report(&e);
			Ok(T::default())
		}
	}
}

async fn join_all(mut tasks: DiscoveryTasks) -> Result<Vec<ResourceIdentity>, DiscoveryError> {
	let mut found = Vec::new();
	while let Some(joined) = tasks.join_next().await {
		found.extend(joined.map_err(DiscoveryError::TaskPanicked)??);
	}
	Ok(found)
}
