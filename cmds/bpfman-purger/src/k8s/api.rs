//! The cluster API capability the purge engine runs against.
//!
//! Resources are handled generically: a [`ClusterObject`] is either a
//! CustomResourceDefinition, whose schema the engine needs to enumerate
//! instances, or a generic resource carrying only the metadata deletion
//! cares about.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use super::{ResourceKind, CRD_KIND};

/// Errors returned by cluster API calls.
#[derive(Debug, Error)]
pub enum ApiError {
	/// The API server answered with a failure status.
	#[error("{code} {reason}: {message}")]
	Status {
		code: u16,
		reason: String,
		message: String,
	},

	#[error(transparent)]
	Kube(kube::Error),

	#[error("operation cancelled")]
	Cancelled,

	#[error("max retries exceeded: {0}")]
	RetriesExhausted(Box<ApiError>),

	#[error("CustomResourceDefinition {0} declares no versions")]
	NoCrdVersion(String),
}

impl ApiError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::Status { code: 404, .. })
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}
}

impl From<kube::Error> for ApiError {
	fn from(err: kube::Error) -> Self {
		match err {
			kube::Error::Api(resp) => Self::Status {
				code: resp.code,
				reason: resp.reason,
				message: resp.message,
			},
			other => Self::Kube(other),
		}
	}
}

/// Canonical identity of one cluster object.
///
/// Equality over all four fields is the dedup key: the same object found
/// by two discovery strategies compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
	pub kind: ResourceKind,
	pub name: String,
	/// `None` for cluster-scoped resources.
	pub namespace: Option<String>,
	/// Human readable kind, e.g. `CustomResourceDefinition`.
	pub display_kind: String,
}

impl ResourceIdentity {
	pub fn new(
		kind: ResourceKind,
		name: impl Into<String>,
		namespace: Option<String>,
		display_kind: impl Into<String>,
	) -> Self {
		Self {
			kind,
			name: name.into(),
			namespace: namespace.filter(|ns| !ns.is_empty()),
			display_kind: display_kind.into(),
		}
	}

	/// Identity of the CustomResourceDefinition called `name`.
	pub fn crd(name: impl Into<String>) -> Self {
		Self::new(ResourceKind::crd(), name, None, CRD_KIND)
	}

	pub fn is_crd(&self) -> bool {
		self.kind.is_crd()
	}
}

impl fmt::Display for ResourceIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.namespace {
			Some(ns) => write!(f, "{}/{} in namespace {}", self.display_kind, self.name, ns),
			None => write!(f, "{}/{} (cluster-scoped)", self.display_kind, self.name),
		}
	}
}

/// A CustomResourceDefinition reduced to what the purger needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdObject {
	pub name: String,
	pub group: String,
	/// Version used to address instances: the storage version if one is
	/// marked, otherwise the first declared version.
	pub version: Option<String>,
	pub plural: String,
	pub kind: String,
	pub finalizers: Vec<String>,
}

impl CrdObject {
	pub fn identity(&self) -> ResourceIdentity {
		ResourceIdentity::crd(&self.name)
	}

	/// The resource type of this CRD's instances.
	pub fn instance_kind(&self) -> Result<ResourceKind, ApiError> {
		let version = self
			.version
			.as_ref()
			.ok_or_else(|| ApiError::NoCrdVersion(self.name.clone()))?;
		Ok(ResourceKind::new(&self.group, version, &self.plural))
	}
}

/// Any other resource, kept as an opaque bag of the metadata we act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericObject {
	pub name: String,
	pub namespace: Option<String>,
	pub finalizers: Vec<String>,
}

impl GenericObject {
	pub fn identity(&self, kind: &ResourceKind, display_kind: &str) -> ResourceIdentity {
		ResourceIdentity::new(
			kind.clone(),
			&self.name,
			self.namespace.clone(),
			display_kind,
		)
	}
}

/// A fetched cluster object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterObject {
	CustomResourceDefinition(CrdObject),
	Generic(GenericObject),
}

impl ClusterObject {
	pub fn name(&self) -> &str {
		match self {
			Self::CustomResourceDefinition(crd) => &crd.name,
			Self::Generic(obj) => &obj.name,
		}
	}

	pub fn finalizers(&self) -> &[String] {
		match self {
			Self::CustomResourceDefinition(crd) => &crd.finalizers,
			Self::Generic(obj) => &obj.finalizers,
		}
	}
}

/// What the server did with a delete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteResponse {
	/// The object is gone.
	Gone,
	/// Deletion was accepted but finalizers keep the object alive.
	Pending { finalizers: Vec<String> },
}

/// Cluster operations needed to discover and remove resources.
///
/// List calls span every namespace. Implementations must be cheap to share
/// across tasks.
#[async_trait]
pub trait ClusterApi: Send + Sync {
	/// List CustomResourceDefinitions, optionally filtered by a label selector.
	async fn list_crds(&self, label_selector: Option<&str>) -> Result<Vec<CrdObject>, ApiError>;

	async fn get_crd(&self, name: &str) -> Result<CrdObject, ApiError>;

	/// List objects of `kind`, optionally filtered by a label selector.
	async fn list(
		&self,
		kind: &ResourceKind,
		label_selector: Option<&str>,
	) -> Result<Vec<GenericObject>, ApiError>;

	async fn get(&self, resource: &ResourceIdentity) -> Result<ClusterObject, ApiError>;

	async fn delete(
		&self,
		resource: &ResourceIdentity,
		grace_period_seconds: u32,
	) -> Result<DeleteResponse, ApiError>;

	/// Replace the object with a copy whose finalizer list is empty.
	async fn clear_finalizers(&self, resource: &ResourceIdentity) -> Result<(), ApiError>;
}
