//! Kubernetes access for the purger.
//!
//! The purge engine only talks to the cluster through the [`api::ClusterApi`]
//! capability; [`dynamic::KubeClusterApi`] implements it on top of kube-rs.

pub mod api;
pub mod client;
pub mod dynamic;

use std::fmt;

use kube::{core::GroupVersionKind, discovery::ApiResource};

/// API group serving CustomResourceDefinitions.
pub const CRD_GROUP: &str = "apiextensions.k8s.io";
/// Plural resource name of CustomResourceDefinitions.
pub const CRD_PLURAL: &str = "customresourcedefinitions";
/// Kind of CustomResourceDefinitions.
pub const CRD_KIND: &str = "CustomResourceDefinition";

/// The group/version/plural triple identifying the shape of an API resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
	pub group: String,
	pub version: String,
	pub plural: String,
}

impl ResourceKind {
	pub fn new(
		group: impl Into<String>,
		version: impl Into<String>,
		plural: impl Into<String>,
	) -> Self {
		Self {
			group: group.into(),
			version: version.into(),
			plural: plural.into(),
		}
	}

	/// The resource type of CustomResourceDefinitions themselves.
	pub fn crd() -> Self {
		Self::new(CRD_GROUP, "v1", CRD_PLURAL)
	}

	pub fn is_crd(&self) -> bool {
		self.group == CRD_GROUP && self.plural == CRD_PLURAL
	}

	/// `group/version`, or just `version` for the core group.
	pub fn api_version(&self) -> String {
		if self.group.is_empty() {
			self.version.clone()
		} else {
			format!("{}/{}", self.group, self.version)
		}
	}

	/// Build a kube [`ApiResource`] for dynamic API calls.
	///
	/// Only group, version and plural take part in URL construction; `kind`
	/// is carried along for the objects kube deserializes.
	pub fn api_resource(&self, kind: &str) -> ApiResource {
		let gvk = GroupVersionKind::gvk(&self.group, &self.version, kind);
		ApiResource::from_gvk_with_plural(&gvk, &self.plural)
	}
}

impl fmt::Display for ResourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.group.is_empty() {
			write!(f, "{}/{}", self.version, self.plural)
		} else {
			write!(f, "{}/{}/{}", self.group, self.version, self.plural)
		}
	}
}
