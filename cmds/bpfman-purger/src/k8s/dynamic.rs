//! [`ClusterApi`] implementation backed by kube-rs.
//!
//! CustomResourceDefinitions are read through the typed API so their schema
//! is available; every other resource goes through `Api<DynamicObject>`.

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
	api::{Api, DeleteParams, DynamicObject, ListParams, PostParams},
	Client, ResourceExt,
};
use tracing::instrument;

use super::{
	api::{
		ApiError, ClusterApi, ClusterObject, CrdObject, DeleteResponse, GenericObject,
		ResourceIdentity,
	},
	ResourceKind,
};

/// Cluster API over a live kube [`Client`].
#[derive(Clone)]
pub struct KubeClusterApi {
	client: Client,
}

impl KubeClusterApi {
	pub fn new(client: Client) -> Self {
		Self { client }
	}

	fn crds(&self) -> Api<CustomResourceDefinition> {
		Api::all(self.client.clone())
	}

	/// Create a dynamic API for the given resource.
	fn dynamic_api(&self, resource: &ResourceIdentity) -> Api<DynamicObject> {
		let ar = resource.kind.api_resource(&resource.display_kind);
		match &resource.namespace {
			Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
			None => Api::all_with(self.client.clone(), &ar),
		}
	}
}

fn list_params(label_selector: Option<&str>) -> ListParams {
	match label_selector {
		Some(selector) => ListParams::default().labels(selector),
		None => ListParams::default(),
	}
}

impl From<CustomResourceDefinition> for CrdObject {
	fn from(crd: CustomResourceDefinition) -> Self {
		let version = crd
			.spec
			.versions
			.iter()
			.find(|v| v.storage)
			.or_else(|| crd.spec.versions.first())
			.map(|v| v.name.clone());

		Self {
			name: crd.name_any(),
			finalizers: crd.finalizers().to_vec(),
			group: crd.spec.group,
			version,
			plural: crd.spec.names.plural,
			kind: crd.spec.names.kind,
		}
	}
}

impl From<DynamicObject> for GenericObject {
	fn from(obj: DynamicObject) -> Self {
		Self {
			name: obj.name_any(),
			namespace: obj.namespace(),
			finalizers: obj.finalizers().to_vec(),
		}
	}
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
	#[instrument(skip(self))]
	async fn list_crds(&self, label_selector: Option<&str>) -> Result<Vec<CrdObject>, ApiError> {
		let list = self.crds().list(&list_params(label_selector)).await?;
		Ok(list.items.into_iter().map(CrdObject::from).collect())
	}

	#[instrument(skip(self))]
	async fn get_crd(&self, name: &str) -> Result<CrdObject, ApiError> {
		Ok(self.crds().get(name).await?.into())
	}

	#[instrument(skip(self), fields(kind = %kind))]
	async fn list(
		&self,
		kind: &ResourceKind,
		label_selector: Option<&str>,
	) -> Result<Vec<GenericObject>, ApiError> {
		// The kind only matters for deserialized objects, never for the URL.
		let ar = kind.api_resource("");
		let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
		let list = api.list(&list_params(label_selector)).await?;
		Ok(list.items.into_iter().map(GenericObject::from).collect())
	}

	#[instrument(skip(self), fields(resource = %resource))]
	async fn get(&self, resource: &ResourceIdentity) -> Result<ClusterObject, ApiError> {
		if resource.is_crd() {
			let crd = self.get_crd(&resource.name).await?;
			return Ok(ClusterObject::CustomResourceDefinition(crd));
		}

		let obj = self.dynamic_api(resource).get(&resource.name).await?;
		Ok(ClusterObject::Generic(obj.into()))
	}

	#[instrument(skip(self), fields(resource = %resource))]
	async fn delete(
		&self,
		resource: &ResourceIdentity,
		grace_period_seconds: u32,
	) -> Result<DeleteResponse, ApiError> {
		let params = DeleteParams {
			grace_period_seconds: Some(grace_period_seconds),
			..Default::default()
		};

		// The server hands back the object itself while finalizers still
		// hold it, and a Status once it is gone.
		let lingering = self
			.dynamic_api(resource)
			.delete(&resource.name, &params)
			.await?
			.left();

		Ok(match lingering {
			Some(obj)
				if obj.metadata.deletion_timestamp.is_some() && !obj.finalizers().is_empty() =>
			{
				DeleteResponse::Pending {
					finalizers: obj.finalizers().to_vec(),
				}
			}
			_ => DeleteResponse::Gone,
		})
	}

	#[instrument(skip(self), fields(resource = %resource))]
	async fn clear_finalizers(&self, resource: &ResourceIdentity) -> Result<(), ApiError> {
		let api = self.dynamic_api(resource);
		let mut obj = api.get(&resource.name).await?;
		obj.metadata.finalizers = Some(Vec::new());
		api.replace(&resource.name, &PostParams::default(), &obj).await?;
		Ok(())
	}
}
