//! In-memory [`ClusterApi`] used by the engine's unit tests.

use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::k8s::{
	api::{
		ApiError, ClusterApi, ClusterObject, CrdObject, DeleteResponse, GenericObject,
		ResourceIdentity,
	},
	ResourceKind,
};

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
	pairs
		.iter()
		.map(|(k, v)| (k.to_string(), v.to_string()))
		.collect()
}

/// One recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
	ListCrds(Option<String>),
	GetCrd(String),
	List(ResourceKind, Option<String>),
	Get(ResourceIdentity),
	Delete(ResourceIdentity),
	ClearFinalizers(ResourceIdentity),
}

type ObjectKey = (ResourceKind, Option<String>, String);

fn key(resource: &ResourceIdentity) -> ObjectKey {
	(
		resource.kind.clone(),
		resource.namespace.clone(),
		resource.name.clone(),
	)
}

struct Stored {
	labels: BTreeMap<String, String>,
	finalizers: Vec<String>,
	deleting: bool,
}

struct StoredCrd {
	crd: CrdObject,
	labels: BTreeMap<String, String>,
	deleting: bool,
}

#[derive(Default)]
struct State {
	crds: BTreeMap<String, StoredCrd>,
	objects: BTreeMap<ObjectKey, Stored>,
	calls: Vec<Call>,
	failing_deletes: HashMap<String, usize>,
	failing_updates: HashSet<String>,
	failing_lists: HashSet<ResourceKind>,
	throttled: usize,
}

/// A fake cluster holding CRDs and objects in memory.
///
/// Deletion follows the API server: objects with finalizers are only marked
/// as deleting and vanish once their finalizers are cleared.
#[derive(Default)]
pub struct MemoryCluster {
	state: Mutex<State>,
	hang_lists: bool,
	list_latency: Option<Duration>,
	cancel_on_delete: Option<CancellationToken>,
	lists_in_flight: AtomicUsize,
	max_lists_in_flight: AtomicUsize,
}

fn status(code: u16, reason: &str, message: impl Into<String>) -> ApiError {
	ApiError::Status {
		code,
		reason: reason.to_string(),
		message: message.into(),
	}
}

fn not_found(what: &impl std::fmt::Display) -> ApiError {
	status(404, "NotFound", format!("{what} not found"))
}

fn selector_matches(selector: Option<&str>, labels: &BTreeMap<String, String>) -> bool {
	let Some(selector) = selector else {
		return true;
	};
	selector.split(',').all(|term| match term.split_once('=') {
		Some((k, v)) => labels.get(k.trim()).is_some_and(|l| l == v.trim()),
		None => labels.contains_key(term.trim()),
	})
}

impl MemoryCluster {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> std::sync::MutexGuard<'_, State> {
		self.state.lock().unwrap()
	}

	pub fn with_crd(self, crd: CrdObject, labels: BTreeMap<String, String>) -> Self {
		self.state().crds.insert(
			crd.name.clone(),
			StoredCrd {
				crd,
				labels,
				deleting: false,
			},
		);
		self
	}

	pub fn with_object(
		self,
		resource: ResourceIdentity,
		labels: BTreeMap<String, String>,
		finalizers: &[&str],
	) -> Self {
		self.state().objects.insert(
			key(&resource),
			Stored {
				labels,
				finalizers: finalizers.iter().map(|f| f.to_string()).collect(),
				deleting: false,
			},
		);
		self
	}

	/// Fail the next `times` delete calls for objects called `name`.
	pub fn fail_deletes(self, name: &str, times: usize) -> Self {
		self.state().failing_deletes.insert(name.to_string(), times);
		self
	}

	/// Reject every finalizer update of objects called `name`.
	pub fn fail_updates(self, name: &str) -> Self {
		self.state().failing_updates.insert(name.to_string());
		self
	}

	/// Fail every list of `kind`. [`ResourceKind::crd`] fails CRD lists.
	pub fn fail_lists(self, kind: ResourceKind) -> Self {
		self.state().failing_lists.insert(kind);
		self
	}

	/// Answer the next `calls` requests with 429.
	pub fn throttle_next(self, calls: usize) -> Self {
		self.state().throttled = calls;
		self
	}

	/// Make every list call block forever.
	pub fn hang_lists(mut self) -> Self {
		self.hang_lists = true;
		self
	}

	/// Cancel `token` as soon as the first delete call arrives.
	pub fn cancel_on_delete(mut self, token: CancellationToken) -> Self {
		self.cancel_on_delete = Some(token);
		self
	}

	pub fn with_list_latency(mut self, latency: Duration) -> Self {
		self.list_latency = Some(latency);
		self
	}

	pub fn calls(&self) -> Vec<Call> {
		self.state().calls.clone()
	}

	pub fn contains(&self, resource: &ResourceIdentity) -> bool {
		let state = self.state();
		if resource.is_crd() {
			state.crds.contains_key(&resource.name)
		} else {
			state.objects.contains_key(&key(resource))
		}
	}

	pub fn object_count(&self) -> usize {
		self.state().objects.len()
	}

	pub fn crd_count(&self) -> usize {
		self.state().crds.len()
	}

	pub fn max_concurrent_lists(&self) -> usize {
		self.max_lists_in_flight.load(Ordering::SeqCst)
	}

	/// Record `call` and apply pending throttling.
	fn begin(&self, call: Call) -> Result<(), ApiError> {
		let mut state = self.state();
		state.calls.push(call);
		if state.throttled > 0 {
			state.throttled -= 1;
			return Err(status(429, "TooManyRequests", "Too many requests"));
		}
		Ok(())
	}

	async fn list_delay(&self) {
		if self.hang_lists {
			std::future::pending::<()>().await;
		}
		if let Some(latency) = self.list_latency {
			let now = self.lists_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_lists_in_flight.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(latency).await;
			self.lists_in_flight.fetch_sub(1, Ordering::SeqCst);
		}
	}
}

#[async_trait]
impl ClusterApi for MemoryCluster {
	async fn list_crds(&self, label_selector: Option<&str>) -> Result<Vec<CrdObject>, ApiError> {
		self.begin(Call::ListCrds(label_selector.map(str::to_string)))?;
		if self.hang_lists {
			std::future::pending::<()>().await;
		}

		let state = self.state();
		if state.failing_lists.contains(&ResourceKind::crd()) {
			return Err(status(500, "InternalError", "internal error"));
		}
		Ok(state
			.crds
			.values()
			.filter(|stored| selector_matches(label_selector, &stored.labels))
			.map(|stored| stored.crd.clone())
			.collect())
	}

	async fn get_crd(&self, name: &str) -> Result<CrdObject, ApiError> {
		self.begin(Call::GetCrd(name.to_string()))?;
		self.state()
			.crds
			.get(name)
			.map(|stored| stored.crd.clone())
			.ok_or_else(|| not_found(&name))
	}

	async fn list(
		&self,
		kind: &ResourceKind,
		label_selector: Option<&str>,
	) -> Result<Vec<GenericObject>, ApiError> {
		self.begin(Call::List(kind.clone(), label_selector.map(str::to_string)))?;
		self.list_delay().await;

		let state = self.state();
		if state.failing_lists.contains(kind) {
			return Err(status(500, "InternalError", "internal error"));
		}
		Ok(state
			.objects
			.iter()
			.filter(|((k, _, _), stored)| {
				k == kind && selector_matches(label_selector, &stored.labels)
			})
			.map(|((_, namespace, name), stored)| GenericObject {
				name: name.clone(),
				namespace: namespace.clone(),
				finalizers: stored.finalizers.clone(),
			})
			.collect())
	}

	async fn get(&self, resource: &ResourceIdentity) -> Result<ClusterObject, ApiError> {
		self.begin(Call::Get(resource.clone()))?;
		let state = self.state();
		if resource.is_crd() {
			return state
				.crds
				.get(&resource.name)
				.map(|stored| ClusterObject::CustomResourceDefinition(stored.crd.clone()))
				.ok_or_else(|| not_found(resource));
		}
		state
			.objects
			.get(&key(resource))
			.map(|stored| {
				ClusterObject::Generic(GenericObject {
					name: resource.name.clone(),
					namespace: resource.namespace.clone(),
					finalizers: stored.finalizers.clone(),
				})
			})
			.ok_or_else(|| not_found(resource))
	}

	async fn delete(
		&self,
		resource: &ResourceIdentity,
		_grace_period_seconds: u32,
	) -> Result<DeleteResponse, ApiError> {
		self.begin(Call::Delete(resource.clone()))?;
		if let Some(token) = &self.cancel_on_delete {
			token.cancel();
		}
		let mut state = self.state();

		if let Some(remaining) = state.failing_deletes.get_mut(&resource.name) {
			if *remaining > 0 {
				*remaining -= 1;
				return Err(status(500, "InternalError", "internal error"));
			}
		}

		if resource.is_crd() {
			let stored = state
				.crds
				.get_mut(&resource.name)
				.ok_or_else(|| not_found(resource))?;
			if stored.crd.finalizers.is_empty() {
				state.crds.remove(&resource.name);
				return Ok(DeleteResponse::Gone);
			}
			stored.deleting = true;
			return Ok(DeleteResponse::Pending {
				finalizers: stored.crd.finalizers.clone(),
			});
		}

		let key = key(resource);
		let stored = state
			.objects
			.get_mut(&key)
			.ok_or_else(|| not_found(resource))?;
		if stored.finalizers.is_empty() {
			state.objects.remove(&key);
			return Ok(DeleteResponse::Gone);
		}
		stored.deleting = true;
		Ok(DeleteResponse::Pending {
			finalizers: stored.finalizers.clone(),
		})
	}

	async fn clear_finalizers(&self, resource: &ResourceIdentity) -> Result<(), ApiError> {
		self.begin(Call::ClearFinalizers(resource.clone()))?;
		let mut state = self.state();

		if state.failing_updates.contains(&resource.name) {
			return Err(status(
				409,
				"Conflict",
				"the object has been modified; please apply your changes to the latest version",
			));
		}

		if resource.is_crd() {
			let stored = state
				.crds
				.get_mut(&resource.name)
				.ok_or_else(|| not_found(resource))?;
			stored.crd.finalizers.clear();
			if stored.deleting {
				state.crds.remove(&resource.name);
			}
			return Ok(());
		}

		let key = key(resource);
		let stored = state
			.objects
			.get_mut(&key)
			.ok_or_else(|| not_found(resource))?;
		stored.finalizers.clear();
		if stored.deleting {
			state.objects.remove(&key);
		}
		Ok(())
	}
}
