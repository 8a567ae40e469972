//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. It keeps seeded objects in memory and serves list, get, delete
//! and replace on them the way the API server does, including finalizer
//! handling.

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, RwLock,
	},
};

use bon::Builder;
use kube::config::{
	AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext,
};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};
use wiremock::{
	matchers::{method, path, path_regex},
	Mock, MockServer, Request, ResponseTemplate,
};

use super::{
	discovery::MockDiscovery,
	helpers::{has_finalizers, is_deleting, matches_selector},
};

/// Timestamp stamped on objects whose deletion waits on finalizers.
const DELETION_TIMESTAMP: &str = "2024-01-01T00:00:00Z";

/// Where an object lives in the API.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
	/// `/api/v1` or `/apis/<group>/<version>`.
	pub prefix: String,
	pub plural: String,
	pub namespace: Option<String>,
	pub name: String,
}

/// Type alias for the shared mutable resources map.
pub type SharedResources = Arc<RwLock<BTreeMap<ObjectKey, Value>>>;

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	/// Resources to serve as raw manifests. The server derives API paths from
	/// apiVersion/kind; CustomResourceDefinitions among them make their
	/// instances addressable too.
	#[builder(default)]
	resources: Vec<Value>,
	/// Number of initial API requests answered with 429.
	#[builder(default)]
	throttled_requests: usize,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	resources: SharedResources,
}

/// Method and path of one request the server received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
	pub method: String,
	pub path: String,
	pub query: Option<String>,
}

struct MockState {
	resources: SharedResources,
	throttle_remaining: AtomicUsize,
}

impl MockState {
	fn take_throttle(&self) -> bool {
		self.throttle_remaining
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
	}
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		debug!(uri = %server.uri(), "Started mock K8s server");

		let mut discovery = MockDiscovery::default();
		for manifest in &self.resources {
			if manifest["kind"] == "CustomResourceDefinition" && !discovery.register_crd(manifest) {
				warn!(manifest = %manifest, "Ignoring malformed CRD");
			}
		}

		let mut resources = BTreeMap::new();
		for mut manifest in self.resources {
			match object_key_for_manifest(&mut manifest, &discovery) {
				Some(key) => {
					trace!(key = ?key, "Registered resource");
					resources.insert(key, manifest);
				}
				None => warn!(manifest = %manifest, "Ignoring resource of unknown type"),
			}
		}

		let shared_resources = Arc::new(RwLock::new(resources));
		let state = Arc::new(MockState {
			resources: Arc::clone(&shared_resources),
			throttle_remaining: AtomicUsize::new(self.throttled_requests),
		});

		mount_version(&server).await;
		mount_resources(&server, state).await;

		RunningHttpMockK8sServer {
			server,
			resources: shared_resources,
		}
	}
}

/// Derive the storage key for a manifest, defaulting the namespace of
/// namespaced objects to `default`.
fn object_key_for_manifest(manifest: &mut Value, discovery: &MockDiscovery) -> Option<ObjectKey> {
	let api_version = manifest["apiVersion"].as_str()?;
	let kind = manifest["kind"].as_str()?;
	let name = manifest["metadata"]["name"].as_str()?.to_string();
	let resource = discovery.find(api_version, kind)?;

	let prefix = if api_version.contains('/') {
		format!("/apis/{api_version}")
	} else {
		format!("/api/{api_version}")
	};

	let namespace = if resource.namespaced {
		let ns = manifest["metadata"]["namespace"]
			.as_str()
			.unwrap_or("default")
			.to_string();
		manifest["metadata"]["namespace"] = json!(ns);
		Some(ns)
	} else {
		None
	};

	Some(ObjectKey {
		prefix,
		plural: resource.name.clone(),
		namespace,
		name,
	})
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}

	/// All objects currently stored, including ones waiting on finalizers.
	pub fn objects(&self) -> Vec<Value> {
		self.resources.read().unwrap().values().cloned().collect()
	}

	/// Whether an object of `plural` called `name` is still stored.
	pub fn contains(&self, plural: &str, namespace: Option<&str>, name: &str) -> bool {
		self.resources.read().unwrap().keys().any(|key| {
			key.plural == plural && key.namespace.as_deref() == namespace && key.name == name
		})
	}

	/// Every request received so far, in arrival order.
	pub async fn received_requests(&self) -> Vec<RecordedRequest> {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.into_iter()
			.map(|req| RecordedRequest {
				method: req.method.to_string(),
				path: req.url.path().to_string(),
				query: req.url.query().map(str::to_string),
			})
			.collect()
	}
}

async fn mount_version(server: &MockServer) {
	Mock::given(method("GET"))
		.and(path("/version"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"major": "1",
			"minor": "31",
			"gitVersion": "v1.31.0",
			"gitCommit": "fake",
			"gitTreeState": "clean",
			"buildDate": "2024-01-01T00:00:00Z",
			"goVersion": "go1.22.0",
			"compiler": "gc",
			"platform": "linux/amd64"
		})))
		.mount(server)
		.await;
}

async fn mount_resources(server: &MockServer, state: Arc<MockState>) {
	Mock::given(path_regex(r"^/apis?/"))
		.respond_with(move |req: &Request| handle(&state, req))
		.mount(server)
		.await;
}

/// A request path split into its API parts.
#[derive(Debug, PartialEq, Eq)]
struct ApiPath {
	prefix: String,
	namespace: Option<String>,
	plural: String,
	/// `None` for collection requests.
	name: Option<String>,
}

impl ApiPath {
	fn key(&self, name: &str) -> ObjectKey {
		ObjectKey {
			prefix: self.prefix.clone(),
			plural: self.plural.clone(),
			namespace: self.namespace.clone(),
			name: name.to_string(),
		}
	}

	fn matches_collection(&self, key: &ObjectKey) -> bool {
		key.prefix == self.prefix
			&& key.plural == self.plural
			&& (self.namespace.is_none() || key.namespace == self.namespace)
	}
}

/// Parse a Kubernetes API path.
///
/// Examples:
/// - `/api/v1/configmaps` -> configmaps in all namespaces
/// - `/api/v1/namespaces/default/configmaps/my-config` -> one configmap
/// - `/apis/apps/v1/namespaces/default/deployments` -> deployments in `default`
/// - `/api/v1/namespaces/my-ns` -> the namespace object `my-ns`
fn parse_api_path(path: &str) -> Option<ApiPath> {
	let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
	let (prefix, rest) = match segments.as_slice() {
		["api", version, rest @ ..] => (format!("/api/{version}"), rest),
		["apis", group, version, rest @ ..] => (format!("/apis/{group}/{version}"), rest),
		_ => return None,
	};
	let (namespace, rest) = match rest {
		["namespaces", ns, rest @ ..] if !rest.is_empty() => (Some(ns.to_string()), rest),
		_ => (None, rest),
	};
	let (plural, name) = match rest {
		[plural] => (plural, None),
		[plural, name] => (plural, Some(name.to_string())),
		_ => return None,
	};
	Some(ApiPath {
		prefix,
		namespace,
		plural: plural.to_string(),
		name,
	})
}

fn status(code: u16, reason: &str, message: &str) -> ResponseTemplate {
	let body = json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": if code < 400 { "Success" } else { "Failure" },
		"message": message,
		"reason": reason,
		"code": code
	});
	ResponseTemplate::new(code).set_body_json(body)
}

fn not_found(path: &ApiPath, name: &str) -> ResponseTemplate {
	status(
		404,
		"NotFound",
		&format!("{} \"{}\" not found", path.plural, name),
	)
}

fn handle(state: &MockState, req: &Request) -> ResponseTemplate {
	if state.take_throttle() {
		return status(429, "TooManyRequests", "Too many requests, please try again later");
	}

	let Some(api_path) = parse_api_path(req.url.path()) else {
		return status(404, "NotFound", "the server could not find the requested resource");
	};

	match (req.method.as_str(), api_path.name.as_deref()) {
		("GET", None) => {
			let selector = req
				.url
				.query_pairs()
				.find(|(k, _)| k == "labelSelector")
				.map(|(_, v)| v.into_owned());
			list(state, &api_path, selector.as_deref())
		}
		("GET", Some(name)) => get(state, &api_path, name),
		("DELETE", Some(name)) => delete(state, &api_path, name),
		("PUT", Some(name)) => replace(state, &api_path, name, &req.body),
		(method, _) => status(
			405,
			"MethodNotAllowed",
			&format!("{method} is not supported by the mock server"),
		),
	}
}

fn list(state: &MockState, api_path: &ApiPath, selector: Option<&str>) -> ResponseTemplate {
	let resources = state.resources.read().unwrap();
	let items: Vec<_> = resources
		.iter()
		.filter(|(key, object)| {
			api_path.matches_collection(key)
				&& selector.is_none_or(|selector| matches_selector(object, selector))
		})
		.map(|(_, object)| object.clone())
		.collect();

	ResponseTemplate::new(200).set_body_json(json!({
		"kind": "List",
		"apiVersion": "v1",
		"metadata": {"resourceVersion": "1"},
		"items": items
	}))
}

fn get(state: &MockState, api_path: &ApiPath, name: &str) -> ResponseTemplate {
	let resources = state.resources.read().unwrap();
	match resources.get(&api_path.key(name)) {
		Some(object) => ResponseTemplate::new(200).set_body_json(object.clone()),
		None => not_found(api_path, name),
	}
}

/// Objects holding finalizers are only marked for deletion and returned;
/// anything else is removed and answered with a success status.
fn delete(state: &MockState, api_path: &ApiPath, name: &str) -> ResponseTemplate {
	let key = api_path.key(name);
	let mut resources = state.resources.write().unwrap();
	let Some(object) = resources.get_mut(&key) else {
		return not_found(api_path, name);
	};

	if has_finalizers(object) {
		object["metadata"]["deletionTimestamp"] = json!(DELETION_TIMESTAMP);
		return ResponseTemplate::new(200).set_body_json(object.clone());
	}

	resources.remove(&key);
	ResponseTemplate::new(200).set_body_json(json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Success",
		"details": {
			"name": name,
			"kind": api_path.plural,
		}
	}))
}

/// Replace an object. Once an object marked for deletion has no finalizers
/// left, it is removed.
fn replace(state: &MockState, api_path: &ApiPath, name: &str, body: &[u8]) -> ResponseTemplate {
	let mut updated: Value = match serde_json::from_slice(body) {
		Ok(value) => value,
		Err(e) => return status(400, "BadRequest", &e.to_string()),
	};

	let key = api_path.key(name);
	let mut resources = state.resources.write().unwrap();
	let Some(existing) = resources.get(&key) else {
		return not_found(api_path, name);
	};

	if is_deleting(existing) {
		updated["metadata"]["deletionTimestamp"] = existing["metadata"]["deletionTimestamp"].clone();
	}

	if is_deleting(&updated) && !has_finalizers(&updated) {
		resources.remove(&key);
	} else {
		resources.insert(key, updated.clone());
	}
	ResponseTemplate::new(200).set_body_json(updated)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_api_path() {
		assert_eq!(
			parse_api_path("/api/v1/configmaps"),
			Some(ApiPath {
				prefix: "/api/v1".to_string(),
				namespace: None,
				plural: "configmaps".to_string(),
				name: None,
			})
		);
		assert_eq!(
			parse_api_path("/apis/apps/v1/namespaces/bpfman/daemonsets/agent"),
			Some(ApiPath {
				prefix: "/apis/apps/v1".to_string(),
				namespace: Some("bpfman".to_string()),
				plural: "daemonsets".to_string(),
				name: Some("agent".to_string()),
			})
		);
		assert_eq!(
			parse_api_path("/api/v1/namespaces/bpfman"),
			Some(ApiPath {
				prefix: "/api/v1".to_string(),
				namespace: None,
				plural: "namespaces".to_string(),
				name: Some("bpfman".to_string()),
			})
		);
		assert_eq!(parse_api_path("/version"), None);
	}
}
