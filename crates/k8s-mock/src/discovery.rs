//! Resource types known to the mock server.

use std::collections::HashMap;

/// Maps `apiVersion` and kind to the plural name and scope the server
/// routes by.
pub struct MockDiscovery {
	resources: HashMap<String, Vec<MockApiResource>>,
}

impl Default for MockDiscovery {
	fn default() -> Self {
		let rbac = "rbac.authorization.k8s.io/v1";
		Self {
			resources: HashMap::from([
				(
					"v1".to_string(),
					vec![
						MockApiResource::namespaced("configmaps", "ConfigMap"),
						MockApiResource::namespaced("secrets", "Secret"),
						MockApiResource::namespaced("services", "Service"),
						MockApiResource::namespaced("serviceaccounts", "ServiceAccount"),
						MockApiResource::namespaced("pods", "Pod"),
						MockApiResource::cluster_scoped("namespaces", "Namespace"),
					],
				),
				(
					"apps/v1".to_string(),
					vec![
						MockApiResource::namespaced("deployments", "Deployment"),
						MockApiResource::namespaced("daemonsets", "DaemonSet"),
						MockApiResource::namespaced("replicasets", "ReplicaSet"),
					],
				),
				(
					rbac.to_string(),
					vec![
						MockApiResource::namespaced("roles", "Role"),
						MockApiResource::namespaced("rolebindings", "RoleBinding"),
						MockApiResource::cluster_scoped("clusterroles", "ClusterRole"),
						MockApiResource::cluster_scoped(
							"clusterrolebindings",
							"ClusterRoleBinding",
						),
					],
				),
				(
					"apiextensions.k8s.io/v1".to_string(),
					vec![MockApiResource::cluster_scoped(
						"customresourcedefinitions",
						"CustomResourceDefinition",
					)],
				),
			]),
		}
	}
}

impl MockDiscovery {
	pub fn find(&self, api_version: &str, kind: &str) -> Option<&MockApiResource> {
		self.resources
			.get(api_version)?
			.iter()
			.find(|r| r.kind == kind)
	}

	pub fn register(&mut self, api_version: impl Into<String>, resource: MockApiResource) {
		self.resources
			.entry(api_version.into())
			.or_default()
			.push(resource);
	}

	/// Register every served version of a CustomResourceDefinition manifest.
	///
	/// Returns false if the manifest is not a usable CRD.
	pub fn register_crd(&mut self, crd: &serde_json::Value) -> bool {
		let spec = &crd["spec"];
		let (Some(group), Some(plural), Some(kind), Some(versions)) = (
			spec["group"].as_str(),
			spec["names"]["plural"].as_str(),
			spec["names"]["kind"].as_str(),
			spec["versions"].as_array(),
		) else {
			return false;
		};
		let namespaced = spec["scope"].as_str() != Some("Cluster");

		for version in versions.iter().filter_map(|v| v["name"].as_str()) {
			let resource = if namespaced {
				MockApiResource::namespaced(plural, kind)
			} else {
				MockApiResource::cluster_scoped(plural, kind)
			};
			self.register(format!("{group}/{version}"), resource);
		}
		true
	}
}

/// A mock API resource definition.
#[derive(Debug, Clone)]
pub struct MockApiResource {
	pub name: String,
	pub kind: String,
	pub namespaced: bool,
}

impl MockApiResource {
	pub fn namespaced(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: true,
		}
	}

	pub fn cluster_scoped(name: &str, kind: &str) -> Self {
		Self {
			name: name.to_string(),
			kind: kind.to_string(),
			namespaced: false,
		}
	}
}
