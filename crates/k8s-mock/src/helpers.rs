//! Manifest builders and small JSON helpers for mock Kubernetes testing.

use serde_json::{json, Value};

/// A minimal CustomResourceDefinition manifest serving `version` as its
/// storage version.
pub fn crd_manifest(group: &str, version: &str, plural: &str, kind: &str, namespaced: bool) -> Value {
	json!({
		"apiVersion": "apiextensions.k8s.io/v1",
		"kind": "CustomResourceDefinition",
		"metadata": { "name": format!("{plural}.{group}") },
		"spec": {
			"group": group,
			"names": {
				"plural": plural,
				"kind": kind,
				"singular": kind.to_lowercase(),
			},
			"scope": if namespaced { "Namespaced" } else { "Cluster" },
			"versions": [{
				"name": version,
				"served": true,
				"storage": true,
			}],
		},
	})
}

/// Manifest for an arbitrary object.
pub fn object_manifest(
	api_version: &str,
	kind: &str,
	name: &str,
	namespace: Option<&str>,
	labels: &[(&str, &str)],
	finalizers: &[&str],
) -> Value {
	let mut metadata = json!({ "name": name });
	if let Some(ns) = namespace {
		metadata["namespace"] = json!(ns);
	}
	if !labels.is_empty() {
		let labels: serde_json::Map<String, Value> = labels
			.iter()
			.map(|(k, v)| (k.to_string(), json!(v)))
			.collect();
		metadata["labels"] = Value::Object(labels);
	}
	if !finalizers.is_empty() {
		metadata["finalizers"] = json!(finalizers);
	}
	json!({
		"apiVersion": api_version,
		"kind": kind,
		"metadata": metadata,
	})
}

pub(crate) fn has_finalizers(object: &Value) -> bool {
	object["metadata"]["finalizers"]
		.as_array()
		.is_some_and(|f| !f.is_empty())
}

pub(crate) fn is_deleting(object: &Value) -> bool {
	!object["metadata"]["deletionTimestamp"].is_null()
}

/// Whether `object` satisfies a Kubernetes label selector.
///
/// Supports `k=v`, `k==v`, `k!=v`, `k` and `!k` terms joined by commas.
pub(crate) fn matches_selector(object: &Value, selector: &str) -> bool {
	let labels = &object["metadata"]["labels"];
	let label = |key: &str| labels[key.trim()].as_str();

	selector
		.split(',')
		.map(str::trim)
		.filter(|term| !term.is_empty())
		.all(|term| {
			if let Some((k, v)) = term.split_once("!=") {
				label(k) != Some(v.trim())
			} else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
				label(k) == Some(v.trim())
			} else if let Some(k) = term.strip_prefix('!') {
				label(k).is_none()
			} else {
				label(term).is_some()
			}
		})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_matches_selector() {
		let object = object_manifest(
			"v1",
			"ConfigMap",
			"cm",
			Some("default"),
			&[("app", "bpfman"), ("tier", "agent")],
			&[],
		);

		assert!(matches_selector(&object, "app=bpfman"));
		assert!(matches_selector(&object, "app==bpfman,tier"));
		assert!(matches_selector(&object, "app!=other,!missing"));
		assert!(!matches_selector(&object, "app=other"));
		assert!(!matches_selector(&object, "missing"));
	}
}
