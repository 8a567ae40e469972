//! Heuristics deciding which resources belong to the app.
//!
//! Ownership is inferred from naming conventions and labels, not from owner
//! references. A resource named after the app or one of its program types is
//! considered the app's, whoever created it.

use crate::{
	config::PurgeConfig,
	k8s::{
		api::{CrdObject, ResourceIdentity},
		ResourceKind,
	},
};

use super::resource::Category;

/// Name and category rules derived from [`PurgeConfig`].
#[derive(Debug, Clone)]
pub struct ResourceMatcher {
	app: String,
	label_selectors: Vec<String>,
	crd_names: Vec<String>,
	fragments: Vec<String>,
	instance_resources: Vec<String>,
}

impl ResourceMatcher {
	pub fn new(config: &PurgeConfig) -> Self {
		let lower = |items: &[String]| items.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
		Self {
			app: config.app.to_lowercase(),
			label_selectors: config.label_selectors(),
			crd_names: lower(&config.crd_names),
			fragments: lower(&config.name_fragments),
			instance_resources: config.instance_resources.clone(),
		}
	}

	/// Label selectors that mark app resources.
	pub fn label_selectors(&self) -> &[String] {
		&self.label_selectors
	}

	/// Whether `name` contains the app token or a known fragment,
	/// ignoring case.
	pub fn matches_name(&self, name: &str) -> bool {
		let name = name.to_lowercase();
		name.contains(&self.app) || self.fragments.iter().any(|f| name.contains(f.as_str()))
	}

	/// Whether a CRD belongs to the app: allow-listed by name, matching the
	/// name heuristic, or served from a group containing the app token.
	pub fn matches_crd(&self, crd: &CrdObject) -> bool {
		let name = crd.name.to_lowercase();
		self.crd_names.contains(&name)
			|| self.matches_name(&name)
			|| crd.group.to_lowercase().contains(&self.app)
	}

	pub fn is_instance_kind(&self, kind: &ResourceKind) -> bool {
		self.instance_resources.contains(&kind.plural)
	}

	pub fn category(&self, resource: &ResourceIdentity) -> Category {
		if resource.is_crd() {
			Category::CustomResourceDefinition
		} else if self.is_instance_kind(&resource.kind) {
			Category::Instance
		} else {
			Category::Other
		}
	}
}

#[cfg(test)]
mod tests {
	use rstest::rstest;

	use super::*;

	fn matcher() -> ResourceMatcher {
		ResourceMatcher::new(&PurgeConfig::default())
	}

	fn crd(name: &str, group: &str) -> CrdObject {
		CrdObject {
			name: name.to_string(),
			group: group.to_string(),
			version: Some("v1alpha1".to_string()),
			plural: name.split('.').next().unwrap_or_default().to_string(),
			kind: "Thing".to_string(),
			finalizers: Vec::new(),
		}
	}

	#[rstest]
	#[case("bpfman-daemon", true)]
	#[case("BPFMAN-Config", true)]
	#[case("my-xdpProgram-sample", true)]
	#[case("go-tcprogram-counter", true)]
	#[case("kube-root-ca.crt", false)]
	#[case("coredns", false)]
	fn test_matches_name(#[case] name: &str, #[case] expected: bool) {
		assert_eq!(matcher().matches_name(name), expected);
	}

	#[rstest]
	#[case(crd("bpfapplications.bpfman.io", "bpfman.io"), true)]
	#[case(crd("xdpprograms.example.io", "example.io"), true)]
	#[case(crd("policies.netsec.io", "BPFMAN.netsec.io"), true)]
	#[case(crd("widgets.example.io", "example.io"), false)]
	fn test_matches_crd(#[case] crd: CrdObject, #[case] expected: bool) {
		assert_eq!(matcher().matches_crd(&crd), expected);
	}

	#[test]
	fn test_allow_listed_crd_name_matches_without_fragment() {
		let config = PurgeConfig {
			app: "other".to_string(),
			name_fragments: Vec::new(),
			crd_names: vec!["widgets.example.io".to_string()],
			..PurgeConfig::default()
		};
		let matcher = ResourceMatcher::new(&config);
		assert!(matcher.matches_crd(&crd("widgets.example.io", "example.io")));
		assert!(!matcher.matches_crd(&crd("gadgets.example.io", "example.io")));
	}

	#[test]
	fn test_category() {
		let matcher = matcher();

		let crd = ResourceIdentity::crd("bpfapplications.bpfman.io");
		assert_eq!(matcher.category(&crd), Category::CustomResourceDefinition);

		let instance = ResourceIdentity::new(
			ResourceKind::new("bpfman.io", "v1alpha1", "bpfapplications"),
			"app",
			Some("default".to_string()),
			"BpfApplication",
		);
		assert_eq!(matcher.category(&instance), Category::Instance);

		let other = ResourceIdentity::new(
			ResourceKind::new("apps", "v1", "daemonsets"),
			"bpfman-daemon",
			Some("bpfman".to_string()),
			"DaemonSet",
		);
		assert_eq!(matcher.category(&other), Category::Other);
	}
}
