//! Deduplicated collections of discovered resources.

use std::{collections::BTreeMap, fmt};

use indexmap::IndexSet;

use crate::k8s::api::ResourceIdentity;

/// Deletion category of a resource. Categories are deleted in declaration
/// order, so CRDs always go last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
	/// Objects of the app's own custom resource types.
	Instance,
	/// Everything that is neither an instance nor a CRD.
	Other,
	CustomResourceDefinition,
}

impl Category {
	/// Categories in the order they must be deleted.
	pub const DELETION_ORDER: [Category; 3] = [
		Category::Instance,
		Category::Other,
		Category::CustomResourceDefinition,
	];
}

impl fmt::Display for Category {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Instance => "custom resource instances",
			Self::Other => "other resources",
			Self::CustomResourceDefinition => "CRDs",
		})
	}
}

/// Insertion-ordered set of resources; identical identities collapse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSet {
	items: IndexSet<ResourceIdentity>,
}

impl ResourceSet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert one resource, returning false if it was already present.
	pub fn insert(&mut self, resource: ResourceIdentity) -> bool {
		self.items.insert(resource)
	}

	/// Merge another batch of resources into the set.
	pub fn merge(&mut self, resources: impl IntoIterator<Item = ResourceIdentity>) {
		self.items.extend(resources);
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn contains(&self, resource: &ResourceIdentity) -> bool {
		self.items.contains(resource)
	}

	pub fn iter(&self) -> impl Iterator<Item = &ResourceIdentity> {
		self.items.iter()
	}

	/// Split the set by category, keeping discovery order within each.
	pub fn categorize(
		self,
		category_of: impl Fn(&ResourceIdentity) -> Category,
	) -> BTreeMap<Category, Vec<ResourceIdentity>> {
		let mut by_category: BTreeMap<Category, Vec<ResourceIdentity>> = BTreeMap::new();
		for resource in self.items {
			by_category
				.entry(category_of(&resource))
				.or_default()
				.push(resource);
		}
		by_category
	}

	/// Number of resources per plural resource type.
	pub fn counts_by_type(&self) -> BTreeMap<&str, usize> {
		let mut counts = BTreeMap::new();
		for resource in &self.items {
			*counts.entry(resource.kind.plural.as_str()).or_insert(0) += 1;
		}
		counts
	}
}

impl FromIterator<ResourceIdentity> for ResourceSet {
	fn from_iter<I: IntoIterator<Item = ResourceIdentity>>(iter: I) -> Self {
		Self {
			items: iter.into_iter().collect(),
		}
	}
}

impl IntoIterator for ResourceSet {
	type Item = ResourceIdentity;
	type IntoIter = indexmap::set::IntoIter<ResourceIdentity>;

	fn into_iter(self) -> Self::IntoIter {
		self.items.into_iter()
	}
}
