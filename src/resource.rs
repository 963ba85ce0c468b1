//! Resource kinds tracked per slot.
//!
//! Ads spell resource suffixes inconsistently (`RequestGpus`, `TotalGPUs`,
//! `Requestgpus`); [`Resource::from_suffix`] folds them onto one kind and
//! [`ResourceMap`] serializes with the capitalization used in stored documents.

use std::ops::{Add, AddAssign, Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A resource kind whose usage is accounted per slot epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Gpus,
    Cpus,
    Memory,
    Disk,
}

impl Resource {
    /// All tracked resource kinds, in document order.
    pub const ALL: [Resource; 4] = [
        Resource::Gpus,
        Resource::Cpus,
        Resource::Memory,
        Resource::Disk,
    ];

    /// Name used as the suffix of `Request*`/`Total*` attributes in stored documents.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gpus => "GPUs",
            Self::Cpus => "Cpus",
            Self::Memory => "Memory",
            Self::Disk => "Disk",
        }
    }

    /// Resolves an attribute suffix case-insensitively (`gpus`, `GPUs`, `Gpus`).
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(suffix))
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per tracked resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMap<T> {
    #[serde(rename = "GPUs", default)]
    pub gpus: T,
    #[serde(rename = "Cpus", default)]
    pub cpus: T,
    #[serde(rename = "Memory", default)]
    pub memory: T,
    #[serde(rename = "Disk", default)]
    pub disk: T,
}

impl<T> ResourceMap<T> {
    /// Builds a map by evaluating `f` for every resource kind.
    pub fn from_fn(mut f: impl FnMut(Resource) -> T) -> Self {
        Self {
            gpus: f(Resource::Gpus),
            cpus: f(Resource::Cpus),
            memory: f(Resource::Memory),
            disk: f(Resource::Disk),
        }
    }

    /// Iterates `(resource, value)` pairs in document order.
    pub fn iter(&self) -> impl Iterator<Item = (Resource, &T)> {
        Resource::ALL.into_iter().map(move |r| (r, &self[r]))
    }
}

impl ResourceMap<f64> {
    /// Multiplies every entry by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self::from_fn(|r| self[r] * factor)
    }
}

impl<T> Index<Resource> for ResourceMap<T> {
    type Output = T;

    fn index(&self, resource: Resource) -> &T {
        match resource {
            Resource::Gpus => &self.gpus,
            Resource::Cpus => &self.cpus,
            Resource::Memory => &self.memory,
            Resource::Disk => &self.disk,
        }
    }
}

impl<T> IndexMut<Resource> for ResourceMap<T> {
    fn index_mut(&mut self, resource: Resource) -> &mut T {
        match resource {
            Resource::Gpus => &mut self.gpus,
            Resource::Cpus => &mut self.cpus,
            Resource::Memory => &mut self.memory,
            Resource::Disk => &mut self.disk,
        }
    }
}

impl Add for ResourceMap<f64> {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::from_fn(|r| self[r] + rhs[r])
    }
}

impl AddAssign for ResourceMap<f64> {
    fn add_assign(&mut self, rhs: Self) {
        for r in Resource::ALL {
            self[r] += rhs[r];
        }
    }
}

/// Per-resource slot capacity; `None` when the slot does not advertise the resource.
pub type Capacity = ResourceMap<Option<f64>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_suffix_folds_case() {
        assert_eq!(Resource::from_suffix("gpus"), Some(Resource::Gpus));
        assert_eq!(Resource::from_suffix("GPUs"), Some(Resource::Gpus));
        assert_eq!(Resource::from_suffix("Gpus"), Some(Resource::Gpus));
        assert_eq!(Resource::from_suffix("CPUS"), Some(Resource::Cpus));
        assert_eq!(Resource::from_suffix("Memory"), Some(Resource::Memory));
        assert_eq!(Resource::from_suffix("Network"), None);
    }

    #[test]
    fn test_resource_map_serializes_document_names() {
        let map = ResourceMap {
            gpus: 1.0,
            cpus: 2.0,
            memory: 3.0,
            disk: 4.0,
        };
        let json = serde_json::to_value(map).expect("serialize");
        assert_eq!(json["GPUs"], 1.0);
        assert_eq!(json["Cpus"], 2.0);
        assert_eq!(json["Memory"], 3.0);
        assert_eq!(json["Disk"], 4.0);
    }

    #[test]
    fn test_resource_map_missing_fields_default() {
        let map: ResourceMap<f64> =
            serde_json::from_str(r#"{"Cpus": 2.5}"#).expect("deserialize");
        assert_eq!(map.cpus, 2.5);
        assert_eq!(map.gpus, 0.0);
        assert_eq!(map.disk, 0.0);
    }

    #[test]
    fn test_add_assign_and_scaled() {
        let mut a = ResourceMap::from_fn(|_| 1.0);
        a += ResourceMap::from_fn(|r| if r == Resource::Cpus { 2.0 } else { 0.0 });
        assert_eq!(a.cpus, 3.0);
        assert_eq!(a.gpus, 1.0);

        let scaled = a.scaled(10.0);
        assert_eq!(scaled.cpus, 30.0);
        assert_eq!(scaled.memory, 10.0);
    }

    #[test]
    fn test_iter_in_document_order() {
        let map = ResourceMap::from_fn(|r| r.as_str().len());
        let names: Vec<_> = map.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(names, vec!["GPUs", "Cpus", "Memory", "Disk"]);
    }
}
