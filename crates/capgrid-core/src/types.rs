//! Shared types used across capgrid crates.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Partition name of nodes that carry no explicit label.
pub const NO_LABEL: &str = "";

/// Resource name of a request that may be satisfied on any host.
pub const ANY: &str = "*";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identity of a cluster node.
    NodeId
);

string_id!(
    /// Identity of one attempt of an application.
    AttemptId
);

string_id!(
    /// Identity of a container, unique across the cluster.
    ContainerId
);

/// Scheduling priority of a request. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Priority attached to scheduler-generated requests that belong to no
    /// application priority level.
    pub const UNDEFINED: Priority = Priority(-1);
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locality of an allocation relative to the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    NodeLocal,
    RackLocal,
    OffSwitch,
}

/// A multi-dimensional resource quantity.
///
/// Subtraction saturates at zero in every dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    pub const fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    pub fn is_zero(&self) -> bool {
        self.memory_mb == 0 && self.vcores == 0
    }

    /// True when every dimension of `self` is at most the matching dimension
    /// of `other`.
    pub fn fits_in(&self, other: &Resource) -> bool {
        self.memory_mb <= other.memory_mb && self.vcores <= other.vcores
    }

    pub fn multiply(&self, by: u32) -> Resource {
        Resource::new(
            self.memory_mb.saturating_mul(u64::from(by)),
            self.vcores.saturating_mul(by),
        )
    }

    pub fn scale(&self, by: f64) -> Resource {
        Resource::new(
            (self.memory_mb as f64 * by) as u64,
            (f64::from(self.vcores) * by) as u32,
        )
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<memory:{}, vCores:{}>", self.memory_mb, self.vcores)
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        Resource::new(
            self.memory_mb.saturating_add(rhs.memory_mb),
            self.vcores.saturating_add(rhs.vcores),
        )
    }
}

impl AddAssign for Resource {
    fn add_assign(&mut self, rhs: Resource) {
        *self = *self + rhs;
    }
}

impl Sub for Resource {
    type Output = Resource;

    fn sub(self, rhs: Resource) -> Resource {
        Resource::new(
            self.memory_mb.saturating_sub(rhs.memory_mb),
            self.vcores.saturating_sub(rhs.vcores),
        )
    }
}

impl SubAssign for Resource {
    fn sub_assign(&mut self, rhs: Resource) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for Resource {
    fn sum<I: Iterator<Item = Resource>>(iter: I) -> Resource {
        iter.fold(Resource::zero(), |acc, r| acc + r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_saturates_per_dimension() {
        let r = Resource::new(1024, 1) - Resource::new(2048, 0);
        assert_eq!(r, Resource::new(0, 1));
    }

    #[test]
    fn fits_in_checks_every_dimension() {
        assert!(Resource::new(1024, 1).fits_in(&Resource::new(2048, 1)));
        assert!(!Resource::new(1024, 2).fits_in(&Resource::new(2048, 1)));
    }

    #[test]
    fn sum_and_multiply() {
        let total: Resource = [Resource::new(512, 1), Resource::new(1024, 2)]
            .into_iter()
            .sum();
        assert_eq!(total, Resource::new(1536, 3));
        assert_eq!(Resource::new(512, 1).multiply(4), Resource::new(2048, 4));
    }

    #[test]
    fn ids_order_lexicographically() {
        let mut ids = vec![NodeId::new("n3"), NodeId::new("n1"), NodeId::new("n2")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "n1");
        assert_eq!(NodeId::from("n1").to_string(), "n1");
    }

    #[test]
    fn display_matches_scheduler_log_format() {
        assert_eq!(Resource::new(2048, 2).to_string(), "<memory:2048, vCores:2>");
    }
}
