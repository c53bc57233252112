//! Resource calculators.
//!
//! A calculator decides how two multi-dimensional [`Resource`]s compare and
//! how one divides into another:
//! - **Default**: memory is the only dimension that counts
//! - **Dominant**: each resource is judged by its largest share of the cluster

use std::cmp::Ordering;
use std::fmt;

use crate::types::Resource;

/// Comparison and division of resources relative to a cluster total.
pub trait ResourceCalculator: Send + Sync + fmt::Debug {
    fn compare(&self, cluster: Resource, lhs: Resource, rhs: Resource) -> Ordering;

    /// `numerator / denominator` in the calculator's measure. Returns `0.0`
    /// when the denominator is an invalid divisor.
    fn divide(&self, cluster: Resource, numerator: Resource, denominator: Resource) -> f64;

    fn is_invalid_divisor(&self, resource: Resource) -> bool;

    fn less_than_or_equal(&self, cluster: Resource, lhs: Resource, rhs: Resource) -> bool {
        self.compare(cluster, lhs, rhs) != Ordering::Greater
    }

    fn greater_than_or_equal(&self, cluster: Resource, lhs: Resource, rhs: Resource) -> bool {
        self.compare(cluster, lhs, rhs) != Ordering::Less
    }
}

/// Memory-only calculator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResourceCalculator;

impl ResourceCalculator for DefaultResourceCalculator {
    fn compare(&self, _cluster: Resource, lhs: Resource, rhs: Resource) -> Ordering {
        lhs.memory_mb.cmp(&rhs.memory_mb)
    }

    fn divide(&self, _cluster: Resource, numerator: Resource, denominator: Resource) -> f64 {
        if self.is_invalid_divisor(denominator) {
            return 0.0;
        }
        numerator.memory_mb as f64 / denominator.memory_mb as f64
    }

    fn is_invalid_divisor(&self, resource: Resource) -> bool {
        resource.memory_mb == 0
    }
}

/// Dominant-resource-fairness calculator.
///
/// Resources are ordered by their dominant share of `cluster`, ties broken by
/// the non-dominant share. With an empty cluster every dimension must be
/// ordered the same way for the result to be anything but `Equal`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DominantResourceCalculator;

impl DominantResourceCalculator {
    fn shares(cluster: Resource, r: Resource) -> (f64, f64) {
        let mem = if cluster.memory_mb == 0 {
            0.0
        } else {
            r.memory_mb as f64 / cluster.memory_mb as f64
        };
        let cpu = if cluster.vcores == 0 {
            0.0
        } else {
            f64::from(r.vcores) / f64::from(cluster.vcores)
        };
        if mem >= cpu { (mem, cpu) } else { (cpu, mem) }
    }
}

impl ResourceCalculator for DominantResourceCalculator {
    fn compare(&self, cluster: Resource, lhs: Resource, rhs: Resource) -> Ordering {
        if lhs == rhs {
            return Ordering::Equal;
        }
        if self.is_invalid_divisor(cluster) {
            let mem = lhs.memory_mb.cmp(&rhs.memory_mb);
            let cpu = lhs.vcores.cmp(&rhs.vcores);
            return if mem == cpu || cpu == Ordering::Equal {
                mem
            } else if mem == Ordering::Equal {
                cpu
            } else {
                Ordering::Equal
            };
        }

        let (l_dom, l_rest) = Self::shares(cluster, lhs);
        let (r_dom, r_rest) = Self::shares(cluster, rhs);
        l_dom
            .partial_cmp(&r_dom)
            .filter(|o| *o != Ordering::Equal)
            .or_else(|| l_rest.partial_cmp(&r_rest))
            .unwrap_or(Ordering::Equal)
    }

    fn divide(&self, cluster: Resource, numerator: Resource, denominator: Resource) -> f64 {
        let (num, _) = Self::shares(cluster, numerator);
        let (den, _) = Self::shares(cluster, denominator);
        if den == 0.0 { 0.0 } else { num / den }
    }

    fn is_invalid_divisor(&self, resource: Resource) -> bool {
        resource.memory_mb == 0 || resource.vcores == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER: Resource = Resource::new(16 * 1024, 16);

    #[test]
    fn default_calculator_ignores_vcores() {
        let rc = DefaultResourceCalculator;
        let lhs = Resource::new(1024, 8);
        let rhs = Resource::new(1024, 1);
        assert_eq!(rc.compare(CLUSTER, lhs, rhs), Ordering::Equal);
        assert!(rc.less_than_or_equal(CLUSTER, Resource::new(2560, 1), Resource::new(3072, 1)));
        assert!(!rc.less_than_or_equal(CLUSTER, Resource::new(2560, 1), Resource::new(2048, 1)));
    }

    #[test]
    fn default_divide_guards_zero_divisor() {
        let rc = DefaultResourceCalculator;
        assert_eq!(rc.divide(CLUSTER, Resource::new(3072, 3), Resource::new(1024, 1)), 3.0);
        assert_eq!(rc.divide(CLUSTER, Resource::new(3072, 3), Resource::zero()), 0.0);
    }

    #[test]
    fn dominant_calculator_uses_largest_share() {
        let rc = DominantResourceCalculator;
        // 1 GiB / 8 cores dominates on cpu (0.5) vs 4 GiB / 1 core (0.25 memory).
        let cpu_heavy = Resource::new(1024, 8);
        let mem_heavy = Resource::new(4096, 1);
        assert_eq!(rc.compare(CLUSTER, cpu_heavy, mem_heavy), Ordering::Greater);
        assert!(rc.less_than_or_equal(CLUSTER, mem_heavy, cpu_heavy));
    }

    #[test]
    fn dominant_divide_is_ratio_of_dominant_shares() {
        let rc = DominantResourceCalculator;
        let ratio = rc.divide(CLUSTER, Resource::new(2048, 4), Resource::new(1024, 1));
        // numerator dominant share 4/16, denominator 1/16
        assert!((ratio - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dominant_with_empty_cluster_falls_back_to_components() {
        let rc = DominantResourceCalculator;
        let empty = Resource::zero();
        assert_eq!(
            rc.compare(empty, Resource::new(1024, 1), Resource::new(2048, 2)),
            Ordering::Less
        );
        assert_eq!(
            rc.compare(empty, Resource::new(1024, 4), Resource::new(2048, 2)),
            Ordering::Equal
        );
    }
}
