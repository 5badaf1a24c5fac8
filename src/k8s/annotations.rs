use std::collections::BTreeMap;

use tracing::warn;

use crate::mig::node::NodeState;
use crate::mig::profile::{DeviceStatus, ProfileName};
use crate::mig::Geometry;

/// Domain prefix for partitioning annotations.
const ANNOTATION_DOMAIN: &str = "n8s.nebuly.ai";

/// Desired partition counts declared on the node: (GPU index, profile) →
/// total count. Parsed from `n8s.nebuly.ai/spec-gpu-<i>-<profile>` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecAnnotations(BTreeMap<(u32, ProfileName), usize>);

impl SpecAnnotations {
    pub fn insert(&mut self, index: u32, profile: ProfileName, count: usize) {
        self.0.insert((index, profile), count);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(u32, ProfileName), &usize)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: u32, profile: &ProfileName) -> Option<usize> {
        self.0.get(&(index, profile.clone())).copied()
    }

    /// Desired geometry for one GPU.
    pub fn desired_geometry(&self, index: u32) -> Geometry {
        self.0
            .iter()
            .filter(|((i, _), _)| *i == index)
            .filter(|(_, count)| **count > 0)
            .map(|((_, profile), count)| (profile.clone(), *count))
            .collect()
    }
}

/// Observed partition counts reported back on the node:
/// (GPU index, profile, status) → count. Parsed from
/// `n8s.nebuly.ai/status-gpu-<i>-<profile>-<free|used>` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusAnnotations(BTreeMap<(u32, ProfileName, DeviceStatus), usize>);

impl StatusAnnotations {
    pub fn insert(&mut self, index: u32, profile: ProfileName, status: DeviceStatus, count: usize) {
        self.0.insert((index, profile, status), count);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(u32, ProfileName, DeviceStatus), &usize)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total count for (index, profile), free and used combined.
    pub fn total(&self, index: u32, profile: &ProfileName) -> usize {
        self.0
            .get(&(index, profile.clone(), DeviceStatus::Free))
            .copied()
            .unwrap_or(0)
            + self
                .0
                .get(&(index, profile.clone(), DeviceStatus::Used))
                .copied()
                .unwrap_or(0)
    }
}

fn spec_key_prefix() -> String {
    format!("{ANNOTATION_DOMAIN}/spec-gpu-")
}

fn status_key_prefix() -> String {
    format!("{ANNOTATION_DOMAIN}/status-gpu-")
}

/// Parse spec annotations from a node's annotation map.
///
/// Malformed entries (bad key shape, unparsable profile, non-integer value)
/// are dropped with a warning, never fatal.
pub fn parse_spec(annotations: &BTreeMap<String, String>) -> SpecAnnotations {
    let prefix = spec_key_prefix();
    let mut spec = SpecAnnotations::default();

    for (key, value) in annotations {
        let rest = match key.strip_prefix(&prefix) {
            Some(rest) => rest,
            None => continue,
        };
        let parsed = rest.split_once('-').and_then(|(index, profile)| {
            let index: u32 = index.parse().ok()?;
            let profile: ProfileName = profile.parse().ok()?;
            let count: usize = value.parse().ok()?;
            Some((index, profile, count))
        });
        match parsed {
            Some((index, profile, count)) => spec.insert(index, profile, count),
            None => warn!(key = %key, value = %value, "dropping malformed spec annotation"),
        }
    }

    spec
}

/// Parse status annotations from a node's annotation map, dropping malformed
/// entries with a warning.
pub fn parse_status(annotations: &BTreeMap<String, String>) -> StatusAnnotations {
    let prefix = status_key_prefix();
    let mut status = StatusAnnotations::default();

    for (key, value) in annotations {
        let rest = match key.strip_prefix(&prefix) {
            Some(rest) => rest,
            None => continue,
        };
        let parsed = rest.split_once('-').and_then(|(index, profile_status)| {
            let index: u32 = index.parse().ok()?;
            let (profile, device_status) = profile_status.rsplit_once('-')?;
            let profile: ProfileName = profile.parse().ok()?;
            let device_status: DeviceStatus = device_status.parse().ok()?;
            let count: usize = value.parse().ok()?;
            Some((index, profile, device_status, count))
        });
        match parsed {
            Some((index, profile, device_status, count)) => {
                status.insert(index, profile, device_status, count);
            }
            None => warn!(key = %key, value = %value, "dropping malformed status annotation"),
        }
    }

    status
}

/// Whether the reported status already fulfills the spec: every spec entry's
/// count equals the free+used total reported for it, and no status entry
/// reports a (GPU, profile) pair the spec does not name.
pub fn spec_matches_status(spec: &SpecAnnotations, status: &StatusAnnotations) -> bool {
    let spec_fulfilled = spec
        .iter()
        .all(|((index, profile), count)| status.total(*index, profile) == *count);
    let no_stray_status = status.iter().all(|((index, profile, _), count)| {
        *count == 0 || spec.get(*index, profile).is_some()
    });
    spec_fulfilled && no_stray_status
}

/// Serialize a node's observed state into status annotations.
///
/// One key per (GPU index, profile, status) with a nonzero count; callers
/// writing these back are expected to first clear every stale status key.
pub fn serialize_status(state: &NodeState) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    for gpu in state.gpus() {
        for (status, geometry) in [
            (DeviceStatus::Free, gpu.free()),
            (DeviceStatus::Used, gpu.used()),
        ] {
            for (profile, count) in geometry {
                if *count == 0 {
                    continue;
                }
                let key = format!(
                    "{ANNOTATION_DOMAIN}/status-gpu-{}-{}-{}",
                    gpu.index(),
                    profile,
                    status
                );
                annotations.insert(key, count.to_string());
            }
        }
    }
    annotations
}

/// Whether `key` is one of this agent's status annotations.
pub fn is_status_key(key: &str) -> bool {
    key.starts_with(&status_key_prefix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mig::catalog::{GpuModel, MODEL_A100_SXM4_40GB};
    use crate::mig::gpu::Gpu;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn geometry(pairs: &[(&str, usize)]) -> Geometry {
        pairs
            .iter()
            .map(|(name, count)| (name.parse().unwrap(), *count))
            .collect()
    }

    #[test]
    fn parse_spec_reads_well_formed_keys() {
        let spec = parse_spec(&annotations(&[
            ("n8s.nebuly.ai/spec-gpu-0-1g.5gb", "2"),
            ("n8s.nebuly.ai/spec-gpu-1-3g.20gb", "1"),
            ("other.domain/annotation", "7"),
        ]));
        assert_eq!(spec.get(0, &"1g.5gb".parse().unwrap()), Some(2));
        assert_eq!(spec.get(1, &"3g.20gb".parse().unwrap()), Some(1));
        assert_eq!(spec.iter().count(), 2);
    }

    #[test]
    fn parse_spec_drops_malformed_entries() {
        let spec = parse_spec(&annotations(&[
            ("n8s.nebuly.ai/spec-gpu-x-1g.5gb", "2"),
            ("n8s.nebuly.ai/spec-gpu-0-notaprofile", "2"),
            ("n8s.nebuly.ai/spec-gpu-1-1g.5gb", "two"),
            ("n8s.nebuly.ai/spec-gpu-0-1g.5gb", "3"),
        ]));
        assert_eq!(spec.iter().count(), 1);
        assert_eq!(spec.get(0, &"1g.5gb".parse().unwrap()), Some(3));
    }

    #[test]
    fn parse_status_reads_both_statuses() {
        let status = parse_status(&annotations(&[
            ("n8s.nebuly.ai/status-gpu-0-1g.5gb-free", "2"),
            ("n8s.nebuly.ai/status-gpu-0-1g.5gb-used", "1"),
            ("n8s.nebuly.ai/status-gpu-0-1g.5gb-busy", "1"),
        ]));
        assert_eq!(status.total(0, &"1g.5gb".parse().unwrap()), 3);
        assert_eq!(status.iter().count(), 2);
    }

    #[test]
    fn spec_matches_status_sums_free_and_used() {
        let spec = parse_spec(&annotations(&[("n8s.nebuly.ai/spec-gpu-0-1g.5gb", "3")]));
        let status = parse_status(&annotations(&[
            ("n8s.nebuly.ai/status-gpu-0-1g.5gb-free", "2"),
            ("n8s.nebuly.ai/status-gpu-0-1g.5gb-used", "1"),
        ]));
        assert!(spec_matches_status(&spec, &status));
    }

    #[test]
    fn spec_matches_status_rejects_stray_status_entries() {
        let spec = SpecAnnotations::default();
        let status = parse_status(&annotations(&[(
            "n8s.nebuly.ai/status-gpu-0-1g.5gb-free",
            "1",
        )]));
        assert!(!spec_matches_status(&spec, &status));
    }

    #[test]
    fn spec_matches_status_rejects_count_mismatch() {
        let spec = parse_spec(&annotations(&[("n8s.nebuly.ai/spec-gpu-0-1g.5gb", "2")]));
        let status = parse_status(&annotations(&[(
            "n8s.nebuly.ai/status-gpu-0-1g.5gb-free",
            "1",
        )]));
        assert!(!spec_matches_status(&spec, &status));
    }

    #[test]
    fn serialize_status_emits_one_key_per_nonzero_pair() {
        let state = NodeState::new(vec![Gpu::new(
            GpuModel::new(MODEL_A100_SXM4_40GB),
            0,
            geometry(&[("1g.5gb", 1)]),
            geometry(&[("2g.10gb", 2)]),
        )
        .unwrap()]);

        let serialized = serialize_status(&state);
        assert_eq!(
            serialized,
            annotations(&[
                ("n8s.nebuly.ai/status-gpu-0-2g.10gb-free", "2"),
                ("n8s.nebuly.ai/status-gpu-0-1g.5gb-used", "1"),
            ])
        );
    }

    #[test]
    fn status_round_trips_through_serialization() {
        let state = NodeState::new(vec![Gpu::new(
            GpuModel::new(MODEL_A100_SXM4_40GB),
            0,
            geometry(&[("1g.5gb", 2)]),
            geometry(&[("3g.20gb", 1), ("1g.5gb", 1)]),
        )
        .unwrap()]);

        let status = parse_status(&serialize_status(&state));
        assert_eq!(status.total(0, &"1g.5gb".parse().unwrap()), 3);
        assert_eq!(status.total(0, &"3g.20gb".parse().unwrap()), 1);
    }

    #[test]
    fn status_key_detection() {
        assert!(is_status_key("n8s.nebuly.ai/status-gpu-0-1g.5gb-free"));
        assert!(!is_status_key("n8s.nebuly.ai/spec-gpu-0-1g.5gb"));
        assert!(!is_status_key("other.domain/status-gpu-0-1g.5gb-free"));
    }
}
