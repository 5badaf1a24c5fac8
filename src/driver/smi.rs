//! Parsers for `nvidia-smi` output.
//!
//! Kept as pure functions so the table and CSV grammars are pinned by unit
//! tests without any hardware present.

use error_stack::Report;

use crate::driver::DriverError;
use crate::mig::profile::ProfileName;

/// A row of `nvidia-smi mig -lgi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GpuInstanceRow {
    pub gpu_index: u32,
    pub profile: ProfileName,
    pub instance_id: u32,
}

/// Parse the GPU-instance table printed by `nvidia-smi mig -lgi`.
///
/// Data rows look like:
///
/// ```text
/// |   0  MIG 3g.20gb          9        1          4:4     |
/// ```
///
/// Border, header, and "No GPU instances found" rows carry no `MIG` token
/// and are skipped.
pub(crate) fn parse_gpu_instances(output: &str) -> Vec<GpuInstanceRow> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line
            .trim()
            .trim_matches('|')
            .split_whitespace()
            .collect();
        if tokens.len() != 6 || tokens[1] != "MIG" {
            continue;
        }
        let parsed = (|| {
            let gpu_index: u32 = tokens[0].parse().ok()?;
            let profile: ProfileName = tokens[2].parse().ok()?;
            let instance_id: u32 = tokens[4].parse().ok()?;
            Some(GpuInstanceRow {
                gpu_index,
                profile,
                instance_id,
            })
        })();
        if let Some(row) = parsed {
            rows.push(row);
        }
    }
    rows
}

/// Parse `nvidia-smi --query-compute-apps=gpu_uuid,gpu_instance_id,pid
/// --format=csv,noheader` into the set of (GPU UUID, GPU-instance id) pairs
/// that have a compute process attached.
///
/// Processes on non-MIG GPUs report `N/A` for the instance id and are
/// skipped.
pub(crate) fn parse_compute_apps(output: &str) -> Result<Vec<(String, u32)>, Report<DriverError>> {
    let mut pairs = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            return Err(Report::new(DriverError::ParseFailed {
                message: format!("unexpected compute-apps row: {line}"),
            }));
        }
        if fields[1].eq_ignore_ascii_case("N/A") {
            continue;
        }
        let instance_id: u32 = fields[1].parse().map_err(|_| {
            Report::new(DriverError::ParseFailed {
                message: format!("bad GPU instance id in compute-apps row: {line}"),
            })
        })?;
        pairs.push((fields[0].to_string(), instance_id));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_instance_table() {
        let output = "\
+-------------------------------------------------------+
| GPU instances:                                        |
| GPU   Name             Profile  Instance   Placement  |
|                          ID       ID       Start:Size |
|=======================================================|
|   0  MIG 3g.20gb          9        1          4:4     |
+-------------------------------------------------------+
|   0  MIG 1g.5gb          19        13         0:1     |
+-------------------------------------------------------+
|   1  MIG 7g.40gb           0        0          0:8     |
+-------------------------------------------------------+";

        let rows = parse_gpu_instances(output);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].gpu_index, 0);
        assert_eq!(rows[0].profile, "3g.20gb".parse().unwrap());
        assert_eq!(rows[0].instance_id, 1);
        assert_eq!(rows[1].instance_id, 13);
        assert_eq!(rows[2].gpu_index, 1);
    }

    #[test]
    fn skips_non_data_rows() {
        let output = "\
+-------------------------------------------------------+
| No GPU instances found                                |
+-------------------------------------------------------+";
        assert!(parse_gpu_instances(output).is_empty());
    }

    #[test]
    fn parses_compute_apps_csv() {
        let output = "\
GPU-5c8e03e4-0a1b-4c9a-ae43-1f1d5b8e1111, 1, 4096
GPU-5c8e03e4-0a1b-4c9a-ae43-1f1d5b8e1111, 2, 4097
GPU-deadbeef-0000-0000-0000-000000000000, N/A, 512
";
        let pairs = parse_compute_apps(output).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("GPU-5c8e03e4-0a1b-4c9a-ae43-1f1d5b8e1111".to_string(), 1),
                ("GPU-5c8e03e4-0a1b-4c9a-ae43-1f1d5b8e1111".to_string(), 2),
            ]
        );
    }

    #[test]
    fn empty_compute_apps_output() {
        assert!(parse_compute_apps("").unwrap().is_empty());
        assert!(parse_compute_apps("\n\n").unwrap().is_empty());
    }

    #[test]
    fn malformed_compute_apps_row_is_an_error() {
        assert!(parse_compute_apps("GPU-x, 1").is_err());
        assert!(parse_compute_apps("GPU-x, one, 99").is_err());
    }
}
