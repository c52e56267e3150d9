//! Plugin version comparison.

/// Parse a version string into numeric components.
///
/// A leading `v` and anything after the first `-` are ignored. Components
/// that are not numbers count as zero.
fn components(version: &str) -> Vec<u64> {
    let version = version.trim();
    let version = version
        .strip_prefix('v')
        .or_else(|| version.strip_prefix('V'))
        .unwrap_or(version);
    let version = version.split('-').next().unwrap_or_default();

    version
        .split('.')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

/// Whether `current` is older than `remote`.
///
/// Missing trailing components are treated as zero, so `1.2` and `1.2.0`
/// are equal.
pub fn is_out_of_date(current: &str, remote: &str) -> bool {
    let current = components(current);
    let remote = components(remote);
    let len = current.len().max(remote.len());

    for i in 0..len {
        let c = current.get(i).copied().unwrap_or(0);
        let r = remote.get(i).copied().unwrap_or(0);
        if c != r {
            return c < r;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_bump() {
        assert!(is_out_of_date("1.1.12", "1.1.13"));
    }

    #[test]
    fn test_minor_beats_patch() {
        assert!(!is_out_of_date("1.2.0", "1.1.99"));
    }

    #[test]
    fn test_equal_versions() {
        assert!(!is_out_of_date("2.0.0", "2.0.0"));
    }

    #[test]
    fn test_major_bump() {
        assert!(is_out_of_date("1.9.9", "2.0.0"));
    }

    #[test]
    fn test_prefix_and_suffix_ignored() {
        assert!(!is_out_of_date("v2.0.0", "2.0.0-SNAPSHOT"));
        assert!(is_out_of_date("v1.0-beta", "1.0.1"));
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert!(!is_out_of_date("1.2", "1.2.0"));
        assert!(is_out_of_date("1.2", "1.2.1"));
    }

    #[test]
    fn test_non_numeric_components_are_zero() {
        assert!(is_out_of_date("1.x", "1.1"));
        assert!(!is_out_of_date("abc", ""));
    }
}
