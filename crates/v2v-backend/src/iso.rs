//! The ISO ranking table and selection algorithm used by `check_install_drivers`
//! (§4.6 "ISO ranking table"). Priority 7 (highest) down to 0; within a
//! priority, the highest version string wins (lexicographic compare).

use regex::Regex;

struct RankedPattern {
    priority: u8,
    regex: Regex,
    has_version: bool,
}

fn ranked_patterns() -> Vec<RankedPattern> {
    vec![
        pattern(7, r"(?i)^RHV-toolsSetup_(.+)\.iso$", true),
        pattern(6, r"(?i)^rhv-tools-setup\.iso$", false),
        pattern(5, r"(?i)^RHEV-toolsSetup_(.+)\.iso$", true),
        pattern(4, r"(?i)^rhev-tools-setup\.iso$", false),
        pattern(3, r"(?i)^oVirt-toolsSetup_(.+)\.iso$", true),
        pattern(2, r"(?i)^ovirt-tools-setup\.iso$", false),
        pattern(1, r"(?i)^virtio-win-(.+)\.iso$", true),
        pattern(0, r"(?i)^virtio-win\.iso$", false),
    ]
}

fn pattern(priority: u8, re: &str, has_version: bool) -> RankedPattern {
    RankedPattern { priority, regex: Regex::new(re).unwrap(), has_version }
}

/// Pick the best-ranked candidate filename: highest priority first, then
/// highest version string within that priority (testable property 9).
pub fn select_best<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let patterns = ranked_patterns();
    let mut best: Option<(u8, String, &str)> = None;

    for name in candidates {
        for p in &patterns {
            if let Some(caps) = p.regex.captures(name) {
                let version = if p.has_version {
                    caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default()
                } else {
                    String::new()
                };
                let candidate = (p.priority, version, name);
                let replace = match &best {
                    None => true,
                    Some((bp, bv, _)) => (candidate.0, candidate.1.as_str()) > (*bp, bv.as_str()),
                };
                if replace {
                    best = Some(candidate);
                }
            }
        }
    }

    best.map(|(_, _, name)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_f_virtio_win_picked_over_plain_names() {
        let candidates = vec!["a.iso", "virtio-win-123.iso", "b.iso"];
        assert_eq!(select_best(candidates), Some("virtio-win-123.iso"));
    }

    #[test]
    fn test_scenario_f_higher_version_wins_same_priority() {
        let candidates = vec!["RHEV-toolsSetup_4.0_3.iso", "RHEV-toolsSetup_4.0_2.iso"];
        assert_eq!(select_best(candidates), Some("RHEV-toolsSetup_4.0_3.iso"));
    }

    #[test]
    fn test_scenario_f_higher_major_version_wins() {
        let candidates = vec!["RHEV-toolsSetup_4.0_3.iso", "RHEV-toolsSetup_4.1_3.iso"];
        assert_eq!(select_best(candidates), Some("RHEV-toolsSetup_4.1_3.iso"));
    }

    #[test]
    fn test_priority_beats_version() {
        // A priority-6 exact match beats any priority-0/1 candidate regardless of version.
        let candidates = vec!["virtio-win-999.iso", "rhv-tools-setup.iso"];
        assert_eq!(select_best(candidates), Some("rhv-tools-setup.iso"));
    }

    #[test]
    fn test_no_match_returns_none() {
        let candidates = vec!["random.iso", "readme.txt"];
        assert_eq!(select_best(candidates), None);
    }

    #[test]
    fn test_case_insensitive_match() {
        let candidates = vec!["VIRTIO-WIN.ISO"];
        assert_eq!(select_best(candidates), Some("VIRTIO-WIN.ISO"));
    }
}
