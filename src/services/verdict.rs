use crate::config::FailurePolicy;
use crate::models::{Classification, ScanFinding, ScanOutcome, ScanSource, Verdict};

/// Which checks must be conclusive and what happens when they are not
#[derive(Debug, Clone)]
pub struct VerdictPolicy {
    pub failure: FailurePolicy,
    pub required: Vec<ScanSource>,
}

impl VerdictPolicy {
    pub fn new(failure: FailurePolicy, required: Vec<ScanSource>) -> Self {
        Self { failure, required }
    }

    fn is_required(&self, source: ScanSource) -> bool {
        self.required.contains(&source)
    }
}

/// Combines scan findings into a single classification.
///
/// Precedence: any Blocked finding wins, then any Suspicious finding. An
/// Error in a required check blocks under fail-closed and becomes a warning
/// under fail-open; an Error in an optional check is always just a warning.
/// The result does not depend on the order of `findings`.
pub fn resolve(findings: &[ScanFinding], policy: &VerdictPolicy) -> Verdict {
    let mut contributing: Vec<ScanFinding> = findings.to_vec();
    contributing.sort_by(|a, b| {
        (a.source, a.outcome, &a.detail, a.latency_ms).cmp(&(
            b.source,
            b.outcome,
            &b.detail,
            b.latency_ms,
        ))
    });

    let has = |outcome: ScanOutcome| findings.iter().any(|f| f.outcome == outcome);

    let mut warnings: Vec<String> = Vec::new();
    let mut required_failed = false;
    for finding in findings.iter().filter(|f| f.outcome == ScanOutcome::Error) {
        if policy.is_required(finding.source) {
            required_failed = true;
            if policy.failure == FailurePolicy::FailOpen {
                warnings.push(format!(
                    "{} verification not available, upload allowed by policy",
                    finding.source.display_name()
                ));
            }
        } else {
            warnings.push(format!(
                "{} verification not available",
                finding.source.display_name()
            ));
        }
    }

    let classification = if has(ScanOutcome::Blocked) {
        Classification::Blocked
    } else if has(ScanOutcome::Suspicious) {
        warnings.push("File was flagged as suspicious but upload was allowed".to_string());
        Classification::Suspicious
    } else if required_failed && policy.failure == FailurePolicy::FailClosed {
        Classification::Blocked
    } else {
        Classification::Clean
    };

    warnings.sort();
    warnings.dedup();

    Verdict {
        classification,
        contributing_findings: contributing,
        warnings,
    }
}

/// Whether a Blocked verdict rests only on inconclusive checks
pub fn is_inconclusive(verdict: &Verdict) -> bool {
    verdict.classification == Classification::Blocked
        && !verdict
            .contributing_findings
            .iter()
            .any(|f| f.outcome == ScanOutcome::Blocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(source: ScanSource, outcome: ScanOutcome) -> ScanFinding {
        ScanFinding::new(source, outcome, format!("{:?}", outcome))
    }

    fn all_sources_required(failure: FailurePolicy) -> VerdictPolicy {
        VerdictPolicy::new(
            failure,
            vec![
                ScanSource::Blacklist,
                ScanSource::LocalScanner,
                ScanSource::ReputationScanner,
            ],
        )
    }

    fn permutations(items: &[ScanFinding]) -> Vec<Vec<ScanFinding>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_order_independence() {
        let outcomes = [
            ScanOutcome::Clean,
            ScanOutcome::Suspicious,
            ScanOutcome::Blocked,
            ScanOutcome::Error,
        ];
        let sources = [
            ScanSource::Blacklist,
            ScanSource::LocalScanner,
            ScanSource::ReputationScanner,
        ];
        for failure in [FailurePolicy::FailClosed, FailurePolicy::FailOpen] {
            let policy = VerdictPolicy::new(failure, vec![ScanSource::LocalScanner]);
            for a in outcomes {
                for b in outcomes {
                    for c in outcomes {
                        let findings: Vec<_> = sources
                            .iter()
                            .zip([a, b, c])
                            .map(|(s, o)| finding(*s, o))
                            .collect();
                        let expected = resolve(&findings, &policy);
                        for perm in permutations(&findings) {
                            assert_eq!(resolve(&perm, &policy), expected);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_blocked_dominates() {
        let findings = vec![
            finding(ScanSource::Blacklist, ScanOutcome::Clean),
            finding(ScanSource::LocalScanner, ScanOutcome::Blocked),
            finding(ScanSource::ReputationScanner, ScanOutcome::Suspicious),
        ];
        for failure in [FailurePolicy::FailClosed, FailurePolicy::FailOpen] {
            let verdict = resolve(&findings, &all_sources_required(failure));
            assert_eq!(verdict.classification, Classification::Blocked);
            assert!(!is_inconclusive(&verdict));
        }
    }

    #[test]
    fn test_suspicious_over_clean() {
        let findings = vec![
            finding(ScanSource::LocalScanner, ScanOutcome::Clean),
            finding(ScanSource::ReputationScanner, ScanOutcome::Suspicious),
        ];
        let verdict = resolve(&findings, &all_sources_required(FailurePolicy::FailClosed));
        assert_eq!(verdict.classification, Classification::Suspicious);
        assert!(verdict.warnings.iter().any(|w| w.contains("suspicious")));
    }

    #[test]
    fn test_required_error_fail_closed_blocks() {
        let findings = vec![
            finding(ScanSource::LocalScanner, ScanOutcome::Error),
            finding(ScanSource::ReputationScanner, ScanOutcome::Clean),
        ];
        let verdict = resolve(&findings, &all_sources_required(FailurePolicy::FailClosed));
        assert_eq!(verdict.classification, Classification::Blocked);
        assert!(is_inconclusive(&verdict));
    }

    #[test]
    fn test_required_error_fail_open_warns_with_check_name() {
        let findings = vec![
            finding(ScanSource::LocalScanner, ScanOutcome::Clean),
            finding(ScanSource::ReputationScanner, ScanOutcome::Error),
        ];
        let verdict = resolve(&findings, &all_sources_required(FailurePolicy::FailOpen));
        assert_eq!(verdict.classification, Classification::Clean);
        assert_eq!(verdict.warnings.len(), 1);
        assert!(verdict.warnings[0].contains("VirusTotal"));
    }

    #[test]
    fn test_optional_error_is_warning_even_fail_closed() {
        let policy = VerdictPolicy::new(FailurePolicy::FailClosed, vec![ScanSource::LocalScanner]);
        let findings = vec![
            finding(ScanSource::LocalScanner, ScanOutcome::Clean),
            finding(ScanSource::ReputationScanner, ScanOutcome::Error),
        ];
        let verdict = resolve(&findings, &policy);
        assert_eq!(verdict.classification, Classification::Clean);
        assert_eq!(
            verdict.warnings,
            vec!["VirusTotal verification not available".to_string()]
        );
    }

    #[test]
    fn test_empty_findings_are_clean() {
        let verdict = resolve(&[], &all_sources_required(FailurePolicy::FailClosed));
        assert_eq!(verdict.classification, Classification::Clean);
        assert!(verdict.warnings.is_empty());
    }
}
