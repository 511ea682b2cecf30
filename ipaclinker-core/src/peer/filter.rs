use regex::Regex;

use crate::protocol::IceCandidate;

/// Ordered exclusion list for locally gathered candidates.
///
/// A candidate is dropped when its address field matches any pattern. The
/// filter is only ever consulted for local candidates; whatever the remote
/// peer sends is applied untouched.
#[derive(Clone, Debug, Default)]
pub struct CandidateFilter {
    patterns: Vec<Regex>,
}

impl CandidateFilter {
    /// Compiles every pattern, failing on the first invalid one.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the first pattern matching the candidate's address, if any.
    pub fn excluded_by(&self, candidate: &IceCandidate) -> Option<&Regex> {
        let address = candidate.address()?;
        self.patterns.iter().find(|p| p.is_match(address))
    }

    pub fn allows(&self, candidate: &IceCandidate) -> bool {
        self.excluded_by(candidate).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(addr: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:842163049 1 udp 1677729535 {addr} 61823 typ srflx"),
            mid: "0".to_string(),
        }
    }

    #[test]
    fn test_default_exclusions() {
        let filter =
            CandidateFilter::from_patterns([r"^.+ff:fe.{2}:.+$", r"^192\.168\..+$", r"^100\..+$"])
                .unwrap();
        assert!(!filter.allows(&candidate("192.168.1.20")));
        assert!(!filter.allows(&candidate("100.64.0.1")));
        assert!(!filter.allows(&candidate("fe80::21a:2bff:fe3c:4d5e")));
        assert!(filter.allows(&candidate("203.0.113.9")));
        assert!(filter.allows(&candidate("2001:db8::1")));
    }

    #[test]
    fn test_first_match_reported() {
        let filter = CandidateFilter::from_patterns([r"^10\.", r"^10\.0\."]).unwrap();
        assert_eq!(
            filter.excluded_by(&candidate("10.0.0.1")).map(Regex::as_str),
            Some(r"^10\.")
        );
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = CandidateFilter::default();
        assert!(filter.is_empty());
        assert!(filter.allows(&candidate("192.168.0.1")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(CandidateFilter::from_patterns(["("]).is_err());
    }
}
