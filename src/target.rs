/// Provider hosts every bucket without an explicit host is tried against.
pub const CANDIDATE_HOSTS: [&str; 3] = [
    "s3.amazonaws.com",
    "storage.googleapis.com",
    "oss-us-east-1.aliyuncs.com",
];

/// Host suffixes recognised as "already addressed" inside a bucket string.
pub const ACCEPTED_HOSTS: [&str; 3] = ["s3.amazonaws.com", "storage.googleapis.com", "aliyuncs.com"];

/// Alibaba bucket names cannot contain dots, and regional redirects are
/// discovered by probing this endpoint first.
pub const HYPHENATED_HOST: &str = "oss-us-east-1.aliyuncs.com";

/// A hostname to probe together with the provider host it was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub hostname: String,
    pub provider: String,
}

/// The fixed provider tables used for fan-out and result categorisation.
#[derive(Debug, Clone)]
pub struct HostCatalog {
    pub candidates: Vec<String>,
    pub accepted: Vec<String>,
    pub hyphenated: String,
}

impl Default for HostCatalog {
    fn default() -> Self {
        Self {
            candidates: CANDIDATE_HOSTS.iter().map(|h| h.to_string()).collect(),
            accepted: ACCEPTED_HOSTS.iter().map(|h| h.to_string()).collect(),
            hyphenated: HYPHENATED_HOST.to_string(),
        }
    }
}

impl HostCatalog {
    /// Expand a bucket string from a job into the hostnames to probe.
    ///
    /// A bucket that already names an accepted host is probed as-is against
    /// that host only. Anything else fans out to every candidate host.
    pub fn resolve(&self, bucket: &str) -> Vec<Candidate> {
        if let Some(host) = self.accepted_host(bucket) {
            log::trace!("[target] explicit_host: bucket={} host={}", bucket, host);
            return vec![Candidate {
                hostname: bucket.to_string(),
                provider: host.to_string(),
            }];
        }

        self.candidates
            .iter()
            .map(|host| {
                let label = if *host == self.hyphenated {
                    bucket.replace('.', "-")
                } else {
                    bucket.to_string()
                };
                Candidate {
                    hostname: format!("{}.{}", label, host),
                    provider: host.clone(),
                }
            })
            .collect()
    }

    /// First accepted host contained in `name`, if any.
    pub fn accepted_host(&self, name: &str) -> Option<&str> {
        self.accepted
            .iter()
            .find(|host| name.contains(host.as_str()))
            .map(String::as_str)
    }

    pub fn is_hyphenated(&self, domain: &str) -> bool {
        domain.contains(&self.hyphenated)
    }

    /// Rebuild a hyphenated-provider domain on a different regional endpoint.
    pub fn readdress(&self, domain: &str, endpoint: &str) -> String {
        let suffix = format!(".{}", self.hyphenated);
        let bucket = domain.split(suffix.as_str()).next().unwrap_or(domain);
        format!("{}.{}", bucket, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_without_host() {
        let catalog = HostCatalog::default();
        let candidates = catalog.resolve("mybucket");

        let hostnames: Vec<&str> = candidates.iter().map(|c| c.hostname.as_str()).collect();
        assert_eq!(
            hostnames,
            vec![
                "mybucket.s3.amazonaws.com",
                "mybucket.storage.googleapis.com",
                "mybucket.oss-us-east-1.aliyuncs.com",
            ]
        );
        assert_eq!(candidates[2].provider, "oss-us-east-1.aliyuncs.com");
    }

    #[test]
    fn test_only_hyphenated_host_rewrites_dots() {
        let catalog = HostCatalog::default();
        let candidates = catalog.resolve("my.dotted.bucket");

        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].hostname, "my.dotted.bucket.s3.amazonaws.com");
        assert_eq!(candidates[1].hostname, "my.dotted.bucket.storage.googleapis.com");
        assert_eq!(candidates[2].hostname, "my-dotted-bucket.oss-us-east-1.aliyuncs.com");
    }

    #[test]
    fn test_explicit_host_yields_single_candidate() {
        let catalog = HostCatalog::default();

        let s3 = catalog.resolve("assets.s3.amazonaws.com");
        assert_eq!(s3.len(), 1);
        assert_eq!(s3[0].hostname, "assets.s3.amazonaws.com");
        assert_eq!(s3[0].provider, "s3.amazonaws.com");

        let oss = catalog.resolve("assets.oss-eu-central-1.aliyuncs.com");
        assert_eq!(oss.len(), 1);
        assert_eq!(oss[0].provider, "aliyuncs.com");
    }

    #[test]
    fn test_accepted_host_lookup() {
        let catalog = HostCatalog::default();
        assert_eq!(catalog.accepted_host("x.storage.googleapis.com"), Some("storage.googleapis.com"));
        assert_eq!(catalog.accepted_host("x-oss-us-east-1.aliyuncs.com"), Some("aliyuncs.com"));
        assert_eq!(catalog.accepted_host("example.com"), None);
    }

    #[test]
    fn test_readdress_to_regional_endpoint() {
        let catalog = HostCatalog::default();
        assert!(catalog.is_hyphenated("logs.oss-us-east-1.aliyuncs.com"));
        assert_eq!(
            catalog.readdress("logs.oss-us-east-1.aliyuncs.com", "oss-cn-hangzhou.aliyuncs.com"),
            "logs.oss-cn-hangzhou.aliyuncs.com"
        );
    }
}
