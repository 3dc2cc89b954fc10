use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ledger::RetryLedger;
use crate::output::OutputFileRegistry;
use crate::seen::SeenSet;
use crate::target::HostCatalog;
use crate::types::ProbeResponse;

const REDIRECT_STATUS: u16 = 403;
const REDIRECT_MARKER: &str = "must be addressed";
const ENDPOINT_OPEN: &str = "<Endpoint>";
const ENDPOINT_CLOSE: &str = "</Endpoint>";

/// What the router did with one scanner line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Line was unparseable or missing a required field
    Skipped,
    /// Probe must be retried on a regional endpoint
    Redirected { from: String, to: String },
    /// Terminal response written to the output files
    Recorded { domain: String, status_code: u16 },
}

/// Consumes scanner output and turns it into ledger updates and result
/// records.
#[derive(Debug, Clone)]
pub struct ResponseRouter {
    ledger: Arc<RetryLedger>,
    seen: Arc<SeenSet>,
    files: Arc<OutputFileRegistry>,
    catalog: Arc<HostCatalog>,
}

impl ResponseRouter {
    pub fn new(
        ledger: Arc<RetryLedger>,
        seen: Arc<SeenSet>,
        files: Arc<OutputFileRegistry>,
        catalog: Arc<HostCatalog>,
    ) -> Self {
        Self {
            ledger,
            seen,
            files,
            catalog,
        }
    }

    /// Route lines until every sender has gone away. Returns the number of
    /// lines consumed.
    ///
    /// Result records are appended with blocking `std::fs` writes on this
    /// task; each is a single short line to an already open file.
    pub async fn run(self, mut lines: mpsc::UnboundedReceiver<String>) -> u64 {
        log::info!("[router] run: started");
        let mut consumed = 0u64;
        while let Some(line) = lines.recv().await {
            consumed += 1;
            self.route_line(&line);
        }
        log::info!("[router] run: channel_closed consumed={}", consumed);
        consumed
    }

    pub fn route_line(&self, line: &str) -> Routed {
        match ProbeResponse::parse(line) {
            Some(response) => self.route(response),
            None => {
                log::trace!("[router] skipped: line={}", line);
                Routed::Skipped
            }
        }
    }

    fn route(&self, response: ProbeResponse) -> Routed {
        log::info!("[router] response: status={} domain={}", response.status_code, response.domain);
        self.seen.insert(&response.domain);

        if let Some(endpoint) = self.redirect_endpoint(&response) {
            let to = self.catalog.readdress(&response.domain, &endpoint);
            self.ledger.redirect(&response.domain, &to);
            log::info!("[router] redirected: from={} to={}", response.domain, to);
            return Routed::Redirected {
                from: response.domain,
                to,
            };
        }

        let record = format!("{},{}", response.domain, chrono::Utc::now().timestamp());

        match self.ledger.complete(&response.domain) {
            Some(request) if !request.source.is_empty() => {
                self.files.get(&request.source).append_line(&record);
            }
            Some(_) => {
                log::debug!("[router] no_source: domain={}", response.domain);
            }
            None => {
                log::warn!("[router] untracked_response: domain={}", response.domain);
            }
        }

        if let Some(host) = self.catalog.accepted_host(&response.domain) {
            let key = format!("{}{}", response.status_code, host);
            self.files.get(&key).append_line(&record);
        }

        Routed::Recorded {
            domain: response.domain,
            status_code: response.status_code,
        }
    }

    /// Regional endpoint named by a hyphenated-provider 403, if any.
    fn redirect_endpoint(&self, response: &ProbeResponse) -> Option<String> {
        if response.status_code != REDIRECT_STATUS || !self.catalog.is_hyphenated(&response.domain) {
            return None;
        }
        let body = response.body.as_deref()?;
        if !body.contains(REDIRECT_MARKER) {
            return None;
        }

        let start = body.find(ENDPOINT_OPEN)? + ENDPOINT_OPEN.len();
        let len = body[start..].find(ENDPOINT_CLOSE)?;
        let endpoint = body[start..start + len].trim();
        if endpoint.is_empty() {
            return None;
        }
        Some(endpoint.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OpenRequest;
    use std::fs;
    use std::time::{Duration, Instant};

    const ALIYUN_REDIRECT: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>AccessDenied</Code><Message>The bucket you are attempting to access must be addressed using the specified endpoint. Please send all future requests to this endpoint.</Message><Endpoint>oss-cn-hangzhou.aliyuncs.com</Endpoint></Error>";

    struct Fixture {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        ledger: Arc<RetryLedger>,
        seen: Arc<SeenSet>,
        router: ResponseRouter,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let ledger = Arc::new(RetryLedger::default());
        let seen = Arc::new(SeenSet::new(1000, 0.0001));
        let files = Arc::new(OutputFileRegistry::new(&root));
        let router = ResponseRouter::new(ledger.clone(), seen.clone(), files, Arc::new(HostCatalog::default()));
        Fixture { _dir: dir, root, ledger, seen, router }
    }

    fn line(domain: &str, status: u16, body: Option<&str>) -> String {
        let mut response = serde_json::json!({ "status_code": status });
        if let Some(body) = body {
            response["body"] = serde_json::Value::String(body.to_string());
        }
        serde_json::json!({
            "domain": domain,
            "data": { "http": { "result": { "response": response } } }
        })
        .to_string()
    }

    #[test]
    fn test_terminal_response_writes_both_files() {
        let f = fixture();
        f.ledger.open("mybucket.s3.amazonaws.com",
            OpenRequest::new("s3.amazonaws.com", "sources/a.txt", Instant::now()));

        let routed = f.router.route_line(&line("mybucket.s3.amazonaws.com", 200, None));
        assert_eq!(routed, Routed::Recorded {
            domain: "mybucket.s3.amazonaws.com".to_string(),
            status_code: 200,
        });
        assert!(f.ledger.is_empty());
        assert!(f.seen.contains("mybucket.s3.amazonaws.com"));

        for file in ["sources/a.txt.txt", "200s3.amazonaws.com.txt"] {
            let contents = fs::read_to_string(f.root.join(file)).unwrap();
            let (domain, timestamp) = contents.trim_end().split_once(',').unwrap();
            assert_eq!(domain, "mybucket.s3.amazonaws.com");
            assert!(timestamp.parse::<i64>().unwrap() > 0);
        }
    }

    #[test]
    fn test_incomplete_line_leaves_ledger_untouched() {
        let f = fixture();
        let now = Instant::now();
        f.ledger.open("mybucket.s3.amazonaws.com", OpenRequest::new("s3.amazonaws.com", "sources/a.txt", now));

        let partial = r#"{"domain":"mybucket.s3.amazonaws.com","data":{"http":{"status":"io-timeout"}}}"#;
        assert_eq!(f.router.route_line(partial), Routed::Skipped);
        assert_eq!(f.router.route_line("garbage"), Routed::Skipped);

        let request = f.ledger.get("mybucket.s3.amazonaws.com").unwrap();
        assert_eq!(request.attempts, 1);
        assert_eq!(request.last_tried, Some(now));
        assert!(!f.seen.contains("mybucket.s3.amazonaws.com"));
        assert!(fs::read_dir(&f.root).unwrap().next().is_none());
    }

    #[test]
    fn test_aliyun_redirect_moves_ledger_entry() {
        let f = fixture();
        f.ledger.open("logs.oss-us-east-1.aliyuncs.com",
            OpenRequest::new("oss-us-east-1.aliyuncs.com", "sources/a.txt", Instant::now()));

        let routed = f.router.route_line(&line("logs.oss-us-east-1.aliyuncs.com", 403, Some(ALIYUN_REDIRECT)));
        assert_eq!(routed, Routed::Redirected {
            from: "logs.oss-us-east-1.aliyuncs.com".to_string(),
            to: "logs.oss-cn-hangzhou.aliyuncs.com".to_string(),
        });

        assert_eq!(f.ledger.len(), 1);
        let moved = f.ledger.get("logs.oss-cn-hangzhou.aliyuncs.com").unwrap();
        assert_eq!(moved.attempts, 2);
        assert_eq!(moved.source, "sources/a.txt");
        assert!(f.ledger.claim_due(Instant::now()).is_some());

        // No output record for a redirect
        assert!(fs::read_dir(&f.root).unwrap().next().is_none());
    }

    #[test]
    fn test_plain_aliyun_403_is_terminal() {
        let f = fixture();
        f.ledger.open("logs.oss-us-east-1.aliyuncs.com",
            OpenRequest::new("oss-us-east-1.aliyuncs.com", "sources/a.txt", Instant::now()));

        let routed = f.router.route_line(&line("logs.oss-us-east-1.aliyuncs.com", 403, Some("<Error><Code>AccessDenied</Code></Error>")));
        assert!(matches!(routed, Routed::Recorded { status_code: 403, .. }));
        assert!(f.ledger.is_empty());
        assert!(f.root.join("403aliyuncs.com.txt").exists());
    }

    #[test]
    fn test_redirect_markers_ignored_for_other_providers() {
        let f = fixture();
        let routed = f.router.route_line(&line("logs.s3.amazonaws.com", 403, Some(ALIYUN_REDIRECT)));
        assert!(matches!(routed, Routed::Recorded { .. }));
    }

    #[test]
    fn test_untracked_response_still_categorised() {
        let f = fixture();
        f.router.route_line(&line("stray.storage.googleapis.com", 404, None));
        assert!(f.root.join("404storage.googleapis.com.txt").exists());
        let entries: Vec<_> = fs::read_dir(&f.root).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let f = fixture();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(f.router.clone().run(rx));

        tx.send(line("a.s3.amazonaws.com", 200, None)).unwrap();
        tx.send("junk".to_string()).unwrap();
        drop(tx);

        let consumed = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(consumed, 2);
        assert!(f.seen.contains("a.s3.amazonaws.com"));
    }
}
