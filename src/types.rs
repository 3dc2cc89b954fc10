use serde::Deserialize;
use std::time::Instant;

/// A probe that has been dispatched and has not yet produced a terminal
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    /// Provider host tag the candidate was built for
    pub provider: String,
    /// Source path of the job that produced the candidate
    pub source: String,
    pub attempts: u32,
    /// `None` means never tried, which makes the entry immediately due.
    pub last_tried: Option<Instant>,
}

impl OpenRequest {
    pub fn new(provider: impl Into<String>, source: impl Into<String>, now: Instant) -> Self {
        Self {
            provider: provider.into(),
            source: source.into(),
            attempts: 1,
            last_tried: Some(now),
        }
    }
}

/// A reserved job from the work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub body: String,
}

/// Decoded `path,bucket` job body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub path: String,
    pub bucket: String,
}

impl JobSpec {
    /// Returns `None` unless the body has exactly one comma.
    pub fn parse(body: &str) -> Option<Self> {
        let mut fields = body.split(',');
        let path = fields.next()?;
        let bucket = fields.next()?;
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            path: path.to_string(),
            bucket: bucket.trim_end_matches(['\r', '\n']).to_string(),
        })
    }
}

/// The parts of a scanner output line the router acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub domain: String,
    pub status_code: u16,
    pub body: Option<String>,
}

// Scanner line layout: {"domain": .., "data": {"http": {"result": {"response": {..}}}}}

#[derive(Debug, Deserialize)]
struct ScanLine {
    domain: Option<String>,
    data: Option<ScanData>,
}

#[derive(Debug, Deserialize)]
struct ScanData {
    http: Option<HttpModule>,
}

#[derive(Debug, Deserialize)]
struct HttpModule {
    result: Option<HttpResult>,
}

#[derive(Debug, Deserialize)]
struct HttpResult {
    response: Option<HttpResponse>,
}

#[derive(Debug, Deserialize)]
struct HttpResponse {
    status_code: Option<u16>,
    body: Option<String>,
}

impl ProbeResponse {
    /// Decode one scanner output line. Any missing level yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let scan: ScanLine = match serde_json::from_str(line) {
            Ok(scan) => scan,
            Err(e) => {
                log::debug!("[types] unparseable_line: error={} len={}", e, line.len());
                return None;
            }
        };

        let response = scan.data?.http?.result?.response?;
        Some(Self {
            domain: scan.domain?,
            status_code: response.status_code?,
            body: response.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_spec_parse() {
        let spec = JobSpec::parse("sources/a.txt,mybucket").unwrap();
        assert_eq!(spec.path, "sources/a.txt");
        assert_eq!(spec.bucket, "mybucket");
    }

    #[test]
    fn test_job_spec_rejects_wrong_shape() {
        assert!(JobSpec::parse("mybucket").is_none());
        assert!(JobSpec::parse("a,b,c").is_none());
        assert!(JobSpec::parse("").is_none());
    }

    #[test]
    fn test_open_request_starts_at_one_attempt() {
        let now = Instant::now();
        let request = OpenRequest::new("s3.amazonaws.com", "sources/a.txt", now);
        assert_eq!(request.attempts, 1);
        assert_eq!(request.last_tried, Some(now));
    }

    #[test]
    fn test_parse_full_response() {
        let line = r#"{"ip":"1.2.3.4","domain":"mybucket.s3.amazonaws.com","data":{"http":{"status":"success","result":{"response":{"status_code":403,"body":"<Error/>"}}}}}"#;
        let response = ProbeResponse::parse(line).unwrap();
        assert_eq!(response.domain, "mybucket.s3.amazonaws.com");
        assert_eq!(response.status_code, 403);
        assert_eq!(response.body.as_deref(), Some("<Error/>"));
    }

    #[test]
    fn test_parse_without_body() {
        let line = r#"{"domain":"b.storage.googleapis.com","data":{"http":{"result":{"response":{"status_code":404}}}}}"#;
        let response = ProbeResponse::parse(line).unwrap();
        assert_eq!(response.status_code, 404);
        assert!(response.body.is_none());
    }

    #[test]
    fn test_parse_missing_levels() {
        let cases = [
            r#"{"data":{"http":{"result":{"response":{"status_code":200}}}}}"#,
            r#"{"domain":"a.s3.amazonaws.com"}"#,
            r#"{"domain":"a.s3.amazonaws.com","data":{}}"#,
            r#"{"domain":"a.s3.amazonaws.com","data":{"http":{"status":"connection-timeout"}}}"#,
            r#"{"domain":"a.s3.amazonaws.com","data":{"http":{"result":{}}}}"#,
            r#"{"domain":"a.s3.amazonaws.com","data":{"http":{"result":{"response":{}}}}}"#,
            "not json at all",
        ];
        for line in cases {
            assert!(ProbeResponse::parse(line).is_none(), "expected skip for {}", line);
        }
    }
}
