// 🧩 Command-backed fetch capability
// Runs an external program as `<command> [args...] <source> <lookup_key>` and
// reads one JSON object from stdout:
//
//   {"estimated_price": 612000, "listing_status": "for-sale", ...}
//   {"error": {"kind": "rate_limited", "message": "429", "retry_after_secs": 30}}
//
// Exit code 75 (EX_TEMPFAIL) without a JSON error is treated as transient; any
// other failure is permanent.

use crate::fetcher::{EstimateFetch, FetchError, RawResponse};
use crate::units::Source;
use serde::Deserialize;
use std::process::Command;
use tracing::debug;

const EX_TEMPFAIL: i32 = 75;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Reply {
    Failure { error: ReplyError },
    Estimate(RawResponse),
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    kind: ReplyErrorKind,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retry_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReplyErrorKind {
    Transient,
    RateLimited,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct CommandFetch {
    program: String,
    args: Vec<String>,
}

impl CommandFetch {
    pub fn new(program: &str, args: &[String]) -> Self {
        CommandFetch {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }
}

impl EstimateFetch for CommandFetch {
    fn fetch_raw(&self, source: Source, lookup_key: &str) -> Result<RawResponse, FetchError> {
        debug!(program = %self.program, source = %source, lookup_key, "invoking fetch command");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(source.as_str())
            .arg(lookup_key)
            .output()
            .map_err(|e| FetchError::Permanent(format!("cannot run {}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Ok(reply) = serde_json::from_str::<Reply>(stdout.trim()) {
            return match reply {
                Reply::Estimate(raw) if output.status.success() => Ok(raw),
                Reply::Estimate(_) => Err(FetchError::Permanent(format!(
                    "command exited with {} despite returning an estimate",
                    output.status
                ))),
                Reply::Failure { error } => Err(match error.kind {
                    ReplyErrorKind::Transient => FetchError::Transient(error.message),
                    ReplyErrorKind::RateLimited => FetchError::RateLimited {
                        retry_after_secs: error.retry_after_secs,
                    },
                    ReplyErrorKind::Permanent => FetchError::Permanent(error.message),
                }),
            };
        }

        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };

        match output.status.code() {
            Some(EX_TEMPFAIL) => Err(FetchError::Transient(detail)),
            Some(0) => Err(FetchError::Permanent(format!("unparseable response: {}", detail))),
            _ => Err(FetchError::Permanent(format!("command failed ({}): {}", output.status, detail))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::db::ListingStatus;

    /// `sh -c <script> sh <source> <key>`: the script sees $1 / $2
    fn shell(script: &str) -> CommandFetch {
        CommandFetch::new("sh", &["-c".to_string(), script.to_string(), "sh".to_string()])
    }

    #[test]
    fn test_parses_estimate() {
        let fetch = shell(r#"echo "{\"estimated_price\": 612000, \"listing_status\": \"for-sale\", \"asking_price\": 629000}""#);
        let raw = fetch.fetch_raw(Source::Zillow, "https://z/1").unwrap();

        assert_eq!(raw.estimated_price, 612_000.0);
        assert_eq!(raw.listing_status, Some(ListingStatus::ForSale));
        assert_eq!(raw.asking_price, Some(629_000.0));
    }

    #[test]
    fn test_passes_source_and_key() {
        let fetch = shell(r#"[ "$1" = redfin ] && [ "$2" = rf-9 ] && echo '{"estimated_price": 1}'"#);
        assert!(fetch.fetch_raw(Source::Redfin, "rf-9").is_ok());
        assert!(fetch.fetch_raw(Source::Zillow, "rf-9").is_err());
    }

    #[test]
    fn test_error_replies() {
        let limited = shell(r#"echo '{"error": {"kind": "rate_limited", "retry_after_secs": 30}}'; exit 1"#);
        assert_eq!(
            limited.fetch_raw(Source::Zillow, "k").unwrap_err(),
            FetchError::RateLimited {
                retry_after_secs: Some(30)
            }
        );

        let gone = shell(r#"echo '{"error": {"kind": "permanent", "message": "delisted"}}'"#);
        assert_eq!(
            gone.fetch_raw(Source::Zillow, "k").unwrap_err(),
            FetchError::Permanent("delisted".to_string())
        );
    }

    #[test]
    fn test_exit_codes() {
        let tempfail = shell("echo 'timed out' >&2; exit 75");
        assert_eq!(
            tempfail.fetch_raw(Source::Redfin, "k").unwrap_err(),
            FetchError::Transient("timed out".to_string())
        );

        let broken = shell("echo '<html>'; exit 0");
        assert!(matches!(broken.fetch_raw(Source::Redfin, "k"), Err(FetchError::Permanent(_))));

        let missing = CommandFetch::new("/nonexistent/fetch-estimate", &[]);
        assert!(matches!(missing.fetch_raw(Source::Redfin, "k"), Err(FetchError::Permanent(_))));
    }
}
