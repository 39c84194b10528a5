//! Trace identity for a job.
//!
//! Each job gets a trace and span id. Commands the job runs receive them as a
//! W3C `TRACEPARENT` variable so their own spans join the job's trace, and the
//! farmer receives a URL to the trace with every terminal status.

use rand::Rng;

/// Placeholders substituted in a trace URL template.
const TRACE_ID_VAR: &str = "{trace_id}";
const SPAN_ID_VAR: &str = "{span_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSpan {
    pub trace_id: u64,
    pub span_id: u64,
}

impl TraceSpan {
    /// A new root span with random, non-zero ids.
    pub fn start() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            trace_id: rng.gen_range(1..=u64::MAX),
            span_id: rng.gen_range(1..=u64::MAX),
        }
    }

    /// Environment entries that let a child process continue this trace.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![(
            "TRACEPARENT".to_string(),
            format!("00-{:032x}-{:016x}-01", self.trace_id, self.span_id),
        )]
    }

    /// Render a correlation URL from `template`.
    pub fn url(&self, template: &str) -> String {
        template
            .replace(TRACE_ID_VAR, &self.trace_id.to_string())
            .replace(SPAN_ID_VAR, &self.span_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traceparent_is_w3c_shaped() {
        let span = TraceSpan {
            trace_id: 0xabc,
            span_id: 0x12,
        };
        let env = span.env();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].0, "TRACEPARENT");
        assert_eq!(
            env[0].1,
            "00-00000000000000000000000000000abc-0000000000000012-01"
        );
    }

    #[test]
    fn url_substitutes_ids() {
        let span = TraceSpan {
            trace_id: 7,
            span_id: 9,
        };
        assert_eq!(
            span.url("https://app.datadoghq.com/apm/trace/{trace_id}?spanID={span_id}"),
            "https://app.datadoghq.com/apm/trace/7?spanID=9"
        );
    }

    #[test]
    fn started_spans_are_nonzero() {
        let span = TraceSpan::start();
        assert_ne!(span.trace_id, 0);
        assert_ne!(span.span_id, 0);
    }
}
