//! Byte-budget fitting for tool results.
//!
//! A result is serialized and, while it exceeds the budget, shrunk in
//! phases: embedded text is cut to progressively shorter caps, then the
//! number of entries is halved, and finally an optional metadata-only
//! fallback is returned. Every shape plugs in through [`Shrinkable`].

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::model::{FieldMap, MESSAGE_FIELD};

/// Length caps for the content phase, longest first.
pub const CONTENT_CAPS: [usize; 4] = [500, 200, 100, 50];

/// Upper bound on count-reduction rounds.
pub const MAX_REDUCTIONS: usize = 20;

pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// A result shape that knows how to shrink itself.
pub trait Shrinkable: Serialize {
    /// Cuts embedded text fields to at most `max_len` bytes.
    fn truncate_content(&mut self, max_len: usize);

    /// Roughly halves the number of entries. Returns `false` once nothing
    /// more can be removed.
    fn reduce_count(&mut self) -> bool;

    /// Records `response_truncated: true` on the result.
    fn mark_truncated(&mut self);

    /// Minimal metadata-only replacement, if the shape has one.
    fn fallback(&self) -> Option<Value> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPhase {
    /// Budget disabled.
    Skipped,
    /// Fit without changes.
    Unchanged,
    /// Fit after cutting text to this cap.
    Content(usize),
    /// Fit after this many count reductions.
    Count(usize),
    Fallback,
    /// Nothing fit; the smallest full result is returned.
    BestEffort,
}

#[derive(Debug, Clone)]
pub struct Fitted {
    pub body: String,
    pub truncated: bool,
    pub phase: FitPhase,
}

/// Serializes `result`, shrinking it until it fits within `budget` bytes.
///
/// A budget of `0` disables fitting. Terminates after at most
/// `CONTENT_CAPS.len() + MAX_REDUCTIONS + 1` shrink steps. Without a
/// fallback the returned body may still exceed the budget.
pub fn fit_result<T: Shrinkable>(result: &mut T, budget: usize) -> Result<Fitted> {
    let body = serde_json::to_string(result)?;
    if budget == 0 {
        return Ok(Fitted {
            body,
            truncated: false,
            phase: FitPhase::Skipped,
        });
    }
    if body.len() <= budget {
        return Ok(Fitted {
            body,
            truncated: false,
            phase: FitPhase::Unchanged,
        });
    }
    debug!(size = body.len(), budget, "result exceeds budget, fitting");

    for cap in CONTENT_CAPS {
        result.truncate_content(cap);
        result.mark_truncated();
        let body = serde_json::to_string(result)?;
        if body.len() <= budget {
            debug!(cap, size = body.len(), "fit after content truncation");
            return Ok(Fitted {
                body,
                truncated: true,
                phase: FitPhase::Content(cap),
            });
        }
    }

    for round in 1..=MAX_REDUCTIONS {
        if !result.reduce_count() {
            break;
        }
        result.mark_truncated();
        let body = serde_json::to_string(result)?;
        if body.len() <= budget {
            debug!(round, size = body.len(), "fit after count reduction");
            return Ok(Fitted {
                body,
                truncated: true,
                phase: FitPhase::Count(round),
            });
        }
    }

    if let Some(mut minimal) = result.fallback() {
        if let Value::Object(map) = &mut minimal {
            map.insert("response_truncated".into(), Value::Bool(true));
        }
        debug!("falling back to metadata-only result");
        return Ok(Fitted {
            body: serde_json::to_string(&minimal)?,
            truncated: true,
            phase: FitPhase::Fallback,
        });
    }

    result.mark_truncated();
    let body = serde_json::to_string(result)?;
    debug!(size = body.len(), budget, "result still over budget");
    Ok(Fitted {
        body,
        truncated: true,
        phase: FitPhase::BestEffort,
    })
}

/// Longest prefix of `s` that is at most `max_bytes` long and ends on a
/// char boundary.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Cuts `s` to `max_bytes` and appends [`TRUNCATION_MARKER`]. The result may
/// exceed `max_bytes` by the marker length. Returns whether `s` changed.
pub fn truncate_in_place(s: &mut String, max_bytes: usize) -> bool {
    if s.len() <= max_bytes {
        return false;
    }
    let end = truncate_str(s, max_bytes).len();
    s.truncate(end);
    s.push_str(TRUNCATION_MARKER);
    true
}

/// Truncates the `message` field of a projected field map, if it is a string.
pub fn truncate_body(map: &mut FieldMap, max_bytes: usize) {
    if let Some(Value::String(body)) = map.get_mut(MESSAGE_FIELD) {
        truncate_in_place(body, max_bytes);
    }
}

/// New length after halving `len`, or `None` when `len` is already at the
/// floor of one entry.
pub fn halved(len: usize) -> Option<usize> {
    if len <= 1 {
        None
    } else {
        Some((len / 2).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Sample {
        items: Vec<String>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        response_truncated: bool,
        #[serde(skip)]
        reduce_calls: usize,
        #[serde(skip)]
        with_fallback: bool,
    }

    impl Sample {
        fn new(n: usize, len: usize) -> Self {
            Self {
                items: (0..n).map(|_| "x".repeat(len)).collect(),
                response_truncated: false,
                reduce_calls: 0,
                with_fallback: false,
            }
        }
    }

    impl Shrinkable for Sample {
        fn truncate_content(&mut self, max_len: usize) {
            for item in &mut self.items {
                truncate_in_place(item, max_len);
            }
        }

        fn reduce_count(&mut self) -> bool {
            self.reduce_calls += 1;
            match halved(self.items.len()) {
                Some(n) => {
                    self.items.truncate(n);
                    true
                }
                None => false,
            }
        }

        fn mark_truncated(&mut self) {
            self.response_truncated = true;
        }

        fn fallback(&self) -> Option<Value> {
            self.with_fallback
                .then(|| json!({"total": self.items.len(), "error": "too large"}))
        }
    }

    /// Never shrinks and always claims progress.
    #[derive(Serialize)]
    struct Stubborn {
        blob: String,
        #[serde(skip)]
        reduce_calls: usize,
    }

    impl Shrinkable for Stubborn {
        fn truncate_content(&mut self, _max_len: usize) {}
        fn reduce_count(&mut self) -> bool {
            self.reduce_calls += 1;
            true
        }
        fn mark_truncated(&mut self) {}
    }

    #[test]
    fn zero_budget_passes_through() {
        let mut s = Sample::new(10, 1000);
        let before = serde_json::to_string(&s).unwrap();
        let fitted = fit_result(&mut s, 0).unwrap();
        assert_eq!(fitted.body, before);
        assert!(!fitted.truncated);
        assert_eq!(fitted.phase, FitPhase::Skipped);
        assert_eq!(s.items[0].len(), 1000);
    }

    #[test]
    fn small_result_is_unchanged() {
        let mut s = Sample::new(2, 10);
        let fitted = fit_result(&mut s, 10_000).unwrap();
        assert!(!fitted.truncated);
        assert_eq!(fitted.phase, FitPhase::Unchanged);
        assert!(!fitted.body.contains("response_truncated"));
    }

    #[test]
    fn content_phase_stops_at_first_fitting_cap() {
        let mut s = Sample::new(4, 2000);
        let fitted = fit_result(&mut s, 2_500).unwrap();
        assert_eq!(fitted.phase, FitPhase::Content(500));
        assert!(fitted.truncated);
        assert!(fitted.body.len() <= 2_500);
        assert!(fitted.body.contains("\"response_truncated\":true"));
        assert_eq!(s.items.len(), 4);
    }

    #[test]
    fn count_phase_halves_entries() {
        let mut s = Sample::new(64, 100);
        let fitted = fit_result(&mut s, 1_000).unwrap();
        assert!(matches!(fitted.phase, FitPhase::Count(_)));
        assert!(fitted.body.len() <= 1_000);
        assert!(s.items.len() < 64);
    }

    #[test]
    fn fallback_is_used_when_reduction_is_exhausted() {
        let mut s = Sample::new(1, 10);
        s.items[0] = "y".repeat(10);
        s.with_fallback = true;
        let fitted = fit_result(&mut s, 5).unwrap();
        assert_eq!(fitted.phase, FitPhase::Fallback);
        let v: Value = serde_json::from_str(&fitted.body).unwrap();
        assert_eq!(v["response_truncated"], json!(true));
        assert_eq!(v["error"], "too large");
        // reduce_count reported exhaustion on the first call
        assert_eq!(s.reduce_calls, 1);
    }

    #[test]
    fn best_effort_without_fallback() {
        let mut s = Sample::new(1, 10);
        let fitted = fit_result(&mut s, 5).unwrap();
        assert_eq!(fitted.phase, FitPhase::BestEffort);
        assert!(fitted.truncated);
        assert!(fitted.body.len() > 5);
        assert!(fitted.body.contains("\"response_truncated\":true"));
    }

    #[test]
    fn reduction_rounds_are_bounded() {
        let mut s = Stubborn {
            blob: "z".repeat(1000),
            reduce_calls: 0,
        };
        let fitted = fit_result(&mut s, 10).unwrap();
        assert_eq!(s.reduce_calls, MAX_REDUCTIONS);
        assert_eq!(fitted.phase, FitPhase::BestEffort);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut s = "héllo wörld".to_string();
        assert!(truncate_in_place(&mut s, 2));
        assert_eq!(s, format!("h{TRUNCATION_MARKER}"));

        let mut short = "abc".to_string();
        assert!(!truncate_in_place(&mut short, 10));
        assert_eq!(short, "abc");
        assert_eq!(truncate_str("日本語", 4), "日");
    }

    #[test]
    fn halving_floors_at_one() {
        assert_eq!(halved(0), None);
        assert_eq!(halved(1), None);
        assert_eq!(halved(2), Some(1));
        assert_eq!(halved(3), Some(1));
        assert_eq!(halved(9), Some(4));
    }
}
