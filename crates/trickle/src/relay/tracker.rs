//! Delta tracking over cumulative snapshots
//!
//! The upstream repeats the whole answer (and the whole reasoning trace) in
//! every event. The tracker remembers the last value seen on each channel and
//! turns each new snapshot into the suffix the client has not seen yet.
//!
//! Text and thought are tracked independently; an event may advance either,
//! both, or neither. Lengths are compared in characters so a suffix is never
//! cut through a multi-byte character.

use serde::Deserialize;

use super::frame::UpstreamEnvelope;

/// What the relay forwards for each advance of a cumulative value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emission {
    /// Only the newly appended suffix
    #[default]
    Delta,
    /// The full cumulative value whenever it grows
    Snapshot,
}

/// Handling of a snapshot that is not longer than the last one seen
///
/// An identical snapshot is always a no-op. The policy only applies to
/// truncations, restarts and same-length rewrites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyPolicy {
    /// Emit nothing and keep the stored value
    #[default]
    Ignore,
    /// Emit the new value in full and make it the stored value
    Replace,
}

/// Per-relay cumulative state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerState {
    pub last_text: String,
    pub last_thought: String,
    pub session_sent: bool,
}

/// Emissions produced by one envelope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedUpdate {
    pub thought: Option<String>,
    pub text: Option<String>,
}

impl TrackedUpdate {
    pub fn is_empty(&self) -> bool {
        self.thought.is_none() && self.text.is_none()
    }
}

/// Computes per-channel deltas for one relay operation
#[derive(Debug)]
pub struct DeltaTracker {
    emission: Emission,
    policy: AnomalyPolicy,
    state: TrackerState,
}

impl DeltaTracker {
    pub fn new(emission: Emission, policy: AnomalyPolicy) -> Self {
        Self {
            emission,
            policy,
            state: TrackerState::default(),
        }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    /// Feed one envelope; channels the envelope does not carry are left untouched
    pub fn observe(&mut self, envelope: &UpstreamEnvelope) -> TrackedUpdate {
        let thought = envelope.thought().and_then(|current| {
            advance(
                &mut self.state.last_thought,
                current,
                self.emission,
                self.policy,
                "thought",
            )
        });
        let text = envelope.text().and_then(|current| {
            advance(
                &mut self.state.last_text,
                current,
                self.emission,
                self.policy,
                "text",
            )
        });

        TrackedUpdate { thought, text }
    }

    /// Returns true exactly once: the first time a session id is claimed
    pub fn claim_session(&mut self) -> bool {
        !std::mem::replace(&mut self.state.session_sent, true)
    }
}

fn advance(
    last: &mut String,
    current: &str,
    emission: Emission,
    policy: AnomalyPolicy,
    channel: &'static str,
) -> Option<String> {
    if current == last.as_str() {
        return None;
    }

    // Well-behaved upstream: the new snapshot extends the previous one
    if current.len() > last.len() && current.starts_with(last.as_str()) {
        let delta = current[last.len()..].to_string();
        *last = current.to_string();
        return Some(match emission {
            Emission::Delta => delta,
            Emission::Snapshot => current.to_string(),
        });
    }

    let previous_chars = last.chars().count();
    let current_chars = current.chars().count();

    if current_chars > previous_chars {
        tracing::warn!(
            channel,
            previous_chars,
            current_chars,
            "Cumulative snapshot diverged from previous value, emitting suffix by length"
        );
        let delta: String = current.chars().skip(previous_chars).collect();
        *last = current.to_string();
        return Some(match emission {
            Emission::Delta => delta,
            Emission::Snapshot => current.to_string(),
        });
    }

    match policy {
        AnomalyPolicy::Ignore => {
            tracing::warn!(
                channel,
                previous_chars,
                current_chars,
                "Cumulative snapshot did not grow, ignoring"
            );
            None
        }
        AnomalyPolicy::Replace => {
            tracing::warn!(
                channel,
                previous_chars,
                current_chars,
                "Cumulative snapshot did not grow, replacing"
            );
            *last = current.to_string();
            (!current.is_empty()).then(|| current.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::frame::{EnvelopeOutput, ThoughtEntry};

    fn envelope(text: Option<&str>, thought: Option<&str>) -> UpstreamEnvelope {
        UpstreamEnvelope {
            request_id: None,
            output: Some(EnvelopeOutput {
                session_id: None,
                text: text.map(str::to_string),
                thoughts: thought.map(|t| {
                    vec![ThoughtEntry {
                        thought: Some(t.to_string()),
                    }]
                }),
                finish_reason: None,
            }),
        }
    }

    fn delta_tracker(policy: AnomalyPolicy) -> DeltaTracker {
        DeltaTracker::new(Emission::Delta, policy)
    }

    #[test]
    fn test_hello_world_deltas() {
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);

        let first = tracker.observe(&envelope(Some("Hello"), None));
        assert_eq!(first.text.as_deref(), Some("Hello"));

        let second = tracker.observe(&envelope(Some("Hello world"), None));
        assert_eq!(second.text.as_deref(), Some(" world"));
        assert_eq!(tracker.state().last_text, "Hello world");
    }

    #[test]
    fn test_concatenated_deltas_reproduce_final_text() {
        let snapshots = ["", "L", "Lo", "Lorem", "Lorem ip", "Lorem ipsum", "Lorem ipsum dolor"];
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);

        let mut assembled = String::new();
        for snapshot in snapshots {
            if let Some(delta) = tracker.observe(&envelope(Some(snapshot), None)).text {
                assembled.push_str(&delta);
            }
        }

        assert_eq!(assembled, "Lorem ipsum dolor");
    }

    #[test]
    fn test_multibyte_deltas() {
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);
        assert_eq!(
            tracker.observe(&envelope(Some("你"), None)).text.as_deref(),
            Some("你")
        );
        assert_eq!(
            tracker.observe(&envelope(Some("你好🙂"), None)).text.as_deref(),
            Some("好🙂")
        );
    }

    #[test]
    fn test_thought_only_envelope() {
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);
        let update = tracker.observe(&envelope(Some(""), Some("Let me think")));

        assert_eq!(update.thought.as_deref(), Some("Let me think"));
        assert_eq!(update.text, None);
    }

    #[test]
    fn test_channels_tracked_independently() {
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);

        tracker.observe(&envelope(None, Some("Step 1")));
        let update = tracker.observe(&envelope(Some("Answer"), None));
        assert_eq!(update.thought, None);
        assert_eq!(update.text.as_deref(), Some("Answer"));
        assert_eq!(tracker.state().last_thought, "Step 1");

        let update = tracker.observe(&envelope(Some("Answer!"), Some("Step 1, step 2")));
        assert_eq!(update.thought.as_deref(), Some(", step 2"));
        assert_eq!(update.text.as_deref(), Some("!"));
    }

    #[test]
    fn test_duplicate_is_noop() {
        for policy in [AnomalyPolicy::Ignore, AnomalyPolicy::Replace] {
            let mut tracker = delta_tracker(policy);
            tracker.observe(&envelope(Some("same"), None));
            assert!(tracker.observe(&envelope(Some("same"), None)).is_empty());
        }
    }

    #[test]
    fn test_shrink_ignored() {
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);
        tracker.observe(&envelope(Some("Hello world"), None));

        assert!(tracker.observe(&envelope(Some("Hello"), None)).is_empty());
        assert_eq!(tracker.state().last_text, "Hello world");

        // Growth resumes relative to the retained value
        let update = tracker.observe(&envelope(Some("Hello world!"), None));
        assert_eq!(update.text.as_deref(), Some("!"));
    }

    #[test]
    fn test_shrink_replaced() {
        let mut tracker = delta_tracker(AnomalyPolicy::Replace);
        tracker.observe(&envelope(Some("Hello world"), None));

        let update = tracker.observe(&envelope(Some("Restart"), None));
        assert_eq!(update.text.as_deref(), Some("Restart"));
        assert_eq!(tracker.state().last_text, "Restart");

        let update = tracker.observe(&envelope(Some("Restarted"), None));
        assert_eq!(update.text.as_deref(), Some("ed"));
    }

    #[test]
    fn test_replace_with_empty_resets_silently() {
        let mut tracker = delta_tracker(AnomalyPolicy::Replace);
        tracker.observe(&envelope(Some("abc"), None));

        assert!(tracker.observe(&envelope(Some(""), None)).is_empty());
        assert_eq!(tracker.state().last_text, "");
    }

    #[test]
    fn test_diverged_growth_emits_suffix_by_length() {
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);
        tracker.observe(&envelope(Some("héllo"), None));

        let update = tracker.observe(&envelope(Some("hallo there"), None));
        assert_eq!(update.text.as_deref(), Some(" there"));
        assert_eq!(tracker.state().last_text, "hallo there");
    }

    #[test]
    fn test_snapshot_emission() {
        let mut tracker = DeltaTracker::new(Emission::Snapshot, AnomalyPolicy::Ignore);

        let update = tracker.observe(&envelope(Some("Hello"), Some("Hmm")));
        assert_eq!(update.text.as_deref(), Some("Hello"));
        assert_eq!(update.thought.as_deref(), Some("Hmm"));

        let update = tracker.observe(&envelope(Some("Hello world"), Some("Hmm")));
        assert_eq!(update.text.as_deref(), Some("Hello world"));
        assert_eq!(update.thought, None);
    }

    #[test]
    fn test_claim_session_once() {
        let mut tracker = delta_tracker(AnomalyPolicy::Ignore);
        assert!(tracker.claim_session());
        assert!(!tracker.claim_session());
        assert!(tracker.state().session_sent);
    }
}
