//! Subscriber registry, channel cycle and frame routing for one shared
//! connection. Pure state: time is passed in, nothing here does I/O.

use tokio::time::Instant;

use crate::config::MuxSettings;
use crate::consistency::ConsistencyFilter;
use crate::cycle::ChannelCycle;
use crate::frame::{Frame, SharedSink, channel_key, normalize_label};

/// One registered consumer of the shared connection.
struct Subscriber {
    id: String,
    requested_channel: String,
    /// Case-folded `task/`-stripped channel, fallback match key
    normalized_key: Option<String>,
    /// Case-folded label the upstream should report for this channel
    expected_label: Option<String>,
    sink: SharedSink,
    filter: ConsistencyFilter,
}

impl Subscriber {
    fn matches(&self, label: &str) -> bool {
        self.expected_label.as_deref() == Some(label) || self.normalized_key.as_deref() == Some(label)
    }
}

/// The last channel selection sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    pub at: Instant,
    pub channel: String,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to this many subscribers
    Delivered(usize),
    /// Arrived inside the settling window after a switch
    Settling,
    /// Labeled, but no subscriber had a long enough run (or none matched)
    Unmatched,
    /// Unlabeled with more than one possible recipient
    Ambiguous,
}

/// Result of routing: the sinks to call and why.
pub struct Routed {
    pub outcome: RouteOutcome,
    pub sinks: Vec<SharedSink>,
}

impl Routed {
    fn dropped(outcome: RouteOutcome) -> Self {
        Self {
            outcome,
            sinks: Vec::new(),
        }
    }
}

/// Routing state owned by one multiplexer.
pub struct MuxState {
    settings: MuxSettings,
    subscribers: Vec<Subscriber>,
    cycle: ChannelCycle,
    last_switch: Option<SwitchEvent>,
}

impl MuxState {
    pub fn new(settings: MuxSettings) -> Self {
        Self {
            settings,
            subscribers: Vec::new(),
            cycle: ChannelCycle::new(),
            last_switch: None,
        }
    }

    pub fn settings(&self) -> &MuxSettings {
        &self.settings
    }

    /// Register a subscriber, replacing any previous one with the same id.
    /// Returns true if the channel cycle changed.
    pub fn insert(
        &mut self,
        id: String,
        channel: String,
        sink: SharedSink,
        expected_label: Option<String>,
    ) -> bool {
        self.subscribers.retain(|s| s.id != id);

        let key = channel_key(&channel);
        let normalized_key = normalize_label(&key);
        let expected_label = expected_label
            .as_deref()
            .and_then(normalize_label)
            .or_else(|| normalized_key.clone());

        self.subscribers.push(Subscriber {
            id,
            requested_channel: channel,
            normalized_key,
            expected_label,
            sink,
            filter: ConsistencyFilter::new(self.settings.required_consecutive_frames),
        });
        self.rebuild_cycle()
    }

    /// Remove a subscriber. Returns true if it was registered.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        let removed = self.subscribers.len() != before;
        if removed {
            self.rebuild_cycle();
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn cycle(&self) -> &ChannelCycle {
        &self.cycle
    }

    pub fn last_switch(&self) -> Option<&SwitchEvent> {
        self.last_switch.as_ref()
    }

    /// Consecutive matches currently held by a subscriber.
    pub fn matches_for(&self, id: &str) -> Option<u32> {
        self.subscribers
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.filter.matches())
    }

    fn rebuild_cycle(&mut self) -> bool {
        self.cycle
            .rebuild(self.subscribers.iter().map(|s| s.requested_channel.as_str()))
    }

    /// After a membership change on a live connection: move off the current
    /// channel only if nobody wants it any more. Returns the channel to send.
    pub fn reselect_if_needed(&mut self, now: Instant) -> Option<String> {
        if self.cycle.is_empty() || self.cycle.current_is_member() {
            return None;
        }
        let channel = self.cycle.restart()?.to_string();
        Some(self.record_switch(channel, now))
    }

    /// A fresh connection has no selection yet: (re)select the current
    /// channel, or the first one.
    pub fn select_for_connection(&mut self, now: Instant) -> Option<String> {
        let channel = self.cycle.resume()?.to_string();
        Some(self.record_switch(channel, now))
    }

    /// Cycle tick. Single-member cycles never re-select.
    pub fn rotate(&mut self, now: Instant) -> Option<String> {
        if !self.cycle.rotates() {
            return None;
        }
        let channel = self.cycle.advance()?.to_string();
        Some(self.record_switch(channel, now))
    }

    /// Forget the selection (connection closed with nobody left).
    pub fn reset_selection(&mut self) {
        self.last_switch = None;
        if self.subscribers.is_empty() {
            self.cycle.clear();
        }
    }

    fn record_switch(&mut self, channel: String, now: Instant) -> String {
        // Any subscriber may now see the new channel under an old label
        for sub in &mut self.subscribers {
            sub.filter.reset();
        }
        self.last_switch = Some(SwitchEvent {
            at: now,
            channel: channel.clone(),
        });
        channel
    }

    fn settling(&self, now: Instant) -> bool {
        self.last_switch
            .as_ref()
            .is_some_and(|sw| now < sw.at + self.settings.settling_period)
    }

    /// Decide which subscribers receive `frame`.
    pub fn route(&mut self, frame: &Frame, now: Instant) -> Routed {
        if self.settling(now) {
            return Routed::dropped(RouteOutcome::Settling);
        }

        let Some(label) = frame.label.as_deref() else {
            // Unlabeled frames are only attributable with a single subscriber
            // on a single channel.
            if self.subscribers.len() == 1 && self.cycle.len() == 1 {
                let sinks = vec![self.subscribers[0].sink.clone()];
                return Routed {
                    outcome: RouteOutcome::Delivered(1),
                    sinks,
                };
            }
            return Routed::dropped(RouteOutcome::Ambiguous);
        };

        let mut sinks = Vec::new();
        for sub in &mut self.subscribers {
            if sub.matches(label) {
                if sub.filter.observe_match() {
                    sinks.push(sub.sink.clone());
                }
            } else {
                sub.filter.observe_mismatch();
            }
        }

        if sinks.is_empty() {
            Routed::dropped(RouteOutcome::Unmatched)
        } else {
            Routed {
                outcome: RouteOutcome::Delivered(sinks.len()),
                sinks,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::counting_sink;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn labeled(label: &str) -> Frame {
        Frame::labeled(Bytes::from_static(b"jpeg"), normalize_label(label))
    }

    fn unlabeled() -> Frame {
        Frame::binary(Bytes::from_static(b"jpeg"))
    }

    fn deliver(state: &mut MuxState, frame: &Frame, now: Instant) -> RouteOutcome {
        let routed = state.route(frame, now);
        for sink in &routed.sinks {
            sink.deliver(frame);
        }
        routed.outcome
    }

    #[test]
    fn three_subscribers_two_channels_scenario() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink1, count1) = counting_sink();
        let (sink2, count2) = counting_sink();
        let (sink3, count3) = counting_sink();
        state.insert("s1".into(), "A".into(), sink1, None);
        state.insert("s2".into(), "B".into(), sink2, None);
        state.insert("s3".into(), "A".into(), sink3, None);
        assert_eq!(state.cycle().members(), ["A", "B"]);

        assert_eq!(state.select_for_connection(t0).as_deref(), Some("A"));

        let frame = labeled("A");
        assert_eq!(deliver(&mut state, &frame, t0 + ms(50)), RouteOutcome::Settling);
        assert_eq!(deliver(&mut state, &frame, t0 + ms(300)), RouteOutcome::Unmatched);
        assert_eq!(state.matches_for("s1"), Some(1));
        assert_eq!(state.matches_for("s2"), Some(0));
        assert_eq!(deliver(&mut state, &frame, t0 + ms(350)), RouteOutcome::Delivered(2));
        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 0);
        assert_eq!(count3.load(Ordering::SeqCst), 1);

        assert_eq!(state.rotate(t0 + ms(800)).as_deref(), Some("B"));
        assert_eq!(state.matches_for("s1"), Some(0));
        assert_eq!(state.matches_for("s3"), Some(0));
        assert_eq!(state.rotate(t0 + ms(1600)).as_deref(), Some("A"));
    }

    #[test]
    fn mismatch_resets_run() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink, count) = counting_sink();
        state.insert("s1".into(), "A".into(), sink, None);
        state.select_for_connection(t0);

        let later = t0 + ms(500);
        deliver(&mut state, &labeled("A"), later);
        deliver(&mut state, &labeled("B"), later);
        deliver(&mut state, &labeled("A"), later);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        deliver(&mut state, &labeled("A"), later);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_prefix_and_case_fold_match() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink, count) = counting_sink();
        state.insert("s1".into(), "task/Cam-7".into(), sink, None);
        state.select_for_connection(t0);

        for _ in 0..2 {
            deliver(&mut state, &labeled(" CAM-7 "), t0 + ms(400));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expected_label_or_key_matches() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink, count) = counting_sink();
        state.insert("s1".into(), "group/3".into(), sink, Some("Loading Bay".into()));
        state.select_for_connection(t0);

        let now = t0 + ms(400);
        deliver(&mut state, &labeled("loading bay"), now);
        deliver(&mut state, &labeled("group/3"), now);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unlabeled_needs_single_subscriber_and_channel() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink1, count1) = counting_sink();
        state.insert("s1".into(), "A".into(), sink1, None);
        state.select_for_connection(t0);
        let now = t0 + ms(300);

        assert_eq!(deliver(&mut state, &unlabeled(), now), RouteOutcome::Delivered(1));
        assert_eq!(count1.load(Ordering::SeqCst), 1);

        // Two subscribers on one channel: still ambiguous
        let (sink2, _) = counting_sink();
        state.insert("s2".into(), "A".into(), sink2, None);
        assert_eq!(deliver(&mut state, &unlabeled(), now), RouteOutcome::Ambiguous);

        state.remove("s2");
        let (sink3, _) = counting_sink();
        state.insert("s3".into(), "B".into(), sink3, None);
        assert_eq!(deliver(&mut state, &unlabeled(), now), RouteOutcome::Ambiguous);
        assert_eq!(count1.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unlabeled_frames_also_settle() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink, count) = counting_sink();
        state.insert("s1".into(), "A".into(), sink, None);
        state.select_for_connection(t0);
        assert_eq!(deliver(&mut state, &unlabeled(), t0 + ms(199)), RouteOutcome::Settling);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn single_member_cycle_never_rotates() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink1, _) = counting_sink();
        let (sink2, _) = counting_sink();
        state.insert("s1".into(), "A".into(), sink1, None);
        assert_eq!(state.select_for_connection(t0).as_deref(), Some("A"));

        // A second subscriber on the same channel does not re-select
        assert!(!state.insert("s2".into(), "A".into(), sink2, None));
        assert_eq!(state.reselect_if_needed(t0 + ms(10)), None);
        assert_eq!(state.rotate(t0 + ms(800)), None);
        assert_eq!(state.last_switch().map(|s| s.at), Some(t0));
    }

    #[test]
    fn removing_active_channel_reselects() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink1, _) = counting_sink();
        let (sink2, _) = counting_sink();
        state.insert("s1".into(), "A".into(), sink1, None);
        state.insert("s2".into(), "B".into(), sink2, None);
        state.select_for_connection(t0);
        assert_eq!(state.rotate(t0 + ms(800)).as_deref(), Some("B"));

        assert!(state.remove("s2"));
        assert_eq!(state.reselect_if_needed(t0 + ms(900)).as_deref(), Some("A"));
        assert!(!state.remove("s2"));
    }

    #[test]
    fn reinsert_replaces_subscriber() {
        let mut state = MuxState::new(MuxSettings::default());
        let (sink1, _) = counting_sink();
        let (sink2, _) = counting_sink();
        state.insert("s1".into(), "A".into(), sink1, None);
        assert!(state.insert("s1".into(), "B".into(), sink2, None));
        assert_eq!(state.subscriber_count(), 1);
        assert_eq!(state.cycle().members(), ["B"]);
    }

    #[test]
    fn reset_selection_clears_empty_cycle() {
        let t0 = Instant::now();
        let mut state = MuxState::new(MuxSettings::default());
        let (sink, _) = counting_sink();
        state.insert("s1".into(), "A".into(), sink, None);
        state.select_for_connection(t0);
        state.remove("s1");
        state.reset_selection();
        assert!(state.last_switch().is_none());
        assert!(state.cycle().current().is_none());
    }
}
