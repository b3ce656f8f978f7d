//! Scheduler guards: per-run fairness policy over popped candidates.
//!
//! [`RunState`] holds everything a run has accepted so far and is passed
//! explicitly into every evaluation, so independent runs (and tests) never
//! share counters. [`SchedulerGuards`] is stateless apart from its config.
//!
//! Policies, first match wins:
//! 1. run cap
//! 2. host cap
//! 3. source-share guard (sliding window + cooldown)
//! 4. contested-content guard (sliding window)
//! 5. host-diversity guard

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use patchscout_shared::{Candidate, GuardConfig, host_matches};

/// Why a candidate was sent back to the frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardReason {
    RunCap,
    HostCap,
    SourceShare,
    Contested,
    Diversity,
}

impl GuardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCap => "run_cap",
            Self::HostCap => "host_cap",
            Self::SourceShare => "source_share_guard",
            Self::Contested => "contested_guard",
            Self::Diversity => "diversity_guard",
        }
    }
}

impl fmt::Display for GuardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Accept,
    Requeue(GuardReason),
}

impl GuardDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    is_source: bool,
    is_contested: bool,
}

/// Per-run counters. Created at run start, dropped at run end.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    total_accepted: usize,
    host_counts: HashMap<String, usize>,
    window: VecDeque<WindowEntry>,
    source_cooldown_until: Option<Instant>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_accepted(&self) -> usize {
        self.total_accepted
    }

    pub fn host_count(&self, host: &str) -> usize {
        self.host_counts.get(host).copied().unwrap_or(0)
    }

    pub fn distinct_hosts(&self) -> usize {
        self.host_counts.len()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Share of the window held by the source-share domain family.
    pub fn source_share(&self) -> f64 {
        ratio(self.window.iter().filter(|e| e.is_source).count(), self.window.len())
    }

    /// Share of the window held by contested candidates.
    pub fn contested_ratio(&self) -> f64 {
        ratio(self.window.iter().filter(|e| e.is_contested).count(), self.window.len())
    }

    pub fn source_cooldown_active(&self, now: Instant) -> bool {
        self.source_cooldown_until.is_some_and(|until| now < until)
    }

    /// Source share of the window if one more source entry were accepted.
    fn prospective_source_share(&self, window_size: usize) -> f64 {
        let mut sources = self.window.iter().filter(|e| e.is_source).count() + 1;
        let mut len = self.window.len() + 1;
        if len > window_size {
            if self.window.front().is_some_and(|e| e.is_source) {
                sources -= 1;
            }
            len -= 1;
        }
        ratio(sources, len)
    }

    fn record(&mut self, host: &str, entry: WindowEntry, window_size: usize) {
        self.total_accepted += 1;
        *self.host_counts.entry(host.to_string()).or_insert(0) += 1;
        self.window.push_back(entry);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Fairness policy bound to one configuration.
#[derive(Debug, Clone)]
pub struct SchedulerGuards {
    config: GuardConfig,
    cooldown: Duration,
}

impl SchedulerGuards {
    pub fn new(config: GuardConfig) -> Self {
        let cooldown = config.source_share_cooldown();
        Self { config, cooldown }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Whether `host` belongs to the source-share domain family.
    pub fn is_source_host(&self, host: &str) -> bool {
        self.config
            .source_share_domains
            .iter()
            .any(|d| host_matches(host, d))
    }

    pub fn evaluate(
        &self,
        state: &mut RunState,
        candidate: &Candidate,
        host: &str,
        is_contested: bool,
    ) -> GuardDecision {
        self.evaluate_at(state, candidate, host, is_contested, Instant::now())
    }

    /// [`evaluate`](Self::evaluate) with an explicit clock, for cooldown tests.
    pub fn evaluate_at(
        &self,
        state: &mut RunState,
        _candidate: &Candidate,
        host: &str,
        is_contested: bool,
        now: Instant,
    ) -> GuardDecision {
        let cfg = &self.config;

        if state.total_accepted >= cfg.run_cap {
            return GuardDecision::Requeue(GuardReason::RunCap);
        }

        if state.host_count(host) >= cfg.host_cap {
            return GuardDecision::Requeue(GuardReason::HostCap);
        }

        let is_source = self.is_source_host(host);
        let window_ready = state.window.len() >= cfg.min_window_samples;

        if is_source {
            if state.source_cooldown_active(now) {
                return GuardDecision::Requeue(GuardReason::SourceShare);
            }
            if window_ready
                && (state.source_share() >= cfg.source_share_threshold
                    || state.prospective_source_share(cfg.window_size) > cfg.source_share_threshold)
            {
                state.source_cooldown_until = Some(now + self.cooldown);
                return GuardDecision::Requeue(GuardReason::SourceShare);
            }
        }

        if is_contested && window_ready && state.contested_ratio() >= cfg.contested_threshold {
            return GuardDecision::Requeue(GuardReason::Contested);
        }

        if state.distinct_hosts() < cfg.min_distinct_hosts && state.host_counts.contains_key(host) {
            return GuardDecision::Requeue(GuardReason::Diversity);
        }

        state.record(
            host,
            WindowEntry {
                is_source,
                is_contested,
            },
            cfg.window_size,
        );
        GuardDecision::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> Candidate {
        Candidate::new("https://example.com/x", "citation")
    }

    fn guards(config: GuardConfig) -> SchedulerGuards {
        SchedulerGuards::new(config)
    }

    /// Config with every guard but the one under test effectively disabled.
    fn relaxed() -> GuardConfig {
        GuardConfig {
            run_cap: 1_000,
            host_cap: 1_000,
            source_share_domains: vec!["wikipedia.org".into()],
            source_share_threshold: 1.0,
            source_share_cooldown_secs: 60,
            contested_threshold: 1.0,
            window_size: 10,
            min_window_samples: 1_000,
            min_distinct_hosts: 0,
        }
    }

    #[test]
    fn run_cap_applies_first() {
        let g = guards(GuardConfig {
            run_cap: 2,
            host_cap: 1,
            ..relaxed()
        });
        let mut state = RunState::new();
        assert!(g.evaluate(&mut state, &candidate(), "a.com", false).is_accept());
        assert!(g.evaluate(&mut state, &candidate(), "b.com", false).is_accept());
        // a.com is also at its host cap; run cap wins.
        assert_eq!(
            g.evaluate(&mut state, &candidate(), "a.com", false),
            GuardDecision::Requeue(GuardReason::RunCap)
        );
        assert_eq!(state.total_accepted(), 2);
    }

    #[test]
    fn host_cap_invariant_holds_over_a_long_stream() {
        let g = guards(GuardConfig {
            host_cap: 3,
            ..relaxed()
        });
        let mut state = RunState::new();
        let hosts = ["a.com", "b.com", "c.com", "a.com", "a.com", "a.com", "b.com"];

        for i in 0..200 {
            let host = hosts[i % hosts.len()];
            let decision = g.evaluate(&mut state, &candidate(), host, false);
            if state.host_count(host) > 3 {
                panic!("{host} exceeded host cap after {decision:?}");
            }
        }
        assert_eq!(state.host_count("a.com"), 3);
        assert_eq!(state.host_count("b.com"), 3);
        assert_eq!(
            g.evaluate(&mut state, &candidate(), "c.com", false),
            GuardDecision::Requeue(GuardReason::HostCap)
        );
    }

    #[test]
    fn source_share_never_exceeds_threshold_once_window_is_ready() {
        let g = guards(GuardConfig {
            source_share_threshold: 0.4,
            window_size: 10,
            min_window_samples: 5,
            ..relaxed()
        });
        let mut state = RunState::new();
        let start = Instant::now();

        let host_for = |i: usize| {
            if i % 3 == 2 {
                format!("news{i}.example.com")
            } else {
                "en.wikipedia.org".to_string()
            }
        };

        // Two encyclopedia candidates per news candidate, clock frozen: once
        // the guard trips, no source candidate gets through.
        let mut tripped = false;
        for i in 0..300 {
            let host = host_for(i);
            let decision = g.evaluate_at(&mut state, &candidate(), &host, false, start);
            if decision == GuardDecision::Requeue(GuardReason::SourceShare) {
                tripped = true;
            }
            if tripped {
                assert!(
                    !(decision.is_accept() && g.is_source_host(&host)),
                    "source accepted during cooldown"
                );
            }
        }
        assert!(tripped);

        // With every cooldown expiring, sources are admitted only while the
        // window stays at or under the threshold.
        let mut now = start;
        let mut admitted = 0;
        for i in 0..300 {
            now += Duration::from_secs(61);
            let host = host_for(i);
            let decision = g.evaluate_at(&mut state, &candidate(), &host, false, now);
            if decision.is_accept() && g.is_source_host(&host) {
                admitted += 1;
                assert!(
                    state.source_share() <= 0.4,
                    "share {} after accepting {host}",
                    state.source_share()
                );
            }
        }
        assert!(admitted > 0);
    }

    #[test]
    fn source_share_cooldown_expires() {
        let g = guards(GuardConfig {
            source_share_threshold: 0.4,
            source_share_cooldown_secs: 60,
            window_size: 5,
            min_window_samples: 5,
            ..relaxed()
        });
        let mut state = RunState::new();
        let t0 = Instant::now();

        for host in ["en.wikipedia.org", "de.wikipedia.org", "a.com", "b.com", "c.com"] {
            assert!(g.evaluate_at(&mut state, &candidate(), host, false, t0).is_accept());
        }
        // 2/5 = 0.4 is at the threshold.
        assert_eq!(
            g.evaluate_at(&mut state, &candidate(), "fr.wikipedia.org", false, t0),
            GuardDecision::Requeue(GuardReason::SourceShare)
        );
        assert!(state.source_cooldown_active(t0));

        // Non-source traffic slides the encyclopedia entries out of the window.
        for host in ["d.com", "e.com", "f.com"] {
            assert!(g.evaluate_at(&mut state, &candidate(), host, false, t0).is_accept());
        }
        assert_eq!(state.source_share(), 0.0);

        // Still cooling down.
        let t1 = t0 + Duration::from_secs(30);
        assert_eq!(
            g.evaluate_at(&mut state, &candidate(), "fr.wikipedia.org", false, t1),
            GuardDecision::Requeue(GuardReason::SourceShare)
        );

        let t2 = t0 + Duration::from_secs(61);
        assert!(!state.source_cooldown_active(t2));
        assert!(g.evaluate_at(&mut state, &candidate(), "fr.wikipedia.org", false, t2).is_accept());
    }

    #[test]
    fn contested_guard_only_throttles_contested_candidates() {
        let g = guards(GuardConfig {
            contested_threshold: 0.3,
            window_size: 10,
            min_window_samples: 3,
            ..relaxed()
        });
        let mut state = RunState::new();
        assert!(g.evaluate(&mut state, &candidate(), "a.com", true).is_accept());
        assert!(g.evaluate(&mut state, &candidate(), "b.com", false).is_accept());
        assert!(g.evaluate(&mut state, &candidate(), "c.com", false).is_accept());

        // 1/3 >= 0.3
        assert_eq!(
            g.evaluate(&mut state, &candidate(), "d.com", true),
            GuardDecision::Requeue(GuardReason::Contested)
        );
        assert!(g.evaluate(&mut state, &candidate(), "d.com", false).is_accept());
        assert!(g.evaluate(&mut state, &candidate(), "e.com", false).is_accept());
        assert!(g.evaluate(&mut state, &candidate(), "f.com", false).is_accept());
        // 1/6 < 0.3
        assert!(g.evaluate(&mut state, &candidate(), "g.com", true).is_accept());
    }

    #[test]
    fn diversity_guard_forces_breadth_before_repeats() {
        let g = guards(GuardConfig {
            min_distinct_hosts: 3,
            ..relaxed()
        });
        let mut state = RunState::new();
        assert!(g.evaluate(&mut state, &candidate(), "a.com", false).is_accept());
        assert_eq!(
            g.evaluate(&mut state, &candidate(), "a.com", false),
            GuardDecision::Requeue(GuardReason::Diversity)
        );
        assert!(g.evaluate(&mut state, &candidate(), "b.com", false).is_accept());
        assert!(g.evaluate(&mut state, &candidate(), "c.com", false).is_accept());
        assert!(g.evaluate(&mut state, &candidate(), "a.com", false).is_accept());
        assert_eq!(state.host_count("a.com"), 2);
    }

    #[test]
    fn requeue_leaves_state_untouched() {
        let g = guards(GuardConfig {
            host_cap: 1,
            ..relaxed()
        });
        let mut state = RunState::new();
        assert!(g.evaluate(&mut state, &candidate(), "a.com", false).is_accept());
        let before = (state.total_accepted(), state.window_len());
        assert!(!g.evaluate(&mut state, &candidate(), "a.com", false).is_accept());
        assert_eq!((state.total_accepted(), state.window_len()), before);
        assert_eq!(GuardReason::HostCap.to_string(), "host_cap");
    }
}
