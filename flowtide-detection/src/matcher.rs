//! ## flowtide-detection::matcher
//! **Incremental per-flow scanning across flush boundaries**
//!
//! Each direction keeps a trailing window of already scanned bytes, as long
//! as the largest rule bound, so a pattern split across two flushes is still
//! seen whole. Per rule, a `reported_until` offset makes matches
//! non-overlapping and guarantees none is reported twice.
//!
//! A regex hit is only reported once `bound` bytes exist from its start (or
//! the direction is finished), so greedy and optional tails resolve the same
//! way whatever the flush boundaries were.

use std::sync::Arc;

use flowtide_core::flow::Direction;
use flowtide_core::record::RawMatch;
use tracing::trace;

use crate::rules::{CompiledPattern, RuleScope, RuleSet};

#[derive(Debug, Default)]
struct DirectionScan {
    window: Vec<u8>,
    /// Stream offset of `window[0]`.
    window_start: u64,
    /// Per rule: stream offset before which nothing may be reported.
    reported_until: Vec<u64>,
}

impl DirectionScan {
    fn window_end(&self) -> u64 {
        self.window_start + self.window.len() as u64
    }
}

#[derive(Debug)]
pub struct RuleMatcher {
    rules: Arc<RuleSet>,
    active: Vec<bool>,
    streams: [DirectionScan; 2],
}

impl RuleMatcher {
    pub fn new(rules: Arc<RuleSet>, scope: &RuleScope) -> Self {
        let active = rules.applicable(scope);
        let per_rule = vec![0; rules.len()];
        Self {
            rules,
            active,
            streams: [
                DirectionScan {
                    reported_until: per_rule.clone(),
                    ..Default::default()
                },
                DirectionScan {
                    reported_until: per_rule,
                    ..Default::default()
                },
            ],
        }
    }

    /// Whether any rule applies to this flow at all.
    pub fn is_idle(&self) -> bool {
        !self.active.iter().any(|a| *a)
    }

    /// Scans newly delivered bytes. `offset` is their stream offset; a jump
    /// past the window end (a declared gap) restarts the window, so no match
    /// spans lost bytes.
    pub fn feed(
        &mut self,
        direction: Direction,
        offset: u64,
        bytes: &[u8],
        timestamp_ns: u64,
    ) -> Vec<RawMatch> {
        if self.is_idle() || bytes.is_empty() {
            return Vec::new();
        }
        let mut matches = Vec::new();
        if offset != self.streams[direction.index()].window_end() {
            // Nothing can extend past a gap: held-back hits are final.
            matches = self.scan(direction, timestamp_ns, true);
            let scan = &mut self.streams[direction.index()];
            trace!(direction = direction.as_str(), offset, "Scan window restarted");
            scan.window.clear();
            scan.window_start = offset;
        }
        self.streams[direction.index()].window.extend_from_slice(bytes);

        matches.extend(self.scan(direction, timestamp_ns, false));
        self.trim(direction);
        matches
    }

    /// Reports matches held back because they touched the end of the
    /// scanned bytes. Called once the direction has no more data.
    pub fn finish(&mut self, direction: Direction, timestamp_ns: u64) -> Vec<RawMatch> {
        if self.is_idle() {
            return Vec::new();
        }
        let matches = self.scan(direction, timestamp_ns, true);
        let scan = &mut self.streams[direction.index()];
        scan.window_start = scan.window_end();
        scan.window.clear();
        matches
    }

    fn scan(&mut self, direction: Direction, timestamp_ns: u64, finishing: bool) -> Vec<RawMatch> {
        let rules = &self.rules;
        let scan = &mut self.streams[direction.index()];
        let start = scan.window_start;
        let end = scan.window_end();
        let mut found: Vec<(u64, usize, u64)> = Vec::new();

        for (index, rule) in rules.rules.iter().enumerate() {
            if !self.active[index] {
                continue;
            }
            let CompiledPattern::Regex(regex) = &rule.pattern else {
                continue;
            };
            let mut at = scan.reported_until[index].max(start);
            while at < end {
                let from = (at - start) as usize;
                let Some(m) = regex.find_at(&scan.window, from) else {
                    break;
                };
                let (m_start, m_end) = (start + m.start() as u64, start + m.end() as u64);
                if m_start == m_end {
                    at = m_end + 1;
                    continue;
                }
                let undetermined = end - m_start < rule.bound as u64;
                if undetermined && !finishing {
                    break;
                }
                found.push((m_start, index, m_end));
                scan.reported_until[index] = m_end;
                at = m_end;
            }
        }

        if let Some(automaton) = &rules.literals {
            for m in automaton.find_overlapping_iter(&scan.window) {
                let index = rules.literal_rules[m.pattern().as_usize()];
                let m_start = start + m.start() as u64;
                if !self.active[index] || m_start < scan.reported_until[index] {
                    continue;
                }
                let m_end = start + m.end() as u64;
                found.push((m_start, index, m_end));
                scan.reported_until[index] = m_end;
            }
        }

        found.sort_unstable();
        found
            .into_iter()
            .map(|(m_start, index, m_end)| {
                let rule = &rules.rules[index];
                let from = (m_start - start) as usize;
                let to = (m_end - start) as usize;
                RawMatch {
                    rule_id: Arc::clone(&rule.id),
                    rule_name: Arc::clone(&rule.name),
                    direction,
                    offset: m_start,
                    bytes: scan.window[from..to].to_vec(),
                    timestamp_ns,
                }
            })
            .collect()
    }

    fn trim(&mut self, direction: Direction) {
        let keep = self.rules.window();
        let scan = &mut self.streams[direction.index()];
        if scan.window.len() > keep {
            let drop = scan.window.len() - keep;
            scan.window.drain(..drop);
            scan.window_start += drop as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSpec;
    use proptest::prelude::*;

    const FLAG: &str = r"FLAG\{[a-f0-9]{8}\}";

    fn matcher(specs: Vec<RuleSpec>, scope: RuleScope) -> RuleMatcher {
        RuleMatcher::new(Arc::new(RuleSet::compile(specs, 64).unwrap()), &scope)
    }

    fn ssh() -> RuleScope {
        RuleScope::new(22, Some("ssh"))
    }

    fn offsets(matches: &[RawMatch]) -> Vec<(&str, u64)> {
        matches.iter().map(|m| (&*m.rule_id, m.offset)).collect()
    }

    /// The flag rule bounded to the longest text it can match.
    fn flag() -> RuleSpec {
        RuleSpec::flag(FLAG).with_max_match_len(14)
    }

    fn spans(matches: &[RawMatch]) -> Vec<(u64, Vec<u8>)> {
        matches.iter().map(|m| (m.offset, m.bytes.clone())).collect()
    }

    #[test]
    fn flag_in_banner() {
        let mut m = matcher(vec![flag()], ssh());
        let hits = m.feed(
            Direction::ServerToClient,
            0,
            b"SSH-2.0-OpenSSH FLAG{deadbeef}\r\n",
            7,
        );
        assert_eq!(offsets(&hits), [("flag", 16)]);
        assert_eq!(hits[0].bytes, b"FLAG{deadbeef}");
        assert_eq!(hits[0].timestamp_ns, 7);
    }

    #[test]
    fn regex_split_across_flushes_is_reported_once() {
        let mut m = matcher(vec![flag()], ssh());
        let dir = Direction::ServerToClient;
        assert!(m.feed(dir, 0, b"xx FLAG{dead", 1).is_empty());
        let hits = m.feed(dir, 12, b"beef} yy", 2);
        assert_eq!(offsets(&hits), [("flag", 3)]);
        assert!(m.feed(dir, 20, b" zz", 3).is_empty());
        assert!(m.finish(dir, 4).is_empty());
    }

    #[test]
    fn literal_split_across_flushes_is_reported_once() {
        let mut m = matcher(
            vec![RuleSpec::literal("shell", "shell", b"/bin/sh".to_vec())],
            ssh(),
        );
        let dir = Direction::ClientToServer;
        assert!(m.feed(dir, 0, b"exec /bi", 1).is_empty());
        let hits = m.feed(dir, 8, b"n/sh;", 2);
        assert_eq!(offsets(&hits), [("shell", 5)]);
        assert!(m.feed(dir, 13, b"/bin", 3).is_empty());
    }

    #[test]
    fn open_ended_regex_waits_for_its_bound() {
        let mut m = matcher(vec![RuleSpec::regex("as", "as", "A+")], ssh());
        let dir = Direction::ClientToServer;
        assert!(m.feed(dir, 0, b"xAAA", 1).is_empty());
        assert!(m.feed(dir, 4, b"AAx", 2).is_empty());
        assert!(m.feed(dir, 7, b"AA", 3).is_empty());

        let hits = m.finish(dir, 4);
        assert_eq!(offsets(&hits), [("as", 1), ("as", 7)]);
        assert_eq!(hits[0].bytes, b"AAAAA");
        assert_eq!(hits[1].bytes, b"AA");
    }

    #[test]
    fn optional_tail_is_not_cut_at_a_flush_boundary() {
        let spec = RuleSpec::regex("abcd", "abcd", "ab(cd)?").with_max_match_len(4);
        let mut m = matcher(vec![spec], ssh());
        let dir = Direction::ClientToServer;
        assert!(m.feed(dir, 0, b"xxabc", 1).is_empty());
        let hits = m.feed(dir, 5, b"dyy", 2);
        assert_eq!(spans(&hits), [(2, b"abcd".to_vec())]);
    }

    #[test]
    fn gap_releases_held_back_hits() {
        let mut m = matcher(vec![RuleSpec::regex("as", "as", "A+")], ssh());
        let dir = Direction::ClientToServer;
        assert!(m.feed(dir, 0, b"xAA", 1).is_empty());
        let hits = m.feed(dir, 10, b"y", 2);
        assert_eq!(spans(&hits), [(1, b"AA".to_vec())]);
        assert!(m.finish(dir, 3).is_empty());
    }

    #[test]
    fn deferred_span_is_reported_at_its_bound() {
        let spec = RuleSpec::regex("as", "as", "A+").with_max_match_len(4);
        let mut m = matcher(vec![spec], ssh());
        let hits = m.feed(Direction::ClientToServer, 0, b"AAAA", 1);
        assert_eq!(offsets(&hits), [("as", 0)]);
    }

    #[test]
    fn literal_matches_do_not_overlap() {
        let mut m = matcher(vec![RuleSpec::literal("aa", "aa", b"aa".to_vec())], ssh());
        let hits = m.feed(Direction::ClientToServer, 0, b"aaaaa", 1);
        assert_eq!(offsets(&hits), [("aa", 0), ("aa", 2)]);
        let hits = m.feed(Direction::ClientToServer, 5, b"a", 2);
        assert_eq!(offsets(&hits), [("aa", 4)]);
    }

    #[test]
    fn directions_are_independent() {
        let mut m = matcher(vec![RuleSpec::literal("k", "k", b"key".to_vec())], ssh());
        assert!(m.feed(Direction::ClientToServer, 0, b"ke", 1).is_empty());
        assert!(m.feed(Direction::ServerToClient, 0, b"y", 1).is_empty());
        let hits = m.feed(Direction::ClientToServer, 2, b"y", 2);
        assert_eq!(hits[0].direction, Direction::ClientToServer);
    }

    #[test]
    fn gap_restarts_window() {
        let mut m = matcher(vec![RuleSpec::literal("k", "k", b"key".to_vec())], ssh());
        assert!(m.feed(Direction::ClientToServer, 0, b"ke", 1).is_empty());
        assert!(m.feed(Direction::ClientToServer, 10, b"y key", 2).len() == 1);
    }

    #[test]
    fn out_of_scope_rules_never_fire() {
        let spec = RuleSpec::literal("web", "web", b"GET".to_vec()).with_services(["http"]);
        let mut m = matcher(vec![spec], ssh());
        assert!(m.is_idle());
        assert!(m.feed(Direction::ClientToServer, 0, b"GET /", 1).is_empty());
    }

    #[test]
    fn results_are_in_stream_order() {
        let mut m = matcher(
            vec![
                flag(),
                RuleSpec::literal("get", "get", b"GET".to_vec()),
            ],
            ssh(),
        );
        let hits = m.feed(
            Direction::ClientToServer,
            0,
            b"FLAG{00000000} GET FLAG{11111111}\n",
            1,
        );
        assert_eq!(offsets(&hits), [("flag", 0), ("get", 15), ("flag", 19)]);
    }

    proptest! {
        #[test]
        fn any_split_point_reports_once(
            prefix in "[a-z ]{0,40}",
            suffix in "[a-z ]{1,40}",
            cut in 0usize..200,
        ) {
            let stream = format!("{prefix}FLAG{{0123abcd}}{suffix}").into_bytes();
            let cut = cut % (stream.len() + 1);
            let mut m = matcher(vec![RuleSpec::flag(FLAG)], ssh());
            let dir = Direction::ServerToClient;
            let mut hits = m.feed(dir, 0, &stream[..cut], 1);
            hits.extend(m.feed(dir, cut as u64, &stream[cut..], 2));
            hits.extend(m.finish(dir, 3));
            prop_assert_eq!(hits.len(), 1);
            prop_assert_eq!(hits[0].offset, prefix.len() as u64);
        }

        #[test]
        fn split_and_whole_streams_agree(
            stream in "[abcdxy]{0,160}",
            cut in 0usize..200,
        ) {
            let stream = stream.into_bytes();
            let cut = cut % (stream.len() + 1);
            let rules = || vec![RuleSpec::regex("abcd", "abcd", "ab(cd)?"), RuleSpec::regex("as", "as", "a+")];
            let dir = Direction::ClientToServer;

            let mut whole = matcher(rules(), ssh());
            let mut expected = whole.feed(dir, 0, &stream, 1);
            expected.extend(whole.finish(dir, 2));

            let mut split = matcher(rules(), ssh());
            let mut actual = split.feed(dir, 0, &stream[..cut], 1);
            actual.extend(split.feed(dir, cut as u64, &stream[cut..], 1));
            actual.extend(split.finish(dir, 2));

            let key = |hits: &[RawMatch]| {
                let mut v: Vec<_> = hits.iter().map(|m| (m.offset, m.rule_id.to_string(), m.bytes.clone())).collect();
                v.sort();
                v
            };
            prop_assert_eq!(key(&expected), key(&actual));
        }
    }
}
