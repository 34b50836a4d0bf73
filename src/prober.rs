//! Probing for unique records, RFC 6762 section 8.1.

use crate::dns_parser::{DnsMessage, DnsQuestion, DnsResource, RRType};
use std::{cmp::Ordering, sync::Arc};

/// Number of probe queries before claiming a name.
const PROBE_COUNT: u32 = 3;

/// Time between probe queries, and from the last probe to success.
pub(crate) const PROBE_INTERVAL_MILLIS: u64 = 250;

/// Delay before probing again after losing a tiebreak, RFC 6762 section 8.2.
pub(crate) const TIEBREAK_LOST_DELAY_MILLIS: u64 = 1000;

/// TTL of our candidate records in the authority section.
const PROBE_AUTHORITY_TTL: u32 = 2;

/// What to do next for a probe.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProbeStep {
    /// Send this query, then come back after [`PROBE_INTERVAL_MILLIS`].
    Send(DnsMessage),

    /// Nobody objected. The name is ours.
    Done,
}

/// Probing state of one unique name.
#[derive(Debug, Clone)]
pub(crate) struct Probe {
    name: String,
    records: Vec<Arc<DnsResource>>,
    sent: u32,
}

impl Probe {
    /// `records` are the unique records we intend to own under `name`.
    pub(crate) fn new(name: &str, records: Vec<Arc<DnsResource>>) -> Self {
        Self {
            name: name.to_string(),
            records,
            sent: 0,
        }
    }

    /// Random delay before the first probe: 0 to 250 ms.
    pub(crate) fn initial_delay() -> u64 {
        fastrand::u64(0..PROBE_INTERVAL_MILLIS)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Starts over, e.g. after losing a tiebreak.
    pub(crate) fn restart(&mut self) {
        self.sent = 0;
    }

    pub(crate) fn next_step(&mut self) -> ProbeStep {
        if self.sent >= PROBE_COUNT {
            return ProbeStep::Done;
        }
        let query = self.build_query();
        self.sent += 1;
        ProbeStep::Send(query)
    }

    fn build_query(&self) -> DnsMessage {
        let mut query = DnsMessage::query();

        // The first probe asks for a unicast response, RFC 6762 section 8.1.
        let mut question = DnsQuestion::new(&self.name, RRType::ANY);
        question.unicast_response = self.sent == 0;
        query.questions.push(question);

        for record in self.records.iter() {
            let candidate = record
                .as_ref()
                .clone()
                .with_cache_flush(false)
                .with_ttl(PROBE_AUTHORITY_TTL);
            query.add_authority(Arc::new(candidate));
        }
        query
    }

    /// Returns true if a response claims our name with different data.
    pub(crate) fn conflicts_with(&self, response: &DnsMessage) -> bool {
        response
            .answers
            .iter()
            .chain(response.additionals.iter())
            .filter(|r| r.name_matches(&self.name) && !r.is_goodbye())
            .any(|r| !self.records.iter().any(|ours| ours.matches(r)))
    }

    /// Returns true if `query` is a simultaneous probe for our name that
    /// wins the tiebreak, RFC 6762 section 8.2.
    pub(crate) fn loses_tiebreak(&self, query: &DnsMessage) -> bool {
        let asks_for_us = query
            .questions
            .iter()
            .any(|q| q.name.eq_ignore_ascii_case(&self.name));
        if !asks_for_us {
            return false;
        }

        let mut theirs: Vec<&Arc<DnsResource>> = query
            .authorities
            .iter()
            .filter(|r| r.name_matches(&self.name))
            .collect();
        if theirs.is_empty() {
            return false;
        }
        let mut ours: Vec<&Arc<DnsResource>> = self.records.iter().collect();

        theirs.sort_by(|a, b| a.compare(b));
        ours.sort_by(|a, b| a.compare(b));

        compare_record_lists(&ours, &theirs) == Ordering::Less
    }
}

/// Compares two sorted record lists pairwise. A list that runs out first
/// is the earlier one.
fn compare_record_lists(a: &[&Arc<DnsResource>], b: &[&Arc<DnsResource>]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.compare(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}
