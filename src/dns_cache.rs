//! A cache for DNS records learned from responses.
//!
//! Each instance requestor owns one, so that records heard through one
//! media / IP version filter never leak into a subscription with another.
//! This is an internal implementation, not visible to the public API.

#[cfg(feature = "logging")]
use crate::log::trace;
use crate::dns_parser::{DnsRData, DnsResource, DnsSrv, RRType};
use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Arc,
};

/// A record in the cache, with its timing.
#[derive(Debug, Clone)]
pub(crate) struct CachedRecord {
    pub(crate) record: Arc<DnsResource>,
    created: u64, // UNIX time in millis
    expires: u64, // expires at this UNIX time in millis

    /// Support re-query a record before it expires.
    /// See https://datatracker.ietf.org/doc/html/rfc6762#section-5.2
    refresh: u64, // UNIX time in millis
}

impl CachedRecord {
    fn new(record: Arc<DnsResource>, now: u64) -> Self {
        let ttl = record.ttl;
        Self {
            record,
            created: now,
            expires: get_expiration_time(now, ttl, 100),

            // From RFC 6762 section 5.2:
            // "... The querier should plan to issue a query at 80% of the record
            // lifetime, and then if no answer is received, at 85%, 90%, and 95%."
            refresh: get_expiration_time(now, ttl, 80),
        }
    }

    pub(crate) const fn is_expired(&self, now: u64) -> bool {
        now >= self.expires
    }

    /// Returns whether `now` (in millis) has passed half of TTL.
    fn halflife_passed(&self, now: u64) -> bool {
        now > get_expiration_time(self.created, self.record.ttl, 50)
    }

    /// Returns the remaining TTL in seconds
    fn remaining_ttl(&self, now: u64) -> u32 {
        (self.expires.saturating_sub(now) / 1000) as u32
    }

    /// Returns if this record is due for refresh. If yes, `refresh` time is
    /// moved to the next step still ahead of `now`: 80%, 85%, 90%, 95%,
    /// then never. Steps missed by a late call are skipped.
    fn refresh_maybe(&mut self, now: u64) -> bool {
        if self.is_expired(now) || now < self.refresh {
            return false;
        }

        let ttl = self.record.ttl;
        let next = [85, 90, 95]
            .iter()
            .map(|percent| get_expiration_time(self.created, ttl, *percent))
            .find(|time| *time > now);
        self.refresh = next.unwrap_or(self.expires);
        true
    }

    fn reset(&mut self, incoming: Arc<DnsResource>, now: u64) {
        *self = Self::new(incoming, now);
    }
}

/// A cache for PTR, SRV, TXT and address records.
///
/// All maps are keyed by the lower-cased record name.
#[derive(Debug, Default)]
pub(crate) struct DnsCache {
    /// PTR records indexed by service (or subtype) full name
    ptr: HashMap<String, Vec<CachedRecord>>,

    /// SRV records indexed by the instance full name
    srv: HashMap<String, Vec<CachedRecord>>,

    /// TXT records indexed by the instance full name
    txt: HashMap<String, Vec<CachedRecord>>,

    /// A and AAAA records indexed by the host full name
    addr: HashMap<String, Vec<CachedRecord>>,
}

impl DnsCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn records_mut(&mut self, ty: RRType, name: String) -> Option<&mut Vec<CachedRecord>> {
        let map = match ty {
            RRType::PTR => &mut self.ptr,
            RRType::SRV => &mut self.srv,
            RRType::TXT => &mut self.txt,
            RRType::A | RRType::AAAA => &mut self.addr,
            _ => return None,
        };
        Some(map.entry(name).or_default())
    }

    /// Adds a record into the cache, or refreshes the matching record.
    ///
    /// Returns true if the record was not in the cache before. Timers for
    /// records whose expiry got moved are pushed into `timers`.
    pub(crate) fn add_or_update(
        &mut self,
        incoming: &Arc<DnsResource>,
        now: u64,
        timers: &mut Vec<u64>,
    ) -> bool {
        let ty = incoming.rr_type();
        let Some(record_vec) = self.records_mut(ty, incoming.name.to_ascii_lowercase()) else {
            return false;
        };

        if incoming.is_goodbye() {
            // RFC 6762 section 10.1:
            // "...Queriers receiving a Multicast DNS response with a TTL of zero SHOULD
            // NOT immediately delete the record from the cache, but instead record
            // a TTL of 1 and then delete the record one second later."
            for r in record_vec.iter_mut() {
                if r.record.matches(incoming) && r.expires > now + 1000 {
                    trace!("goodbye: {}", &r.record);
                    r.expires = now + 1000;
                    r.refresh = r.expires;
                    timers.push(r.expires);
                }
            }
            return false;
        }

        if incoming.cache_flush {
            for r in record_vec.iter_mut() {
                // When cache flush is asked, we set expire date to 1 second in the future if:
                // - The record has the same type.
                // - The record was created more than 1 second ago.
                // - The record expire is more than 1 second away.
                // Ref: RFC 6762 Section 10.2
                if r.record.rr_type() == ty
                    && !r.record.rdata_matches(incoming)
                    && now > r.created + 1000
                    && r.expires > now + 1000
                {
                    trace!("FLUSH one record: {}", &r.record);
                    r.expires = now + 1000;
                    r.refresh = r.expires;
                    timers.push(r.expires);
                }
            }
        }

        // update TTL for existing record or create a new record.
        match record_vec
            .iter_mut()
            .find(|r| r.record.rdata_matches(incoming))
        {
            Some(r) => {
                r.reset(incoming.clone(), now);
                timers.push(r.refresh);
                false
            }
            None => {
                let cached = CachedRecord::new(incoming.clone(), now);
                timers.push(cached.refresh);
                record_vec.insert(0, cached); // A new record.
                true
            }
        }
    }

    /// Returns the aliases of live PTR records for `name`.
    pub(crate) fn ptr_aliases(&self, name: &str, now: u64) -> Vec<String> {
        let mut seen = HashSet::new();
        live(self.ptr.get(&name.to_ascii_lowercase()), now)
            .filter_map(|r| r.record.ptr_alias())
            .filter(|alias| seen.insert(alias.to_ascii_lowercase()))
            .map(|alias| alias.to_string())
            .collect()
    }

    /// Returns the newest live SRV record of an instance.
    pub(crate) fn srv(&self, instance: &str, now: u64) -> Option<&DnsSrv> {
        live(self.srv.get(&instance.to_ascii_lowercase()), now).find_map(|r| {
            match &r.record.rdata {
                DnsRData::Srv(srv) => Some(srv),
                _ => None,
            }
        })
    }

    /// Returns the newest live TXT strings of an instance.
    pub(crate) fn txt(&self, instance: &str, now: u64) -> Option<&Vec<Vec<u8>>> {
        live(self.txt.get(&instance.to_ascii_lowercase()), now).find_map(|r| {
            match &r.record.rdata {
                DnsRData::Txt(strings) => Some(strings),
                _ => None,
            }
        })
    }

    /// Returns the live addresses of a host, oldest first.
    pub(crate) fn addresses(&self, host: &str, now: u64) -> Vec<IpAddr> {
        let mut addresses: Vec<IpAddr> = live(self.addr.get(&host.to_ascii_lowercase()), now)
            .filter_map(|r| r.record.ip_address())
            .collect();
        addresses.reverse();
        addresses.dedup();
        addresses
    }

    /// Removes expired records. Returns true if anything was removed.
    pub(crate) fn evict_expired(&mut self, now: u64) -> bool {
        let mut evicted = false;
        for map in [&mut self.ptr, &mut self.srv, &mut self.txt, &mut self.addr] {
            map.retain(|_, records| {
                records.retain(|r| {
                    let expired = r.is_expired(now);
                    if expired {
                        trace!("evict expired: {}", &r.record);
                        evicted = true;
                    }
                    !expired
                });
                !records.is_empty()
            });
        }
        evicted
    }

    /// Returns the (name, type) of records due for a refresh query.
    pub(crate) fn refresh_due(&mut self, now: u64) -> Vec<(String, RRType)> {
        let mut due = Vec::new();
        for map in [&mut self.ptr, &mut self.srv, &mut self.txt, &mut self.addr] {
            for records in map.values_mut() {
                for r in records.iter_mut() {
                    if r.refresh_maybe(now) {
                        let key = (r.record.name.clone(), r.record.rr_type());
                        if !due.contains(&key) {
                            due.push(key);
                        }
                    }
                }
            }
        }
        due
    }

    /// The earliest time at which a record needs a refresh or expires.
    pub(crate) fn next_event_time(&self) -> Option<u64> {
        [&self.ptr, &self.srv, &self.txt, &self.addr]
            .into_iter()
            .flat_map(|map| map.values())
            .flatten()
            .map(|r| r.refresh.min(r.expires))
            .min()
    }

    /// Returns a list of Known Answer for a given question of `name` with `qtype`,
    /// with TTLs reduced to the remaining lifetime.
    ///
    /// Reference:  RFC 6762 section 7.1
    pub(crate) fn known_answers(
        &self,
        name: &str,
        qtype: RRType,
        now: u64,
    ) -> Vec<Arc<DnsResource>> {
        let name = name.to_ascii_lowercase();
        let records = match qtype {
            RRType::PTR => self.ptr.get(&name),
            RRType::SRV => self.srv.get(&name),
            RRType::TXT => self.txt.get(&name),
            RRType::A | RRType::AAAA => self.addr.get(&name),
            _ => None,
        };

        // From RFC 6762 section 7.1:
        // ..Generally, this applies only to Shared records, not Unique records,..
        //
        // ..a Multicast DNS querier SHOULD NOT include
        // records in the Known-Answer list whose remaining TTL is less than
        // half of their original TTL.
        live(records, now)
            .filter(|r| !r.record.cache_flush && !r.halflife_passed(now))
            .filter(|r| qtype.matches(r.record.rr_type()))
            .map(|r| {
                let remaining = r.remaining_ttl(now);
                Arc::new(r.record.as_ref().clone().with_ttl(remaining))
            })
            .collect()
    }
}

fn live(records: Option<&Vec<CachedRecord>>, now: u64) -> impl Iterator<Item = &CachedRecord> {
    records
        .into_iter()
        .flatten()
        .filter(move |r| !r.is_expired(now))
}

/// Returns the UNIX time in millis at which a record will have expired
/// by a certain percentage.
const fn get_expiration_time(created: u64, ttl: u32, percent: u32) -> u64 {
    // 'created' is in millis, 'ttl' is in seconds, hence:
    // ttl * 1000 * (percent / 100) => ttl * percent * 10
    created + (ttl as u64 * percent as u64 * 10)
}
