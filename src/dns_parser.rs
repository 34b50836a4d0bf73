//! DNS wire format.
//!
//! [DnsMessage] is the logic representation of a DNS message, inbound or outbound.
//! [DnsOutPacket] is one encoded packet of an outbound [DnsMessage], and
//! [DnsIncoming] is the decoder for an inbound packet.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};

use crate::error::{e_fmt, Error, Result};
use std::{
    cmp,
    collections::HashMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str,
    sync::Arc,
};

/// DNS resource record types, stored as `u16`. Can do `as u16` when needed.
///
/// See [RFC 1035 section 3.2.2](https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.2)
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum RRType {
    /// DNS record type for IPv4 address
    A = 1,

    /// DNS record type for Pointer
    PTR = 12,

    /// DNS record type for Text (properties)
    TXT = 16,

    /// DNS record type for IPv6 address
    AAAA = 28,

    /// DNS record type for Service
    SRV = 33,

    /// DNS record type for any records (wildcard)
    ANY = 255,
}

impl RRType {
    /// Converts `u16` into `RRType` if possible.
    pub const fn from_u16(value: u16) -> Option<RRType> {
        match value {
            1 => Some(RRType::A),
            12 => Some(RRType::PTR),
            16 => Some(RRType::TXT),
            28 => Some(RRType::AAAA),
            33 => Some(RRType::SRV),
            255 => Some(RRType::ANY),
            _ => None,
        }
    }

    /// Returns true if a question of `self` is answered by a record of `record_type`.
    pub fn matches(self, record_type: RRType) -> bool {
        self == RRType::ANY || self == record_type
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::A => write!(f, "TYPE_A"),
            RRType::PTR => write!(f, "TYPE_PTR"),
            RRType::TXT => write!(f, "TYPE_TXT"),
            RRType::AAAA => write!(f, "TYPE_AAAA"),
            RRType::SRV => write!(f, "TYPE_SRV"),
            RRType::ANY => write!(f, "TYPE_ANY"),
        }
    }
}

/// The class value for the Internet.
pub const CLASS_IN: u16 = 1;
pub const CLASS_MASK: u16 = 0x7FFF;
const CLASS_ANY: u16 = 255;

/// Cache-flush bit: the most significant bit of the rrclass field of the resource record.
pub const CLASS_CACHE_FLUSH: u16 = 0x8000;

/// Unicast-response bit: the most significant bit of the qclass field of a question.
const CLASS_UNICAST_RESPONSE: u16 = 0x8000;

/// Max size of UDP datagram payload.
///
/// It is calculated as: 9000 bytes - IP header 20 bytes - UDP header 8 bytes.
/// Reference: [RFC6762 section 17](https://datatracker.ietf.org/doc/html/rfc6762#section-17)
pub const MAX_MSG_ABSOLUTE: usize = 8972;

const MSG_HEADER_LEN: usize = 12;

// Definitions for DNS message header "flags" field
//
// The "flags" field is 16-bit long, in this format:
// (RFC 1035 section 4.1.1)
//
//   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//
pub const FLAGS_QR_MASK: u16 = 0x8000; // mask for query/response bit

/// Flag bit to indicate a query
pub const FLAGS_QR_QUERY: u16 = 0x0000;

/// Flag bit to indicate a response
pub const FLAGS_QR_RESPONSE: u16 = 0x8000;

/// Flag bit for Authoritative Answer
pub const FLAGS_AA: u16 = 0x0400;

/// mask for TC(Truncated) bit
pub const FLAGS_TC: u16 = 0x0200;

const U16_SIZE: usize = 2;

/// Max length of a domain name on the wire, RFC 1035 section 3.1.
const MAX_NAME_LEN: usize = 255;

/// The largest offset a compression pointer can hold.
const MAX_POINTER_OFFSET: usize = 0x3FFF;

/// Max length of a single label.
const MAX_LABEL_LEN: usize = 63;

/// Each character-string of TXT rdata is at most 255 bytes, RFC 1035 3.3.
pub const MAX_TXT_STRING_LEN: usize = 255;

/// Returns false if a label of `name` is empty or longer than 63 bytes.
/// The root name is fine.
fn name_is_encodable(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.is_empty()
        || name
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= MAX_LABEL_LEN)
}

/// Returns `RRType` for a given IP address.
#[inline]
pub const fn ip_address_rr_type(address: &IpAddr) -> RRType {
    match address {
        IpAddr::V4(_) => RRType::A,
        IpAddr::V6(_) => RRType::AAAA,
    }
}

/// The fixed part of a DNS message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
}

impl DnsHeader {
    pub const fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    pub const fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    pub const fn is_truncated(&self) -> bool {
        (self.flags & FLAGS_TC) != 0
    }
}

/// A question of a DNS message. The class is always `IN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RRType,

    /// The "QU" bit: the querier would like a unicast response.
    pub unicast_response: bool,
}

impl DnsQuestion {
    pub fn new(name: &str, qtype: RRType) -> Self {
        Self {
            name: name.to_string(),
            qtype,
            unicast_response: false,
        }
    }
}

/// The RDATA of a SRV record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsSrv {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// The RDATA of the record types we know.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DnsRData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Srv(DnsSrv),

    /// One or more character strings, each at most 255 bytes.
    Txt(Vec<Vec<u8>>),
}

/// A resource record.
///
/// Records are shared between in-flight messages via `Arc` and never
/// mutated once placed into a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResource {
    pub name: String,
    pub class: u16,
    pub cache_flush: bool,

    /// In seconds. Zero means goodbye.
    pub ttl: u32,
    pub rdata: DnsRData,
}

impl DnsResource {
    pub fn new(name: &str, ttl: u32, rdata: DnsRData) -> Self {
        Self {
            name: name.to_string(),
            class: CLASS_IN,
            cache_flush: false,
            ttl,
            rdata,
        }
    }

    /// An A or AAAA record.
    pub fn address(name: &str, ttl: u32, address: IpAddr) -> Self {
        let rdata = match address {
            IpAddr::V4(v4) => DnsRData::A(v4),
            IpAddr::V6(v6) => DnsRData::Aaaa(v6),
        };
        Self::new(name, ttl, rdata).with_cache_flush(true)
    }

    pub fn with_cache_flush(mut self, cache_flush: bool) -> Self {
        self.cache_flush = cache_flush;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn rr_type(&self) -> RRType {
        match &self.rdata {
            DnsRData::A(_) => RRType::A,
            DnsRData::Aaaa(_) => RRType::AAAA,
            DnsRData::Ptr(_) => RRType::PTR,
            DnsRData::Srv(_) => RRType::SRV,
            DnsRData::Txt(_) => RRType::TXT,
        }
    }

    pub const fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }

    /// Returns false if the record has a label or TXT string too long for
    /// the wire.
    pub fn is_encodable(&self) -> bool {
        name_is_encodable(&self.name)
            && match &self.rdata {
                DnsRData::Ptr(alias) => name_is_encodable(alias),
                DnsRData::Srv(srv) => name_is_encodable(&srv.target),
                DnsRData::Txt(strings) => strings.iter().all(|s| s.len() <= MAX_TXT_STRING_LEN),
                DnsRData::A(_) | DnsRData::Aaaa(_) => true,
            }
    }

    /// mDNS names are case-insensitive.
    pub fn name_matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Returns the PTR alias if this is a PTR record.
    pub fn ptr_alias(&self) -> Option<&str> {
        match &self.rdata {
            DnsRData::Ptr(alias) => Some(alias),
            _ => None,
        }
    }

    /// Returns the IP address if this is an A or AAAA record.
    pub fn ip_address(&self) -> Option<IpAddr> {
        match &self.rdata {
            DnsRData::A(v4) => Some(IpAddr::V4(*v4)),
            DnsRData::Aaaa(v6) => Some(IpAddr::V6(*v6)),
            _ => None,
        }
    }

    /// Returns true if both records have the same name, type and rdata,
    /// ignoring TTL and the cache-flush bit.
    pub fn matches(&self, other: &DnsResource) -> bool {
        self.name_matches(&other.name) && self.rdata_matches(other)
    }

    /// Compares rdata, with domain names compared case-insensitively.
    pub fn rdata_matches(&self, other: &DnsResource) -> bool {
        match (&self.rdata, &other.rdata) {
            (DnsRData::Ptr(a), DnsRData::Ptr(b)) => a.eq_ignore_ascii_case(b),
            (DnsRData::Srv(a), DnsRData::Srv(b)) => {
                a.priority == b.priority
                    && a.weight == b.weight
                    && a.port == b.port
                    && a.target.eq_ignore_ascii_case(&b.target)
            }
            (a, b) => a == b,
        }
    }

    /// Lexicographical comparison for probe tiebreaking.
    ///
    /// See [RFC 6762 section 8.2](https://datatracker.ietf.org/doc/html/rfc6762#section-8.2)
    pub fn compare(&self, other: &DnsResource) -> cmp::Ordering {
        // 1. compare the class (with cache-flush bit cleared).
        let class1 = self.class & CLASS_MASK;
        let class2 = other.class & CLASS_MASK;

        // 2. compare the record type, then 3. the raw rdata bytes.
        class1
            .cmp(&class2)
            .then((self.rr_type() as u16).cmp(&(other.rr_type() as u16)))
            .then_with(|| self.rdata_bytes().cmp(&other.rdata_bytes()))
    }

    /// The rdata as it would appear on the wire without name compression.
    fn rdata_bytes(&self) -> Vec<u8> {
        let mut packet = DnsOutPacket::new();
        packet.names_disabled = true;
        packet.write_rdata(&self.rdata);
        packet.to_bytes()
    }
}

impl fmt::Display for DnsResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rdata = match &self.rdata {
            DnsRData::A(v4) => v4.to_string(),
            DnsRData::Aaaa(v6) => v6.to_string(),
            DnsRData::Ptr(alias) => alias.clone(),
            DnsRData::Srv(srv) => format!(
                "{} {} {} {}",
                srv.priority, srv.weight, srv.port, srv.target
            ),
            DnsRData::Txt(strings) => format!("{} strings", strings.len()),
        };
        write!(
            f,
            "{} {} ttl {}{} {}",
            self.name,
            self.rr_type(),
            self.ttl,
            if self.cache_flush { " flush" } else { "" },
            rdata
        )
    }
}

/// A DNS message: the header and the four sections.
///
/// The section counts of the header are derived from the section lengths
/// when encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<Arc<DnsResource>>,
    pub authorities: Vec<Arc<DnsResource>>,
    pub additionals: Vec<Arc<DnsResource>>,
}

impl DnsMessage {
    /// An empty multicast query.
    pub fn query() -> Self {
        Self {
            header: DnsHeader {
                id: 0,
                flags: FLAGS_QR_QUERY,
            },
            ..Default::default()
        }
    }

    /// An empty authoritative response.
    pub fn response() -> Self {
        Self {
            header: DnsHeader {
                id: 0,
                flags: FLAGS_QR_RESPONSE | FLAGS_AA,
            },
            ..Default::default()
        }
    }

    pub const fn is_query(&self) -> bool {
        self.header.is_query()
    }

    pub const fn is_response(&self) -> bool {
        self.header.is_response()
    }

    pub fn add_question(&mut self, name: &str, qtype: RRType) {
        self.questions.push(DnsQuestion::new(name, qtype));
    }

    /// Adds an answer unless an identical record is already there.
    pub fn add_answer(&mut self, record: Arc<DnsResource>) {
        if !self.answers.iter().any(|r| r.as_ref() == record.as_ref()) {
            self.answers.push(record);
        }
    }

    pub fn add_authority(&mut self, record: Arc<DnsResource>) {
        self.authorities.push(record);
    }

    /// Adds an additional record unless it is already an answer or an additional.
    pub fn add_additional(&mut self, record: Arc<DnsResource>) {
        let present = self
            .answers
            .iter()
            .chain(self.additionals.iter())
            .any(|r| r.as_ref() == record.as_ref());
        if !present {
            self.additionals.push(record);
        }
    }

    /// Returns true if the message carries neither questions nor records.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    /// All records in answers, authorities and additionals.
    pub fn all_records(&self) -> impl Iterator<Item = &Arc<DnsResource>> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
    }

    /// Decodes one packet received from the wire.
    ///
    /// Any truncation or malformation yields an error: the message is
    /// incomplete and should be dropped.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        DnsIncoming::new(data).decode()
    }

    /// Returns a list of actual DNS packet data to be sent on the wire.
    pub fn to_data_on_wire(&self) -> Vec<Vec<u8>> {
        let packet_list = self.to_packets();
        packet_list.iter().map(|p| p.to_bytes()).collect()
    }

    /// Encode self into one or more packets.
    ///
    /// A query whose known answers do not fit into one packet is split per
    /// RFC 6762 section 7.2: every packet except the last has the TC bit.
    /// Records of a response that do not fit are dropped. Questions and
    /// records that cannot be encoded are left out, never truncated.
    pub fn to_packets(&self) -> Vec<DnsOutPacket> {
        let mut packet_list = Vec::new();
        let mut packet = DnsOutPacket::new();

        let mut question_count = 0;
        let mut answer_count = 0;
        let mut auth_count = 0;
        let mut addi_count = 0;

        for question in self.questions.iter() {
            if !name_is_encodable(&question.name) {
                debug!("dropped question with invalid name: {}", &question.name);
                continue;
            }
            packet.write_question(question);
            question_count += 1;
        }

        for answer in self.answers.iter().filter(|r| encodable(r)) {
            if packet.write_record(answer) {
                answer_count += 1;
                continue;
            }

            if self.is_response() {
                trace!("response full, dropped answer: {}", answer);
                continue;
            }

            // For query, the current packet exceeds its max size due to known answers,
            // need to truncate.
            packet.write_header(
                self.header.id,
                self.header.flags | FLAGS_TC,
                question_count,
                answer_count,
                auth_count,
                addi_count,
            );
            packet_list.push(packet);

            // create a new packet and reset counts.
            packet = DnsOutPacket::new();
            question_count = 0;
            answer_count = u16::from(packet.write_record(answer));
        }

        for auth in self.authorities.iter().filter(|r| encodable(r)) {
            auth_count += u16::from(packet.write_record(auth));
        }

        for addi in self.additionals.iter().filter(|r| encodable(r)) {
            addi_count += u16::from(packet.write_record(addi));
        }

        packet.write_header(
            self.header.id,
            self.header.flags,
            question_count,
            answer_count,
            auth_count,
            addi_count,
        );

        packet_list.push(packet);
        packet_list
    }
}

fn encodable(record: &DnsResource) -> bool {
    if record.is_encodable() {
        return true;
    }
    debug!("dropped record that cannot be encoded: {}", record);
    false
}

/// A single packet for outgoing DNS message.
pub struct DnsOutPacket {
    /// All bytes in `data` concatenated is the actual packet on the wire.
    data: Vec<Vec<u8>>,

    /// Current logical size of the packet. It starts with the size of the mandatory header.
    size: usize,

    /// k: name, v: offset
    names: HashMap<String, u16>,

    /// Writes names without compression.
    names_disabled: bool,
}

impl DnsOutPacket {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            size: MSG_HEADER_LEN, // Header is mandatory.
            names: HashMap::new(),
            names_disabled: false,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.concat()
    }

    fn write_question(&mut self, question: &DnsQuestion) {
        self.write_name(&question.name);
        self.write_short(question.qtype as u16);
        if question.unicast_response {
            self.write_short(CLASS_IN | CLASS_UNICAST_RESPONSE);
        } else {
            self.write_short(CLASS_IN);
        }
    }

    /// Writes a record (answer, authoritative answer, additional)
    /// Returns false if the packet exceeds the max size with this record, nothing is written to the packet.
    /// otherwise returns true.
    fn write_record(&mut self, record: &DnsResource) -> bool {
        let start_data_length = self.data.len();
        let start_size = self.size;
        let start_names = self.names.len();

        self.write_name(&record.name);
        self.write_short(record.rr_type() as u16);
        if record.cache_flush {
            // check "multicast"
            self.write_short(record.class | CLASS_CACHE_FLUSH);
        } else {
            self.write_short(record.class);
        }
        self.write_u32(record.ttl);

        let index = self.data.len();

        // Adjust size for the short we will write before this record
        self.size += 2;
        self.write_rdata(&record.rdata);
        self.size -= 2;

        let length: usize = self.data[index..].iter().map(|x| x.len()).sum();
        self.insert_short(index, length as u16);

        if self.size > MAX_MSG_ABSOLUTE {
            self.data.truncate(start_data_length);
            self.size = start_size;
            if self.names.len() != start_names {
                let size = self.size;
                self.names.retain(|_, offset| (*offset as usize) < size);
            }
            return false;
        }

        true
    }

    fn write_rdata(&mut self, rdata: &DnsRData) {
        match rdata {
            DnsRData::A(v4) => self.write_bytes(&v4.octets()),
            DnsRData::Aaaa(v6) => self.write_bytes(&v6.octets()),
            DnsRData::Ptr(alias) => self.write_name(alias),
            DnsRData::Srv(srv) => {
                self.write_short(srv.priority);
                self.write_short(srv.weight);
                self.write_short(srv.port);
                self.write_name(&srv.target);
            }
            DnsRData::Txt(strings) => {
                for s in strings {
                    self.write_byte(s.len() as u8);
                    self.write_bytes(s);
                }
            }
        }
    }

    fn insert_short(&mut self, index: usize, value: u16) {
        self.data.insert(index, value.to_be_bytes().to_vec());
        self.size += 2;
    }

    // Write name to packet
    //
    // [RFC1035]
    // 4.1.4. Message compression
    //
    // In order to reduce the size of messages, the domain system utilizes a
    // compression scheme which eliminates the repetition of domain names in a
    // message.  In this scheme, an entire domain name or a list of labels at
    // the end of a domain name is replaced with a pointer to a prior occurrence
    // of the same name.
    // The pointer takes the form of a two octet sequence:
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     | 1  1|                OFFSET                   |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    fn write_name(&mut self, name: &str) {
        // ignore the ending "." if exists
        let end = name.len();
        let end = if end > 0 && &name[end - 1..] == "." {
            end - 1
        } else {
            end
        };

        // the root name
        if end == 0 {
            self.write_byte(0);
            return;
        }

        let mut here = 0;
        while here < end {
            const POINTER_MASK: u16 = 0xC000;
            let remaining = &name[here..end];

            // Check if 'remaining' already appeared in this message
            let known = if self.names_disabled {
                None
            } else {
                self.names.get(remaining).copied()
            };

            match known {
                Some(offset) => {
                    self.write_short(offset | POINTER_MASK);
                    break;
                }
                None => {
                    // Remember the remaining parts so we can point to it.
                    // Offsets beyond 14 bits cannot be pointed to.
                    if !self.names_disabled && self.size <= MAX_POINTER_OFFSET {
                        self.names.insert(remaining.to_string(), self.size as u16);
                    }

                    // Find the current label to write into the packet
                    let stop = remaining.find('.').map_or(end, |i| here + i);
                    let label = &name[here..stop];
                    self.write_label(label);

                    here = stop + 1; // move past the current label
                }
            }

            if here >= end {
                self.write_byte(0); // name ends with 0 if not using a pointer
            }
        }
    }

    /// Label lengths are checked by `to_packets`.
    fn write_label(&mut self, label: &str) {
        let bytes = label.as_bytes();
        self.write_byte(bytes.len() as u8);
        self.write_bytes(bytes);
    }

    fn write_bytes(&mut self, s: &[u8]) {
        self.data.push(s.to_vec());
        self.size += s.len();
    }

    fn write_u32(&mut self, int: u32) {
        self.data.push(int.to_be_bytes().to_vec());
        self.size += 4;
    }

    fn write_short(&mut self, short: u16) {
        self.data.push(short.to_be_bytes().to_vec());
        self.size += 2;
    }

    fn write_byte(&mut self, byte: u8) {
        self.data.push(vec![byte]);
        self.size += 1;
    }

    /// Writes the header fields and finish the packet.
    /// This function should be only called when finishing a packet.
    ///
    /// The header format is based on RFC 1035 section 4.1.1:
    /// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
    //
    //                                  1  1  1  1  1  1
    //    0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                      ID                       |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    QDCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    ANCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    NSCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    ARCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //
    fn write_header(
        &mut self,
        id: u16,
        flags: u16,
        q_count: u16,
        a_count: u16,
        auth_count: u16,
        addi_count: u16,
    ) {
        self.insert_short(0, addi_count);
        self.insert_short(0, auth_count);
        self.insert_short(0, a_count);
        self.insert_short(0, q_count);
        self.insert_short(0, flags);
        self.insert_short(0, id);

        // Adjust the size as it was already initialized to include the header.
        self.size -= MSG_HEADER_LEN;
    }
}

/// Decoder of an incoming DNS packet.
struct DnsIncoming<'a> {
    offset: usize,
    data: &'a [u8],
}

impl<'a> DnsIncoming<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { offset: 0, data }
    }

    fn decode(mut self) -> Result<DnsMessage> {
        /*
        RFC 1035 section 4.1: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1

            +---------------------+
            |        Header       |
            +---------------------+
            |       Question      | the question for the name server
            +---------------------+
            |        Answer       | RRs answering the question
            +---------------------+
            |      Authority      | RRs pointing toward an authority
            +---------------------+
            |      Additional     | RRs holding additional information
            +---------------------+
         */
        let (header, counts) = self.read_header()?;
        let questions = self.read_questions(counts[0])?;
        let answers = self.read_rr_records(counts[1])?;
        let authorities = self.read_rr_records(counts[2])?;
        let additionals = self.read_rr_records(counts[3])?;

        Ok(DnsMessage {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    fn read_header(&mut self) -> Result<(DnsHeader, [u16; 4])> {
        if self.data.len() < MSG_HEADER_LEN {
            return Err(e_fmt!(
                "DNS incoming: header is too short: {} bytes",
                self.data.len()
            ));
        }

        let data = self.data;
        let header = DnsHeader {
            id: u16_from_be_slice(&data[..2]),
            flags: u16_from_be_slice(&data[2..4]),
        };
        let counts = [
            u16_from_be_slice(&data[4..6]),
            u16_from_be_slice(&data[6..8]),
            u16_from_be_slice(&data[8..10]),
            u16_from_be_slice(&data[10..12]),
        ];

        self.offset = MSG_HEADER_LEN;

        trace!(
            "read_header: id {}, {} questions {} answers {} authorities {} additionals",
            header.id,
            counts[0],
            counts[1],
            counts[2],
            counts[3]
        );
        Ok((header, counts))
    }

    fn read_questions(&mut self, count: u16) -> Result<Vec<DnsQuestion>> {
        let mut questions = Vec::new();
        for i in 0..count {
            let name = self.read_name()?;

            let data = &self.data[self.offset..];
            if data.len() < 4 {
                return Err(e_fmt!(
                    "DNS incoming: question idx {} too short: {}",
                    i,
                    data.len()
                ));
            }
            let ty = u16_from_be_slice(&data[..2]);
            let class = u16_from_be_slice(&data[2..4]);
            self.offset += 4;

            let masked_class = class & CLASS_MASK;
            if masked_class != CLASS_IN && masked_class != CLASS_ANY {
                trace!("question {} class {} ignored", &name, masked_class);
                continue;
            }

            let Some(qtype) = RRType::from_u16(ty) else {
                trace!("question {} qtype {} not supported", &name, ty);
                continue;
            };

            questions.push(DnsQuestion {
                name,
                qtype,
                unicast_response: (class & CLASS_UNICAST_RESPONSE) != 0,
            });
        }
        Ok(questions)
    }

    /// Decodes a sequence of RR records (in answers, authorities and additionals).
    fn read_rr_records(&mut self, count: u16) -> Result<Vec<Arc<DnsResource>>> {
        let mut rr_records = Vec::new();

        // RFC 1035: https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.1
        //
        // All RRs have the same top level format shown below:
        //                               1  1  1  1  1  1
        // 0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // /                      NAME                     /
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                      TYPE                     |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                     CLASS                     |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                      TTL                      |
        // |                                               |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                   RDLENGTH                    |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|
        // /                     RDATA                     /
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+

        // Must have at least TYPE, CLASS, TTL, RDLENGTH fields: 10 bytes.
        const RR_HEADER_REMAIN: usize = 10;

        for _ in 0..count {
            let name = self.read_name()?;
            let slice = &self.data[self.offset..];

            if slice.len() < RR_HEADER_REMAIN {
                return Err(e_fmt!(
                    "read_rr_records: RR '{}' is too short after name: {} bytes",
                    &name,
                    slice.len()
                ));
            }

            let ty = u16_from_be_slice(&slice[..2]);
            let class = u16_from_be_slice(&slice[2..4]);
            let ttl = u32_from_be_slice(&slice[4..8]);
            let rdata_len = u16_from_be_slice(&slice[8..10]) as usize;
            self.offset += RR_HEADER_REMAIN;
            let next_offset = self.offset + rdata_len;

            // Sanity check for RDATA length.
            if next_offset > self.data.len() {
                return Err(e_fmt!(
                    "RR {name} RDATA length {rdata_len} is invalid: remain data len: {}",
                    self.data.len() - self.offset
                ));
            }

            // decode RDATA based on the record type.
            let rdata = match RRType::from_u16(ty) {
                Some(RRType::A) => Some(DnsRData::A(Ipv4Addr::from(
                    self.read_array::<4>(rdata_len)?,
                ))),
                Some(RRType::AAAA) => Some(DnsRData::Aaaa(Ipv6Addr::from(
                    self.read_array::<16>(rdata_len)?,
                ))),
                Some(RRType::PTR) => Some(DnsRData::Ptr(self.read_name()?)),
                Some(RRType::SRV) => Some(DnsRData::Srv(DnsSrv {
                    priority: self.read_u16()?,
                    weight: self.read_u16()?,
                    port: self.read_u16()?,
                    target: self.read_name()?,
                })),
                Some(RRType::TXT) => Some(DnsRData::Txt(self.read_txt(next_offset)?)),
                _ => None,
            };

            match rdata {
                Some(rdata) => {
                    let record = DnsResource {
                        name,
                        class: class & CLASS_MASK,
                        cache_flush: (class & CLASS_CACHE_FLUSH) != 0,
                        ttl,
                        rdata,
                    };
                    trace!("read_rr_records: {}", &record);
                    rr_records.push(Arc::new(record));
                }
                None => {
                    trace!("Unsupported DNS record type: {} name: {}", ty, &name);
                    self.offset += rdata_len;
                }
            }

            // sanity check.
            if self.offset != next_offset {
                return Err(e_fmt!(
                    "read_rr_records: decode offset error for RData type {} offset: {} expected offset: {}",
                    ty, self.offset, next_offset,
                ));
            }
        }

        Ok(rr_records)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let slice = &self.data[self.offset..];
        if slice.len() < U16_SIZE {
            return Err(e_fmt!("read_u16: slice len is only {}", slice.len()));
        }
        let num = u16_from_be_slice(&slice[..U16_SIZE]);
        self.offset += U16_SIZE;
        Ok(num)
    }

    /// Reads a fixed size rdata, which must fill the whole RDLENGTH.
    fn read_array<const N: usize>(&mut self, rdata_len: usize) -> Result<[u8; N]> {
        if rdata_len != N {
            return Err(e_fmt!(
                "address rdata length {} while {} expected",
                rdata_len,
                N
            ));
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.data[self.offset..self.offset + N]);
        self.offset += N;
        Ok(bytes)
    }

    /// Reads character strings up to `end`.
    fn read_txt(&mut self, end: usize) -> Result<Vec<Vec<u8>>> {
        let mut strings = Vec::new();
        while self.offset < end {
            let length = self.data[self.offset] as usize;
            self.offset += 1;
            if self.offset + length > end {
                return Err(e_fmt!(
                    "TXT string of {} bytes overflows its rdata at offset {}",
                    length,
                    self.offset
                ));
            }
            strings.push(self.data[self.offset..self.offset + length].to_vec());
            self.offset += length;
        }
        Ok(strings)
    }

    /// Reads a domain name at the current location of `self.data`.
    ///
    /// See https://datatracker.ietf.org/doc/html/rfc1035#section-3.1 for
    /// domain name encoding.
    fn read_name(&mut self) -> Result<String> {
        let data = self.data;
        let start_offset = self.offset;
        let mut offset = start_offset;
        let mut name = "".to_string();
        let mut at_end = false;

        // Every pointer must go strictly backwards, which rules out loops.
        let mut pointer_limit = start_offset;

        // From RFC1035:
        // "...Domain names in messages are expressed in terms of a sequence of labels.
        // Each label is represented as a one octet length field followed by that
        // number of octets."
        //
        // "...The compression scheme allows a domain name in a message to be
        // represented as either:
        // - a sequence of labels ending in a zero octet
        // - a pointer
        // - a sequence of labels ending with a pointer"
        loop {
            if offset >= data.len() {
                return Err(e_fmt!(
                    "read_name: offset: {} data len {}",
                    offset,
                    data.len()
                ));
            }
            let length = data[offset];

            // From RFC1035:
            // "...Since every domain name ends with the null label of
            // the root, a domain name is terminated by a length byte of zero."
            if length == 0 {
                if !at_end {
                    self.offset = offset + 1;
                }
                break; // The end of the name
            }

            // Check the first 2 bits for possible "Message compression".
            match length & 0xC0 {
                0x00 => {
                    // regular utf8 string with length
                    offset += 1;
                    let ending = offset + length as usize;

                    // Never read beyond the whole data length.
                    if ending > data.len() {
                        return Err(e_fmt!(
                            "read_name: ending {} exceeds data length {}",
                            ending,
                            data.len()
                        ));
                    }

                    name += str::from_utf8(&data[offset..ending])
                        .map_err(|e| e_fmt!("read_name: from_utf8: {}", e))?;
                    name += ".";
                    offset += length as usize;

                    if name.len() > MAX_NAME_LEN {
                        return Err(e_fmt!("read_name: name too long: {} bytes", name.len()));
                    }
                }
                0xC0 => {
                    // Message compression.
                    // See https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
                    let slice = &data[offset..];
                    if slice.len() < U16_SIZE {
                        return Err(e_fmt!(
                            "read_name: u16 slice len is only {}",
                            slice.len()
                        ));
                    }
                    let pointer = (u16_from_be_slice(slice) ^ 0xC000) as usize;
                    if pointer >= pointer_limit {
                        // Error: could trigger an infinite loop.
                        return Err(e_fmt!(
                            "Invalid name compression: pointer {} must be less than {}",
                            &pointer,
                            &pointer_limit
                        ));
                    }
                    pointer_limit = pointer;

                    // A pointer marks the end of a domain name.
                    if !at_end {
                        self.offset = offset + U16_SIZE;
                        at_end = true;
                    }
                    offset = pointer;
                }
                _ => {
                    return Err(e_fmt!(
                        "Bad name with invalid length: 0x{:x} offset {}",
                        length,
                        offset
                    ));
                }
            };
        }

        // The root name.
        if name.is_empty() {
            name.push('.');
        }

        Ok(name)
    }
}

const fn u16_from_be_slice(bytes: &[u8]) -> u16 {
    let u8_array: [u8; 2] = [bytes[0], bytes[1]];
    u16::from_be_bytes(u8_array)
}

const fn u32_from_be_slice(s: &[u8]) -> u32 {
    let u8_array: [u8; 4] = [s[0], s[1], s[2], s[3]];
    u32::from_be_bytes(u8_array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample_response() -> DnsMessage {
        let mut msg = DnsMessage::response();
        msg.answers.push(Arc::new(DnsResource::new(
            "_printer._tcp.local.",
            4500,
            DnsRData::Ptr("office._printer._tcp.local.".to_string()),
        )));
        msg.answers.push(Arc::new(
            DnsResource::new(
                "office._printer._tcp.local.",
                120,
                DnsRData::Srv(DnsSrv {
                    priority: 0,
                    weight: 5,
                    port: 631,
                    target: "office.local.".to_string(),
                }),
            )
            .with_cache_flush(true),
        ));
        msg.answers.push(Arc::new(
            DnsResource::new(
                "office._printer._tcp.local.",
                4500,
                DnsRData::Txt(vec![b"rp=queue".to_vec(), b"color=T".to_vec()]),
            )
            .with_cache_flush(true),
        ));
        msg.additionals.push(Arc::new(DnsResource::address(
            "office.local.",
            120,
            "192.168.1.20".parse().unwrap(),
        )));
        msg.additionals.push(Arc::new(DnsResource::address(
            "office.local.",
            0,
            "fe80::1234".parse().unwrap(),
        )));
        msg
    }

    #[test]
    fn test_round_trip() {
        let mut msg = sample_response();
        msg.questions.push(DnsQuestion {
            name: "_printer._tcp.local.".to_string(),
            qtype: RRType::PTR,
            unicast_response: true,
        });

        let packets = msg.to_data_on_wire();
        assert_eq!(packets.len(), 1);

        let decoded = DnsMessage::from_bytes(&packets[0]).unwrap();
        assert_eq!(decoded, msg);

        // The goodbye survives as TTL 0.
        assert!(decoded.additionals[1].is_goodbye());
    }

    #[test]
    fn test_oversized_strings_are_left_out() {
        let long_txt = DnsResource::new(
            "office._printer._tcp.local.",
            4500,
            DnsRData::Txt(vec![vec![b'a'; MAX_TXT_STRING_LEN + 1]]),
        );
        let long_label = DnsResource::new(
            &format!("{}._printer._tcp.local.", "x".repeat(64)),
            4500,
            DnsRData::Ptr("office.local.".to_string()),
        );
        let full_txt = DnsResource::new(
            "office._printer._tcp.local.",
            4500,
            DnsRData::Txt(vec![vec![b'b'; MAX_TXT_STRING_LEN]]),
        );
        assert!(!long_txt.is_encodable());
        assert!(!long_label.is_encodable());
        assert!(full_txt.is_encodable());

        let mut msg = DnsMessage::response();
        msg.add_answer(Arc::new(long_txt));
        msg.add_answer(Arc::new(long_label));
        msg.add_answer(Arc::new(full_txt.clone()));

        let packets = msg.to_data_on_wire();
        assert_eq!(packets.len(), 1);
        let decoded = DnsMessage::from_bytes(&packets[0]).unwrap();
        assert_eq!(decoded.answers.len(), 1);
        assert_eq!(*decoded.answers[0], full_txt);

        let mut query = DnsMessage::query();
        query.add_question(&format!("{}.local.", "y".repeat(64)), RRType::A);
        query.add_question("office.local.", RRType::A);
        let decoded = DnsMessage::from_bytes(&query.to_data_on_wire()[0]).unwrap();
        assert_eq!(decoded.questions.len(), 1);
        assert_eq!(decoded.questions[0].name, "office.local.");
    }

    #[test]
    fn test_name_compression() {
        let msg = sample_response();
        let packet = &msg.to_data_on_wire()[0];

        // "local" appears in every name but is written only once.
        let count = packet.windows(5).filter(|w| w == b"local").count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_truncated_input() {
        let msg = sample_response();
        let packet = &msg.to_data_on_wire()[0];

        assert!(DnsMessage::from_bytes(&packet[..5]).is_err());
        assert!(DnsMessage::from_bytes(&packet[..packet.len() - 3]).is_err());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        // A header with one question whose name points to itself.
        let mut data = vec![0u8, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1]);
        assert!(DnsMessage::from_bytes(&data).is_err());
    }

    #[test]
    fn test_unsupported_type_skipped() {
        let mut data = vec![0x00, 0x00, 0x84, 0x00, 0, 0, 0, 2, 0, 0, 0, 0];
        // HINFO record for "a.": type 13, class IN, ttl 1, rdata 2 empty strings.
        data.extend_from_slice(&[1, b'a', 0, 0, 13, 0, 1, 0, 0, 0, 1, 0, 2, 0, 0]);
        // A record for "a.": pointer to the name above.
        data.extend_from_slice(&[0xC0, 12, 0, 1, 0x80, 1, 0, 0, 0, 120, 0, 4, 10, 0, 0, 1]);

        let msg = DnsMessage::from_bytes(&data).unwrap();
        assert!(msg.is_response());
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.answers[0].name, "a.");
        assert!(msg.answers[0].cache_flush);
        assert_eq!(
            msg.answers[0].ip_address(),
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_known_answers_split_into_truncated_packets() {
        let mut query = DnsMessage::query();
        query.add_question("_many._tcp.local.", RRType::PTR);
        for i in 0..400 {
            query.answers.push(Arc::new(DnsResource::new(
                "_many._tcp.local.",
                4500,
                DnsRData::Ptr(format!("instance-with-a-long-name-{:04}._many._tcp.local.", i)),
            )));
        }

        let packets = query.to_data_on_wire();
        assert!(packets.len() > 1);

        let mut total_answers = 0;
        for (i, packet) in packets.iter().enumerate() {
            assert!(packet.len() <= MAX_MSG_ABSOLUTE);
            let msg = DnsMessage::from_bytes(packet).unwrap();
            let last = i == packets.len() - 1;
            assert_eq!(msg.header.is_truncated(), !last);
            assert_eq!(msg.questions.len(), if i == 0 { 1 } else { 0 });
            total_answers += msg.answers.len();
        }
        assert_eq!(total_answers, 400);
    }

    #[test]
    fn test_tiebreak_compare() {
        let low = DnsResource::address("host.local.", 120, "10.0.0.1".parse().unwrap());
        let high = DnsResource::address("host.local.", 120, "10.0.0.2".parse().unwrap());
        assert_eq!(low.compare(&high), cmp::Ordering::Less);
        assert_eq!(high.compare(&low), cmp::Ordering::Greater);
        assert_eq!(low.compare(&low.clone().with_ttl(1)), cmp::Ordering::Equal);
    }
}
