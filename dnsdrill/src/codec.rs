//! `DnsCodec`: wire-format construction, TSIG signing, and RCODE naming.
//!
//! The load-generation core treats message bytes as opaque and only
//! inspects the first four bytes of a response (see [`crate::receiver`]).
//! This module targets exactly what `build_request` needs: constructing a
//! query or RFC 2136 dynamic update from one line of input text,
//! optionally with EDNS0/DNSSEC-OK and a TSIG signature. It is not a
//! resolver and does not parse responses beyond what the core already
//! does.

use anyhow::{Context as _, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

/// Opaque handle mirroring a `create_ctx`/`destroy_ctx` pair. Rust's
/// ownership model makes an explicit `destroy_ctx` unnecessary (`Ctx`
/// cleans up on drop), but the constructor is kept to match the
/// documented interface.
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    is_update: bool,
}

pub fn create_ctx(is_update: bool) -> Ctx {
    Ctx { is_update }
}

const QCLASS_IN: u16 = 1;
const TYPE_OPT: u16 = 41;
const TYPE_TSIG: u16 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigAlgorithm {
    HmacMd5,
    HmacSha1,
    HmacSha256,
}

impl TsigAlgorithm {
    fn wire_name(self) -> &'static str {
        match self {
            TsigAlgorithm::HmacMd5 => "hmac-md5.sig-alg.reg.int",
            TsigAlgorithm::HmacSha1 => "hmac-sha1",
            TsigAlgorithm::HmacSha256 => "hmac-sha256",
        }
    }

    fn mac_len(self) -> usize {
        match self {
            TsigAlgorithm::HmacMd5 => 16,
            TsigAlgorithm::HmacSha1 => 20,
            TsigAlgorithm::HmacSha256 => 32,
        }
    }
}

/// A parsed `[alg:]name:secret` TSIG key specification.
#[derive(Debug, Clone)]
pub struct TsigKey {
    pub algorithm: TsigAlgorithm,
    pub name: String,
    pub secret: Vec<u8>,
}

impl TsigKey {
    /// Parses `spec = "[alg:]name:secret"`. `secret` is base64-encoded, as
    /// produced by `dnssec-keygen`/`tsig-keygen`-style tooling. When
    /// `alg` is omitted, `hmac-sha256` is assumed.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();

        let (algorithm, name, secret) = match parts.as_slice() {
            [alg, name, secret] => (parse_algorithm(alg)?, *name, *secret),
            [name, secret] => (TsigAlgorithm::HmacSha256, *name, *secret),
            _ => bail!("TSIG key must be `[alg:]name:secret`, got `{spec}`"),
        };

        ensure_non_empty(name, "TSIG key name")?;
        ensure_non_empty(secret, "TSIG key secret")?;

        let secret = BASE64
            .decode(secret)
            .context("Failed to decode TSIG secret as base64")?;

        Ok(Self {
            algorithm,
            name: name.to_string(),
            secret,
        })
    }
}

fn parse_algorithm(alg: &str) -> Result<TsigAlgorithm> {
    match alg.to_ascii_lowercase().as_str() {
        "hmac-md5" => Ok(TsigAlgorithm::HmacMd5),
        "hmac-sha1" => Ok(TsigAlgorithm::HmacSha1),
        "hmac-sha256" => Ok(TsigAlgorithm::HmacSha256),
        other => bail!("Unknown TSIG algorithm `{other}`"),
    }
}

fn ensure_non_empty(s: &str, what: &str) -> Result<()> {
    if s.is_empty() {
        bail!("{what} must not be empty");
    }
    Ok(())
}

/// Human-readable RCODE names for final-statistics formatting, indexed by
/// the 4-bit RCODE the core extracts from every response.
pub const RCODE_STRINGS: [&str; 16] = [
    "NOERROR",
    "FORMERR",
    "SERVFAIL",
    "NXDOMAIN",
    "NOTIMP",
    "REFUSED",
    "YXDOMAIN",
    "YXRRSET",
    "NXRRSET",
    "NOTAUTH",
    "NOTZONE",
    "RCODE11",
    "RCODE12",
    "RCODE13",
    "RCODE14",
    "RCODE15",
];

struct Record<'a> {
    name: &'a str,
    rtype: u16,
}

struct UpdateRecord<'a> {
    name: &'a str,
    ttl: u32,
    rtype: u16,
    rdata: &'a str,
}

/// Builds a DNS query or dynamic update into `out`, consuming `record` as
/// one line of input text. `id` becomes both the transaction ID and (by
/// construction, see [`crate::slot::SlotTable`]) the slot index it was
/// reserved from.
///
/// Query lines look like `"<name> <type>"` (e.g. `"www.example.com A"`).
/// Update lines look like `"<name> <ttl> <type> <rdata>"` and are encoded
/// as an RFC 2136 "add an RRset" update against `<name>`'s zone.
pub fn build_request(
    ctx: Ctx,
    record: &str,
    id: u16,
    edns: bool,
    dnssec: bool,
    tsig: Option<&TsigKey>,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.clear();

    if ctx.is_update {
        let rec = parse_update_line(record)?;
        build_update(&rec, id, out)?;
    } else {
        let rec = parse_query_line(record)?;
        build_query(&rec, id, out)?;
    }

    if edns || dnssec {
        append_opt_record(out, dnssec)?;
    }

    if let Some(key) = tsig {
        append_tsig_record(out, key)?;
    }

    Ok(())
}

fn parse_query_line(line: &str) -> Result<Record<'_>> {
    let mut fields = line.split_whitespace();
    let name = fields
        .next()
        .filter(|s| !s.is_empty())
        .with_context(|| format!("Malformed query line: `{line}`"))?;
    let rtype = fields
        .next()
        .map(qtype_from_str)
        .transpose()?
        .unwrap_or(1); // default to A

    Ok(Record { name, rtype })
}

fn parse_update_line(line: &str) -> Result<UpdateRecord<'_>> {
    let mut fields = line.split_whitespace();
    let name = fields
        .next()
        .with_context(|| format!("Malformed update line: `{line}`"))?;
    let ttl: u32 = fields
        .next()
        .with_context(|| format!("Malformed update line (missing TTL): `{line}`"))?
        .parse()
        .with_context(|| format!("Malformed update line (bad TTL): `{line}`"))?;
    let rtype = fields
        .next()
        .with_context(|| format!("Malformed update line (missing type): `{line}`"))
        .and_then(|s| qtype_from_str(s))?;
    let rdata = fields.next().unwrap_or("");

    Ok(UpdateRecord {
        name,
        ttl,
        rtype,
        rdata,
    })
}

fn qtype_from_str(s: &str) -> Result<u16> {
    Ok(match s.to_ascii_uppercase().as_str() {
        "A" => 1,
        "NS" => 2,
        "CNAME" => 5,
        "SOA" => 6,
        "PTR" => 12,
        "MX" => 15,
        "TXT" => 16,
        "AAAA" => 28,
        "SRV" => 33,
        "ANY" => 255,
        other => bail!("Unknown record type `{other}`"),
    })
}

fn build_query(rec: &Record<'_>, id: u16, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&[0x01, 0x00]); // RD=1, opcode=QUERY
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    encode_name(rec.name, out)?;
    out.extend_from_slice(&rec.rtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(())
}

fn build_update(rec: &UpdateRecord<'_>, id: u16, out: &mut Vec<u8>) -> Result<()> {
    const OPCODE_UPDATE: u16 = 5 << 11;

    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&OPCODE_UPDATE.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // ZOCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // PRCOUNT
    out.extend_from_slice(&1u16.to_be_bytes()); // UPCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ADCOUNT

    // Zone section: the owner name's immediate parent zone, SOA/IN.
    let zone = rec.name.split_once('.').map(|(_, rest)| rest).unwrap_or(rec.name);
    encode_name(zone, out)?;
    out.extend_from_slice(&6u16.to_be_bytes()); // TYPE=SOA
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());

    // Update section: add one RR to the RRset.
    encode_name(rec.name, out)?;
    out.extend_from_slice(&rec.rtype.to_be_bytes());
    out.extend_from_slice(&QCLASS_IN.to_be_bytes());
    out.extend_from_slice(&rec.ttl.to_be_bytes());
    let rdata = rec.rdata.as_bytes();
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(rdata);

    Ok(())
}

fn append_opt_record(out: &mut Vec<u8>, dnssec: bool) -> Result<()> {
    const MAX_EDNS_PAYLOAD: u16 = 4096;

    bump_arcount(out)?;

    out.push(0x00); // root name
    out.extend_from_slice(&TYPE_OPT.to_be_bytes());
    out.extend_from_slice(&MAX_EDNS_PAYLOAD.to_be_bytes()); // "class" = UDP payload size
    let flags: u32 = if dnssec { 0x8000_0000 } else { 0 }; // extended-rcode(0) | version(0) | DO bit
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // RDLENGTH

    Ok(())
}

/// Appends an RFC 2845 TSIG resource record, signing everything written to
/// `out` so far (the original message) together with the TSIG variables.
fn append_tsig_record(out: &mut Vec<u8>, key: &TsigKey) -> Result<()> {
    bump_arcount(out)?;

    let time_signed: u64 = 0; // a loadtest has no use for clock-skew rejection
    let fudge: u16 = 300;

    let mut signed = Vec::with_capacity(out.len() + 64);
    signed.extend_from_slice(out);
    encode_name(&key.name, &mut signed)?;
    signed.extend_from_slice(&QCLASS_IN.to_be_bytes()); // ANY-class in TSIG's own record class slot
    signed.extend_from_slice(&0u32.to_be_bytes()); // TTL
    encode_name(key.algorithm.wire_name(), &mut signed)?;
    signed.extend_from_slice(&time_signed.to_be_bytes()[2..]); // 48-bit time
    signed.extend_from_slice(&fudge.to_be_bytes());
    signed.extend_from_slice(&0u16.to_be_bytes()); // error
    signed.extend_from_slice(&0u16.to_be_bytes()); // other len

    let mac = sign(key, &signed)?;

    encode_name(&key.name, out)?;
    out.extend_from_slice(&TYPE_TSIG.to_be_bytes());
    out.extend_from_slice(&255u16.to_be_bytes()); // CLASS=ANY
    out.extend_from_slice(&0u32.to_be_bytes()); // TTL

    let mut rdata = Vec::new();
    encode_name(key.algorithm.wire_name(), &mut rdata)?;
    rdata.extend_from_slice(&time_signed.to_be_bytes()[2..]);
    rdata.extend_from_slice(&fudge.to_be_bytes());
    rdata.extend_from_slice(&(mac.len() as u16).to_be_bytes());
    rdata.extend_from_slice(&mac);
    rdata.extend_from_slice(&0u16.to_be_bytes()); // original ID already matches, omitted for brevity
    rdata.extend_from_slice(&0u16.to_be_bytes()); // error
    rdata.extend_from_slice(&0u16.to_be_bytes()); // other len

    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(&rdata);

    Ok(())
}

fn sign(key: &TsigKey, data: &[u8]) -> Result<Vec<u8>> {
    let mac = match key.algorithm {
        TsigAlgorithm::HmacSha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(&key.secret).context("Invalid TSIG key length")?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        TsigAlgorithm::HmacSha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(&key.secret).context("Invalid TSIG key length")?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        TsigAlgorithm::HmacMd5 => {
            bail!("hmac-md5 TSIG signing is not supported by this build")
        }
    };

    debug_assert_eq!(mac.len(), key.algorithm.mac_len());
    Ok(mac)
}

/// Header count fields share layout between queries (ARCOUNT) and updates
/// (ADCOUNT); both are the last 16-bit field of the 12-byte header.
fn bump_arcount(out: &mut [u8]) -> Result<()> {
    if out.len() < 12 {
        bail!("message header missing before appending additional records");
    }
    let count = u16::from_be_bytes([out[10], out[11]]);
    let bumped = count.checked_add(1).context("too many additional records")?;
    out[10..12].copy_from_slice(&bumped.to_be_bytes());
    Ok(())
}

fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    let trimmed = name.trim_end_matches('.');

    if trimmed.is_empty() {
        out.push(0);
        return Ok(());
    }

    for label in trimmed.split('.') {
        ensure_non_empty(label, "DNS label")?;
        if label.len() > 63 {
            bail!("DNS label `{label}` exceeds 63 bytes");
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_query_with_matching_id() {
        let mut out = Vec::new();
        build_request(
            create_ctx(false),
            "www.example.com A",
            0x1234,
            false,
            false,
            None,
            &mut out,
        )
        .unwrap();

        assert_eq!(u16::from_be_bytes([out[0], out[1]]), 0x1234);
        assert_eq!(&out[4..6], &1u16.to_be_bytes()); // QDCOUNT
    }

    #[test]
    fn edns_sets_arcount_and_do_bit() {
        let mut out = Vec::new();
        build_request(
            create_ctx(false),
            "example.com AAAA",
            1,
            true,
            true,
            None,
            &mut out,
        )
        .unwrap();

        assert_eq!(&out[10..12], &1u16.to_be_bytes()); // ARCOUNT
        assert!(out.ends_with(&0u16.to_be_bytes())); // RDLENGTH = 0
    }

    #[test]
    fn malformed_line_is_rejected() {
        let mut out = Vec::new();
        let err = build_request(create_ctx(false), "", 1, false, false, None, &mut out);
        assert!(err.is_err());
    }

    #[test]
    fn tsig_key_parses_with_and_without_algorithm() {
        let key = TsigKey::parse("hmac-sha1:mykey:c2VjcmV0").unwrap();
        assert_eq!(key.algorithm, TsigAlgorithm::HmacSha1);
        assert_eq!(key.name, "mykey");
        assert_eq!(key.secret, b"secret");

        let key = TsigKey::parse("mykey:c2VjcmV0").unwrap();
        assert_eq!(key.algorithm, TsigAlgorithm::HmacSha256);
    }

    #[test]
    fn tsig_signing_appends_a_record_and_bumps_arcount() {
        let mut out = Vec::new();
        build_request(create_ctx(false), "example.com A", 2, false, false, None, &mut out).unwrap();
        let before = out.len();

        let key = TsigKey::parse("mykey:c2VjcmV0").unwrap();
        append_tsig_record(&mut out, &key).unwrap();

        assert!(out.len() > before);
        assert_eq!(&out[10..12], &1u16.to_be_bytes());
    }

    #[test]
    fn update_line_builds_rfc2136_update_opcode() {
        let mut out = Vec::new();
        build_request(
            create_ctx(true),
            "host.example.com 300 A 203.0.113.5",
            7,
            false,
            false,
            None,
            &mut out,
        )
        .unwrap();

        let flags = u16::from_be_bytes([out[2], out[3]]);
        assert_eq!((flags >> 11) & 0b1111, 5);
    }
}
