//! The mail model: message structure, the B2F text envelope, and the store adapter.
//!
//! A message travels (and is persisted) as its B2F envelope — header lines, a blank separator,
//! the body, then attachment data per the declared `File:` lengths:
//!
//! ```notrust
//! Mid: ABC123DEF456
//! Date: 2026/08/01 12:34
//! Type: Private
//! From: N0CALL
//! To: W1AW
//! Subject: greetings
//! Mbo: N0CALL
//! Body: 5
//! File: 3 a.bin
//!
//! hello
//! <3 bytes>
//! ```
//!
//! The store encoding prefixes two bookkeeping bytes (mailbox, flags) that are not part of the
//! wire form.

use crate::ax25::Callsign;
use crate::store::Store;
use crate::Error;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt::Write;
use rand_core::RngCore;

/// Key prefix of the mail table.
const TABLE_PREFIX: &str = "winlink-mails-";

/// A 12-character message identifier.
pub type MessageId = heapless::String<12>;

bitflags! {
    /// Per-mail state bits.
    pub struct MailFlags: u8 {
        const UNREAD  = 1 << 0;
        const PRIVATE = 1 << 1;
        const P2P     = 1 << 2;
    }
}

/// Which mailbox a message sits in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mailbox {
    Inbox = 0,
    Outbox = 1,
    Draft = 2,
    Sent = 3,
    Archive = 4,
    Trash = 5,
}

impl Mailbox {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Mailbox::Inbox,
            1 => Mailbox::Outbox,
            2 => Mailbox::Draft,
            3 => Mailbox::Sent,
            4 => Mailbox::Archive,
            5 => Mailbox::Trash,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

/// One mail message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinlinkMail {
    pub mid: MessageId,
    /// UTC, seconds since the Unix epoch (minute precision on the wire).
    pub date: u64,
    /// Callsign or `callsign@winlink.org` style address.
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: Vec<u8>,
    pub attachments: Vec<Attachment>,
    pub flags: MailFlags,
    pub mailbox: Mailbox,
}

impl WinlinkMail {
    /// Creates an outbound private mail sitting in the outbox.
    pub fn outbound(mid: MessageId, date: u64, from: &str, to: &str, subject: &str, body: Vec<u8>) -> Self {
        WinlinkMail {
            mid,
            date,
            from: from.to_string(),
            to: alloc::vec![to.to_string()],
            cc: Vec::new(),
            subject: subject.to_string(),
            body,
            attachments: Vec::new(),
            flags: MailFlags::PRIVATE,
            mailbox: Mailbox::Outbox,
        }
    }

    /// Whether any recipient resolves to `callsign`.
    pub fn addressed_to(&self, callsign: &Callsign) -> bool {
        self.to
            .iter()
            .chain(self.cc.iter())
            .any(|addr| recipient_callsign(addr).map_or(false, |c| c == *callsign))
    }

    /// Renders the B2F envelope.
    pub fn to_b2f(&self) -> Vec<u8> {
        let mut head = String::new();
        let _ = write!(head, "Mid: {}\r\n", self.mid);
        let _ = write!(head, "Date: {}\r\n", format_date(self.date));
        let type_name = if self.flags.contains(MailFlags::PRIVATE) {
            "Private"
        } else {
            "Traffic"
        };
        let _ = write!(head, "Type: {}\r\n", type_name);
        let _ = write!(head, "From: {}\r\n", self.from);
        for to in &self.to {
            let _ = write!(head, "To: {}\r\n", to);
        }
        for cc in &self.cc {
            let _ = write!(head, "Cc: {}\r\n", cc);
        }
        let _ = write!(head, "Subject: {}\r\n", self.subject);
        let _ = write!(head, "Mbo: {}\r\n", mbo_of(&self.from));
        let _ = write!(head, "Body: {}\r\n", self.body.len());
        for att in &self.attachments {
            let _ = write!(head, "File: {} {}\r\n", att.data.len(), att.name);
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        for att in &self.attachments {
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&att.data);
        }
        out
    }

    /// Parses a B2F envelope into an inbox mail.
    pub fn from_b2f(data: &[u8]) -> Result<Self, Error> {
        let mut mail = WinlinkMail {
            mid: MessageId::new(),
            date: 0,
            from: String::new(),
            to: Vec::new(),
            cc: Vec::new(),
            subject: String::new(),
            body: Vec::new(),
            attachments: Vec::new(),
            flags: MailFlags::UNREAD,
            mailbox: Mailbox::Inbox,
        };
        let mut body_len = 0usize;
        let mut file_specs: Vec<(usize, String)> = Vec::new();

        let mut pos = 0usize;
        loop {
            let line_end = data[pos..]
                .iter()
                .position(|&b| b == b'\r' || b == b'\n')
                .map(|i| pos + i)
                .ok_or(Error::IncompleteParse)?;
            let line = core::str::from_utf8(&data[pos..line_end])
                .map_err(|_| Error::InvalidValue)?;
            // Step over CRLF or a lone terminator.
            pos = if data.get(line_end) == Some(&b'\r') && data.get(line_end + 1) == Some(&b'\n') {
                line_end + 2
            } else {
                line_end + 1
            };
            if line.is_empty() {
                break;
            }
            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            };
            if key.eq_ignore_ascii_case("Mid") {
                for c in value.chars().take(12) {
                    let _ = mail.mid.push(c);
                }
            } else if key.eq_ignore_ascii_case("Date") {
                mail.date = parse_date(value).unwrap_or(0);
            } else if key.eq_ignore_ascii_case("Type") {
                if value.eq_ignore_ascii_case("Private") {
                    mail.flags |= MailFlags::PRIVATE;
                }
            } else if key.eq_ignore_ascii_case("From") {
                mail.from = value.to_string();
            } else if key.eq_ignore_ascii_case("To") {
                mail.to.push(value.to_string());
            } else if key.eq_ignore_ascii_case("Cc") {
                mail.cc.push(value.to_string());
            } else if key.eq_ignore_ascii_case("Subject") {
                mail.subject = value.to_string();
            } else if key.eq_ignore_ascii_case("Body") {
                body_len = value.parse().map_err(|_| Error::InvalidValue)?;
            } else if key.eq_ignore_ascii_case("File") {
                let (len, name) = value.split_once(' ').ok_or(Error::InvalidValue)?;
                let len = len.parse().map_err(|_| Error::InvalidValue)?;
                file_specs.push((len, name.to_string()));
            }
        }

        if mail.mid.is_empty() || mail.to.is_empty() {
            return Err(Error::InvalidValue);
        }
        if data.len() < pos + body_len {
            return Err(Error::InvalidLength);
        }
        mail.body = data[pos..pos + body_len].to_vec();
        pos += body_len;
        for (len, name) in file_specs {
            // Attachment data is separated from what precedes it by CRLF.
            if data.get(pos) == Some(&b'\r') {
                pos += 1;
            }
            if data.get(pos) == Some(&b'\n') {
                pos += 1;
            }
            if data.len() < pos + len {
                return Err(Error::InvalidLength);
            }
            mail.attachments.push(Attachment {
                name,
                data: data[pos..pos + len].to_vec(),
            });
            pos += len;
        }
        Ok(mail)
    }
}

/// Extracts the bare callsign of a recipient (`W1AW`, `W1AW-5`, `w1aw@winlink.org`).
pub fn recipient_callsign(addr: &str) -> Option<Callsign> {
    let bare = addr.split('@').next()?.trim();
    Callsign::parse(bare).ok()
}

fn mbo_of(from: &str) -> String {
    recipient_callsign(from)
        .map(|c| c.to_string())
        .unwrap_or_else(|| from.to_string())
}

/// Draws a fresh 12-character alphanumeric message-ID.
pub fn generate_mid<R: RngCore>(rng: &mut R) -> MessageId {
    const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut mid = MessageId::new();
    for _ in 0..12 {
        let c = ALPHABET[(rng.next_u32() % 36) as usize];
        let _ = mid.push(c as char);
    }
    mid
}

/// Formats epoch seconds as the `YYYY/MM/DD HH:MM` B2F date line.
pub fn format_date(epoch: u64) -> heapless::String<16> {
    let days = (epoch / 86_400) as i64;
    let secs = epoch % 86_400;
    let (y, m, d) = civil_from_days(days);
    let mut out = heapless::String::new();
    let _ = write!(
        out,
        "{:04}/{:02}/{:02} {:02}:{:02}",
        y,
        m,
        d,
        secs / 3600,
        (secs % 3600) / 60
    );
    out
}

/// Parses a `YYYY/MM/DD HH:MM` date line back to epoch seconds.
pub fn parse_date(s: &str) -> Option<u64> {
    let b = s.as_bytes();
    if b.len() < 16 || b[4] != b'/' || b[7] != b'/' || b[10] != b' ' || b[13] != b':' {
        return None;
    }
    let num = |range: core::ops::Range<usize>| -> Option<u64> {
        s.get(range)?.parse().ok()
    };
    let (y, m, d) = (num(0..4)?, num(5..7)?, num(8..10)?);
    let (hh, mm) = (num(11..13)?, num(14..16)?);
    if m == 0 || m > 12 || d == 0 || d > 31 || hh > 23 || mm > 59 {
        return None;
    }
    let days = days_from_civil(y as i64, m as u32, d as u32);
    if days < 0 {
        return None;
    }
    Some(days as u64 * 86_400 + hh * 3600 + mm * 60)
}

/// Gregorian date from days since 1970-01-01 (civil calendar algorithm).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Days since 1970-01-01 for a Gregorian date.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 } as i64;
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

// --- store adapter ---

fn key_of(mid: &str) -> String {
    format!("{}{}", TABLE_PREFIX, mid)
}

/// Persists a mail (mailbox and flag bytes, then the B2F envelope).
pub fn save_mail<S: Store>(store: &mut S, mail: &WinlinkMail) -> bool {
    let mut record = Vec::new();
    record.push(mail.mailbox as u8);
    record.push(mail.flags.bits());
    record.extend_from_slice(&mail.to_b2f());
    store.save(&key_of(&mail.mid), &record)
}

/// Loads one mail by message-ID.
pub fn load_mail<S: Store>(store: &S, mid: &str) -> Option<WinlinkMail> {
    let record = store.load(&key_of(mid))?;
    if record.len() < 2 {
        return None;
    }
    let mut mail = WinlinkMail::from_b2f(&record[2..]).ok()?;
    mail.mailbox = Mailbox::from_u8(record[0])?;
    mail.flags = MailFlags::from_bits_truncate(record[1]);
    Some(mail)
}

/// Whether a message-ID is already known (dedup for inbound proposals).
pub fn contains_mid<S: Store>(store: &S, mid: &str) -> bool {
    store.load(&key_of(mid)).is_some()
}

/// All outbox mail addressed to `peer`.
pub fn pending_for<S: Store>(store: &S, peer: &Callsign) -> Vec<WinlinkMail> {
    let mut out = Vec::new();
    for key in store.list(TABLE_PREFIX) {
        let mid = &key[TABLE_PREFIX.len()..];
        if let Some(mail) = load_mail(store, mid) {
            if mail.mailbox == Mailbox::Outbox && mail.addressed_to(peer) {
                out.push(mail);
            }
        }
    }
    out
}

/// Moves a mail to the sent mailbox after a completed transfer.
pub fn mark_sent<S: Store>(store: &mut S, mid: &str) -> bool {
    match load_mail(store, mid) {
        Some(mut mail) => {
            mail.mailbox = Mailbox::Sent;
            save_mail(store, &mail)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::testutil::NullRng;

    fn sample() -> WinlinkMail {
        let mut mid = MessageId::new();
        let _ = mid.push_str("ABC123DEF456");
        let mut mail = WinlinkMail::outbound(
            mid,
            1_754_042_040,
            "N0CALL",
            "W1AW@winlink.org",
            "greetings",
            b"hello there\r\n73".to_vec(),
        );
        mail.attachments.push(Attachment {
            name: String::from("pos.bin"),
            data: alloc::vec![1, 2, 3, 4],
        });
        mail
    }

    #[test]
    fn date_roundtrip() {
        for &epoch in &[0u64, 1_754_042_040, 4_102_444_740] {
            let s = format_date(epoch);
            let back = parse_date(&s).unwrap();
            // Minute precision on the wire.
            assert_eq!(back, epoch - epoch % 60, "{}", s);
        }
        assert_eq!(format_date(0).as_str(), "1970/01/01 00:00");
        assert!(parse_date("garbage").is_none());
    }

    #[test]
    fn b2f_roundtrip() {
        let mail = sample();
        let wire = mail.to_b2f();
        let text = core::str::from_utf8(&wire[..wire.len() - 6]).unwrap();
        assert!(text.starts_with("Mid: ABC123DEF456\r\n"));
        assert!(text.contains("Type: Private\r\n"));
        assert!(text.contains("Body: 15\r\n"));
        assert!(text.contains("File: 4 pos.bin\r\n"));

        let back = WinlinkMail::from_b2f(&wire).unwrap();
        assert_eq!(back.mid, mail.mid);
        assert_eq!(back.from, "N0CALL");
        assert_eq!(back.to, mail.to);
        assert_eq!(back.subject, "greetings");
        assert_eq!(back.body, mail.body);
        assert_eq!(back.attachments, mail.attachments);
        assert_eq!(back.date, mail.date - mail.date % 60);
        assert!(back.flags.contains(MailFlags::PRIVATE));
    }

    #[test]
    fn recipient_parsing() {
        let w1aw = Callsign::parse("W1AW").unwrap();
        assert_eq!(recipient_callsign("W1AW"), Some(w1aw.clone()));
        assert_eq!(recipient_callsign("w1aw@winlink.org"), Some(w1aw.clone()));
        assert_eq!(recipient_callsign("SMTP:someone"), None);

        let mail = sample();
        assert!(mail.addressed_to(&w1aw));
        assert!(!mail.addressed_to(&Callsign::parse("N0CALL").unwrap()));
    }

    #[test]
    fn store_lifecycle() {
        let mut store = MemStore::new();
        let mail = sample();
        assert!(save_mail(&mut store, &mail));
        assert!(contains_mid(&store, "ABC123DEF456"));
        assert!(!contains_mid(&store, "UNKNOWN"));

        let peer = Callsign::parse("W1AW").unwrap();
        let pending = pending_for(&store, &peer);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].subject, "greetings");

        assert!(mark_sent(&mut store, "ABC123DEF456"));
        assert!(pending_for(&store, &peer).is_empty());
        assert_eq!(
            load_mail(&store, "ABC123DEF456").unwrap().mailbox,
            Mailbox::Sent
        );
    }

    #[test]
    fn generated_mid_shape() {
        let mut rng = NullRng(7);
        let mid = generate_mid(&mut rng);
        assert_eq!(mid.len(), 12);
        assert!(mid.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
}
