//! APRS messages: the `:ADDRESSEE:text{seq` format, acknowledgements, and the APRS-IS
//! login hash used to authenticate an internet-side session.

use crate::Error;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

/// What a message payload conveys.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary text for the addressee.
    Text,
    /// `ack<seq>`: the addressee confirms reception of our message `seq`.
    Ack,
    /// `rej<seq>`: the addressee refuses our message `seq`.
    Reject,
}

/// A decoded message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AprsMessage {
    /// Target station (or bulletin group), up to 9 characters.
    pub addressee: heapless::String<9>,
    pub text: String,
    /// Sequence tag the sender wants acknowledged, up to 5 characters.
    pub seq: Option<heapless::String<5>>,
    pub kind: MessageKind,
}

impl AprsMessage {
    /// Parses an information field starting with `:`.
    pub fn parse(info: &[u8]) -> Result<Self, Error> {
        // ":" addressee(9) ":" text ["{" seq]
        if info.len() < 11 || info[0] != b':' || info[10] != b':' {
            return Err(Error::InvalidLength);
        }
        let mut addressee = heapless::String::new();
        for &b in info[1..10].iter() {
            if b == b' ' {
                break;
            }
            if !b.is_ascii_graphic() {
                return Err(Error::InvalidValue);
            }
            addressee.push(b as char).map_err(|_| Error::InvalidLength)?;
        }
        if addressee.is_empty() {
            return Err(Error::InvalidValue);
        }

        let body = &info[11..];
        // The sequence tag follows the *last* '{' so text may contain the character.
        let (text_bytes, seq) = match body.iter().rposition(|&b| b == b'{') {
            Some(idx) => {
                let mut seq = heapless::String::new();
                for &b in &body[idx + 1..] {
                    if !b.is_ascii_graphic() {
                        return Err(Error::InvalidValue);
                    }
                    seq.push(b as char).map_err(|_| Error::InvalidLength)?;
                }
                (&body[..idx], Some(seq))
            }
            None => (body, None),
        };
        let text = String::from_utf8_lossy(text_bytes).into_owned();

        // `ack`/`rej` replies carry their sequence inline rather than in a `{seq` suffix.
        let mut kind = MessageKind::Text;
        let mut seq = seq;
        if seq.is_none() {
            if let Some(s) = text.strip_prefix("ack").and_then(seq_tag) {
                kind = MessageKind::Ack;
                seq = Some(s);
            } else if let Some(s) = text.strip_prefix("rej").and_then(seq_tag) {
                kind = MessageKind::Reject;
                seq = Some(s);
            }
        }

        Ok(AprsMessage {
            addressee,
            text,
            seq,
            kind,
        })
    }

    /// Encodes the message back to an information field.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(b':');
        out.extend_from_slice(self.addressee.as_bytes());
        out.resize(10, b' ');
        out.push(b':');
        match self.kind {
            MessageKind::Ack | MessageKind::Reject => {
                out.extend_from_slice(self.text.as_bytes());
            }
            MessageKind::Text => {
                out.extend_from_slice(self.text.as_bytes());
                if let Some(seq) = &self.seq {
                    out.push(b'{');
                    out.extend_from_slice(seq.as_bytes());
                }
            }
        }
        out
    }

    /// Builds the acknowledgement record for a received message carrying `seq`.
    pub fn ack_for(&self) -> Option<AprsMessage> {
        self.reply_record("ack", MessageKind::Ack)
    }

    /// Builds the rejection record for a received message carrying `seq`.
    pub fn reject_for(&self) -> Option<AprsMessage> {
        self.reply_record("rej", MessageKind::Reject)
    }

    fn reply_record(&self, verb: &str, kind: MessageKind) -> Option<AprsMessage> {
        let seq = self.seq.as_ref()?;
        let mut text = String::new();
        let _ = write!(text, "{}{}", verb, seq);
        Some(AprsMessage {
            addressee: self.addressee.clone(),
            text,
            seq: Some(seq.clone()),
            kind,
        })
    }
}

/// Parses a plausible 1–5 character sequence tag.
fn seq_tag(s: &str) -> Option<heapless::String<5>> {
    if s.is_empty() || s.len() > 5 || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    let mut out = heapless::String::new();
    for c in s.chars() {
        out.push(c).ok()?;
    }
    Some(out)
}

/// Computes the APRS-IS login passcode for a callsign base.
///
/// 16-bit hash over the uppercased base (NUL-padded to even length), masked to 15 bits.
pub fn login_passcode(callsign_base: &str) -> u16 {
    let mut hash: u16 = 0x73E2;
    let base = callsign_base.split('-').next().unwrap_or("");
    let bytes = base.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        hash ^= u16::from(bytes[i].to_ascii_uppercase()) << 8;
        if i + 1 < bytes.len() {
            hash ^= u16::from(bytes[i + 1].to_ascii_uppercase());
        }
        i += 2;
    }
    hash & 0x7FFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_with_seq() {
        let info = b":N0CALL   :Hello World{123";
        let msg = AprsMessage::parse(info).unwrap();
        assert_eq!(msg.addressee.as_str(), "N0CALL");
        assert_eq!(msg.text, "Hello World");
        assert_eq!(msg.seq.as_ref().unwrap().as_str(), "123");
        assert_eq!(msg.kind, MessageKind::Text);
        // Byte-exact round trip.
        assert_eq!(msg.encode(), info);
    }

    #[test]
    fn message_without_seq() {
        let msg = AprsMessage::parse(b":BLN1     :Club meeting 7pm").unwrap();
        assert_eq!(msg.addressee.as_str(), "BLN1");
        assert_eq!(msg.text, "Club meeting 7pm");
        assert!(msg.seq.is_none());
        assert_eq!(msg.encode(), b":BLN1     :Club meeting 7pm");
    }

    #[test]
    fn ack_and_reject() {
        let msg = AprsMessage::parse(b":W1AW-5   :ack123").unwrap();
        assert_eq!(msg.kind, MessageKind::Ack);
        assert_eq!(msg.seq.as_ref().unwrap().as_str(), "123");

        let msg = AprsMessage::parse(b":W1AW-5   :rej9").unwrap();
        assert_eq!(msg.kind, MessageKind::Reject);
        assert_eq!(msg.seq.as_ref().unwrap().as_str(), "9");

        // "ack" with a {seq} is a text message that merely starts with the letters.
        let msg = AprsMessage::parse(b":W1AW-5   :acknowledged, thanks{7").unwrap();
        assert_eq!(msg.kind, MessageKind::Text);
    }

    #[test]
    fn auto_ack_record() {
        let inbound = AprsMessage::parse(b":N0CALL   :Hello World{123").unwrap();
        let ack = inbound.ack_for().unwrap();
        assert_eq!(ack.text, "ack123");
        assert_eq!(ack.encode(), b":N0CALL   :ack123");

        let no_seq = AprsMessage::parse(b":N0CALL   :Hi").unwrap();
        assert!(no_seq.ack_for().is_none());
    }

    #[test]
    fn login_hash() {
        assert_eq!(login_passcode("N0CALL"), 13023);
        assert_eq!(login_passcode("n0call"), 13023);
        assert_eq!(login_passcode("KJ4ERJ"), 24231);
        assert_eq!(login_passcode("W1AW"), 25988);
        assert_eq!(login_passcode("AB1CDE-5"), 18342);
    }
}
