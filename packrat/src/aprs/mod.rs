//! APRS: position reports, messages and the rest of the UI-frame payload conventions.
//!
//! The codec is deliberately forgiving. [`AprsPacket::parse`] never fails outright: whatever
//! could be decoded lands in the packet's fields and everything that could not is recorded in
//! `parse_errors`, so consumers always get a best-effort view (this matters most for the
//! partially-specified Mic-E format).
//!
//! Dispatch is on the first byte of the information field:
//!
//! | lead | meaning |
//! |------|---------|
//! | `!` `=` | position without timestamp (`=` claims messaging capability) |
//! | `/` `@` | position with timestamp |
//! | `:` | message / ack / reject |
//! | `>` | status |
//! | `;` | object |
//! | `)` | item |
//! | `T` | telemetry |
//! | `_` | positionless weather |
//! | `` ` `` `'` | Mic-E (best effort) |
//! | `}` | third-party, re-parsed recursively |
//!
//! [`AprsPacket::parse`]: struct.AprsPacket.html#method.parse

pub mod message;
pub mod position;

pub use self::message::{login_passcode, AprsMessage, MessageKind};

use crate::ax25::frame::{Ax25Frame, Control, UFormat};
use crate::ax25::Callsign;
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::Write;

/// Destination callsign bases that mark generic (non-Mic-E) APRS traffic.
const GENERIC_DESTINATIONS: [&str; 8] = [
    "AIR", "ALL", "BEACON", "CQ", "GPS", "ID", "QST", "WIDE",
];

/// A decoded geographic position.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Count of space-blanked digits, 0–4.
    pub ambiguity: u8,
    /// Course over ground in degrees.
    pub course: Option<u16>,
    /// Speed in knots.
    pub speed: Option<f64>,
    /// Altitude in feet (from the `/A=nnnnnn` comment convention).
    pub altitude: Option<i32>,
    /// Maidenhead locator, when the report carried one instead of coordinates.
    pub grid: Option<heapless::String<6>>,
}

/// Report timestamp variants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Timestamp {
    /// `DDHHMM`, zulu or local.
    DayHoursMinutes { day: u8, hour: u8, minute: u8, zulu: bool },
    /// `HHMMSS` zulu.
    HoursMinutesSeconds { hour: u8, minute: u8, second: u8 },
}

/// An object or item report header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: heapless::String<9>,
    pub alive: bool,
}

/// A `T#...` telemetry report.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub sequence: u16,
    pub analog: Vec<f64>,
    pub digital: u8,
}

/// Positionless weather fields (those this station understands).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherReport {
    pub wind_dir: Option<u16>,
    pub wind_speed: Option<u16>,
    pub gust: Option<u16>,
    pub temperature_f: Option<i16>,
    pub rain_1h: Option<u16>,
    pub humidity: Option<u8>,
    /// Tenths of hPa.
    pub pressure: Option<u32>,
}

/// One parsed APRS information field.
#[derive(Debug, Clone, PartialEq)]
pub struct AprsPacket {
    /// The dispatch character the field started with.
    pub data_type: char,
    pub position: Option<Position>,
    pub timestamp: Option<Timestamp>,
    pub symbol_table: Option<char>,
    pub symbol_code: Option<char>,
    pub comment: String,
    pub message: Option<AprsMessage>,
    pub status: Option<String>,
    pub object: Option<ObjectInfo>,
    pub telemetry: Option<Telemetry>,
    pub weather: Option<WeatherReport>,
    /// Inner packet of a third-party frame.
    pub third_party: Option<Box<AprsPacket>>,
    /// Whether the report claims to be message-capable (`=`/`@` leads).
    pub messaging: bool,
    pub parse_errors: Vec<String>,
}

impl AprsPacket {
    pub fn empty(data_type: char) -> Self {
        AprsPacket {
            data_type,
            position: None,
            timestamp: None,
            symbol_table: None,
            symbol_code: None,
            comment: String::new(),
            message: None,
            status: None,
            object: None,
            telemetry: None,
            weather: None,
            third_party: None,
            messaging: false,
            parse_errors: Vec::new(),
        }
    }

    /// Parses an information field. `dest` enables Mic-E decoding.
    pub fn parse(info: &[u8], dest: Option<&Callsign>) -> AprsPacket {
        let lead = info.first().copied().unwrap_or(0) as char;
        let mut packet = AprsPacket::empty(lead);
        if info.is_empty() {
            packet.parse_errors.push("empty information field".to_string());
            return packet;
        }
        let rest = &info[1..];
        match lead {
            '!' | '=' => {
                packet.messaging = lead == '=';
                parse_position_body(rest, &mut packet);
            }
            '/' | '@' => {
                packet.messaging = lead == '@';
                if rest.len() < 7 {
                    packet.parse_errors.push("short timestamp".to_string());
                } else {
                    match parse_timestamp(&rest[..7]) {
                        Ok(ts) => packet.timestamp = Some(ts),
                        Err(e) => packet.parse_errors.push(e.to_string()),
                    }
                    parse_position_body(&rest[7..], &mut packet);
                }
            }
            ':' => match AprsMessage::parse(info) {
                Ok(msg) => packet.message = Some(msg),
                Err(e) => packet.parse_errors.push(e.to_string()),
            },
            '>' => {
                packet.status = Some(String::from_utf8_lossy(rest).into_owned());
            }
            ';' => parse_object(rest, &mut packet),
            ')' => parse_item(rest, &mut packet),
            'T' => parse_telemetry(rest, &mut packet),
            '_' => parse_weather(rest, &mut packet),
            '`' | '\'' => match dest {
                Some(dest) => position::parse_mic_e(dest, info, &mut packet),
                None => packet
                    .parse_errors
                    .push("mic-e without destination".to_string()),
            },
            '}' => parse_third_party(rest, &mut packet),
            _ => {
                packet
                    .parse_errors
                    .push("unrecognized data type".to_string());
                packet.comment = String::from_utf8_lossy(info).into_owned();
            }
        }
        packet
    }

    /// Parses a UI frame's payload, with Mic-E support from the destination address.
    pub fn parse_frame(frame: &Ax25Frame) -> Option<AprsPacket> {
        match frame.control {
            Control::U {
                format: UFormat::Ui,
                ..
            } => Some(Self::parse(
                &frame.payload,
                Some(&frame.addresses.destination.callsign),
            )),
            _ => None,
        }
    }
}

/// Whether a UI destination address looks like APRS traffic.
///
/// APRS destinations are software identifiers (`APxxxx`), generic names, or Mic-E latitude
/// encodings; none of them are real station callsigns.
pub fn is_aprs_destination(dest: &Callsign) -> bool {
    let base = dest.base();
    if base.starts_with("AP") {
        return true;
    }
    GENERIC_DESTINATIONS
        .iter()
        .any(|g| base == *g || (g.len() < base.len() && base.starts_with(g)))
}

fn parse_timestamp(s: &[u8]) -> Result<Timestamp, crate::Error> {
    let digits: Option<Vec<u8>> = s[..6]
        .iter()
        .map(|&b| {
            if b.is_ascii_digit() {
                Some(b - b'0')
            } else {
                None
            }
        })
        .collect();
    let d = digits.ok_or(crate::Error::InvalidValue)?;
    let (a, b, c) = (d[0] * 10 + d[1], d[2] * 10 + d[3], d[4] * 10 + d[5]);
    match s[6] {
        b'z' => Ok(Timestamp::DayHoursMinutes {
            day: a,
            hour: b,
            minute: c,
            zulu: true,
        }),
        b'/' => Ok(Timestamp::DayHoursMinutes {
            day: a,
            hour: b,
            minute: c,
            zulu: false,
        }),
        b'h' => Ok(Timestamp::HoursMinutesSeconds {
            hour: a,
            minute: b,
            second: c,
        }),
        _ => Err(crate::Error::InvalidValue),
    }
}

/// Parses a position body: either plain text `lat sym lon code` or Base-91 compressed.
fn parse_position_body(body: &[u8], packet: &mut AprsPacket) {
    if body.len() >= 13 && !body[0].is_ascii_digit() {
        // Compressed format: the lead byte is the symbol table, never a digit.
        match position::parse_compressed(&body[..13]) {
            Ok((pos, (table, code), _)) => {
                packet.position = Some(pos);
                packet.symbol_table = Some(table);
                packet.symbol_code = Some(code);
                set_comment(&body[13..], packet);
            }
            Err(e) => packet.parse_errors.push(e.to_string()),
        }
        return;
    }
    if body.len() < 19 {
        packet.parse_errors.push("short position".to_string());
        return;
    }
    let lat = position::parse_latitude(&body[..8]);
    let lon = position::parse_longitude(&body[9..18]);
    match (lat, lon) {
        (Ok((lat, amb_lat)), Ok((lon, amb_lon))) => {
            packet.symbol_table = Some(body[8] as char);
            packet.symbol_code = Some(body[18] as char);
            packet.position = Some(Position {
                latitude: lat,
                longitude: lon,
                ambiguity: amb_lat.max(amb_lon),
                course: None,
                speed: None,
                altitude: None,
                grid: None,
            });
            set_comment(&body[19..], packet);
        }
        (lat, lon) => {
            if let Err(e) = lat {
                packet.parse_errors.push(e.to_string());
            }
            if let Err(e) = lon {
                packet.parse_errors.push(e.to_string());
            }
        }
    }
}

/// Stores the trailing comment, extracting course/speed (`CCC/SSS`) and altitude conventions.
fn set_comment(comment: &[u8], packet: &mut AprsPacket) {
    // A course/speed data extension leads the comment: three digits, '/', three digits. It is
    // pure ASCII, so it is validated and taken off the byte slice before any text conversion;
    // comments may carry arbitrary (multi-byte) text right after it.
    let mut comment = comment;
    if comment.len() >= 7
        && comment[3] == b'/'
        && comment[..3].iter().all(u8::is_ascii_digit)
        && comment[4..7].iter().all(u8::is_ascii_digit)
    {
        if let Some(pos) = packet.position.as_mut() {
            pos.course = core::str::from_utf8(&comment[..3])
                .ok()
                .and_then(|s| s.parse().ok());
            pos.speed = core::str::from_utf8(&comment[4..7])
                .ok()
                .and_then(|s| s.parse().ok());
            comment = &comment[7..];
        }
    }
    let rest = String::from_utf8_lossy(comment).into_owned();

    let (altitude, rest) = position::extract_altitude(&rest);
    if let Some(pos) = packet.position.as_mut() {
        if let Some(feet) = altitude {
            pos.altitude = Some(feet);
        }
        // Derive the locator for consumers that prefer grids.
        pos.grid = Some(position::to_grid(pos.latitude, pos.longitude));
    }
    packet.comment = rest;
}

fn parse_object(body: &[u8], packet: &mut AprsPacket) {
    // name(9) '*'|'_' timestamp(7) position...
    if body.len() < 17 {
        packet.parse_errors.push("short object".to_string());
        return;
    }
    let mut name = heapless::String::new();
    for &b in body[..9].iter() {
        if !b.is_ascii() {
            packet.parse_errors.push("bad object name".to_string());
            return;
        }
        let _ = name.push(b as char);
    }
    while name.ends_with(' ') {
        name.pop();
    }
    let alive = match body[9] {
        b'*' => true,
        b'_' => false,
        _ => {
            packet.parse_errors.push("bad object state".to_string());
            return;
        }
    };
    match parse_timestamp(&body[10..17]) {
        Ok(ts) => packet.timestamp = Some(ts),
        Err(e) => packet.parse_errors.push(e.to_string()),
    }
    packet.object = Some(ObjectInfo { name, alive });
    parse_position_body(&body[17..], packet);
}

fn parse_item(body: &[u8], packet: &mut AprsPacket) {
    // name(3..9) '!'|'_' position...
    let end = body
        .iter()
        .take(10)
        .position(|&b| b == b'!' || b == b'_');
    let end = match end {
        Some(end) if end >= 3 => end,
        _ => {
            packet.parse_errors.push("bad item header".to_string());
            return;
        }
    };
    let mut name = heapless::String::new();
    for &b in body[..end].iter() {
        let _ = name.push(b as char);
    }
    packet.object = Some(ObjectInfo {
        name,
        alive: body[end] == b'!',
    });
    parse_position_body(&body[end + 1..], packet);
}

fn parse_telemetry(body: &[u8], packet: &mut AprsPacket) {
    // "#SSS,A1,A2,A3,A4,A5,DDDDDDDD"
    let text = match core::str::from_utf8(body) {
        Ok(t) => t,
        Err(_) => {
            packet.parse_errors.push("telemetry not ascii".to_string());
            return;
        }
    };
    let text = match text.strip_prefix('#') {
        Some(t) => t,
        None => {
            // Not telemetry after all; treat as a plain comment.
            packet.comment = text.to_string();
            return;
        }
    };
    let mut parts = text.split(',');
    let sequence = match parts.next().map(str::trim).and_then(|s| {
        if s == "MIC" {
            Some(0)
        } else {
            s.parse::<u16>().ok()
        }
    }) {
        Some(seq) => seq,
        None => {
            packet.parse_errors.push("bad telemetry sequence".to_string());
            return;
        }
    };
    let mut analog = Vec::new();
    let mut digital = 0u8;
    for (i, part) in parts.enumerate() {
        if i < 5 {
            match part.trim().parse::<f64>() {
                Ok(v) => analog.push(v),
                Err(_) => packet.parse_errors.push("bad analog value".to_string()),
            }
        } else if i == 5 {
            for (bit, b) in part.bytes().take(8).enumerate() {
                if b == b'1' {
                    digital |= 1 << (7 - bit);
                }
            }
        }
    }
    packet.telemetry = Some(Telemetry {
        sequence,
        analog,
        digital,
    });
}

fn parse_weather(body: &[u8], packet: &mut AprsPacket) {
    let mut wx = WeatherReport::default();
    // Skip the 8-digit MDHM timestamp when present.
    let mut rest = if body.len() >= 8 && body[..8].iter().all(u8::is_ascii_digit) {
        &body[8..]
    } else {
        body
    };
    let mut read_field = |rest: &mut &[u8]| -> Option<(u8, i32)> {
        let key = *rest.first()?;
        let len = rest[1..]
            .iter()
            .take_while(|b| b.is_ascii_digit() || **b == b'-')
            .count();
        if len == 0 {
            return None;
        }
        let value = core::str::from_utf8(&rest[1..1 + len]).ok()?.parse().ok()?;
        *rest = &rest[1 + len..];
        Some((key, value))
    };
    while let Some((key, value)) = read_field(&mut rest) {
        match key {
            b'c' => wx.wind_dir = Some(value as u16),
            b's' => wx.wind_speed = Some(value as u16),
            b'g' => wx.gust = Some(value as u16),
            b't' => wx.temperature_f = Some(value as i16),
            b'r' => wx.rain_1h = Some(value as u16),
            b'h' => wx.humidity = Some(value as u8),
            b'b' => wx.pressure = Some(value as u32),
            _ => {}
        }
    }
    if !rest.is_empty() {
        packet.comment = String::from_utf8_lossy(rest).into_owned();
    }
    packet.weather = Some(wx);
}

fn parse_third_party(body: &[u8], packet: &mut AprsPacket) {
    // "src>dest,path:inner-information-field"
    let colon = match body.iter().position(|&b| b == b':') {
        Some(c) => c,
        None => {
            packet.parse_errors.push("third-party without payload".to_string());
            return;
        }
    };
    let header = &body[..colon];
    let gt = header.iter().position(|&b| b == b'>');
    let dest = gt.and_then(|gt| {
        let after = &header[gt + 1..];
        let end = after
            .iter()
            .position(|&b| b == b',')
            .unwrap_or(after.len());
        core::str::from_utf8(&after[..end])
            .ok()
            .and_then(|s| Callsign::parse(s).ok())
    });
    let inner = AprsPacket::parse(&body[colon + 1..], dest.as_ref());
    packet.third_party = Some(Box::new(inner));
}

/// Encodes a plain position report information field.
pub fn encode_position(
    position: &Position,
    symbol_table: char,
    symbol_code: char,
    comment: &str,
    messaging: bool,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(if messaging { b'=' } else { b'!' });
    out.extend_from_slice(position::format_latitude(position.latitude).as_bytes());
    out.push(symbol_table as u8);
    out.extend_from_slice(position::format_longitude(position.longitude).as_bytes());
    out.push(symbol_code as u8);
    if let (Some(course), Some(speed)) = (position.course, position.speed) {
        let mut ext = String::new();
        let _ = write!(ext, "{:03}/{:03}", course % 1000, (speed as u32) % 1000);
        out.extend_from_slice(ext.as_bytes());
    }
    out.extend_from_slice(comment.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, eps: f64) -> bool {
        let diff = if a > b { a - b } else { b - a };
        diff < eps
    }

    #[test]
    fn plain_position_report() {
        let p = AprsPacket::parse(b"!4903.50N/07201.75W-Test 001234", None);
        assert!(p.parse_errors.is_empty());
        let pos = p.position.unwrap();
        assert!(close(pos.latitude, 49.0583, 1e-3));
        assert!(close(pos.longitude, -72.0292, 1e-3));
        assert_eq!(p.symbol_table, Some('/'));
        assert_eq!(p.symbol_code, Some('-'));
        assert_eq!(p.comment, "Test 001234");
        assert!(!p.messaging);
    }

    #[test]
    fn timestamped_position_with_course_speed() {
        let p = AprsPacket::parse(b"@092345z4903.50N/07201.75W>088/036 comment", None);
        assert!(p.messaging);
        assert_eq!(
            p.timestamp,
            Some(Timestamp::DayHoursMinutes {
                day: 9,
                hour: 23,
                minute: 45,
                zulu: true
            })
        );
        let pos = p.position.unwrap();
        assert_eq!(pos.course, Some(88));
        assert_eq!(pos.speed, Some(36.0));
        assert_eq!(p.comment, " comment");
    }

    #[test]
    fn compressed_position_report() {
        let p = AprsPacket::parse(b"!/5L!!<*e7>{?! Hi", None);
        let pos = p.position.unwrap();
        assert!(close(pos.latitude, 49.5, 1e-4));
        assert!(close(pos.longitude, -72.75, 1e-4));
        assert_eq!(p.symbol_code, Some('>'));
    }

    #[test]
    fn multibyte_comment_is_preserved() {
        // A multi-byte character straddling the would-be extension boundary must not break the
        // parse; "123/XYü" is an ordinary comment, not a course/speed extension.
        let mut info = b"!4903.50N/07201.75W>123/XY".to_vec();
        info.extend_from_slice("ü".as_bytes());
        let p = AprsPacket::parse(&info, None);
        assert!(p.parse_errors.is_empty(), "{:?}", p.parse_errors);
        let pos = p.position.unwrap();
        assert_eq!(pos.course, None);
        assert_eq!(p.comment, "123/XYü");

        // A real extension followed directly by multi-byte text still parses.
        let mut info = b"!4903.50N/07201.75W>088/036".to_vec();
        info.extend_from_slice("über".as_bytes());
        let p = AprsPacket::parse(&info, None);
        let pos = p.position.unwrap();
        assert_eq!(pos.course, Some(88));
        assert_eq!(pos.speed, Some(36.0));
        assert_eq!(p.comment, "über");
    }

    #[test]
    fn altitude_comment() {
        let p = AprsPacket::parse(b"!4903.50N/07201.75W-/A=002000 hilltop", None);
        let pos = p.position.unwrap();
        assert_eq!(pos.altitude, Some(2000));
        assert_eq!(p.comment, " hilltop");
    }

    #[test]
    fn status_report() {
        let p = AprsPacket::parse(b">Net Control Center", None);
        assert_eq!(p.status.as_deref(), Some("Net Control Center"));
    }

    #[test]
    fn object_report() {
        let p = AprsPacket::parse(b";LEADER   *092345z4903.50N/07201.75W>", None);
        let obj = p.object.unwrap();
        assert_eq!(obj.name.as_str(), "LEADER");
        assert!(obj.alive);
        assert!(p.timestamp.is_some());
        assert!(p.position.is_some());
    }

    #[test]
    fn item_report() {
        let p = AprsPacket::parse(b")AID #2!4903.50N/07201.75W!", None);
        let obj = p.object.unwrap();
        assert_eq!(obj.name.as_str(), "AID #2");
        assert!(obj.alive);
        assert!(p.position.is_some());
    }

    #[test]
    fn telemetry_report() {
        let p = AprsPacket::parse(b"T#005,199.5,000,255,073,123,01101001", None);
        let t = p.telemetry.unwrap();
        assert_eq!(t.sequence, 5);
        assert_eq!(t.analog.len(), 5);
        assert!(close(t.analog[0], 199.5, 1e-9));
        assert_eq!(t.digital, 0b01101001);
    }

    #[test]
    fn weather_report() {
        let p = AprsPacket::parse(b"_10090556c220s004g005t077r000h50b09900", None);
        let w = p.weather.unwrap();
        assert_eq!(w.wind_dir, Some(220));
        assert_eq!(w.wind_speed, Some(4));
        assert_eq!(w.gust, Some(5));
        assert_eq!(w.temperature_f, Some(77));
        assert_eq!(w.humidity, Some(50));
        assert_eq!(w.pressure, Some(9900));
    }

    #[test]
    fn third_party_reparse() {
        let p = AprsPacket::parse(b"}W1AW-5>APRS,TCPIP*::N0CALL   :ping{1", None);
        let inner = p.third_party.unwrap();
        let msg = inner.message.as_ref().unwrap();
        assert_eq!(msg.addressee.as_str(), "N0CALL");
        assert_eq!(msg.text, "ping");
    }

    #[test]
    fn unknown_type_is_best_effort() {
        let p = AprsPacket::parse(b"\x1cweird", None);
        assert!(!p.parse_errors.is_empty());
        assert!(!p.comment.is_empty());
    }

    #[test]
    fn aprs_destination_classification() {
        assert!(is_aprs_destination(&Callsign::parse("APRS").unwrap()));
        assert!(is_aprs_destination(&Callsign::parse("APZ123").unwrap()));
        assert!(is_aprs_destination(&Callsign::parse("BEACON").unwrap()));
        assert!(is_aprs_destination(&Callsign::parse("WIDE1-1").unwrap()));
        assert!(!is_aprs_destination(&Callsign::parse("N0CALL-7").unwrap()));
        assert!(!is_aprs_destination(&Callsign::parse("BBS-2").unwrap()));
    }

    #[test]
    fn position_encode_parse_roundtrip() {
        let pos = Position {
            latitude: 49.0583,
            longitude: -72.0292,
            ambiguity: 0,
            course: Some(88),
            speed: Some(36.0),
            altitude: None,
            grid: None,
        };
        let info = encode_position(&pos, '/', '>', " mobile", true);
        let back = AprsPacket::parse(&info, None);
        assert!(back.parse_errors.is_empty(), "{:?}", back.parse_errors);
        let bpos = back.position.unwrap();
        assert!(close(bpos.latitude, pos.latitude, 1e-3));
        assert!(close(bpos.longitude, pos.longitude, 1e-3));
        assert_eq!(bpos.course, Some(88));
        assert_eq!(back.comment, " mobile");
    }
}
