//! Position formats: plain text lat/lon, Base-91 compressed, Mic-E, plus the coordinate
//! utilities shared by all of them (NMEA-style degree/minute strings, Maidenhead grids).

use super::{AprsPacket, Position};
use crate::ax25::Callsign;
use crate::Error;
use alloc::format;
use alloc::string::String;
use core::fmt::Write;

/// Parses `DDMM.hhN` (8 chars). Space-padded digits denote position ambiguity.
///
/// Returns degrees (positive north) and the ambiguity digit count (0–4).
pub fn parse_latitude(s: &[u8]) -> Result<(f64, u8), Error> {
    if s.len() != 8 {
        return Err(Error::InvalidLength);
    }
    let hemi = match s[7] {
        b'N' => 1.0,
        b'S' => -1.0,
        _ => return Err(Error::InvalidValue),
    };
    let (value, ambiguity) = parse_dm(&s[..7], 2)?;
    Ok((value * hemi, ambiguity))
}

/// Parses `DDDMM.hhE` (9 chars), analogous to [`parse_latitude`].
///
/// [`parse_latitude`]: fn.parse_latitude.html
pub fn parse_longitude(s: &[u8]) -> Result<(f64, u8), Error> {
    if s.len() != 9 {
        return Err(Error::InvalidLength);
    }
    let hemi = match s[8] {
        b'E' => 1.0,
        b'W' => -1.0,
        _ => return Err(Error::InvalidValue),
    };
    let (value, ambiguity) = parse_dm(&s[..8], 3)?;
    Ok((value * hemi, ambiguity))
}

/// Parses `D{deg_digits}MM.hh` with space-padding for ambiguity.
fn parse_dm(s: &[u8], deg_digits: usize) -> Result<(f64, u8), Error> {
    if s[deg_digits + 2] != b'.' {
        return Err(Error::InvalidValue);
    }
    let mut ambiguity = 0u8;
    let mut digits = [0u8; 7];
    let mut n = 0;
    for (i, &b) in s.iter().enumerate() {
        if i == deg_digits + 2 {
            continue;
        }
        digits[n] = match b {
            b'0'..=b'9' => b - b'0',
            // Space padding: counts toward ambiguity, reads as 0.
            b' ' if i >= deg_digits => {
                ambiguity += 1;
                0
            }
            _ => return Err(Error::InvalidValue),
        };
        n += 1;
    }
    let mut degrees = 0u32;
    for &d in &digits[..deg_digits] {
        degrees = degrees * 10 + u32::from(d);
    }
    let minutes = f64::from(digits[deg_digits]) * 10.0
        + f64::from(digits[deg_digits + 1])
        + f64::from(digits[deg_digits + 2]) / 10.0
        + f64::from(digits[deg_digits + 3]) / 100.0;
    if degrees > 180 || minutes >= 60.0 {
        return Err(Error::InvalidValue);
    }
    Ok((f64::from(degrees) + minutes / 60.0, ambiguity.min(4)))
}

/// Formats a latitude as `DDMM.hhN`.
pub fn format_latitude(lat: f64) -> heapless::String<8> {
    let mut out = heapless::String::new();
    let hemi = if lat >= 0.0 { 'N' } else { 'S' };
    let (deg, centi_min) = split_degrees(lat, 90);
    let _ = write!(
        out,
        "{:02}{:02}.{:02}{}",
        deg,
        centi_min / 100,
        centi_min % 100,
        hemi
    );
    out
}

/// Formats a longitude as `DDDMM.hhE`.
pub fn format_longitude(lon: f64) -> heapless::String<9> {
    let mut out = heapless::String::new();
    let hemi = if lon >= 0.0 { 'E' } else { 'W' };
    let (deg, centi_min) = split_degrees(lon, 180);
    let _ = write!(
        out,
        "{:03}{:02}.{:02}{}",
        deg,
        centi_min / 100,
        centi_min % 100,
        hemi
    );
    out
}

/// Splits |degrees| into whole degrees and hundredths of minutes, clamped to `limit`.
fn split_degrees(value: f64, limit: u32) -> (u32, u32) {
    let mut abs = if value < 0.0 { -value } else { value };
    let max = f64::from(limit);
    if abs > max {
        abs = max;
    }
    let total_centi_min = (abs * 6000.0 + 0.5) as u64;
    let deg = (total_centi_min / 6000) as u32;
    let centi_min = (total_centi_min % 6000) as u32;
    (deg.min(limit), centi_min)
}

/// Converts decimal degrees to the NMEA `DDMM.mmmm` convention (unsigned).
pub fn float_to_nmea(value: f64) -> heapless::String<12> {
    let abs = if value < 0.0 { -value } else { value };
    let deg = abs as u32;
    let minutes = (abs - f64::from(deg)) * 60.0;
    let mut out = heapless::String::new();
    let _ = write!(out, "{:02}{:07.4}", deg, minutes);
    out
}

/// Converts an NMEA `DDMM.mmmm` string back to decimal degrees.
pub fn nmea_to_float(s: &str) -> Result<f64, Error> {
    let b = s.as_bytes();
    let dot = b.iter().position(|&c| c == b'.').unwrap_or(b.len());
    if dot < 3 {
        return Err(Error::InvalidLength);
    }
    // Everything before the dot must be ASCII digits, which also makes the split below land on
    // a char boundary.
    if !b[..dot].iter().all(u8::is_ascii_digit) {
        return Err(Error::InvalidValue);
    }
    let deg: f64 = s[..dot - 2].parse().map_err(|_| Error::InvalidValue)?;
    let minutes: f64 = s[dot - 2..].parse().map_err(|_| Error::InvalidValue)?;
    Ok(deg + minutes / 60.0)
}

fn base91(s: &[u8]) -> Result<f64, Error> {
    let mut n = 0.0;
    for &b in s {
        if !(33..=124).contains(&b) {
            return Err(Error::InvalidValue);
        }
        n = n * 91.0 + f64::from(b - 33);
    }
    Ok(n)
}

/// Decoded compressed-format extension: either course/speed or radio range.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CompressedExt {
    None,
    /// Course in degrees and speed in knots.
    CourseSpeed(u16, f64),
    /// Pre-calculated radio range in miles.
    Range(f64),
}

/// Parses the 13-char compressed position `T YYYY XXXX $ c s t`.
///
/// `T` is the symbol table, `$` the symbol code. Returns position, symbol pair, and the
/// course/speed extension.
pub fn parse_compressed(s: &[u8]) -> Result<(Position, (char, char), CompressedExt), Error> {
    if s.len() < 13 {
        return Err(Error::InvalidLength);
    }
    let table = s[0] as char;
    let lat = 90.0 - base91(&s[1..5])? / 380_926.0;
    let lon = -180.0 + base91(&s[5..9])? / 190_463.0;
    let code = s[9] as char;
    let c = s[10];
    let st = s[11];
    let ext = if c == b' ' {
        CompressedExt::None
    } else if c == b'{' {
        // Radio range: 0.146 * 1.08^s miles.
        CompressedExt::Range(0.146 * pow_1_08(st.saturating_sub(33)))
    } else if (b'!'..=b'z').contains(&c) {
        let course = u16::from(c - 33) * 4;
        let speed = pow_1_08(st.saturating_sub(33)) - 1.0;
        CompressedExt::CourseSpeed(course % 360, speed)
    } else {
        CompressedExt::None
    };
    let position = Position {
        latitude: lat,
        longitude: lon,
        ambiguity: 0,
        course: match ext {
            CompressedExt::CourseSpeed(course, _) => Some(course),
            _ => None,
        },
        speed: match ext {
            CompressedExt::CourseSpeed(_, speed) => Some(speed),
            _ => None,
        },
        altitude: None,
        grid: None,
    };
    Ok((position, (table, code), ext))
}

/// `1.08^n` without a float pow intrinsic (n is at most 91).
fn pow_1_08(n: u8) -> f64 {
    let mut v = 1.0;
    for _ in 0..n {
        v *= 1.08;
    }
    v
}

/// Converts a coordinate to a 6-character Maidenhead grid locator.
pub fn to_grid(lat: f64, lon: f64) -> heapless::String<6> {
    let lon = (lon + 180.0).max(0.0).min(359.999_999);
    let lat = (lat + 90.0).max(0.0).min(179.999_999);
    let mut out = heapless::String::new();
    let _ = out.push((b'A' + (lon / 20.0) as u8) as char);
    let _ = out.push((b'A' + (lat / 10.0) as u8) as char);
    let _ = out.push((b'0' + ((lon % 20.0) / 2.0) as u8) as char);
    let _ = out.push((b'0' + (lat % 10.0) as u8) as char);
    let _ = out.push((b'a' + ((lon % 2.0) * 12.0) as u8) as char);
    let _ = out.push((b'a' + ((lat % 1.0) * 24.0) as u8) as char);
    out
}

/// Converts a 4- or 6-character grid locator to the center of its cell.
pub fn from_grid(grid: &str) -> Result<(f64, f64), Error> {
    let b = grid.as_bytes();
    if b.len() != 4 && b.len() != 6 {
        return Err(Error::InvalidLength);
    }
    let field = |c: u8, base: u8, max: u8| -> Result<f64, Error> {
        let v = c.to_ascii_uppercase().wrapping_sub(base);
        if v >= max {
            Err(Error::InvalidValue)
        } else {
            Ok(f64::from(v))
        }
    };
    let mut lon = field(b[0], b'A', 18)? * 20.0;
    let mut lat = field(b[1], b'A', 18)? * 10.0;
    lon += field(b[2], b'0', 10)? * 2.0;
    lat += field(b[3], b'0', 10)?;
    if b.len() == 6 {
        lon += field(b[4], b'A', 24)? / 12.0 + 1.0 / 24.0;
        lat += field(b[5], b'A', 24)? / 24.0 + 1.0 / 48.0;
    } else {
        lon += 1.0;
        lat += 0.5;
    }
    Ok((lat - 90.0, lon - 180.0))
}

/// Best-effort Mic-E decode.
///
/// The latitude, message bits and half of the longitude information ride in the *destination*
/// callsign; the information field carries the rest. Anything undecodable lands in
/// `parse_errors` without failing the packet.
pub fn parse_mic_e(dest: &Callsign, info: &[u8], packet: &mut AprsPacket) {
    let d = dest.base().as_bytes();
    if d.len() < 6 || info.len() < 9 {
        packet.parse_errors.push(String::from("short mic-e"));
        return;
    }

    let mut lat_digits = [0u8; 6];
    let mut ambiguity = 0u8;
    for (i, &c) in d[..6].iter().enumerate() {
        lat_digits[i] = match c {
            b'0'..=b'9' => c - b'0',
            b'A'..=b'J' => c - b'A',
            b'P'..=b'Y' => c - b'P',
            b'K' | b'L' | b'Z' => {
                ambiguity += 1;
                0
            }
            _ => {
                packet.parse_errors.push(String::from("bad mic-e dest"));
                return;
            }
        };
    }
    let north = matches!(d[3], b'P'..=b'Z');
    let lon_offset = matches!(d[4], b'P'..=b'Z');
    let west = matches!(d[5], b'P'..=b'Z');

    let lat_deg = f64::from(lat_digits[0]) * 10.0 + f64::from(lat_digits[1]);
    let lat_min = f64::from(lat_digits[2]) * 10.0
        + f64::from(lat_digits[3])
        + f64::from(lat_digits[4]) / 10.0
        + f64::from(lat_digits[5]) / 100.0;
    let mut latitude = lat_deg + lat_min / 60.0;
    if !north {
        latitude = -latitude;
    }

    let mut lon_deg = i32::from(info[1].wrapping_sub(28));
    if lon_offset {
        lon_deg += 100;
    }
    if (180..=189).contains(&lon_deg) {
        lon_deg -= 80;
    } else if (190..=199).contains(&lon_deg) {
        lon_deg -= 190;
    }
    let mut lon_min = i32::from(info[2].wrapping_sub(28));
    if lon_min >= 60 {
        lon_min -= 60;
    }
    let lon_hundredths = i32::from(info[3].wrapping_sub(28));
    let mut longitude =
        f64::from(lon_deg) + (f64::from(lon_min) + f64::from(lon_hundredths) / 100.0) / 60.0;
    if west {
        longitude = -longitude;
    }

    let sp = u16::from(info[4].wrapping_sub(28));
    let dc = u16::from(info[5].wrapping_sub(28));
    let se = u16::from(info[6].wrapping_sub(28));
    let mut speed = sp * 10 + dc / 10;
    let mut course = (dc % 10) * 100 + se;
    if speed >= 800 {
        speed -= 800;
    }
    if course >= 400 {
        course -= 400;
    }

    packet.symbol_code = Some(info[7] as char);
    packet.symbol_table = Some(info[8] as char);
    packet.position = Some(Position {
        latitude,
        longitude,
        ambiguity: ambiguity.min(4),
        course: Some(course % 360),
        speed: Some(f64::from(speed)),
        altitude: None,
        grid: None,
    });
    if info.len() > 9 {
        packet.comment = String::from_utf8_lossy(&info[9..]).into_owned();
    }
}

/// Pulls an `/A=nnnnnn` altitude (feet) out of a comment, returning the remaining comment.
pub fn extract_altitude(comment: &str) -> (Option<i32>, String) {
    if let Some(idx) = comment.find("/A=") {
        let digits = &comment[idx + 3..];
        if digits.len() >= 6 && digits.as_bytes()[..6].iter().all(|b| b.is_ascii_digit() || *b == b'-') {
            if let Ok(feet) = digits[..6].parse::<i32>() {
                let rest = format!("{}{}", &comment[..idx], &digits[6..]);
                return (Some(feet), rest);
            }
        }
    }
    (None, String::from(comment))
}
