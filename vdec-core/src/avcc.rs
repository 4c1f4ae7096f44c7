//! AVCC configuration record parsing and Annex B rewriting.
//!
//! Containers deliver H.264 access units as length-prefixed NAL units (AVCC)
//! with the parameter sets kept out-of-band in an
//! AVCDecoderConfigurationRecord. The decoder transform expects start-code
//! delimited Annex B with SPS/PPS inline at stream start, so every access
//! unit passes through here before it is fed.

use thiserror::Error;

/// Annex B start code (4-byte version)
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Bytes before the first SPS length field in a configuration record.
const MIN_RECORD_LEN: usize = 6;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("configuration record shorter than the minimum header")]
    Empty,
    #[error("declared parameter-set length exceeds remaining input")]
    Truncated,
    #[error("unsupported configuration record version {0}")]
    BadVersion(u8),
    #[error("invalid NAL length field width {0}")]
    BadLengthSize(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("NAL length field declares {declared} bytes but only {remaining} remain")]
    Truncated { declared: usize, remaining: usize },
}

/// Parsed AVCDecoderConfigurationRecord.
///
/// Immutable once parsed; parsed once per decoder session from the first
/// codec-specific data the caller supplies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfigRecord {
    pub profile: u8,
    pub profile_compat: u8,
    pub level: u8,
    /// Width of the NAL length prefix in the stream: 1, 2 or 4 bytes.
    pub nal_length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcConfigRecord {
    /// Parse a configuration record blob.
    ///
    /// All-or-nothing: a record is never returned with fewer parameter sets
    /// than it declares.
    pub fn parse(blob: &[u8]) -> Result<Self, ParseError> {
        if blob.len() < MIN_RECORD_LEN {
            return Err(ParseError::Empty);
        }
        if blob[0] != 1 {
            return Err(ParseError::BadVersion(blob[0]));
        }

        // lengthSizeMinusOne may only encode 1, 2 or 4 byte prefixes
        let nal_length_size = ((blob[4] & 0x03) + 1) as usize;
        if nal_length_size == 3 {
            return Err(ParseError::BadLengthSize(nal_length_size));
        }

        let num_sps = (blob[5] & 0x1f) as usize;
        let mut offset = 6;

        let mut sps = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            sps.push(read_param_set(blob, &mut offset)?);
        }

        if offset >= blob.len() {
            return Err(ParseError::Truncated);
        }
        let num_pps = blob[offset] as usize;
        offset += 1;

        let mut pps = Vec::with_capacity(num_pps);
        for _ in 0..num_pps {
            pps.push(read_param_set(blob, &mut offset)?);
        }

        Ok(Self {
            profile: blob[1],
            profile_compat: blob[2],
            level: blob[3],
            nal_length_size,
            sps,
            pps,
        })
    }
}

fn read_param_set(blob: &[u8], offset: &mut usize) -> Result<Vec<u8>, ParseError> {
    if *offset + 2 > blob.len() {
        return Err(ParseError::Truncated);
    }
    let len = u16::from_be_bytes([blob[*offset], blob[*offset + 1]]) as usize;
    *offset += 2;

    if *offset + len > blob.len() {
        return Err(ParseError::Truncated);
    }
    let set = blob[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(set)
}

/// Rewrite one length-prefixed access unit into Annex B form.
///
/// Each NAL unit's big-endian length prefix is replaced by a 4-byte start
/// code. When `first_unit` is set, the record's SPS and PPS entries are
/// emitted ahead of the unit's own NAL units so the transform sees parameter
/// sets at stream start even if the container kept them out-of-band.
///
/// A length field declaring more payload than remains is corruption, not a
/// format change, and fails the rewrite instead of being truncated or padded.
pub fn to_annex_b(
    unit: &[u8],
    config: &AvcConfigRecord,
    first_unit: bool,
) -> Result<Vec<u8>, RewriteError> {
    let mut out = Vec::with_capacity(unit.len() + 64);

    if first_unit {
        for set in config.sps.iter().chain(config.pps.iter()) {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(set);
        }
    }

    let mut offset = 0;
    while offset < unit.len() {
        let remaining = unit.len() - offset;
        if remaining < config.nal_length_size {
            return Err(RewriteError::Truncated {
                declared: config.nal_length_size,
                remaining,
            });
        }
        let nal_len = read_be_uint(&unit[offset..], config.nal_length_size);
        offset += config.nal_length_size;

        if nal_len > unit.len() - offset {
            return Err(RewriteError::Truncated {
                declared: nal_len,
                remaining: unit.len() - offset,
            });
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&unit[offset..offset + nal_len]);
        offset += nal_len;
    }

    Ok(out)
}

/// Check if data already carries Annex B start codes.
pub fn is_annex_b(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    (data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1)
        || (data[0] == 0 && data[1] == 0 && data[2] == 1)
}

/// Read big-endian unsigned integer of 1-4 bytes.
fn read_be_uint(data: &[u8], size: usize) -> usize {
    let mut val = 0usize;
    for &byte in &data[..size] {
        val = (val << 8) | byte as usize;
    }
    val
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Standard record: version 1, High profile bytes, 4-byte lengths,
    /// one SPS and one PPS.
    fn record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut blob = vec![0x01, 0x64, 0x00, 0x1e, 0xff, 0xe1];
        blob.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        blob.extend_from_slice(sps);
        blob.push(0x01);
        blob.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        blob.extend_from_slice(pps);
        blob
    }

    #[test]
    fn test_parse_record() {
        let sps = [0x67, 0x64, 0x00, 0x1e];
        let pps = [0x68, 0xeb, 0xe3];
        let rec = AvcConfigRecord::parse(&record(&sps, &pps)).unwrap();

        assert_eq!(rec.nal_length_size, 4);
        assert_eq!(rec.profile, 0x64);
        assert_eq!(rec.level, 0x1e);
        assert_eq!(rec.sps, vec![sps.to_vec()]);
        assert_eq!(rec.pps, vec![pps.to_vec()]);
    }

    #[test]
    fn test_parse_short_input_is_empty() {
        assert_eq!(AvcConfigRecord::parse(&[]), Err(ParseError::Empty));
        for len in 1..MIN_RECORD_LEN {
            let blob = vec![0x01; len];
            assert_eq!(AvcConfigRecord::parse(&blob), Err(ParseError::Empty));
        }
    }

    #[test]
    fn test_parse_overdeclared_sps_is_truncated() {
        // Declares a 100-byte SPS with 4 bytes present.
        let blob = vec![0x01, 0x64, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x64, 0x67, 0x64, 0x00, 0x1e];
        assert_eq!(AvcConfigRecord::parse(&blob), Err(ParseError::Truncated));
    }

    #[test]
    fn test_parse_missing_pps_count_is_truncated() {
        // SPS consumes the whole tail, no PPS count byte follows.
        let blob = vec![0x01, 0x64, 0x00, 0x1e, 0xff, 0xe1, 0x00, 0x02, 0x67, 0x64];
        assert_eq!(AvcConfigRecord::parse(&blob), Err(ParseError::Truncated));
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let blob = vec![0x00, 0x64, 0x00, 0x1e, 0xff, 0xe0, 0x00];
        assert_eq!(AvcConfigRecord::parse(&blob), Err(ParseError::BadVersion(0)));
    }

    #[test]
    fn test_parse_rejects_three_byte_lengths() {
        let blob = vec![0x01, 0x64, 0x00, 0x1e, 0xfe, 0xe0, 0x00];
        assert_eq!(AvcConfigRecord::parse(&blob), Err(ParseError::BadLengthSize(3)));
    }

    #[test]
    fn test_first_unit_injects_parameter_sets() {
        // Spec scenario: 4-byte lengths, SPS S, PPS P, unit = len(3) "ABC".
        let rec = AvcConfigRecord::parse(&record(b"S", b"P")).unwrap();
        let unit = [0x00, 0x00, 0x00, 0x03, b'A', b'B', b'C'];

        let out = to_annex_b(&unit, &rec, true).unwrap();
        let expected: Vec<u8> = [
            &START_CODE[..], &b"S"[..],
            &START_CODE[..], &b"P"[..],
            &START_CODE[..], &b"ABC"[..],
        ]
        .concat();
        assert_eq!(out, expected);

        // Later units carry no parameter sets.
        let out = to_annex_b(&unit, &rec, false).unwrap();
        assert_eq!(out, [&START_CODE[..], &b"ABC"[..]].concat());
    }

    #[test]
    fn test_rewrite_round_trip_preserves_order() {
        let rec = AvcConfigRecord::parse(&record(b"S", b"P")).unwrap();

        // Access unit with NALs of assorted lengths.
        let payloads: [&[u8]; 4] = [b"a", b"longer-nal-unit", b"\x00\x00\x01", b"tail"];
        let mut unit = Vec::new();
        for p in payloads {
            unit.extend_from_slice(&(p.len() as u32).to_be_bytes());
            unit.extend_from_slice(p);
        }

        let out = to_annex_b(&unit, &rec, false).unwrap();

        let mut expected = Vec::new();
        for p in payloads {
            expected.extend_from_slice(&START_CODE);
            expected.extend_from_slice(p);
        }
        assert_eq!(out, expected);

        // Exactly one start code per NAL unit.
        let starts = out.windows(4).filter(|w| *w == START_CODE).count();
        assert_eq!(starts, payloads.len());
    }

    #[test]
    fn test_rewrite_two_byte_lengths() {
        let mut blob = vec![0x01, 0x42, 0x00, 0x0a, 0xfd, 0xe0];
        blob.push(0x00); // no PPS
        let rec = AvcConfigRecord::parse(&blob).unwrap();
        assert_eq!(rec.nal_length_size, 2);
        assert!(rec.sps.is_empty());

        let unit = [0x00, 0x02, 0xaa, 0xbb, 0x00, 0x01, 0xcc];
        let out = to_annex_b(&unit, &rec, false).unwrap();
        assert_eq!(
            out,
            [&START_CODE[..], &[0xaa, 0xbb][..], &START_CODE[..], &[0xcc][..]].concat()
        );
    }

    #[test]
    fn test_rewrite_overdeclared_length_fails() {
        let rec = AvcConfigRecord::parse(&record(b"S", b"P")).unwrap();
        let unit = [0x00, 0x00, 0x00, 0x09, b'A', b'B', b'C'];
        assert_eq!(
            to_annex_b(&unit, &rec, false),
            Err(RewriteError::Truncated { declared: 9, remaining: 3 })
        );
    }

    #[test]
    fn test_rewrite_partial_length_field_fails() {
        let rec = AvcConfigRecord::parse(&record(b"S", b"P")).unwrap();
        // One complete NAL followed by two stray bytes.
        let unit = [0x00, 0x00, 0x00, 0x01, b'A', 0x00, 0x00];
        assert_eq!(
            to_annex_b(&unit, &rec, false),
            Err(RewriteError::Truncated { declared: 4, remaining: 2 })
        );
    }

    #[test]
    fn test_is_annex_b() {
        assert!(is_annex_b(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annex_b(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annex_b(&[0x00, 0x00, 0x00, 0x05, 0x67])); // AVCC
        assert!(!is_annex_b(&[0x00, 0x00]));
    }
}
