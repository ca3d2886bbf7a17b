//! Annex B byte stream helpers for H.264

use bytes::{Bytes, BytesMut};

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Split an Annex B stream into NAL units, start codes and trailing zero
/// bytes removed
pub fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut cursor = 0usize;

    while let Some((start, start_code_len)) = find_start_code(data, cursor) {
        let unit_start = start + start_code_len;
        if unit_start >= data.len() {
            break;
        }

        let next_start = find_start_code(data, unit_start)
            .map(|(idx, _)| idx)
            .unwrap_or(data.len());

        let mut unit_end = next_start;
        while unit_end > unit_start && data[unit_end - 1] == 0 {
            unit_end -= 1;
        }
        if unit_end > unit_start {
            units.push(&data[unit_start..unit_end]);
        }

        cursor = next_start;
    }

    units
}

fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len() && data[i..i + 4] == START_CODE {
            return Some((i, 4));
        }
        if data[i..i + 3] == START_CODE[1..] {
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

pub fn nal_type(unit: &[u8]) -> Option<u8> {
    unit.first().map(|b| b & 0x1f)
}

/// SPS and PPS units of an access unit, each re-framed with a 4-byte start
/// code. `None` unless both are present.
pub fn parameter_sets(data: &[u8]) -> Option<Bytes> {
    let mut out = BytesMut::new();
    let (mut sps, mut pps) = (false, false);
    for unit in nal_units(data) {
        match nal_type(unit) {
            Some(NAL_SPS) => sps = true,
            Some(NAL_PPS) => pps = true,
            _ => continue,
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(unit);
    }
    (sps && pps).then(|| out.freeze())
}
