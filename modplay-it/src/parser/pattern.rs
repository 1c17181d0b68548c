//! IT pattern parsing
//!
//! Patterns are stored as a packed byte stream with per-channel memory: a
//! channel byte with its high bit set is followed by a new 8-bit mask,
//! otherwise the channel's previous mask is reused. The low mask bits say
//! which fields follow; the high bits repeat the channel's remembered
//! field values without any bytes in the stream.

use std::io::{Cursor, Seek, SeekFrom};

use crate::error::ItError;
use crate::module::{ItNote, ItPattern};
use crate::MAX_PATTERN_ROWS;

use super::helpers::{read_u8, read_u16};

/// Parse a single pattern
pub(crate) fn parse_pattern(
    cursor: &mut Cursor<&[u8]>,
    num_channels: u8,
) -> Result<ItPattern, ItError> {
    // Length (2 bytes) - packed data size, excluding the 8-byte header
    let packed_length = read_u16(cursor)?;

    // Rows (2 bytes)
    let num_rows = read_u16(cursor)?;
    if num_rows == 0 || num_rows > MAX_PATTERN_ROWS {
        return Err(ItError::InvalidPattern(0));
    }

    // Reserved (4 bytes)
    cursor.seek(SeekFrom::Current(4))?;

    let mut notes = Vec::with_capacity(num_rows as usize);
    for _ in 0..num_rows {
        notes.push(vec![ItNote::default(); num_channels as usize]);
    }

    if packed_length == 0 {
        return Ok(ItPattern { num_rows, notes });
    }

    let pattern_start = cursor.position();
    let pattern_end = pattern_start + packed_length as u64;

    // Per-channel memory for the mask and each field
    let mut prev_mask = [0u8; 64];
    let mut prev_note = [0u8; 64];
    let mut prev_instrument = [0u8; 64];
    let mut prev_volume = [0u8; 64];
    let mut prev_effect = [0u8; 64];
    let mut prev_effect_param = [0u8; 64];

    let mut row: u16 = 0;
    while row < num_rows && cursor.position() < pattern_end {
        let channel_marker = read_u8(cursor)?;

        if channel_marker == 0 {
            // End of row
            row += 1;
            continue;
        }

        let channel = ((channel_marker - 1) & 0x3F) as usize;

        let mask = if channel_marker & 0x80 != 0 {
            let m = read_u8(cursor)?;
            prev_mask[channel] = m;
            m
        } else {
            prev_mask[channel]
        };

        // Channels beyond the module's count still consume their bytes
        let in_range = channel < num_channels as usize;
        let mut scratch = ItNote::default();
        let note = if in_range {
            &mut notes[row as usize][channel]
        } else {
            &mut scratch
        };

        if mask & 0x01 != 0 {
            let n = read_u8(cursor)?;
            prev_note[channel] = n;
            note.note = n;
            note.mask |= ItNote::MASK_NOTE;
        } else if mask & 0x10 != 0 {
            note.note = prev_note[channel];
            note.mask |= ItNote::MASK_NOTE;
        }

        if mask & 0x02 != 0 {
            let i = read_u8(cursor)?;
            prev_instrument[channel] = i;
            note.instrument = i;
            note.mask |= ItNote::MASK_INSTRUMENT;
        } else if mask & 0x20 != 0 {
            note.instrument = prev_instrument[channel];
            note.mask |= ItNote::MASK_INSTRUMENT;
        }

        if mask & 0x04 != 0 {
            let v = read_u8(cursor)?;
            prev_volume[channel] = v;
            note.volume = v;
            note.mask |= ItNote::MASK_VOLUME;
        } else if mask & 0x40 != 0 {
            note.volume = prev_volume[channel];
            note.mask |= ItNote::MASK_VOLUME;
        }

        if mask & 0x08 != 0 {
            let e = read_u8(cursor)?;
            let p = read_u8(cursor)?;
            prev_effect[channel] = e;
            prev_effect_param[channel] = p;
            note.effect = e;
            note.effect_param = p;
            note.mask |= ItNote::MASK_EFFECT;
        } else if mask & 0x80 != 0 {
            note.effect = prev_effect[channel];
            note.effect_param = prev_effect_param[channel];
            note.mask |= ItNote::MASK_EFFECT;
        }
    }

    Ok(ItPattern { num_rows, notes })
}
