//! IT file parser

use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::ItError;
use crate::module::{ItFlags, ItModule, ItPattern, MidiConfig};
use crate::{
    IT_MAGIC, MAX_CHANNELS, MAX_INSTRUMENTS, MAX_ORDERS, MAX_PATTERNS, MAX_SAMPLES,
    MIN_COMPATIBLE_VERSION,
};

pub(crate) mod helpers;
mod instrument;
mod pattern;
mod sample;
#[cfg(test)]
mod tests;

use helpers::{read_string, read_u8, read_u16, read_u32};
use instrument::parse_instrument;
use pattern::parse_pattern;
use sample::parse_sample;

// Special field bits
const SPECIAL_MESSAGE: u16 = 0x01;
const SPECIAL_EDIT_HISTORY: u16 = 0x02;
const SPECIAL_MIDI_CONFIG: u16 = 0x08;

/// Parse an IT file into an ItModule
///
/// Requires compatible-with version 2.00 or newer (the old instrument
/// layout of earlier files is not supported).
///
/// # Arguments
/// * `data` - Raw IT file bytes
///
/// # Returns
/// * `Ok(ItModule)` - Parsed module
/// * `Err(ItError)` - Parse error
pub fn parse_it(data: &[u8]) -> Result<ItModule, ItError> {
    if data.len() < 192 {
        return Err(ItError::TooSmall);
    }

    if &data[0..4] != IT_MAGIC {
        return Err(ItError::InvalidMagic);
    }

    let mut cursor = Cursor::new(data);
    cursor.seek(SeekFrom::Start(4))?;

    let mut name_bytes = [0u8; 26];
    cursor.read_exact(&mut name_bytes)?;
    let name = read_string(&name_bytes);

    // Pattern row highlight (2 bytes) - editor hint, skipped
    cursor.seek(SeekFrom::Current(2))?;

    let num_orders = read_u16(&mut cursor)?;
    if num_orders > MAX_ORDERS {
        return Err(ItError::TooSmall);
    }

    let num_instruments = read_u16(&mut cursor)?;
    if num_instruments > MAX_INSTRUMENTS {
        return Err(ItError::TooManyInstruments(num_instruments));
    }

    let num_samples = read_u16(&mut cursor)?;
    if num_samples > MAX_SAMPLES {
        return Err(ItError::TooManySamples(num_samples));
    }

    let num_patterns = read_u16(&mut cursor)?;
    if num_patterns > MAX_PATTERNS {
        return Err(ItError::TooManyPatterns(num_patterns));
    }

    // Cwt/v - created with version
    let _created_with = read_u16(&mut cursor)?;

    let compatible_with = read_u16(&mut cursor)?;
    if compatible_with < MIN_COMPATIBLE_VERSION {
        return Err(ItError::UnsupportedVersion(compatible_with));
    }

    let flags = ItFlags::from_bits(read_u16(&mut cursor)?);
    let special = read_u16(&mut cursor)?;

    let global_volume = read_u8(&mut cursor)?.min(128);
    let mix_volume = read_u8(&mut cursor)?.min(128);
    let initial_speed = read_u8(&mut cursor)?.max(1);
    let initial_tempo = read_u8(&mut cursor)?.max(31);
    let panning_separation = read_u8(&mut cursor)?.min(128);

    // PWD - pitch wheel depth (1 byte)
    cursor.seek(SeekFrom::Current(1))?;

    let message_length = read_u16(&mut cursor)?;
    let message_offset = read_u32(&mut cursor)?;

    // Reserved (4 bytes)
    cursor.seek(SeekFrom::Current(4))?;

    let mut channel_pan = [0u8; 64];
    cursor.read_exact(&mut channel_pan)?;
    let mut channel_volume = [0u8; 64];
    cursor.read_exact(&mut channel_volume)?;

    // The channel count is implicit: trailing disabled channels (pan bit 7
    // set) are trimmed, everything up to the last enabled one is live
    let mut num_channels = MAX_CHANNELS;
    while num_channels > 1 && channel_pan[num_channels as usize - 1] >= 128 {
        num_channels -= 1;
    }

    // Order list; the stored count includes the 255 terminator
    let mut orders = vec![0u8; num_orders as usize];
    cursor.read_exact(&mut orders)?;
    if num_orders > 0 {
        orders.truncate(num_orders as usize - 1);
    }

    let mut instrument_offsets = Vec::with_capacity(num_instruments as usize);
    for _ in 0..num_instruments {
        instrument_offsets.push(read_u32(&mut cursor)?);
    }
    let mut sample_offsets = Vec::with_capacity(num_samples as usize);
    for _ in 0..num_samples {
        sample_offsets.push(read_u32(&mut cursor)?);
    }
    let mut pattern_offsets = Vec::with_capacity(num_patterns as usize);
    for _ in 0..num_patterns {
        pattern_offsets.push(read_u32(&mut cursor)?);
    }

    // Optional trailing blocks between the offset tables and the data
    if special & SPECIAL_EDIT_HISTORY != 0 {
        let entries = read_u16(&mut cursor)?;
        cursor.seek(SeekFrom::Current(entries as i64 * 8))?;
    }

    let midi_config = if special & SPECIAL_MIDI_CONFIG != 0 {
        Some(Box::new(parse_midi_config(&mut cursor)?))
    } else {
        None
    };

    let message = if special & SPECIAL_MESSAGE != 0 && message_length > 0 {
        let start = message_offset as usize;
        let end = start + message_length as usize;
        if start >= data.len() || end > data.len() {
            return Err(ItError::OffsetOutOfRange(message_offset));
        }
        // IT messages use CR line ends
        Some(read_string(&data[start..end]).replace('\r', "\n"))
    } else {
        None
    };

    // Instruments
    let mut instruments = Vec::with_capacity(num_instruments as usize);
    for (idx, &offset) in instrument_offsets.iter().enumerate() {
        if offset as usize >= data.len() {
            return Err(ItError::OffsetOutOfRange(offset));
        }
        cursor.seek(SeekFrom::Start(offset as u64))?;
        let instr =
            parse_instrument(&mut cursor).map_err(|_| ItError::InvalidInstrument(idx as u16))?;
        instruments.push(instr);
    }

    // Samples
    let mut samples = Vec::with_capacity(num_samples as usize);
    for (idx, &offset) in sample_offsets.iter().enumerate() {
        if offset as usize >= data.len() {
            return Err(ItError::OffsetOutOfRange(offset));
        }
        cursor.seek(SeekFrom::Start(offset as u64))?;
        samples.push(parse_sample(&mut cursor, data, idx as u16)?);
    }

    // Patterns; a zero offset is an empty 64-row pattern
    let mut patterns = Vec::with_capacity(num_patterns as usize);
    for (idx, &offset) in pattern_offsets.iter().enumerate() {
        if offset == 0 {
            patterns.push(ItPattern::empty(num_channels));
            continue;
        }
        if offset as usize >= data.len() {
            return Err(ItError::OffsetOutOfRange(offset));
        }
        cursor.seek(SeekFrom::Start(offset as u64))?;
        let pattern = parse_pattern(&mut cursor, num_channels)
            .map_err(|_| ItError::InvalidPattern(idx as u16))?;
        patterns.push(pattern);
    }

    Ok(ItModule {
        name,
        flags,
        num_channels,
        global_volume,
        mix_volume,
        initial_speed,
        initial_tempo,
        panning_separation,
        channel_pan,
        channel_volume,
        orders,
        instruments,
        samples,
        patterns,
        message,
        midi_config,
    })
}

/// Read the embedded MIDI macro configuration: 9 global + 16 parametric +
/// 128 fixed slots of 32 bytes each
fn parse_midi_config(cursor: &mut Cursor<&[u8]>) -> Result<MidiConfig, ItError> {
    let mut config = MidiConfig::default();
    for slot in config.global.iter_mut() {
        cursor
            .read_exact(slot)
            .map_err(|_| ItError::UnexpectedEof)?;
    }
    for slot in config.sfx.iter_mut() {
        cursor
            .read_exact(slot)
            .map_err(|_| ItError::UnexpectedEof)?;
    }
    for slot in config.zxx.iter_mut() {
        cursor
            .read_exact(slot)
            .map_err(|_| ItError::UnexpectedEof)?;
    }
    Ok(config)
}
