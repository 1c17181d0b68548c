//! XM file parsing

use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::XmError;
use crate::module::{
    SampleData, XmEnvelope, XmInstrument, XmModule, XmNote, XmPattern, XmSample, LOOP_NONE,
};
use crate::{
    MAX_CHANNELS, MAX_ENVELOPE_POINTS, MAX_INSTRUMENTS, MAX_PATTERNS, MAX_PATTERN_ROWS,
    MAX_SAMPLES_PER_INSTRUMENT, XM_MAGIC, XM_VERSIONS,
};

mod mod_format;

pub use mod_format::{parse_mod, signature_channels};

/// Parse an XM file into an XmModule
///
/// Supports versions 0x0102, 0x0103 and 0x0104. Older versions store all
/// instrument headers before the patterns with the sample data trailing;
/// 0x0104 stores patterns first and interleaves each instrument's sample
/// data with its header.
///
/// # Arguments
/// * `data` - Raw XM file bytes
///
/// # Returns
/// * `Ok(XmModule)` - Parsed module
/// * `Err(XmError)` - Parse error
pub fn parse_xm(data: &[u8]) -> Result<XmModule, XmError> {
    if data.len() < 60 {
        return Err(XmError::TooSmall);
    }

    if &data[0..17] != XM_MAGIC {
        return Err(XmError::InvalidMagic);
    }

    let mut cursor = Cursor::new(data);

    // Skip magic (17 bytes)
    cursor.seek(SeekFrom::Start(17))?;

    // Module name (20 bytes, null-terminated)
    let mut name_bytes = [0u8; 20];
    cursor.read_exact(&mut name_bytes)?;
    let name = read_string(&name_bytes);

    // 0x1A marker (1 byte) + tracker name (20 bytes)
    cursor.seek(SeekFrom::Current(21))?;

    // Version (2 bytes)
    let version = read_u16(&mut cursor)?;
    if !XM_VERSIONS.contains(&version) {
        return Err(XmError::UnsupportedVersion(version));
    }

    // Header size is measured from the position of the field itself
    let header_start = cursor.position();
    let header_size = read_u32(&mut cursor)?;

    let song_length = read_u16(&mut cursor)?;
    let restart_position = read_u16(&mut cursor)?;

    let num_channels = read_u16(&mut cursor)?;
    if num_channels < 2 || num_channels > MAX_CHANNELS as u16 || num_channels % 2 != 0 {
        return Err(XmError::InvalidChannelCount(num_channels));
    }
    let num_channels = num_channels as u8;

    let num_patterns = read_u16(&mut cursor)?;
    if num_patterns > MAX_PATTERNS {
        return Err(XmError::TooManyPatterns(num_patterns));
    }

    let num_instruments = read_u16(&mut cursor)?;
    if num_instruments > MAX_INSTRUMENTS {
        return Err(XmError::TooManyInstruments(num_instruments));
    }

    let flags = read_u16(&mut cursor)?;
    let linear_frequency_table = (flags & 1) != 0;

    let default_speed = read_u16(&mut cursor)?;
    let default_bpm = read_u16(&mut cursor)?;

    // Pattern order table (256 bytes)
    let mut order_table = vec![0u8; 256];
    cursor.read_exact(&mut order_table)?;
    order_table.truncate((song_length as usize).min(256).max(1));

    cursor.seek(SeekFrom::Start(header_start + header_size as u64))?;

    let mut patterns = Vec::with_capacity(num_patterns as usize);
    let mut instruments = Vec::with_capacity(num_instruments as usize);

    if version >= 0x0104 {
        // Patterns first, then instruments with interleaved sample data
        for pattern_idx in 0..num_patterns {
            let pattern = parse_pattern(&mut cursor, num_channels, version)
                .map_err(|_| XmError::InvalidPattern(pattern_idx))?;
            patterns.push(pattern);
        }
        for instr_idx in 0..num_instruments {
            let (mut instrument, byte_lengths) = parse_instrument(&mut cursor)
                .map_err(|_| XmError::InvalidInstrument(instr_idx))?;
            load_sample_data(&mut cursor, &mut instrument, &byte_lengths)
                .map_err(|_| XmError::InvalidInstrument(instr_idx))?;
            instruments.push(instrument);
        }
    } else {
        // All instrument headers, then all patterns, then all sample data
        let mut deferred = Vec::with_capacity(num_instruments as usize);
        for instr_idx in 0..num_instruments {
            let (instrument, byte_lengths) = parse_instrument(&mut cursor)
                .map_err(|_| XmError::InvalidInstrument(instr_idx))?;
            instruments.push(instrument);
            deferred.push(byte_lengths);
        }
        for pattern_idx in 0..num_patterns {
            let pattern = parse_pattern(&mut cursor, num_channels, version)
                .map_err(|_| XmError::InvalidPattern(pattern_idx))?;
            patterns.push(pattern);
        }
        for (instr_idx, (instrument, byte_lengths)) in
            instruments.iter_mut().zip(&deferred).enumerate()
        {
            load_sample_data(&mut cursor, instrument, byte_lengths)
                .map_err(|_| XmError::InvalidInstrument(instr_idx as u16))?;
        }
    }

    Ok(XmModule {
        name,
        num_channels,
        song_length: order_table.len() as u16,
        restart_position,
        default_speed,
        default_bpm,
        linear_frequency_table,
        order_table,
        patterns,
        instruments,
    })
}

/// Parse a single pattern from the cursor
fn parse_pattern(
    cursor: &mut Cursor<&[u8]>,
    num_channels: u8,
    version: u16,
) -> Result<XmPattern, XmError> {
    // Pattern header length includes the 4-byte length field itself
    let header_start = cursor.position();
    let header_length = read_u32(cursor)?;

    // Packing type (1 byte) - always 0
    let _packing_type = read_u8(cursor)?;

    // 0x0102 stores the row count as a single byte, offset by one
    let num_rows = if version == 0x0102 {
        read_u8(cursor)? as u16 + 1
    } else {
        read_u16(cursor)?
    };
    if num_rows == 0 || num_rows > MAX_PATTERN_ROWS {
        return Err(XmError::InvalidPattern(0));
    }

    let packed_size = read_u16(cursor)?;

    cursor.seek(SeekFrom::Start(header_start + header_length as u64))?;

    let mut notes = Vec::with_capacity(num_rows as usize);

    if packed_size == 0 {
        // Empty pattern
        for _ in 0..num_rows {
            notes.push(vec![XmNote::default(); num_channels as usize]);
        }
    } else {
        let pattern_start = cursor.position();

        for _ in 0..num_rows {
            let mut row = Vec::with_capacity(num_channels as usize);
            for _ in 0..num_channels {
                row.push(unpack_note(cursor)?);
            }
            notes.push(row);
        }

        cursor.seek(SeekFrom::Start(pattern_start + packed_size as u64))?;
    }

    Ok(XmPattern { num_rows, notes })
}

/// Unpack a single note from the pattern data
fn unpack_note(cursor: &mut Cursor<&[u8]>) -> Result<XmNote, XmError> {
    let first_byte = read_u8(cursor)?;

    if first_byte & 0x80 != 0 {
        // Packed format - low bits say which fields follow
        let mut note = XmNote::default();
        if first_byte & 0x01 != 0 {
            note.note = read_u8(cursor)?;
        }
        if first_byte & 0x02 != 0 {
            note.instrument = read_u8(cursor)?;
        }
        if first_byte & 0x04 != 0 {
            note.volume = read_u8(cursor)?;
        }
        if first_byte & 0x08 != 0 {
            note.effect = read_u8(cursor)?;
        }
        if first_byte & 0x10 != 0 {
            note.effect_param = read_u8(cursor)?;
        }
        Ok(note)
    } else {
        // Unpacked format - 5 bytes in sequence
        Ok(XmNote {
            note: first_byte,
            instrument: read_u8(cursor)?,
            volume: read_u8(cursor)?,
            effect: read_u8(cursor)?,
            effect_param: read_u8(cursor)?,
        })
    }
}

/// Parse a single instrument header with its sample headers
///
/// Returns the instrument and the on-disk byte length of each sample's
/// PCM, which the caller uses to load the data (interleaved for 0x0104,
/// from the trailing data section otherwise).
fn parse_instrument(cursor: &mut Cursor<&[u8]>) -> Result<(XmInstrument, Vec<u32>), XmError> {
    let header_size = read_u32(cursor)?;
    let header_start = cursor.position();

    if header_size < 29 {
        // Minimal header - seek past and return an empty instrument
        cursor.seek(SeekFrom::Start(header_start + header_size.max(4) as u64 - 4))?;
        return Ok((XmInstrument::default(), Vec::new()));
    }

    let mut name_bytes = [0u8; 22];
    cursor.read_exact(&mut name_bytes)?;
    let name = read_string(&name_bytes);

    // Instrument type (1 byte) - always 0
    let _instrument_type = read_u8(cursor)?;

    let num_samples = read_u16(cursor)?;
    if num_samples > MAX_SAMPLES_PER_INSTRUMENT {
        return Err(XmError::InvalidInstrument(0));
    }

    let mut instrument = XmInstrument {
        name,
        ..Default::default()
    };
    let mut byte_lengths = Vec::new();

    if num_samples > 0 {
        let sample_header_size = read_u32(cursor)?;

        // Note to sample mapping (96 bytes)
        let mut map = [0u8; 96];
        cursor.read_exact(&mut map)?;
        instrument.note_sample_map = map;

        // Volume envelope points (48 bytes)
        let mut vol_points = Vec::with_capacity(MAX_ENVELOPE_POINTS);
        for _ in 0..MAX_ENVELOPE_POINTS {
            let x = read_u16(cursor)?;
            let y = read_u16(cursor)?;
            vol_points.push((x, y));
        }

        // Panning envelope points (48 bytes)
        let mut pan_points = Vec::with_capacity(MAX_ENVELOPE_POINTS);
        for _ in 0..MAX_ENVELOPE_POINTS {
            let x = read_u16(cursor)?;
            let y = read_u16(cursor)?;
            pan_points.push((x, y));
        }

        let num_vol_points = read_u8(cursor)?;
        let num_pan_points = read_u8(cursor)?;
        let vol_sustain = read_u8(cursor)?;
        let vol_loop_start = read_u8(cursor)?;
        let vol_loop_end = read_u8(cursor)?;
        let pan_sustain = read_u8(cursor)?;
        let pan_loop_start = read_u8(cursor)?;
        let pan_loop_end = read_u8(cursor)?;
        let vol_type = read_u8(cursor)?;
        let pan_type = read_u8(cursor)?;

        instrument.vibrato_type = read_u8(cursor)?;
        instrument.vibrato_sweep = read_u8(cursor)?;
        instrument.vibrato_depth = read_u8(cursor)?;
        instrument.vibrato_rate = read_u8(cursor)?;
        instrument.volume_fadeout = read_u16(cursor)?;

        // Reserved - skip to end of header
        cursor.seek(SeekFrom::Start(header_start + header_size as u64 - 4))?;

        if num_vol_points > 0 && (vol_type & 1) != 0 {
            vol_points.truncate((num_vol_points as usize).min(MAX_ENVELOPE_POINTS));
            instrument.volume_envelope = Some(XmEnvelope {
                points: vol_points,
                sustain_point: vol_sustain,
                loop_start: vol_loop_start,
                loop_end: vol_loop_end,
                sustain_enabled: (vol_type & 2) != 0,
                loop_enabled: (vol_type & 4) != 0,
            });
        }

        if num_pan_points > 0 && (pan_type & 1) != 0 {
            pan_points.truncate((num_pan_points as usize).min(MAX_ENVELOPE_POINTS));
            instrument.panning_envelope = Some(XmEnvelope {
                points: pan_points,
                sustain_point: pan_sustain,
                loop_start: pan_loop_start,
                loop_end: pan_loop_end,
                sustain_enabled: (pan_type & 2) != 0,
                loop_enabled: (pan_type & 4) != 0,
            });
        }

        // Sample headers
        for _ in 0..num_samples {
            let (sample, byte_length) = parse_sample_header(cursor, sample_header_size)?;
            instrument.samples.push(sample);
            byte_lengths.push(byte_length);
        }
    } else {
        cursor.seek(SeekFrom::Start(header_start + header_size as u64 - 4))?;
    }

    Ok((instrument, byte_lengths))
}

/// Parse one 40-byte sample header; returns the sample (without PCM) and
/// its on-disk byte length
fn parse_sample_header(
    cursor: &mut Cursor<&[u8]>,
    sample_header_size: u32,
) -> Result<(XmSample, u32), XmError> {
    let byte_length = read_u32(cursor)?;
    let loop_start_bytes = read_u32(cursor)?;
    let loop_length_bytes = read_u32(cursor)?;
    let volume = read_u8(cursor)?;
    let finetune = read_u8(cursor)? as i8;
    let sample_type = read_u8(cursor)?;
    let panning = read_u8(cursor)?;
    let relative_note = read_u8(cursor)? as i8;

    // Reserved (1 byte)
    cursor.seek(SeekFrom::Current(1))?;

    let mut name_bytes = [0u8; 22];
    cursor.read_exact(&mut name_bytes)?;
    let name = read_string(&name_bytes);

    if sample_header_size > 40 {
        cursor.seek(SeekFrom::Current((sample_header_size - 40) as i64))?;
    }

    let is_16bit = sample_type & 0x10 != 0;
    let shift = if is_16bit { 1 } else { 0 };

    let mut loop_type = sample_type & 0x03;
    if loop_type > 2 {
        loop_type = 2;
    }
    let length = byte_length >> shift;
    let mut loop_start = loop_start_bytes >> shift;
    let mut loop_length = loop_length_bytes >> shift;
    if loop_length == 0 {
        loop_type = LOOP_NONE;
    }
    if loop_start > length {
        loop_start = length;
    }
    if loop_start + loop_length > length {
        loop_length = length - loop_start;
    }

    let data = if is_16bit {
        SampleData::I16(Vec::new())
    } else {
        SampleData::I8(Vec::new())
    };

    Ok((
        XmSample {
            name,
            length,
            loop_start,
            loop_length,
            volume: volume.min(64),
            finetune,
            loop_type,
            panning,
            relative_note,
            data,
        },
        byte_length,
    ))
}

/// Load and delta-decode the PCM for every sample of an instrument
fn load_sample_data(
    cursor: &mut Cursor<&[u8]>,
    instrument: &mut XmInstrument,
    byte_lengths: &[u32],
) -> Result<(), XmError> {
    for (sample, &byte_length) in instrument.samples.iter_mut().zip(byte_lengths) {
        let mut raw = vec![0u8; byte_length as usize];
        cursor.read_exact(&mut raw)?;

        // On disk the PCM is stored as successive differences
        match &mut sample.data {
            SampleData::I8(out) => {
                out.reserve(raw.len());
                let mut value: i8 = 0;
                for &b in &raw {
                    value = value.wrapping_add(b as i8);
                    out.push(value);
                }
            }
            SampleData::I16(out) => {
                out.reserve(raw.len() / 2);
                let mut value: i16 = 0;
                for pair in raw.chunks_exact(2) {
                    let delta = i16::from_le_bytes([pair[0], pair[1]]);
                    value = value.wrapping_add(delta);
                    out.push(value);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Helper functions for reading data
// =============================================================================

pub(crate) fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, XmError> {
    let mut buf = [0u8; 1];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| XmError::UnexpectedEof)?;
    Ok(buf[0])
}

pub(crate) fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, XmError> {
    let mut buf = [0u8; 2];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| XmError::UnexpectedEof)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, XmError> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| XmError::UnexpectedEof)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_string(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).trim_end().to_string()
}
