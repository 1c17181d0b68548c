//! S3M (Scream Tracker 3) parsing
//!
//! S3M modules are translated into the IT data model on load. The IT
//! command space descends directly from S3M's, so effects pass through
//! with their letter numbering intact; the differences (panning scale,
//! note numbering, unsigned samples, channel setup bytes) are normalised
//! here, and the `OLD_EFFECTS` / `COMPAT_GXX` flags are raised so the
//! playback engine applies Scream Tracker semantics.

use std::io::{Cursor, Seek, SeekFrom};

use crate::error::ItError;
use crate::module::{
    ItFlags, ItModule, ItNote, ItPattern, ItSample, ItSampleFlags, SampleData,
};
use crate::parser::helpers::{read_string, read_u8, read_u16};
use crate::{effects, MAX_CHANNELS, NOTE_CUT, S3M_MAGIC, S3M_SAMPLE_MAGIC};

/// Offset of the "SCRM" magic
const S3M_MAGIC_OFFSET: usize = 44;

/// S3M channel setting: bit 7 disables the channel
const CHANNEL_DISABLED: u8 = 0x80;

/// Parse an S3M file into an ItModule
///
/// # Arguments
/// * `data` - Raw S3M file bytes
///
/// # Returns
/// * `Ok(ItModule)` - Parsed module with S3M compatibility flags raised
/// * `Err(ItError)` - Parse error
pub fn parse_s3m(data: &[u8]) -> Result<ItModule, ItError> {
    if data.len() < 96 {
        return Err(ItError::TooSmall);
    }
    if &data[S3M_MAGIC_OFFSET..S3M_MAGIC_OFFSET + 4] != S3M_MAGIC {
        return Err(ItError::InvalidMagic);
    }

    let mut cursor = Cursor::new(data);
    let name = read_string(&data[0..28]);

    cursor.seek(SeekFrom::Start(32))?;
    let num_orders = read_u16(&mut cursor)?;
    let num_instruments = read_u16(&mut cursor)?;
    let num_patterns = read_u16(&mut cursor)?;

    // Header flags and tracker version are not needed for playback
    let _flags = read_u16(&mut cursor)?;
    let _created_with = read_u16(&mut cursor)?;

    // Sample format: 1 = signed, 2 = unsigned
    let ffi = read_u16(&mut cursor)?;
    let unsigned_samples = ffi != 1;

    cursor.seek(SeekFrom::Start(48))?;
    let global_volume = read_u8(&mut cursor)?; // 0-64 in S3M
    let initial_speed = read_u8(&mut cursor)?.max(1);
    let initial_tempo = read_u8(&mut cursor)?.max(31);
    let master_volume = read_u8(&mut cursor)?;
    let _ultraclick = read_u8(&mut cursor)?;
    let default_pan_flag = read_u8(&mut cursor)?;

    // Channel settings (32 bytes at offset 64)
    let mut channel_settings = [0u8; 32];
    channel_settings.copy_from_slice(&data[64..96]);

    cursor.seek(SeekFrom::Start(96))?;
    let mut orders = vec![0u8; num_orders as usize];
    for o in orders.iter_mut() {
        *o = read_u8(&mut cursor)?;
    }

    let mut instrument_paras = Vec::with_capacity(num_instruments as usize);
    for _ in 0..num_instruments {
        instrument_paras.push(read_u16(&mut cursor)? as u32 * 16);
    }
    let mut pattern_paras = Vec::with_capacity(num_patterns as usize);
    for _ in 0..num_patterns {
        pattern_paras.push(read_u16(&mut cursor)? as u32 * 16);
    }

    // Optional default pan positions
    let pan_positions = if default_pan_flag == 0xFC {
        let mut pans = [0u8; 32];
        for p in pans.iter_mut() {
            *p = read_u8(&mut cursor)?;
        }
        Some(pans)
    } else {
        None
    };

    // Channel pan/volume tables in IT terms
    let mut channel_pan = [32 | CHANNEL_DISABLED; 64];
    let mut num_channels: u8 = 0;
    for (i, &setting) in channel_settings.iter().enumerate() {
        if setting & CHANNEL_DISABLED != 0 {
            continue;
        }
        let kind = setting & 0x7F;
        if kind < 16 {
            // PCM channel: 0-7 left, 8-15 right
            let mut pan = if kind < 8 { 16 } else { 48 };
            if let Some(pans) = &pan_positions {
                if pans[i] & 0x20 != 0 {
                    pan = (pans[i] & 0x0F) << 2;
                }
            }
            channel_pan[i] = pan;
            num_channels = num_channels.max(i as u8 + 1);
        }
    }
    let num_channels = num_channels.clamp(1, MAX_CHANNELS);
    let channel_volume = [64u8; 64];

    // Samples ("instruments" in S3M terms)
    let mut samples = Vec::with_capacity(num_instruments as usize);
    for (idx, &para) in instrument_paras.iter().enumerate() {
        if para == 0 {
            samples.push(ItSample::default());
            continue;
        }
        if para as usize + 80 > data.len() {
            return Err(ItError::OffsetOutOfRange(para));
        }
        samples.push(parse_s3m_sample(data, para as usize, unsigned_samples, idx as u16)?);
    }

    // Patterns
    let mut patterns = Vec::with_capacity(num_patterns as usize);
    for (idx, &para) in pattern_paras.iter().enumerate() {
        if para == 0 {
            patterns.push(ItPattern::empty(num_channels));
            continue;
        }
        if para as usize >= data.len() {
            return Err(ItError::OffsetOutOfRange(para));
        }
        patterns.push(
            parse_s3m_pattern(data, para as usize, num_channels)
                .map_err(|_| ItError::InvalidPattern(idx as u16))?,
        );
    }

    Ok(ItModule {
        name,
        flags: if master_volume & 0x80 != 0 {
            ItFlags::STEREO | ItFlags::OLD_EFFECTS | ItFlags::COMPAT_GXX
        } else {
            ItFlags::OLD_EFFECTS | ItFlags::COMPAT_GXX
        },
        num_channels,
        global_volume: (global_volume as u16 * 2).min(128) as u8,
        mix_volume: (master_volume & 0x7F).min(128),
        initial_speed,
        initial_tempo,
        panning_separation: 128,
        channel_pan,
        channel_volume,
        orders,
        instruments: Vec::new(),
        samples,
        patterns,
        message: None,
        midi_config: None,
    })
}

/// Parse one S3M sample header (+ PCM) into an ItSample
fn parse_s3m_sample(
    data: &[u8],
    pos: usize,
    unsigned: bool,
    index: u16,
) -> Result<ItSample, ItError> {
    let block = &data[pos..];

    let sample_type = block[0];
    let filename = read_string(&block[1..13]);
    let memseg = ((block[13] as u32) << 16) | u32::from(u16::from_le_bytes([block[14], block[15]]));
    let data_offset = memseg * 16;

    let length = u32::from_le_bytes([block[16], block[17], block[18], block[19]]);
    let loop_begin = u32::from_le_bytes([block[20], block[21], block[22], block[23]]);
    let loop_end = u32::from_le_bytes([block[24], block[25], block[26], block[27]]);
    let volume = block[28].min(64);
    let s3m_flags = block[31];
    let c2_speed = u32::from_le_bytes([block[32], block[33], block[34], block[35]]);
    let sample_name = read_string(&block[48..76]);

    if sample_type != 1 || &block[76..80] != S3M_SAMPLE_MAGIC {
        // Empty slot or AdLib instrument: keep the name, play nothing
        return Ok(ItSample {
            name: sample_name,
            filename,
            ..Default::default()
        });
    }

    let is_16bit = s3m_flags & 4 != 0;
    let mut flags = ItSampleFlags::HAS_DATA;
    if s3m_flags & 1 != 0 {
        flags = flags | ItSampleFlags::LOOP;
    }
    if is_16bit {
        flags = flags | ItSampleFlags::SAMPLE_16BIT;
    }

    let frames = length as usize;
    let offset = data_offset as usize;
    let bytes = frames * if is_16bit { 2 } else { 1 };
    if offset + bytes > data.len() {
        return Err(ItError::InvalidSample(index));
    }

    let pcm = if is_16bit {
        SampleData::I16(
            (0..frames)
                .map(|i| {
                    let p = offset + i * 2;
                    let raw = u16::from_le_bytes([data[p], data[p + 1]]);
                    if unsigned {
                        (raw ^ 0x8000) as i16
                    } else {
                        raw as i16
                    }
                })
                .collect(),
        )
    } else {
        SampleData::I8(
            data[offset..offset + frames]
                .iter()
                .map(|&b| if unsigned { (b ^ 0x80) as i8 } else { b as i8 })
                .collect(),
        )
    };

    Ok(ItSample {
        name: sample_name,
        filename,
        global_volume: 64,
        flags,
        default_volume: volume,
        default_pan: None,
        length,
        loop_begin: loop_begin.min(length),
        loop_end: loop_end.min(length),
        c5_speed: c2_speed,
        data: pcm,
        ..Default::default()
    })
}

/// Parse one packed S3M pattern into the expanded IT representation
fn parse_s3m_pattern(
    data: &[u8],
    pos: usize,
    num_channels: u8,
) -> Result<ItPattern, ItError> {
    let mut cursor = Cursor::new(data);
    cursor.seek(SeekFrom::Start(pos as u64))?;

    // Packed length (2 bytes, includes the length field)
    let _packed_length = read_u16(&mut cursor)?;

    let num_rows = 64u16;
    let mut notes = vec![vec![ItNote::default(); num_channels as usize]; num_rows as usize];

    let mut row = 0u16;
    while row < num_rows {
        let what = read_u8(&mut cursor)?;
        if what == 0 {
            row += 1;
            continue;
        }

        let channel = (what & 0x1F) as usize;
        let mut cell = ItNote::default();

        if what & 0x20 != 0 {
            let note = read_u8(&mut cursor)?;
            let instrument = read_u8(&mut cursor)?;
            cell.note = translate_s3m_note(note);
            cell.mask |= ItNote::MASK_NOTE;
            if instrument > 0 {
                cell.instrument = instrument;
                cell.mask |= ItNote::MASK_INSTRUMENT;
            }
            if note == 0xFF {
                // No note after all, only the instrument column
                cell.mask &= !ItNote::MASK_NOTE;
            }
        }
        if what & 0x40 != 0 {
            cell.volume = read_u8(&mut cursor)?.min(64);
            cell.mask |= ItNote::MASK_VOLUME;
        }
        if what & 0x80 != 0 {
            let command = read_u8(&mut cursor)?;
            let info = read_u8(&mut cursor)?;
            let (effect, param) = translate_s3m_effect(command, info);
            if effect != 0 {
                cell.effect = effect;
                cell.effect_param = param;
                cell.mask |= ItNote::MASK_EFFECT;
            }
        }

        if channel < num_channels as usize {
            notes[row as usize][channel] = cell;
        }
    }

    Ok(ItPattern { num_rows, notes })
}

/// Translate an S3M note byte to IT numbering
///
/// S3M packs octave and semitone into nibbles with middle C at octave 4;
/// the IT scale sits one octave higher (C-5 plays at the sample rate).
fn translate_s3m_note(note: u8) -> u8 {
    match note {
        0xFF => 0,
        0xFE => NOTE_CUT,
        _ => {
            let octave = note >> 4;
            let semitone = note & 0x0F;
            ((octave as u16 + 1) * 12 + semitone as u16).min(119) as u8
        }
    }
}

/// Translate an S3M effect into the IT command space
///
/// The numbering is shared (A=1 .. Z=26); only the panning command's
/// parameter scale differs.
fn translate_s3m_effect(command: u8, info: u8) -> (u8, u8) {
    if command == 0 || command > 26 {
        return (0, 0);
    }
    match command {
        // Xxx - S3M pans 0x00-0x80; IT uses the full byte
        effects::SET_PANNING => {
            if info == 0xA4 {
                // ST3 surround: map to the IT surround sound-control
                (effects::EXTENDED, 0x91)
            } else {
                ((effects::SET_PANNING), ((info.min(0x80) as u16 * 2).min(255)) as u8)
            }
        }
        _ => (command, info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_s3m_note() {
        // C-4 in S3M (octave 4, semitone 0) is note 60 in IT terms
        assert_eq!(translate_s3m_note(0x40), 60);
        // B-3
        assert_eq!(translate_s3m_note(0x3B), 59);
        assert_eq!(translate_s3m_note(0xFE), NOTE_CUT);
        assert_eq!(translate_s3m_note(0xFF), 0);
    }

    #[test]
    fn test_translate_s3m_effect() {
        // A08 stays the IT set-speed command
        assert_eq!(translate_s3m_effect(1, 8), (effects::SET_SPEED, 8));
        // X40 (centre) doubles to the IT scale
        assert_eq!(
            translate_s3m_effect(effects::SET_PANNING, 0x40),
            (effects::SET_PANNING, 0x80)
        );
        // XA4 is ST3 surround
        assert_eq!(
            translate_s3m_effect(effects::SET_PANNING, 0xA4),
            (effects::EXTENDED, 0x91)
        );
        assert_eq!(translate_s3m_effect(0, 5), (0, 0));
    }
}
