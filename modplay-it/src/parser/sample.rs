//! IT sample header parsing and PCM loading

use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::compression::{decompress_it_8bit, decompress_it_16bit};
use crate::error::ItError;
use crate::module::{ItSample, ItSampleFlags, SampleData};
use crate::SAMPLE_MAGIC;

use super::helpers::{read_string, read_u32, read_u8};

/// Convert flag: data is signed (clear means unsigned, to be toggled)
const CVT_SIGNED: u8 = 0x01;
/// Convert flag: compressed data uses the doubled delta of IT 2.15
const CVT_DELTA: u8 = 0x04;

/// Parse a single sample header and load its PCM from `data`
pub(crate) fn parse_sample(
    cursor: &mut Cursor<&[u8]>,
    data: &[u8],
    index: u16,
) -> Result<ItSample, ItError> {
    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| ItError::UnexpectedEof)?;
    if &magic != SAMPLE_MAGIC {
        return Err(ItError::InvalidSample(index));
    }

    let mut filename_bytes = [0u8; 12];
    cursor.read_exact(&mut filename_bytes)?;
    let filename = read_string(&filename_bytes);

    // Reserved (1 byte)
    cursor.seek(SeekFrom::Current(1))?;

    let global_volume = read_u8(cursor)?.min(64);
    let flags = ItSampleFlags::from_bits(read_u8(cursor)?);
    let default_volume = read_u8(cursor)?.min(64);

    let mut name_bytes = [0u8; 26];
    cursor.read_exact(&mut name_bytes)?;
    let name = read_string(&name_bytes);

    let cvt = read_u8(cursor)?;

    let dfp = read_u8(cursor)?;
    let default_pan = if dfp & 0x80 != 0 {
        Some((dfp & 0x7F).min(64))
    } else {
        None
    };

    let length = read_u32(cursor)?;
    let loop_begin = read_u32(cursor)?;
    let loop_end = read_u32(cursor)?;
    let c5_speed = read_u32(cursor)?;
    let sustain_begin = read_u32(cursor)?;
    let sustain_end = read_u32(cursor)?;
    let data_offset = read_u32(cursor)?;

    let vibrato_speed = read_u8(cursor)?;
    let vibrato_depth = read_u8(cursor)?;
    let vibrato_rate = read_u8(cursor)?;
    let vibrato_type = read_u8(cursor)?;

    let mut sample = ItSample {
        name,
        filename,
        global_volume,
        flags,
        default_volume,
        default_pan,
        length,
        loop_begin: loop_begin.min(length),
        loop_end: loop_end.min(length),
        c5_speed,
        sustain_begin: sustain_begin.min(length),
        sustain_end: sustain_end.min(length),
        vibrato_speed,
        vibrato_depth,
        vibrato_rate,
        vibrato_type,
        data: SampleData::I8(Vec::new()),
        data_right: None,
    };

    if sample.flags.contains(ItSampleFlags::HAS_DATA) && length > 0 {
        load_pcm(&mut sample, data, data_offset, cvt, index)?;
    } else {
        sample.length = 0;
    }

    Ok(sample)
}

/// Load, decompress and sign-convert a sample's PCM
fn load_pcm(
    sample: &mut ItSample,
    data: &[u8],
    data_offset: u32,
    cvt: u8,
    index: u16,
) -> Result<(), ItError> {
    // Only plain signed/unsigned and the compression delta flag are
    // handled; other conversions (big-endian, PTM deltas) never occur in
    // IT-written files
    if cvt & !(CVT_SIGNED | CVT_DELTA) != 0 {
        return Err(ItError::UnsupportedSampleConvert(cvt));
    }

    let offset = data_offset as usize;
    if offset >= data.len() {
        return Err(ItError::OffsetOutOfRange(data_offset));
    }

    let frames = sample.length as usize;
    let is_16bit = sample.is_16bit();
    let is_stereo = sample.is_stereo();
    let signed = cvt & CVT_SIGNED != 0;
    let it215 = cvt & CVT_DELTA != 0;

    if sample.is_compressed() {
        let src = &data[offset..];
        if is_16bit {
            let pcm = decompress_it_16bit(src, frames, it215)?;
            sample.data = SampleData::I16(pcm);
        } else {
            let pcm = decompress_it_8bit(src, frames, it215)?;
            sample.data = SampleData::I8(pcm);
        }
        // Compressed stereo is not produced by any IT version; the right
        // channel silently mirrors the left if flagged
        return Ok(());
    }

    let bytes_per_frame = if is_16bit { 2 } else { 1 };
    let channels = if is_stereo { 2 } else { 1 };
    if offset + frames * bytes_per_frame * channels > data.len() {
        return Err(ItError::InvalidSample(index));
    }

    if is_16bit {
        let read_channel = |base: usize| -> Vec<i16> {
            (0..frames)
                .map(|i| {
                    let p = base + i * 2;
                    let raw = u16::from_le_bytes([data[p], data[p + 1]]);
                    if signed {
                        raw as i16
                    } else {
                        (raw ^ 0x8000) as i16
                    }
                })
                .collect()
        };
        sample.data = SampleData::I16(read_channel(offset));
        if is_stereo {
            sample.data_right = Some(SampleData::I16(read_channel(offset + frames * 2)));
        }
    } else {
        let read_channel = |base: usize| -> Vec<i8> {
            data[base..base + frames]
                .iter()
                .map(|&b| if signed { b as i8 } else { (b ^ 0x80) as i8 })
                .collect()
        };
        sample.data = SampleData::I8(read_channel(offset));
        if is_stereo {
            sample.data_right = Some(SampleData::I8(read_channel(offset + frames)));
        }
    }

    Ok(())
}
