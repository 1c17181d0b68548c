//! IT instrument parsing (the version >= 2.00 layout)

use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::error::ItError;
use crate::module::{
    DuplicateCheckAction, DuplicateCheckType, ItEnvelope, ItEnvelopeFlags, ItInstrument,
    NewNoteAction,
};
use crate::{INSTRUMENT_MAGIC, MAX_ENVELOPE_POINTS};

use super::helpers::{read_string, read_u8, read_u16};

/// Parse a single instrument (new-format layout)
pub(crate) fn parse_instrument(cursor: &mut Cursor<&[u8]>) -> Result<ItInstrument, ItError> {
    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| ItError::UnexpectedEof)?;
    if &magic != INSTRUMENT_MAGIC {
        return Err(ItError::InvalidInstrument(0));
    }

    let mut filename_bytes = [0u8; 12];
    cursor.read_exact(&mut filename_bytes)?;
    let filename = read_string(&filename_bytes);

    // Reserved (1 byte)
    cursor.seek(SeekFrom::Current(1))?;

    let nna = NewNoteAction::from_byte(read_u8(cursor)?);
    let dct = DuplicateCheckType::from_byte(read_u8(cursor)?);
    let dca = DuplicateCheckAction::from_byte(read_u8(cursor)?);

    let fadeout = read_u16(cursor)?;
    let pitch_pan_separation = read_u8(cursor)? as i8;
    let pitch_pan_center = read_u8(cursor)?;
    let global_volume = read_u8(cursor)?;

    let dfp = read_u8(cursor)?;
    let default_pan = if dfp & 0x80 == 0 {
        Some((dfp & 0x7F).min(64))
    } else {
        None
    };

    let random_volume = read_u8(cursor)?;
    let random_pan = read_u8(cursor)?;

    // TrkVers (2), NoS (1), reserved (1)
    cursor.seek(SeekFrom::Current(4))?;

    let mut name_bytes = [0u8; 26];
    cursor.read_exact(&mut name_bytes)?;
    let name = read_string(&name_bytes);

    let filter_cutoff = read_u8(cursor)?;
    let filter_resonance = read_u8(cursor)?;
    let midi_channel = read_u8(cursor)?;
    let midi_program = read_u8(cursor)?;
    let midi_bank = read_u16(cursor)?;

    // Note -> (note, sample) map: 120 pairs
    let mut note_map = [(0u8, 0u8); 120];
    for entry in note_map.iter_mut() {
        let note = read_u8(cursor)?;
        let sample = read_u8(cursor)?;
        *entry = (note, sample);
    }

    let volume_envelope = parse_envelope(cursor)?;
    let panning_envelope = parse_envelope(cursor)?;
    let pitch_envelope = parse_envelope(cursor)?;

    Ok(ItInstrument {
        name,
        filename,
        nna,
        dct,
        dca,
        fadeout,
        pitch_pan_separation,
        pitch_pan_center,
        global_volume: global_volume.min(128),
        default_pan,
        random_volume,
        random_pan,
        filter_cutoff,
        filter_resonance,
        midi_channel,
        midi_program,
        midi_bank,
        note_map,
        volume_envelope,
        panning_envelope,
        pitch_envelope,
    })
}

/// Parse one 82-byte envelope block
fn parse_envelope(cursor: &mut Cursor<&[u8]>) -> Result<ItEnvelope, ItError> {
    let flags = ItEnvelopeFlags::from_bits(read_u8(cursor)?);
    let num_nodes = read_u8(cursor)? as usize;
    if num_nodes > MAX_ENVELOPE_POINTS {
        return Err(ItError::InvalidInstrument(0));
    }
    let loop_begin = read_u8(cursor)?;
    let loop_end = read_u8(cursor)?;
    let sustain_begin = read_u8(cursor)?;
    let sustain_end = read_u8(cursor)?;

    // 25 node slots of (value i8, tick u16), then a trailing pad byte
    let mut nodes = Vec::with_capacity(num_nodes);
    for i in 0..MAX_ENVELOPE_POINTS {
        let value = read_u8(cursor)? as i8;
        let tick = read_u16(cursor)?;
        if i < num_nodes {
            nodes.push((tick, value));
        }
    }
    cursor.seek(SeekFrom::Current(1))?;

    Ok(ItEnvelope {
        flags,
        nodes,
        loop_begin,
        loop_end,
        sustain_begin,
        sustain_end,
    })
}
