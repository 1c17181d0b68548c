//! IT instrument structures

use super::envelope::ItEnvelope;

/// What happens to a sounding voice when a new note arrives on its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewNoteAction {
    /// Stop the old voice immediately
    #[default]
    Cut,
    /// Keep the old voice playing unchanged
    Continue,
    /// Release the old voice (note-off)
    NoteOff,
    /// Start fading the old voice out
    NoteFade,
}

impl NewNoteAction {
    pub fn from_byte(b: u8) -> Self {
        match b & 3 {
            0 => Self::Cut,
            1 => Self::Continue,
            2 => Self::NoteOff,
            _ => Self::NoteFade,
        }
    }
}

/// Which sounding voices count as duplicates of a new note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateCheckType {
    /// No duplicate checking
    #[default]
    Off,
    /// Same note and instrument
    Note,
    /// Same sample
    Sample,
    /// Same instrument
    Instrument,
}

impl DuplicateCheckType {
    pub fn from_byte(b: u8) -> Self {
        match b & 3 {
            0 => Self::Off,
            1 => Self::Note,
            2 => Self::Sample,
            _ => Self::Instrument,
        }
    }
}

/// What to do with voices that match the duplicate check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateCheckAction {
    /// Stop the duplicate immediately
    #[default]
    Cut,
    /// Release the duplicate
    NoteOff,
    /// Fade the duplicate out
    NoteFade,
}

impl DuplicateCheckAction {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => Self::NoteOff,
            2 => Self::NoteFade,
            _ => Self::Cut,
        }
    }
}

/// An IT instrument
#[derive(Debug, Clone)]
pub struct ItInstrument {
    /// Instrument name (max 26 chars)
    pub name: String,
    /// DOS filename (max 12 chars)
    pub filename: String,
    /// New note action
    pub nna: NewNoteAction,
    /// Duplicate check type
    pub dct: DuplicateCheckType,
    /// Duplicate check action
    pub dca: DuplicateCheckAction,
    /// Fade-out rate (subtracted from the 16-bit fade amplitude per tick)
    pub fadeout: u16,
    /// Pitch-pan separation (-32..32)
    pub pitch_pan_separation: i8,
    /// Pitch-pan centre note
    pub pitch_pan_center: u8,
    /// Global volume (0-128)
    pub global_volume: u8,
    /// Default pan (0-64), None when disabled
    pub default_pan: Option<u8>,
    /// Random volume variation (percent)
    pub random_volume: u8,
    /// Random panning variation
    pub random_pan: u8,
    /// Default filter cutoff (0-127), bit 7 = enabled
    pub filter_cutoff: u8,
    /// Default filter resonance (0-127), bit 7 = enabled
    pub filter_resonance: u8,
    /// MIDI channel (0 = none, 1-16, 17 = mapped)
    pub midi_channel: u8,
    /// MIDI program (1-128, 0xFF = none)
    pub midi_program: u8,
    /// MIDI bank
    pub midi_bank: u16,
    /// Note -> (note, sample) map, 120 entries
    pub note_map: [(u8, u8); 120],
    /// Volume envelope
    pub volume_envelope: ItEnvelope,
    /// Panning envelope
    pub panning_envelope: ItEnvelope,
    /// Pitch (or filter) envelope
    pub pitch_envelope: ItEnvelope,
}

impl Default for ItInstrument {
    fn default() -> Self {
        let mut note_map = [(0u8, 0u8); 120];
        for (i, entry) in note_map.iter_mut().enumerate() {
            *entry = (i as u8, 0);
        }
        Self {
            name: String::new(),
            filename: String::new(),
            nna: NewNoteAction::Cut,
            dct: DuplicateCheckType::Off,
            dca: DuplicateCheckAction::Cut,
            fadeout: 0,
            pitch_pan_separation: 0,
            pitch_pan_center: 60,
            global_volume: 128,
            default_pan: None,
            random_volume: 0,
            random_pan: 0,
            filter_cutoff: 0,
            filter_resonance: 0,
            midi_channel: 0,
            midi_program: 0xFF,
            midi_bank: 0,
            note_map,
            volume_envelope: ItEnvelope::default(),
            panning_envelope: ItEnvelope::default(),
            pitch_envelope: ItEnvelope::default(),
        }
    }
}

impl ItInstrument {
    /// Resolve a pattern note through the note map
    ///
    /// Returns the translated note and the 1-based sample number
    /// (0 = no sample).
    pub fn map_note(&self, note: u8) -> (u8, u8) {
        if note > 119 {
            return (note, 0);
        }
        self.note_map[note as usize]
    }

    /// True when this instrument is routed to MIDI
    pub fn is_midi(&self) -> bool {
        self.midi_channel != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_note_map_is_identity() {
        let instr = ItInstrument::default();
        assert_eq!(instr.map_note(60), (60, 0));
        assert_eq!(instr.map_note(0), (0, 0));
    }

    #[test]
    fn test_nna_from_byte() {
        assert_eq!(NewNoteAction::from_byte(0), NewNoteAction::Cut);
        assert_eq!(NewNoteAction::from_byte(1), NewNoteAction::Continue);
        assert_eq!(NewNoteAction::from_byte(2), NewNoteAction::NoteOff);
        assert_eq!(NewNoteAction::from_byte(3), NewNoteAction::NoteFade);
    }
}
