//! IT module data structures
//!
//! The same structures represent loaded S3M files; the S3M parser
//! translates samples, channel settings and effects into this model and
//! raises the compatibility flags the playback engine keys off.

mod envelope;
mod instrument;
mod sample;

pub use envelope::{ItEnvelope, ItEnvelopeFlags};
pub use instrument::{
    DuplicateCheckAction, DuplicateCheckType, ItInstrument, NewNoteAction,
};
pub use sample::{ItSample, ItSampleFlags, SampleData};

/// A parsed IT (or translated S3M) module
#[derive(Debug, Clone)]
pub struct ItModule {
    /// Song name (max 26 chars)
    pub name: String,
    /// Header flags
    pub flags: ItFlags,
    /// Number of used channels (1-64)
    pub num_channels: u8,
    /// Global volume (0-128)
    pub global_volume: u8,
    /// Mix volume (0-128)
    pub mix_volume: u8,
    /// Initial speed (ticks per row)
    pub initial_speed: u8,
    /// Initial tempo (BPM, >= 31)
    pub initial_tempo: u8,
    /// Panning separation (0-128)
    pub panning_separation: u8,
    /// Initial channel panning (0-64, 100 = surround)
    pub channel_pan: [u8; 64],
    /// Initial channel volume (0-64)
    pub channel_volume: [u8; 64],
    /// Order list (may contain ORDER_SKIP / ORDER_END markers)
    pub orders: Vec<u8>,
    /// Instrument definitions (empty in sample mode)
    pub instruments: Vec<ItInstrument>,
    /// Sample definitions
    pub samples: Vec<ItSample>,
    /// Pattern data
    pub patterns: Vec<ItPattern>,
    /// Optional song message
    pub message: Option<String>,
    /// Optional MIDI macro configuration
    pub midi_config: Option<Box<MidiConfig>>,
}

impl ItModule {
    /// True when the module uses instruments rather than raw samples
    pub fn uses_instruments(&self) -> bool {
        self.flags.contains(ItFlags::INSTRUMENTS)
    }

    /// True when pitch slides are linear rather than Amiga
    pub fn uses_linear_slides(&self) -> bool {
        self.flags.contains(ItFlags::LINEAR_SLIDES)
    }

    /// True when old (S3M-compatible) effect semantics apply
    pub fn uses_old_effects(&self) -> bool {
        self.flags.contains(ItFlags::OLD_EFFECTS)
    }

    /// True when Gxx shares slide memory with Exx/Fxx
    pub fn uses_compat_gxx(&self) -> bool {
        self.flags.contains(ItFlags::COMPAT_GXX)
    }
}

/// IT header flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItFlags(u16);

impl ItFlags {
    /// Stereo playback
    pub const STEREO: Self = Self(0x0001);
    /// Instrument mode (vs sample mode)
    pub const INSTRUMENTS: Self = Self(0x0004);
    /// Linear slides (vs Amiga)
    pub const LINEAR_SLIDES: Self = Self(0x0008);
    /// Old effect semantics (S3M compatibility)
    pub const OLD_EFFECTS: Self = Self(0x0010);
    /// Gxx shares memory with Exx/Fxx
    pub const COMPAT_GXX: Self = Self(0x0020);
    /// Use MIDI pitch controller
    pub const MIDI_PITCH: Self = Self(0x0040);
    /// Embedded MIDI configuration requested
    pub const REQ_MIDI_CFG: Self = Self(0x0080);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for ItFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single pattern: a row-major grid of notes
#[derive(Debug, Clone)]
pub struct ItPattern {
    /// Number of rows (1-200)
    pub num_rows: u16,
    /// Notes indexed by [row][channel]
    pub notes: Vec<Vec<ItNote>>,
}

impl ItPattern {
    /// Get the note at (row, channel), if present
    pub fn get_note(&self, row: u16, channel: u8) -> Option<&ItNote> {
        self.notes.get(row as usize)?.get(channel as usize)
    }

    /// An empty pattern of the standard 64 rows
    pub fn empty(num_channels: u8) -> Self {
        Self {
            num_rows: 64,
            notes: vec![vec![ItNote::default(); num_channels as usize]; 64],
        }
    }
}

/// A single pattern cell
///
/// `mask` records which fields are actually present in the cell; a zero
/// mask is an empty cell. This mirrors the on-disk encoding, where C-0
/// (note value 0) is a real note and absence is signalled separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItNote {
    /// Field presence bits (MASK_* constants)
    pub mask: u8,
    /// Note (0-119, or NOTE_CUT / NOTE_OFF / NOTE_FADE)
    pub note: u8,
    /// Instrument (1-200)
    pub instrument: u8,
    /// Volume column byte (raw IT encoding)
    pub volume: u8,
    /// Effect command (1-26, A=1)
    pub effect: u8,
    /// Effect parameter
    pub effect_param: u8,
}

impl ItNote {
    /// Note field present
    pub const MASK_NOTE: u8 = 0x01;
    /// Instrument field present
    pub const MASK_INSTRUMENT: u8 = 0x02;
    /// Volume column present
    pub const MASK_VOLUME: u8 = 0x04;
    /// Effect + parameter present
    pub const MASK_EFFECT: u8 = 0x08;

    pub fn has_note(&self) -> bool {
        self.mask & Self::MASK_NOTE != 0
    }

    pub fn has_instrument(&self) -> bool {
        self.mask & Self::MASK_INSTRUMENT != 0
    }

    pub fn has_volume(&self) -> bool {
        self.mask & Self::MASK_VOLUME != 0
    }

    pub fn has_effect(&self) -> bool {
        self.mask & Self::MASK_EFFECT != 0
    }
}

/// Embedded MIDI macro configuration
///
/// Three banks of 32-byte text slots: 9 global macros, 16 parametric
/// macros selected by SFx, and 128 fixed macros selected by Zxx.
#[derive(Debug, Clone)]
pub struct MidiConfig {
    /// Global macros (MIDI start/stop etc.)
    pub global: [[u8; 32]; 9],
    /// Parametric macros (SF0-SFF)
    pub sfx: [[u8; 32]; 16],
    /// Fixed macros (Z80-ZFF)
    pub zxx: [[u8; 32]; 128],
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            global: [[0; 32]; 9],
            sfx: [[0; 32]; 16],
            zxx: [[0; 32]; 128],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_it_flags() {
        let flags = ItFlags::STEREO | ItFlags::INSTRUMENTS | ItFlags::LINEAR_SLIDES;
        assert!(flags.contains(ItFlags::STEREO));
        assert!(flags.contains(ItFlags::INSTRUMENTS));
        assert!(!flags.contains(ItFlags::OLD_EFFECTS));
    }

    #[test]
    fn test_note_mask() {
        let mut note = ItNote::default();
        assert!(!note.has_note());
        note.mask = ItNote::MASK_NOTE | ItNote::MASK_EFFECT;
        note.note = 0; // C-0 is a real note
        assert!(note.has_note());
        assert!(note.has_effect());
        assert!(!note.has_volume());
    }
}
