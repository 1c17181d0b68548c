//! IT host channels and slave voices
//!
//! A host channel carries row-level state: effect memory, waveform
//! positions, loop counters and the link to its current slave voice. A
//! slave voice owns a sounding sample; NNA can disown it from its host,
//! after which the mixer keeps processing it independently. Host links
//! are validated through the slave's flags, never through liveness of an
//! index alone.

use modplay_it::{DuplicateCheckAction, DuplicateCheckType, NewNoteAction};

/// One host (pattern) channel
#[derive(Debug, Clone)]
pub struct ItChannel {
    /// Last instrument column value (memory)
    pub instrument: u8,
    /// Last note column value (pattern numbering)
    pub note: u8,
    /// Slave voice currently owned (index), u16::MAX when none
    pub slave: u16,

    /// Channel volume (Mxx, 0-64)
    pub channel_volume: u8,
    /// Note volume (0-64)
    pub volume: u8,
    /// Tremolo-adjusted volume for the current tick (0-64)
    pub tick_volume: u8,
    /// Panbrello-adjusted pan for the current tick (0-64)
    pub tick_pan: u8,
    /// Panning (0-64, 32 = centre)
    pub pan: u8,
    /// Surround mode (S91)
    pub surround: bool,
    /// Channel muted in the module header
    pub muted: bool,

    // Filter parameters (tracked for macro compatibility)
    pub filter_cutoff: u8,
    pub filter_resonance: u8,

    // Effect memory
    pub vol_slide_mem: u8,
    pub pitch_slide_mem: u8,
    pub tone_porta_mem: u8,
    /// Shared E/F/G memory used in compatible-Gxx mode
    pub efg_mem: u8,
    pub vibrato_mem: u8,
    pub tremor_mem: u8,
    pub arpeggio_mem: u8,
    pub chan_vol_slide_mem: u8,
    pub offset_mem: u8,
    pub high_offset: u8,
    pub pan_slide_mem: u8,
    pub retrig_mem: u8,
    pub tremolo_mem: u8,
    pub extended_mem: u8,
    pub tempo_mem: u8,
    pub global_vol_slide_mem: u8,
    pub panbrello_mem: u8,

    // Waveform state
    pub vib_waveform: u8,
    pub vib_pos: u8,
    pub vib_depth: u8,
    pub vib_speed: u8,
    pub trem_waveform: u8,
    pub trem_pos: u8,
    pub trem_depth: u8,
    pub trem_speed: u8,
    pub panbrello_waveform: u8,
    pub panbrello_pos: u8,
    pub panbrello_depth: u8,
    pub panbrello_speed: u8,

    // Tone portamento
    pub porta_target: u32,

    // Tremor
    pub tremor_counter: u8,
    pub tremor_mute: bool,

    // Retrigger
    pub retrig_counter: u8,

    // Row state
    pub effect: u8,
    pub effect_param: u8,
    pub vol_column: u8,
    pub note_cut_tick: u8,
    pub note_delay_tick: u8,
    pub delayed_note: u8,
    pub delayed_instrument: u8,
    pub delayed_volume: u8,

    // Pattern loop
    pub pattern_loop_row: u16,
    pub pattern_loop_count: u8,

    // Sxx state
    pub glissando: bool,
    /// Active parametric macro (SFx)
    pub active_macro: u8,
    /// NNA override for the next note (S73-S76)
    pub nna_override: Option<NewNoteAction>,
}

impl Default for ItChannel {
    fn default() -> Self {
        Self {
            instrument: 0,
            note: 0,
            slave: u16::MAX,
            channel_volume: 64,
            volume: 64,
            tick_volume: 64,
            tick_pan: 32,
            pan: 32,
            surround: false,
            muted: false,
            filter_cutoff: 127,
            filter_resonance: 0,
            vol_slide_mem: 0,
            pitch_slide_mem: 0,
            tone_porta_mem: 0,
            efg_mem: 0,
            vibrato_mem: 0,
            tremor_mem: 0,
            arpeggio_mem: 0,
            chan_vol_slide_mem: 0,
            offset_mem: 0,
            high_offset: 0,
            pan_slide_mem: 0,
            retrig_mem: 0,
            tremolo_mem: 0,
            extended_mem: 0,
            tempo_mem: 0,
            global_vol_slide_mem: 0,
            panbrello_mem: 0,
            vib_waveform: 0,
            vib_pos: 0,
            vib_depth: 0,
            vib_speed: 0,
            trem_waveform: 0,
            trem_pos: 0,
            trem_depth: 0,
            trem_speed: 0,
            panbrello_waveform: 0,
            panbrello_pos: 0,
            panbrello_depth: 0,
            panbrello_speed: 0,
            porta_target: 0,
            tremor_counter: 0,
            tremor_mute: false,
            retrig_counter: 0,
            effect: 0,
            effect_param: 0,
            vol_column: 0,
            note_cut_tick: 0,
            note_delay_tick: 0,
            delayed_note: 0,
            delayed_instrument: 0,
            delayed_volume: 0,
            pattern_loop_row: 0,
            pattern_loop_count: 0,
            glissando: false,
            active_macro: 0,
            nna_override: None,
        }
    }
}

/// Envelope playback state on a slave voice
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeState {
    /// Envelope is active on this voice
    pub enabled: bool,
    /// Tick position
    pub pos: u16,
    /// Envelope has run to its end
    pub finished: bool,
}

/// One slave (mixer) voice
#[derive(Debug, Clone)]
pub struct ItVoice {
    /// Voice is producing (or ramping out) audio
    pub on: bool,
    /// No longer follows its host channel (NNA background voice)
    pub disowned: bool,
    /// Host channel that spawned the voice
    pub host: u8,

    /// Instrument (1-based) and sample (1-based) identities
    pub instrument: u8,
    pub sample: u8,
    /// Translated note (0-119)
    pub note: u8,
    /// Instrument routed to MIDI when it was triggered
    pub midi: bool,
    /// Sample has a sustain loop (active until note-off)
    pub sustain: bool,

    /// Release phase entered
    pub note_off: bool,
    /// Fade-out running
    pub fading: bool,
    /// Fade amplitude (starts at 32768)
    pub fadeout_amp: u16,
    /// Fade decrement per tick
    pub fadeout_speed: u16,
    /// Voice must stop after its final ramp
    pub note_stop: bool,

    /// Current frequency (Hz-scaled, 32-bit like the original)
    pub frequency: u32,
    /// Frequency without vibrato/arpeggio
    pub base_frequency: u32,

    /// Note volume 0-64 (copied from the host each tick while owned)
    pub volume: u8,
    /// Channel volume at trigger (frozen when disowned)
    pub channel_volume: u8,
    /// Pan 0-64 (100 = surround handled via flag)
    pub pan: u8,
    pub surround: bool,
    /// Sample global volume 0-64
    pub sample_gv: u8,
    /// Instrument global volume 0-128
    pub instrument_gv: u8,
    /// Random volume swing percent applied at trigger
    pub swing_volume: i8,
    pub swing_pan: i8,

    // Envelopes
    pub vol_env: EnvelopeState,
    pub pan_env: EnvelopeState,
    pub pitch_env: EnvelopeState,

    // Auto-vibrato
    pub auto_vib_pos: u16,
    pub auto_vib_depth: u16,

    // Mixer state
    /// Combined sample position, 16 fractional bits
    pub pos_frac: i64,
    /// 16.16 resampling step
    pub delta: u32,
    /// Ping-pong direction
    pub backwards: bool,
    pub interpolate: bool,

    // Volume ramping (values << 16)
    pub lvol: i64,
    pub rvol: i64,
    pub lvol_target: i64,
    pub rvol_target: i64,
    pub lvol_step: i64,
    pub rvol_step: i64,
    pub ramp_left: u32,
}

impl Default for ItVoice {
    fn default() -> Self {
        Self {
            on: false,
            disowned: false,
            host: 0,
            instrument: 0,
            sample: 0,
            note: 0,
            midi: false,
            sustain: false,
            note_off: false,
            fading: false,
            fadeout_amp: 32768,
            fadeout_speed: 0,
            note_stop: false,
            frequency: 0,
            base_frequency: 0,
            volume: 64,
            channel_volume: 64,
            pan: 32,
            surround: false,
            sample_gv: 64,
            instrument_gv: 128,
            swing_volume: 0,
            swing_pan: 0,
            vol_env: EnvelopeState::default(),
            pan_env: EnvelopeState::default(),
            pitch_env: EnvelopeState::default(),
            auto_vib_pos: 0,
            auto_vib_depth: 0,
            pos_frac: 0,
            delta: 0,
            backwards: false,
            interpolate: true,
            lvol: 0,
            rvol: 0,
            lvol_target: 0,
            rvol_target: 0,
            lvol_step: 0,
            rvol_step: 0,
            ramp_left: 0,
        }
    }
}

impl ItVoice {
    /// Begin the release phase
    pub fn release(&mut self) {
        self.note_off = true;
    }

    /// Begin fading out
    pub fn fade(&mut self) {
        self.fading = true;
    }

    /// Audible enough to count in voice stealing comparisons
    pub fn steal_weight(&self) -> u32 {
        self.volume as u32 * self.fadeout_amp as u32
    }

    /// Does this voice duplicate (note/sample/instrument) a new trigger?
    pub fn matches_duplicate(
        &self,
        dct: DuplicateCheckType,
        note: u8,
        sample: u8,
        instrument: u8,
    ) -> bool {
        if !self.on {
            return false;
        }
        match dct {
            DuplicateCheckType::Off => false,
            DuplicateCheckType::Note => self.note == note && self.instrument == instrument,
            DuplicateCheckType::Sample => self.sample == sample,
            DuplicateCheckType::Instrument => self.instrument == instrument,
        }
    }

    /// Apply a duplicate check action
    pub fn apply_dca(&mut self, dca: DuplicateCheckAction) {
        match dca {
            DuplicateCheckAction::Cut => self.note_stop = true,
            DuplicateCheckAction::NoteOff => self.release(),
            DuplicateCheckAction::NoteFade => self.fade(),
        }
    }

    /// Start ramping toward new target volumes (14-bit)
    pub fn ramp_to(&mut self, lvol: i64, rvol: i64, ramp_len: u32) {
        let lt = lvol << 16;
        let rt = rvol << 16;
        if ramp_len == 0 || !self.on {
            self.lvol = lt;
            self.rvol = rt;
            self.ramp_left = 0;
        } else if lt != self.lvol || rt != self.rvol {
            self.lvol_step = (lt - self.lvol) / ramp_len as i64;
            self.rvol_step = (rt - self.rvol) / ramp_len as i64;
            self.ramp_left = ramp_len;
        }
        self.lvol_target = lt;
        self.rvol_target = rt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_check_matching() {
        let mut v = ItVoice {
            on: true,
            note: 60,
            sample: 2,
            instrument: 1,
            ..Default::default()
        };
        assert!(v.matches_duplicate(DuplicateCheckType::Note, 60, 9, 1));
        assert!(!v.matches_duplicate(DuplicateCheckType::Note, 61, 2, 1));
        assert!(v.matches_duplicate(DuplicateCheckType::Sample, 0, 2, 0));
        assert!(v.matches_duplicate(DuplicateCheckType::Instrument, 0, 0, 1));
        assert!(!v.matches_duplicate(DuplicateCheckType::Off, 60, 2, 1));
        v.on = false;
        assert!(!v.matches_duplicate(DuplicateCheckType::Instrument, 0, 0, 1));
    }

    #[test]
    fn test_dca_actions() {
        let mut v = ItVoice {
            on: true,
            ..Default::default()
        };
        v.apply_dca(DuplicateCheckAction::NoteOff);
        assert!(v.note_off);
        v.apply_dca(DuplicateCheckAction::NoteFade);
        assert!(v.fading);
        v.apply_dca(DuplicateCheckAction::Cut);
        assert!(v.note_stop);
    }
}
