//! New Note Action processing and slave voice allocation
//!
//! When a note starts on a host channel that is already sounding, the old
//! slave voice is cut, continued, released or faded according to the
//! instrument's NNA (or an S7x override). Non-cut actions disown the old
//! voice: the mixer keeps processing it, but it no longer follows the
//! host. Before the new voice starts, the duplicate check silences voices
//! that match the instrument's DCT criteria.
//!
//! Voice allocation prefers silent slots; when all 256 are busy the
//! search steals from the most crowded population of disowned voices,
//! quietest first, matching the reference search order.

use modplay_it::{DuplicateCheckAction, DuplicateCheckType, NewNoteAction};

use super::{ItPlayer, MAX_IT_VOICES};

impl ItPlayer {
    /// Apply the NNA to a channel's current slave before a new trigger
    ///
    /// Returns true when the old voice was disowned (so the new note must
    /// allocate a fresh slot).
    pub(crate) fn handle_nna(&mut self, ch_idx: usize, nna: NewNoteAction) -> bool {
        let slave_idx = match self.channel_slave(ch_idx) {
            Some(idx) => idx,
            None => return false,
        };

        let voice = &mut self.voices[slave_idx];
        match nna {
            NewNoteAction::Cut => {
                // The slot is reused directly; the ramp-out of the old
                // material happens through the volume ramp on retrigger
                voice.note_stop = true;
                false
            }
            NewNoteAction::Continue => {
                voice.disowned = true;
                true
            }
            NewNoteAction::NoteOff => {
                voice.disowned = true;
                voice.release();
                true
            }
            NewNoteAction::NoteFade => {
                voice.disowned = true;
                voice.fade();
                true
            }
        }
    }

    /// Duplicate check: apply the DCA to every voice matching the DCT
    ///
    /// MIDI-routed instruments always check by note, regardless of the
    /// configured DCT.
    pub(crate) fn duplicate_check(
        &mut self,
        dct: DuplicateCheckType,
        dca: DuplicateCheckAction,
        midi: bool,
        note: u8,
        sample: u8,
        instrument: u8,
    ) {
        let dct = if midi { DuplicateCheckType::Note } else { dct };
        if dct == DuplicateCheckType::Off {
            return;
        }
        for voice in &mut self.voices {
            if voice.matches_duplicate(dct, note, sample, instrument) {
                voice.apply_dca(dca);
            }
        }
    }

    /// Find a slave slot for a new note
    ///
    /// Search order: a free slot; then the quietest disowned voice of the
    /// sample most represented among disowned voices; then the quietest
    /// disowned voice of the host channel with the most disowned voices;
    /// finally the quietest voice outright.
    pub(crate) fn allocate_voice(&mut self, midi: bool) -> usize {
        // 1. Any inactive slot
        for (i, v) in self.voices.iter().enumerate() {
            if !v.on {
                return i;
            }
        }

        // 2. For MIDI, an inactive-by-host slot: one whose host channel
        // has moved on to a different slave
        if midi {
            for (i, v) in self.voices.iter().enumerate() {
                if v.disowned && self.channels[v.host as usize].slave != i as u16 {
                    return i;
                }
            }
        }

        // 3. Most-played sample across disowned voices, quietest first
        let mut sample_counts = [0u16; 256];
        for v in &self.voices {
            if v.on && v.disowned {
                sample_counts[v.sample as usize] += 1;
            }
        }
        if let Some((top_sample, _)) = sample_counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .max_by_key(|&(_, &c)| c)
        {
            if let Some(best) = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.on && v.disowned && v.sample as usize == top_sample)
                .min_by_key(|(_, v)| v.steal_weight())
                .map(|(i, _)| i)
            {
                return best;
            }
        }

        // 4. Host channel with the most disowned voices, quietest of them
        let mut host_counts = [0u16; super::MAX_IT_CHANNELS];
        for v in &self.voices {
            if v.on && v.disowned {
                host_counts[v.host as usize] += 1;
            }
        }
        if let Some((top_host, _)) = host_counts
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .max_by_key(|&(_, &c)| c)
        {
            if let Some(best) = self
                .voices
                .iter()
                .enumerate()
                .filter(|(_, v)| v.on && v.disowned && v.host as usize == top_host)
                .min_by_key(|(_, v)| v.steal_weight())
                .map(|(i, _)| i)
            {
                return best;
            }
        }

        // Last resort: quietest voice of all
        self.voices
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.steal_weight())
            .map(|(i, _)| i)
            .unwrap_or(MAX_IT_VOICES - 1)
    }
}
