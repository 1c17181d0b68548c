//! IT/S3M playback engine
//!
//! Implements the Impulse Tracker tick/row state machine: host channels
//! drive up to 256 slave voices through NNA, duplicate checks, three
//! envelopes per instrument and the A..Z effect space. S3M modules arrive
//! translated to the IT data model with the old-effects and
//! compatible-Gxx flags raised.

mod channels;
mod effects;
mod midi;
mod mixer;
mod nna;
mod random;
mod tables;

#[cfg(test)]
mod tests;

pub use channels::{EnvelopeState, ItChannel, ItVoice};
pub use midi::{MacroContext, MidiFilterState};
pub use random::ItRandom;

use modplay_it::{ItModule, SampleData, ORDER_END, ORDER_SKIP};

use crate::sample::{LoopMode, PaddedPcm};

/// Host (pattern) channels
pub const MAX_IT_CHANNELS: usize = 64;

/// Slave (mixer) voices
pub const MAX_IT_VOICES: usize = 256;

/// IT/S3M playback engine
#[derive(Debug)]
pub struct ItPlayer {
    pub(crate) module: ItModule,

    /// Padded PCM per sample slot (left channel)
    pub(crate) samples: Vec<PaddedPcm>,
    /// Right channels of stereo samples
    pub(crate) samples_right: Vec<Option<PaddedPcm>>,
    /// Sustain-loop variants, used while a note is held
    pub(crate) samples_sustain: Vec<Option<PaddedPcm>>,

    pub(crate) channels: Vec<ItChannel>,
    pub(crate) voices: Vec<ItVoice>,

    pub(crate) rng: ItRandom,
    pub(crate) midi: MidiFilterState,

    // Playback cursor
    pub(crate) current_order: u16,
    pub(crate) current_row: u16,
    pub(crate) current_tick: u16,
    pub(crate) speed: u16,
    pub(crate) tempo: u16,
    pub(crate) global_volume: u8,
    pub(crate) tempo_slide: i8,

    // Pattern flow
    pub(crate) pattern_delay: u8,
    pub(crate) pattern_delay_count: u8,
    pub(crate) fine_pattern_delay: u8,
    pub(crate) pending_jump: Option<(u16, u16)>,
    pub(crate) pattern_loop_jump: Option<u16>,

    // Mixing
    pub(crate) mix_rate: u32,
    pub(crate) tick_samples_left: u32,
    pub(crate) playing: bool,
    pub(crate) acc: Vec<i32>,
    pub(crate) quick_ramp_len: u32,
}

impl ItPlayer {
    /// Build a player for a loaded module at the given mixing rate
    pub fn new(module: ItModule, mix_rate: u32) -> Self {
        let mut samples = Vec::with_capacity(module.samples.len());
        let mut samples_right = Vec::with_capacity(module.samples.len());
        let mut samples_sustain = Vec::with_capacity(module.samples.len());
        for s in &module.samples {
            let loop_mode = if s.has_loop() {
                if s.is_pingpong_loop() {
                    LoopMode::PingPong
                } else {
                    LoopMode::Forward
                }
            } else {
                LoopMode::Off
            };
            let build = |begin: u32, end: u32, mode: LoopMode| match &s.data {
                SampleData::I8(v) => PaddedPcm::from_i8(v, begin, end, mode),
                SampleData::I16(v) => PaddedPcm::from_i16(v, begin, end, mode),
            };
            samples.push(build(s.loop_begin, s.loop_end, loop_mode));
            // A held note plays the sustain loop; the regular loop takes
            // over at note-off
            samples_sustain.push(if s.has_sustain_loop() {
                let mode = if s.is_pingpong_sustain() {
                    LoopMode::PingPong
                } else {
                    LoopMode::Forward
                };
                Some(build(s.sustain_begin, s.sustain_end, mode))
            } else {
                None
            });
            samples_right.push(s.data_right.as_ref().map(|d| match d {
                SampleData::I8(v) => PaddedPcm::from_i8(v, s.loop_begin, s.loop_end, loop_mode),
                SampleData::I16(v) => PaddedPcm::from_i16(v, s.loop_begin, s.loop_end, loop_mode),
            }));
        }

        let num_channels = (module.num_channels as usize).min(MAX_IT_CHANNELS);
        let mut channels = vec![ItChannel::default(); num_channels];
        for (i, ch) in channels.iter_mut().enumerate() {
            let pan = module.channel_pan[i];
            ch.muted = pan >= 128;
            if pan == 100 {
                ch.surround = true;
                ch.pan = 32;
            } else {
                ch.pan = (pan & 0x7F).min(64);
            }
            ch.channel_volume = module.channel_volume[i].min(64);
        }

        let mut player = Self {
            samples,
            samples_right,
            samples_sustain,
            channels,
            voices: vec![ItVoice::default(); MAX_IT_VOICES],
            rng: ItRandom::new(),
            midi: MidiFilterState::new(),
            current_order: 0,
            current_row: 0,
            current_tick: 0,
            speed: module.initial_speed.max(1) as u16,
            tempo: module.initial_tempo.max(31) as u16,
            global_volume: module.global_volume.min(128),
            tempo_slide: 0,
            pattern_delay: 0,
            pattern_delay_count: 0,
            fine_pattern_delay: 0,
            pending_jump: None,
            pattern_loop_jump: None,
            mix_rate,
            tick_samples_left: 0,
            playing: false,
            acc: Vec::new(),
            quick_ramp_len: (mix_rate / 200).max(1),
            module,
        };
        player.current_order = player.first_playable_order();
        player
    }

    /// Output frames per tracker tick at the current tempo
    pub(crate) fn samples_per_tick(&self) -> u32 {
        (self.mix_rate * 5 / 2) / self.tempo.max(31) as u32
    }

    /// First order slot that holds a playable pattern
    fn first_playable_order(&self) -> u16 {
        for (i, &o) in self.module.orders.iter().enumerate() {
            if o == ORDER_END {
                break;
            }
            if o != ORDER_SKIP {
                return i as u16;
            }
        }
        0
    }

    /// Next playable order after `from`, wrapping at the end marker
    pub(crate) fn next_playable_order(&self, from: u16) -> u16 {
        let orders = &self.module.orders;
        let mut idx = from as usize;
        let mut wrapped = false;
        loop {
            if idx >= orders.len() || orders[idx] == ORDER_END {
                if wrapped {
                    return 0;
                }
                idx = 0;
                wrapped = true;
                continue;
            }
            if orders[idx] == ORDER_SKIP {
                idx += 1;
                continue;
            }
            return idx as u16;
        }
    }

    /// Pattern at an order slot
    pub(crate) fn pattern_at(&self, order: u16) -> Option<&modplay_it::ItPattern> {
        let idx = *self.module.orders.get(order as usize)? as usize;
        if idx >= 254 {
            return None;
        }
        self.module.patterns.get(idx)
    }

    /// Reset the cursor, voices, RNG and MIDI state; start playing
    pub fn play(&mut self) {
        for (i, ch) in self.channels.iter_mut().enumerate() {
            let muted = ch.muted;
            *ch = ItChannel::default();
            let pan = self.module.channel_pan[i];
            ch.muted = muted;
            if pan == 100 {
                ch.surround = true;
                ch.pan = 32;
            } else {
                ch.pan = (pan & 0x7F).min(64);
            }
            ch.channel_volume = self.module.channel_volume[i].min(64);
        }
        for v in &mut self.voices {
            *v = ItVoice::default();
        }
        self.rng.reset();
        self.midi.reset_filters();
        self.current_order = self.first_playable_order();
        self.current_row = 0;
        self.current_tick = 0;
        self.speed = self.module.initial_speed.max(1) as u16;
        self.tempo = self.module.initial_tempo.max(31) as u16;
        self.global_volume = self.module.global_volume.min(128);
        self.tempo_slide = 0;
        self.pattern_delay = 0;
        self.pattern_delay_count = 0;
        self.fine_pattern_delay = 0;
        self.pending_jump = None;
        self.pattern_loop_jump = None;
        self.tick_samples_left = 0;
        self.playing = true;
    }

    /// Halt mixing; the pattern cursor is retained
    pub fn stop(&mut self) {
        self.playing = false;
        for v in &mut self.voices {
            v.on = false;
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Render interleaved stereo frames into `out` (len = 2 * frames)
    pub fn generate_samples(&mut self, out: &mut [i16]) {
        let frames = out.len() / 2;
        if !self.playing {
            out.fill(0);
            return;
        }
        let mut done = 0usize;
        while done < frames {
            if self.tick_samples_left == 0 {
                self.advance_tick();
                self.update_voices();
                self.tick_samples_left = self.samples_per_tick().max(1);
            }
            let n = (frames - done).min(self.tick_samples_left as usize);
            self.mix_frames(n);
            for (i, frame) in self.acc[..n * 2].iter().enumerate() {
                // 28-bit stereo accumulator down to 16 bits
                out[done * 2 + i] = (frame >> 13).clamp(-32768, 32767) as i16;
            }
            self.tick_samples_left -= n as u32;
            done += n;
        }
    }

    /// Render normalised stereo floats into `out` (len = 2 * frames)
    pub fn generate_float_samples(&mut self, out: &mut [f32]) {
        let frames = out.len() / 2;
        if !self.playing {
            out.fill(0.0);
            return;
        }
        let mut done = 0usize;
        while done < frames {
            if self.tick_samples_left == 0 {
                self.advance_tick();
                self.update_voices();
                self.tick_samples_left = self.samples_per_tick().max(1);
            }
            let n = (frames - done).min(self.tick_samples_left as usize);
            self.mix_frames(n);
            for (i, frame) in self.acc[..n * 2].iter().enumerate() {
                let v = (frame >> 13).clamp(-32768, 32767);
                out[done * 2 + i] = v as f32 / 32768.0;
            }
            self.tick_samples_left -= n as u32;
            done += n;
        }
    }

    /// The slave voice a channel currently owns, validated through flags
    pub(crate) fn channel_slave(&self, ch_idx: usize) -> Option<usize> {
        let slave = self.channels[ch_idx].slave;
        if slave == u16::MAX {
            return None;
        }
        let v = self.voices.get(slave as usize)?;
        if v.on && !v.disowned && v.host as usize == ch_idx {
            Some(slave as usize)
        } else {
            None
        }
    }
}
