//! XM/MOD playback engine
//!
//! Implements the FastTracker II tick/row state machine and its
//! fixed-point mixer. MOD files arrive here already translated to the XM
//! data model by the loader, so a single engine covers both formats.
//!
//! The generation loop alternates between advancing the tracker by one
//! tick (updating per-voice frequency/volume/pan targets) and rendering
//! up to one tick's worth of frames through the mixer.

mod channels;
mod effects;
mod mixer;
mod tables;

#[cfg(test)]
mod tests;

pub use channels::XmChannel;
pub use mixer::XmVoice;
pub use tables::FreqTables;

use modplay_xm::{SampleData, XmModule};

use crate::sample::{LoopMode, PaddedPcm};

/// Maximum pattern channels
pub const MAX_XM_CHANNELS: usize = 32;

/// Mixer voices: two per channel, the second carrying the ramp-down of a
/// replaced note
pub const MAX_XM_VOICES: usize = MAX_XM_CHANNELS * 2;

/// Default ticks per row
pub const DEFAULT_SPEED: u16 = 6;

/// Default BPM
pub const DEFAULT_BPM: u16 = 125;

/// Trigger metadata of one flattened sample
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SampleMeta {
    pub volume: u8,
    pub panning: u8,
    pub finetune: i8,
    pub relative_note: i8,
}

/// XM/MOD playback engine
#[derive(Debug)]
pub struct XmPlayer {
    pub(crate) module: XmModule,
    pub(crate) tables: FreqTables,

    /// Flattened, padded samples of every instrument
    pub(crate) samples: Vec<PaddedPcm>,
    pub(crate) sample_meta: Vec<SampleMeta>,
    /// First flattened sample index per instrument
    pub(crate) sample_base: Vec<u32>,

    pub(crate) channels: Vec<XmChannel>,
    pub(crate) voices: Vec<XmVoice>,

    // Playback cursor
    pub(crate) current_order: u16,
    pub(crate) current_row: u16,
    pub(crate) current_tick: u16,
    pub(crate) speed: u16,
    pub(crate) bpm: u16,
    pub(crate) global_volume: u8,

    // Pattern flow
    pub(crate) pattern_delay: u8,
    pub(crate) pattern_delay_count: u8,
    pub(crate) pending_jump: Option<(u16, u16)>,
    pub(crate) pattern_loop_jump: Option<u16>,

    // Global effect memory
    pub(crate) last_global_vol_slide: u8,

    // Mixing state
    pub(crate) mix_rate: u32,
    pub(crate) tick_samples_left: u32,
    pub(crate) playing: bool,
    pub(crate) acc: Vec<i32>,
    /// Quick volume ramp length (about 5 ms)
    pub(crate) quick_ramp_len: u32,
}

impl XmPlayer {
    /// Build a player for a loaded module at the given mixing rate
    pub fn new(module: XmModule, mix_rate: u32) -> Self {
        let tables = FreqTables::new(module.linear_frequency_table, mix_rate);

        // Flatten every instrument's samples into one padded list
        let mut samples = Vec::new();
        let mut sample_meta = Vec::new();
        let mut sample_base = Vec::with_capacity(module.instruments.len());
        for instrument in &module.instruments {
            sample_base.push(samples.len() as u32);
            for s in &instrument.samples {
                let loop_mode = match s.loop_type {
                    modplay_xm::LOOP_FORWARD => LoopMode::Forward,
                    modplay_xm::LOOP_PINGPONG => LoopMode::PingPong,
                    _ => LoopMode::Off,
                };
                let padded = match &s.data {
                    SampleData::I8(v) => PaddedPcm::from_i8(v, s.loop_start, s.loop_end(), loop_mode),
                    SampleData::I16(v) => {
                        PaddedPcm::from_i16(v, s.loop_start, s.loop_end(), loop_mode)
                    }
                };
                samples.push(padded);
                sample_meta.push(SampleMeta {
                    volume: s.volume,
                    panning: s.panning,
                    finetune: s.finetune,
                    relative_note: s.relative_note,
                });
            }
        }

        let num_channels = module.num_channels as usize;
        let mut channels = vec![XmChannel::default(); num_channels.min(MAX_XM_CHANNELS)];
        for ch in &mut channels {
            ch.reset();
        }

        let speed = if module.default_speed == 0 {
            DEFAULT_SPEED
        } else {
            module.default_speed
        };
        let bpm = if module.default_bpm < 32 {
            DEFAULT_BPM
        } else {
            module.default_bpm
        };

        Self {
            tables,
            samples,
            sample_meta,
            sample_base,
            channels,
            voices: vec![XmVoice::default(); MAX_XM_VOICES],
            current_order: 0,
            current_row: 0,
            current_tick: 0,
            speed,
            bpm,
            global_volume: 64,
            pattern_delay: 0,
            pattern_delay_count: 0,
            pending_jump: None,
            pattern_loop_jump: None,
            last_global_vol_slide: 0,
            mix_rate,
            tick_samples_left: 0,
            playing: false,
            acc: Vec::new(),
            quick_ramp_len: (mix_rate / 200).max(1),
            module,
        }
    }

    /// Output frames per tracker tick at the current tempo
    pub(crate) fn samples_per_tick(&self) -> u32 {
        (self.mix_rate * 5 / 2) / self.bpm.max(32) as u32
    }

    /// Reset the cursor and start playback from the top
    pub fn play(&mut self) {
        for ch in &mut self.channels {
            ch.reset();
        }
        for v in &mut self.voices {
            *v = XmVoice::default();
        }
        self.current_order = 0;
        self.current_row = 0;
        self.current_tick = 0;
        self.speed = if self.module.default_speed == 0 {
            DEFAULT_SPEED
        } else {
            self.module.default_speed
        };
        self.bpm = if self.module.default_bpm < 32 {
            DEFAULT_BPM
        } else {
            self.module.default_bpm
        };
        self.global_volume = 64;
        self.pattern_delay = 0;
        self.pattern_delay_count = 0;
        self.pending_jump = None;
        self.pattern_loop_jump = None;
        self.tick_samples_left = 0;
        self.playing = true;
    }

    /// Halt mixing; the pattern cursor is retained
    pub fn stop(&mut self) {
        self.playing = false;
        for v in &mut self.voices {
            v.active = false;
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
                // Bring the 24-bit accumulator into 16-bit range
                out[done * 2 + i] = (frame >> 8).clamp(-32768, 32767) as i16;
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
                let v = (frame >> 8).clamp(-32768, 32767);
                out[done * 2 + i] = v as f32 / 32768.0;
            }
            self.tick_samples_left -= n as u32;
            done += n;
        }
    }

    /// Flattened sample index for an instrument + note, if playable
    pub(crate) fn resolve_sample(&self, instrument: u8, note: u8) -> Option<u32> {
        if instrument == 0 || note == 0 || note > 96 {
            return None;
        }
        let instr = self.module.instruments.get(instrument as usize - 1)?;
        let within = *instr.note_sample_map.get(note as usize - 1)? as usize;
        if within >= instr.samples.len() {
            return None;
        }
        let idx = self.sample_base[instrument as usize - 1] + within as u32;
        if self.samples[idx as usize].is_empty() {
            return None;
        }
        Some(idx)
    }
}
