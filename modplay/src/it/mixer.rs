//! IT fixed-point mixer
//!
//! Slave voices mix into a 32-bit stereo accumulator with 13 bits of
//! headroom (the output stage shifts right by 13). Positions are 16-bit
//! fractional, deltas derive from the voice's 32-bit frequency, and
//! volumes ramp with 16 extra fractional bits over roughly five
//! milliseconds. Stereo samples carry a separate right-channel buffer;
//! surround voices accumulate their right side negated.

use crate::sample::{LoopMode, PaddedPcm};

use super::channels::ItVoice;
use super::tables::linear_slide;
use super::ItPlayer;

/// Unity voice volume (14-bit)
const VOL_UNITY: i64 = 16384;

impl ItPlayer {
    /// Push channel state into owned voices and refresh every voice's
    /// mixer parameters (delta, volume targets)
    pub(crate) fn update_voices(&mut self) {
        let ramp_len = self.quick_ramp_len;

        // Owned voices follow their host channel each tick; a voice keeps
        // the values it had when it was disowned
        for ch_idx in 0..self.channels.len() {
            if let Some(idx) = self.channel_slave(ch_idx) {
                let ch = &self.channels[ch_idx];
                let v = &mut self.voices[idx];
                v.volume = if ch.tremor_mute { 0 } else { ch.tick_volume };
                v.pan = ch.tick_pan;
                v.surround = ch.surround;
                v.channel_volume = ch.channel_volume;
            }
        }

        for idx in 0..self.voices.len() {
            if !self.voices[idx].on {
                continue;
            }

            // A stopped voice ramps to silence, then frees its slot
            if self.voices[idx].note_stop {
                let v = &mut self.voices[idx];
                if v.ramp_left == 0 && v.lvol == 0 && v.rvol == 0 {
                    v.on = false;
                    continue;
                }
                v.ramp_to(0, 0, ramp_len);
                continue;
            }

            let (lvol, rvol) = self.final_volumes(idx);
            let frequency = self.effective_frequency(idx);
            let v = &mut self.voices[idx];
            v.delta = ((frequency as u64) << 16)
                .checked_div(self.mix_rate as u64)
                .map(|d| d.min(u32::MAX as u64) as u32)
                .unwrap_or(0);
            v.ramp_to(lvol, rvol, ramp_len);
        }
    }

    /// Voice frequency with the pitch envelope applied
    fn effective_frequency(&self, idx: usize) -> u32 {
        let v = &self.voices[idx];
        let mut frequency = v.frequency;
        if v.pitch_env.enabled {
            if let Some(instr) = self
                .module
                .instruments
                .get(v.instrument.saturating_sub(1) as usize)
            {
                let env = &instr.pitch_envelope;
                if env.is_enabled() && !env.is_filter() {
                    // One envelope unit is a quarter semitone
                    let value = env.value_at(v.pitch_env.pos);
                    frequency = linear_slide(frequency, value * 4);
                }
            }
        }
        frequency
    }

    /// Final 14-bit left/right volumes for a voice
    fn final_volumes(&self, idx: usize) -> (i64, i64) {
        let v = &self.voices[idx];
        let instr = self
            .module
            .instruments
            .get(v.instrument.saturating_sub(1) as usize);

        let env_vol = if v.vol_env.enabled {
            instr
                .map(|i| i.volume_envelope.value_at(v.vol_env.pos).clamp(0, 64) as f64)
                .unwrap_or(64.0)
        } else {
            64.0
        };

        // Random volume variation is a percentage of the note volume
        let note_vol = (v.volume.min(64) as f64 * (100 + v.swing_volume as i32) as f64
            / 100.0)
            .clamp(0.0, 64.0);

        let vol = (note_vol / 64.0)
            * (env_vol / 64.0)
            * (v.sample_gv.min(64) as f64 / 64.0)
            * (v.instrument_gv.min(128) as f64 / 128.0)
            * (v.channel_volume.min(64) as f64 / 64.0)
            * (self.global_volume.min(128) as f64 / 128.0)
            * (v.fadeout_amp as f64 / 32768.0)
            * (self.module.mix_volume.min(128) as f64 / 128.0);

        // Panning: envelope swings around the set pan, narrower near the
        // edges; pitch-pan separation and random swing add on top
        let mut pan = v.pan.min(64) as i32 + v.swing_pan as i32;
        if v.pan_env.enabled {
            if let Some(i) = instr {
                let env_pan = i.panning_envelope.value_at(v.pan_env.pos).clamp(-32, 32);
                pan += env_pan * (32 - (pan - 32).abs()) / 32;
            }
        }
        if let Some(i) = instr {
            if i.pitch_pan_separation != 0 {
                pan +=
                    (v.note as i32 - i.pitch_pan_center as i32) * i.pitch_pan_separation as i32
                        / 32;
            }
        }
        let pan = pan.clamp(0, 64);

        // Separation narrows the field toward centre
        let sep = self.module.panning_separation.min(128) as i32;
        let pan = 32 + (pan - 32) * sep / 128;

        let v14 = (vol * VOL_UNITY as f64) as i64;
        let lvol = v14 * (64 - pan) as i64 / 64;
        let rvol = v14 * pan as i64 / 64;
        (lvol, rvol)
    }

    /// Mix `frames` output frames from all voices into the accumulator
    pub(crate) fn mix_frames(&mut self, frames: usize) {
        self.acc.clear();
        self.acc.resize(frames * 2, 0);
        let samples = &self.samples;
        let samples_right = &self.samples_right;
        let samples_sustain = &self.samples_sustain;
        let acc = &mut self.acc;
        for voice in &mut self.voices {
            if voice.on {
                mix_voice(voice, samples, samples_right, samples_sustain, acc, frames);
            }
        }
    }
}

/// Mix one voice for `frames` frames, honouring loop boundaries
fn mix_voice(
    voice: &mut ItVoice,
    samples: &[PaddedPcm],
    samples_right: &[Option<PaddedPcm>],
    samples_sustain: &[Option<PaddedPcm>],
    acc: &mut [i32],
    frames: usize,
) {
    let sample_idx = voice.sample.saturating_sub(1) as usize;
    let smp = match samples.get(sample_idx) {
        Some(s) if !s.is_empty() && voice.delta != 0 => s,
        _ => {
            voice.on = false;
            return;
        }
    };
    // Held notes follow the sustain loop; note-off falls back to the
    // regular loop bounds
    let smp = if voice.sustain && !voice.note_off {
        samples_sustain
            .get(sample_idx)
            .and_then(|s| s.as_ref())
            .unwrap_or(smp)
    } else {
        smp
    };
    let right = samples_right.get(sample_idx).and_then(|r| r.as_ref());

    let loop_begin = (smp.loop_begin as i64) << 16;
    let play_end = (smp.play_end() as i64) << 16;
    let delta = voice.delta as i64;

    let mut remaining = frames;
    let mut out_idx = 0usize;
    let mut boundary_guard = 0u32;

    while remaining > 0 {
        let distance = if voice.backwards {
            voice.pos_frac - loop_begin
        } else {
            play_end - voice.pos_frac
        };

        if distance <= 0 {
            boundary_guard += 1;
            if boundary_guard > 8 || !handle_boundary(voice, smp, loop_begin, play_end) {
                voice.on = false;
                return;
            }
            continue;
        }
        boundary_guard = 0;

        let frames_avail = ((distance + delta - 1) / delta) as usize;
        let chunk = remaining.min(frames_avail);

        for _ in 0..chunk {
            let pos = (voice.pos_frac >> 16) as u32;
            let frac = (voice.pos_frac & 0xFFFF) as i32;

            let fetch = |buffer: &PaddedPcm| -> i32 {
                if voice.interpolate {
                    let s0 = buffer.at(pos);
                    let s1 = buffer.at(pos + 1);
                    s0 + (((s1 - s0) * frac) >> 16)
                } else {
                    buffer.at(pos)
                }
            };
            let s_left = fetch(smp);
            let s_right = right.map(&fetch).unwrap_or(s_left);

            // 13 effective volume bits against the >>13 output stage
            let lv = ((voice.lvol >> 16) >> 1) as i32;
            let rv = ((voice.rvol >> 16) >> 1) as i32;
            acc[out_idx] = acc[out_idx].saturating_add(s_left * lv);
            acc[out_idx + 1] = if voice.surround {
                acc[out_idx + 1].saturating_sub(s_right * rv)
            } else {
                acc[out_idx + 1].saturating_add(s_right * rv)
            };
            out_idx += 2;

            if voice.ramp_left > 0 {
                voice.lvol += voice.lvol_step;
                voice.rvol += voice.rvol_step;
                voice.ramp_left -= 1;
                if voice.ramp_left == 0 {
                    voice.lvol = voice.lvol_target;
                    voice.rvol = voice.rvol_target;
                }
            }

            if voice.backwards {
                voice.pos_frac -= delta;
            } else {
                voice.pos_frac += delta;
            }
        }

        remaining -= chunk;
    }
}

/// Wrap or reflect the position at a loop boundary
fn handle_boundary(voice: &mut ItVoice, smp: &PaddedPcm, loop_begin: i64, play_end: i64) -> bool {
    match smp.loop_mode {
        LoopMode::Off => false,
        LoopMode::Forward => {
            let loop_len = play_end - loop_begin;
            if loop_len <= 0 {
                return false;
            }
            let over = (voice.pos_frac - play_end).rem_euclid(loop_len);
            voice.pos_frac = loop_begin + over;
            true
        }
        LoopMode::PingPong => {
            let loop_len = play_end - loop_begin;
            if loop_len <= 0 {
                return false;
            }
            if voice.backwards {
                voice.pos_frac = loop_begin + (loop_begin - voice.pos_frac);
                voice.backwards = false;
            } else {
                voice.pos_frac = play_end - (voice.pos_frac - play_end) - 1;
                voice.backwards = true;
            }
            voice.pos_frac = voice.pos_frac.clamp(loop_begin, play_end - 1);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::LoopMode;

    fn flat(len: usize, value: i8, mode: LoopMode) -> PaddedPcm {
        PaddedPcm::from_i8(&vec![value; len], 0, len as u32, mode)
    }

    fn no_sustain() -> Vec<Option<PaddedPcm>> {
        vec![None]
    }

    #[test]
    fn test_surround_negates_right() {
        let samples = vec![flat(16, 50, LoopMode::Forward)];
        let right = vec![None];
        let no_sustain = no_sustain();
        let mut voice = ItVoice {
            on: true,
            sample: 1,
            delta: 1 << 16,
            surround: true,
            ..Default::default()
        };
        voice.ramp_to(VOL_UNITY, VOL_UNITY, 0);
        let mut acc = vec![0i32; 16];
        mix_voice(&mut voice, &samples, &right, &no_sustain, &mut acc, 8);
        assert!(acc[0] > 0);
        assert_eq!(acc[0], -acc[1]);
    }

    #[test]
    fn test_stereo_right_buffer_used() {
        let samples = vec![flat(16, 10, LoopMode::Forward)];
        let right = vec![Some(flat(16, 40, LoopMode::Forward))];
        let no_sustain = no_sustain();
        let mut voice = ItVoice {
            on: true,
            sample: 1,
            delta: 1 << 16,
            ..Default::default()
        };
        voice.ramp_to(VOL_UNITY, VOL_UNITY, 0);
        let mut acc = vec![0i32; 8];
        mix_voice(&mut voice, &samples, &right, &no_sustain, &mut acc, 4);
        assert_eq!(acc[1], acc[0] * 4);
    }

    #[test]
    fn test_oneshot_clears_voice() {
        let samples = vec![flat(4, 30, LoopMode::Off)];
        let right = vec![None];
        let no_sustain = no_sustain();
        let mut voice = ItVoice {
            on: true,
            sample: 1,
            delta: 1 << 16,
            ..Default::default()
        };
        voice.ramp_to(VOL_UNITY, VOL_UNITY, 0);
        let mut acc = vec![0i32; 32];
        mix_voice(&mut voice, &samples, &right, &no_sustain, &mut acc, 16);
        assert!(!voice.on);
        assert_eq!(acc[8], 0);
    }
}
