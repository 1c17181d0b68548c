//! XM fixed-point mixer
//!
//! Each pattern channel owns a pair of mixer voices: the main voice and a
//! ramp-down voice that carries the tail of a replaced note, giving the
//! FastTracker-style crossfade on retriggers. Positions are 32.16 fixed
//! point; volumes are 14-bit with 16 extra fractional ramp bits. The
//! kernel mixes in runs bounded by the next loop boundary, so the inner
//! loop carries no per-sample branch beyond the ramp counter.

use crate::sample::{LoopMode, PaddedPcm};

use super::{XmPlayer, MAX_XM_CHANNELS};

/// Unity voice volume (14-bit)
const VOL_UNITY: i64 = 16384;

/// Fractional bits kept on ramped volumes
const RAMP_SHIFT: u32 = 16;

/// One mixer voice
#[derive(Debug, Clone)]
pub struct XmVoice {
    pub active: bool,
    /// Flattened sample index
    pub sample: u32,
    /// Combined sample position: frames in the high 48 bits, 16-bit frac
    pub pos_frac: i64,
    /// 16.16 resampling step
    pub delta: u32,
    /// Ping-pong direction
    pub backwards: bool,
    /// Linear interpolation enabled
    pub interpolate: bool,

    // Volume ramping state, all scaled << RAMP_SHIFT
    pub lvol: i64,
    pub rvol: i64,
    pub lvol_target: i64,
    pub rvol_target: i64,
    pub lvol_step: i64,
    pub rvol_step: i64,
    pub ramp_left: u32,
}

impl Default for XmVoice {
    fn default() -> Self {
        Self {
            active: false,
            sample: u32::MAX,
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

impl XmVoice {
    /// Start ramping toward new target volumes (14-bit)
    pub fn ramp_to(&mut self, lvol: i64, rvol: i64, ramp_len: u32) {
        let lt = lvol << RAMP_SHIFT;
        let rt = rvol << RAMP_SHIFT;
        if ramp_len == 0 || !self.active {
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

impl XmPlayer {
    /// Push every channel's state into its voice pair
    ///
    /// Called once per tick after the state machine ran: triggers swap the
    /// old voice into the ramp-down slot, and period/volume/panning are
    /// converted into mixer deltas and 14-bit volume targets.
    pub(crate) fn update_voices(&mut self) {
        let ramp_len = self.quick_ramp_len;
        for ch_idx in 0..self.channels.len() {
            if self.channels[ch_idx].trigger_voice {
                self.channels[ch_idx].trigger_voice = false;
                let fade_idx = ch_idx + MAX_XM_CHANNELS;

                // The old note rides out on the paired fade voice
                let old = self.voices[ch_idx].clone();
                if old.active {
                    let fade = &mut self.voices[fade_idx];
                    *fade = old;
                    fade.ramp_to(0, 0, ramp_len);
                }

                let ch = &self.channels[ch_idx];
                let voice = &mut self.voices[ch_idx];
                *voice = XmVoice::default();
                if ch.sample != u32::MAX {
                    let smp = &self.samples[ch.sample as usize];
                    if !smp.is_empty() && (ch.trigger_offset as u64) < smp.length as u64 {
                        voice.active = true;
                        voice.sample = ch.sample;
                        voice.pos_frac = (ch.trigger_offset as i64) << 16;
                    }
                }
            }

            if !self.voices[ch_idx].active {
                continue;
            }
            let period = self.channels[ch_idx]
                .period
                .clamp(self.tables.min_period(), self.tables.max_period());
            let delta = self.tables.period_to_delta(period);
            let (lvol, rvol) = final_volumes(self, ch_idx);

            let voice = &mut self.voices[ch_idx];
            voice.delta = delta;
            voice.ramp_to(lvol, rvol, ramp_len);
        }

        // Fade voices that finished their ramp-down are recycled
        for v in &mut self.voices[MAX_XM_CHANNELS..] {
            if v.active && v.ramp_left == 0 && v.lvol == 0 && v.rvol == 0 {
                v.active = false;
            }
        }
    }

    /// Mix `frames` output frames from all voices into the accumulator
    pub(crate) fn mix_frames(&mut self, frames: usize) {
        self.acc.clear();
        self.acc.resize(frames * 2, 0);
        let samples = &self.samples;
        let acc = &mut self.acc;
        for voice in &mut self.voices {
            if voice.active {
                mix_voice(voice, samples, acc, frames);
            }
        }
    }
}

/// Final 14-bit left/right volumes for a channel
fn final_volumes(player: &XmPlayer, ch_idx: usize) -> (i64, i64) {
    let ch = &player.channels[ch_idx];
    let instrument = player
        .module
        .instruments
        .get(ch.instrument.saturating_sub(1) as usize);

    let env_vol = instrument
        .and_then(|i| i.volume_envelope.as_ref())
        .map(|e| e.value_at(ch.vol_env_pos).min(64) as i64)
        .unwrap_or(64);

    // volume(0..64) * envelope(0..64) -> 0..4096, then fade and global
    let mut v = ch.tick_volume.min(64) as i64 * env_vol;
    v = v * player.global_volume.min(64) as i64 / 64;
    if ch.key_off {
        v = v * ch.fadeout_amp as i64 / 32768;
    }
    // Scale 0..4096 up to the 14-bit unity
    let v = (v * VOL_UNITY / 4096).min(VOL_UNITY);

    // Panning envelope widens around the channel pan
    let mut pan = ch.pan as i32;
    if let Some(env) = instrument.and_then(|i| i.panning_envelope.as_ref()) {
        let env_pan = env.value_at(ch.pan_env_pos).min(64) as i32;
        pan += (env_pan - 32) * (128 - (pan - 128).abs()) / 32;
    }
    let pan = pan.clamp(0, 255) as f64;

    // Equal-power pan law
    let lgain = ((256.0 - pan) / 256.0).sqrt();
    let rgain = (pan / 256.0).sqrt();
    ((v as f64 * lgain) as i64, (v as f64 * rgain) as i64)
}

/// Mix one voice for `frames` frames, honouring loop boundaries
fn mix_voice(voice: &mut XmVoice, samples: &[PaddedPcm], acc: &mut [i32], frames: usize) {
    let smp = match samples.get(voice.sample as usize) {
        Some(s) if !s.is_empty() && voice.delta != 0 => s,
        _ => {
            voice.active = false;
            return;
        }
    };

    let loop_begin = (smp.loop_begin as i64) << 16;
    let play_end = (smp.play_end() as i64) << 16;
    let delta = voice.delta as i64;

    let mut remaining = frames;
    let mut out_idx = 0usize;
    let mut boundary_guard = 0u32;

    while remaining > 0 {
        // How many frames fit before the next boundary
        let distance = if voice.backwards {
            voice.pos_frac - loop_begin
        } else {
            play_end - voice.pos_frac
        };

        if distance <= 0 {
            boundary_guard += 1;
            if boundary_guard > 8 || !handle_boundary(voice, smp, loop_begin, play_end) {
                voice.active = false;
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
            let s = if voice.interpolate {
                let s0 = smp.at(pos);
                let s1 = smp.at(pos + 1);
                s0 + (((s1 - s0) * frac) >> 16)
            } else {
                smp.at(pos)
            };

            // 14-bit volume, reduced to 8 bits of gain for the 24-bit
            // accumulator (the output stage shifts right by 8)
            let lv = ((voice.lvol >> RAMP_SHIFT) >> 6) as i32;
            let rv = ((voice.rvol >> RAMP_SHIFT) >> 6) as i32;
            acc[out_idx] = acc[out_idx].saturating_add(s * lv);
            acc[out_idx + 1] = acc[out_idx + 1].saturating_add(s * rv);
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
///
/// Returns false when the voice has run out of sample.
fn handle_boundary(voice: &mut XmVoice, smp: &PaddedPcm, loop_begin: i64, play_end: i64) -> bool {
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
                // Reflect upward off the loop start
                voice.pos_frac = loop_begin + (loop_begin - voice.pos_frac);
                voice.backwards = false;
            } else {
                // Reflect downward off the loop end
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
    use crate::sample::PaddedPcm;

    fn flat_sample(len: usize, value: i8, loop_mode: LoopMode) -> PaddedPcm {
        let data = vec![value; len];
        let end = len as u32;
        PaddedPcm::from_i8(&data, 0, end, loop_mode)
    }

    fn test_voice(sample_len: usize) -> (XmVoice, Vec<PaddedPcm>) {
        let samples = vec![flat_sample(sample_len, 64, LoopMode::Off)];
        let mut voice = XmVoice::default();
        voice.active = true;
        voice.sample = 0;
        voice.delta = 1 << 16; // one frame per output sample
        voice.ramp_to(VOL_UNITY, VOL_UNITY, 0);
        (voice, samples)
    }

    #[test]
    fn test_oneshot_stops_at_end() {
        let (mut voice, samples) = test_voice(8);
        let mut acc = vec![0i32; 32];
        mix_voice(&mut voice, &samples, &mut acc, 16);
        assert!(!voice.active);
        // 8 frames of signal, the rest silent
        assert_ne!(acc[0], 0);
        assert_ne!(acc[14], 0);
        assert_eq!(acc[16], 0);
    }

    #[test]
    fn test_forward_loop_wraps() {
        let samples = vec![flat_sample(8, 32, LoopMode::Forward)];
        let mut voice = XmVoice::default();
        voice.active = true;
        voice.sample = 0;
        voice.delta = 1 << 16;
        voice.ramp_to(VOL_UNITY, VOL_UNITY, 0);
        let mut acc = vec![0i32; 64];
        mix_voice(&mut voice, &samples, &mut acc, 32);
        assert!(voice.active);
        // Every output frame carries signal
        assert!(acc.iter().step_by(2).all(|&v| v != 0));
        let pos = (voice.pos_frac >> 16) as u32;
        assert!(pos < 8);
    }

    #[test]
    fn test_pingpong_reflects() {
        let samples = vec![flat_sample(4, 16, LoopMode::PingPong)];
        let mut voice = XmVoice::default();
        voice.active = true;
        voice.sample = 0;
        voice.delta = 1 << 16;
        voice.ramp_to(VOL_UNITY, VOL_UNITY, 0);
        let mut acc = vec![0i32; 40];
        mix_voice(&mut voice, &samples, &mut acc, 20);
        assert!(voice.active);
        let pos = (voice.pos_frac >> 16) as i64;
        assert!((0..4).contains(&pos));
    }

    #[test]
    fn test_volume_ramp_reaches_target() {
        let (mut voice, samples) = test_voice(64);
        voice.ramp_to(0, 0, 0);
        voice.active = true;
        voice.ramp_to(VOL_UNITY, VOL_UNITY, 16);
        let mut acc = vec![0i32; 64];
        mix_voice(&mut voice, &samples, &mut acc, 32);
        assert_eq!(voice.lvol, VOL_UNITY << RAMP_SHIFT);
        assert_eq!(voice.ramp_left, 0);
        // Early frames are quieter than late frames
        assert!(acc[0].abs() < acc[62].abs());
    }
}
