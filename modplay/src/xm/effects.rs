//! XM row and tick processing
//!
//! Row boundary: at tick 0 the current row is read and each channel's
//! "init" handling runs (note/instrument triggers, volume column, effect
//! setup). Every later tick runs the "update" handlers of effects that
//! act per tick. Envelope, fade-out and auto-vibrato state advances once
//! per tick for every channel.

use modplay_xm::XmNote;

use super::tables::{exp2, retrig_volume, waveform_value, ARPEGGIO_TICK_TAB};
use super::XmPlayer;

// Effect command numbers (0-9, then A=10 .. Z=35)
const FX_ARPEGGIO: u8 = 0x00;
const FX_PORTA_UP: u8 = 0x01;
const FX_PORTA_DOWN: u8 = 0x02;
const FX_TONE_PORTA: u8 = 0x03;
const FX_VIBRATO: u8 = 0x04;
const FX_TONE_PORTA_VOL: u8 = 0x05;
const FX_VIBRATO_VOL: u8 = 0x06;
const FX_TREMOLO: u8 = 0x07;
const FX_SET_PAN: u8 = 0x08;
const FX_SAMPLE_OFFSET: u8 = 0x09;
const FX_VOL_SLIDE: u8 = 0x0A;
const FX_POSITION_JUMP: u8 = 0x0B;
const FX_SET_VOLUME: u8 = 0x0C;
const FX_PATTERN_BREAK: u8 = 0x0D;
const FX_EXTENDED: u8 = 0x0E;
const FX_SPEED_TEMPO: u8 = 0x0F;
const FX_GLOBAL_VOLUME: u8 = 0x10;
const FX_GLOBAL_VOL_SLIDE: u8 = 0x11;
const FX_KEY_OFF: u8 = 0x14;
const FX_ENVELOPE_POS: u8 = 0x15;
const FX_PAN_SLIDE: u8 = 0x19;
const FX_MULTI_RETRIG: u8 = 0x1B;
const FX_TREMOR: u8 = 0x1D;
const FX_EXTRA_FINE_PORTA: u8 = 0x21;

// Extended (Exy) sub-commands
const EX_FINE_PORTA_UP: u8 = 0x1;
const EX_FINE_PORTA_DOWN: u8 = 0x2;
const EX_GLISSANDO: u8 = 0x3;
const EX_VIBRATO_WAVE: u8 = 0x4;
const EX_FINETUNE: u8 = 0x5;
const EX_PATTERN_LOOP: u8 = 0x6;
const EX_TREMOLO_WAVE: u8 = 0x7;
const EX_COARSE_PAN: u8 = 0x8;
const EX_RETRIG: u8 = 0x9;
const EX_FINE_VOL_UP: u8 = 0xA;
const EX_FINE_VOL_DOWN: u8 = 0xB;
const EX_NOTE_CUT: u8 = 0xC;
const EX_NOTE_DELAY: u8 = 0xD;
const EX_PATTERN_DELAY: u8 = 0xE;

/// Key-off pseudo-note
const NOTE_KEY_OFF: u8 = 97;

impl XmPlayer {
    /// Advance the tracker by one tick
    pub(crate) fn advance_tick(&mut self) {
        if self.current_tick == 0 {
            if self.pattern_delay_count > 0 {
                // A delayed row repeats without re-reading its cells
                self.process_tick_effects();
            } else {
                self.process_row();
            }
        } else {
            self.process_tick_effects();
        }
        self.process_envelopes();

        self.current_tick += 1;
        if self.current_tick >= self.speed.max(1) {
            self.current_tick = 0;
            self.advance_row();
        }
    }

    /// Read the current row and run every channel's tick-0 handling
    fn process_row(&mut self) {
        let cells: Vec<XmNote> = {
            let pattern = match self.module.pattern_at_order(self.current_order) {
                Some(p) => p,
                None => return,
            };
            (0..self.channels.len())
                .map(|ch| {
                    pattern
                        .get_note(self.current_row, ch as u8)
                        .copied()
                        .unwrap_or_default()
                })
                .collect()
        };

        for (ch_idx, cell) in cells.into_iter().enumerate() {
            self.channel_row(ch_idx, cell);
        }
    }

    /// Tick-0 handling for one channel
    fn channel_row(&mut self, ch_idx: usize, cell: XmNote) {
        {
            let ch = &mut self.channels[ch_idx];
            ch.effect = cell.effect;
            ch.effect_param = cell.effect_param;
            ch.vol_column = cell.volume;
            ch.trigger_voice = false;
            ch.trigger_offset = 0;
            ch.finetune_override = false;
            ch.note_delay_tick = 0;
        }

        // EDx defers the whole cell to its tick
        if cell.effect == FX_EXTENDED
            && cell.effect_param >> 4 == EX_NOTE_DELAY
            && cell.effect_param & 0x0F != 0
        {
            let ch = &mut self.channels[ch_idx];
            ch.delayed_note = cell.note;
            ch.delayed_instrument = cell.instrument;
            ch.note_delay_tick = cell.effect_param & 0x0F;
            return;
        }

        self.note_cell(ch_idx, cell.note, cell.instrument);
        self.volume_column_init(ch_idx);
        self.effect_init(ch_idx);
    }

    /// Handle the note and instrument columns of one cell
    pub(crate) fn note_cell(&mut self, ch_idx: usize, note: u8, instrument: u8) {
        if instrument > 0 && (instrument as usize) <= self.module.instruments.len() {
            self.channels[ch_idx].instrument = instrument;
        }

        let tone_porta = {
            let ch = &self.channels[ch_idx];
            ch.effect == FX_TONE_PORTA || ch.effect == FX_TONE_PORTA_VOL || ch.vol_column >= 0xF0
        };

        if note == NOTE_KEY_OFF {
            self.key_off(ch_idx);
        } else if (1..=96).contains(&note) {
            let instr_num = self.channels[ch_idx].instrument;
            if let Some(sample_idx) = self.resolve_sample(instr_num, note) {
                let meta = self.sample_meta[sample_idx as usize];
                let ch = &mut self.channels[ch_idx];
                let finetune = if ch.finetune_override {
                    ch.finetune
                } else {
                    meta.finetune
                };
                let real_note = note as i16 + meta.relative_note as i16;
                let period = if (1..=96).contains(&real_note) {
                    self.tables.note_to_period(real_note as u8, finetune)
                } else {
                    0
                };

                if period > 0 {
                    let ch = &mut self.channels[ch_idx];
                    ch.current_note = note;
                    ch.relative_note = meta.relative_note;
                    ch.finetune = finetune;
                    if tone_porta && ch.sample != u32::MAX {
                        // Glide toward the new note instead of triggering
                        ch.target_period = period;
                    } else {
                        ch.sample = sample_idx;
                        ch.period = period;
                        ch.base_period = period;
                        ch.target_period = period;
                        ch.trigger_voice = true;
                        if ch.vibrato_retrigger() {
                            ch.vib_pos = 0;
                        }
                        if ch.tremolo_retrigger() {
                            ch.trem_pos = 0;
                        }
                        ch.auto_vib_pos = 0;
                        ch.auto_vib_sweep = 0;
                        ch.retrig_counter = 0;
                        ch.tremor_counter = 0;
                        ch.tremor_mute = false;
                    }
                }
            }
        }

        if instrument > 0 {
            self.apply_instrument_defaults(ch_idx);
        }
    }

    /// Instrument column: reset volume, panning, envelopes and fade-out
    fn apply_instrument_defaults(&mut self, ch_idx: usize) {
        let sample_idx = self.channels[ch_idx].sample;
        if sample_idx == u32::MAX {
            return;
        }
        let meta = self.sample_meta[sample_idx as usize];
        let fadeout = self
            .module
            .instruments
            .get(self.channels[ch_idx].instrument.saturating_sub(1) as usize)
            .map(|i| i.volume_fadeout)
            .unwrap_or(0);

        let ch = &mut self.channels[ch_idx];
        ch.volume = meta.volume;
        ch.pan = meta.panning;
        ch.vol_env_pos = 0;
        ch.pan_env_pos = 0;
        ch.fadeout_amp = 32768;
        ch.fadeout_speed = fadeout;
        ch.key_off = false;
    }

    /// Enter the release phase; without a volume envelope the note is cut
    fn key_off(&mut self, ch_idx: usize) {
        let has_vol_env = self
            .module
            .instruments
            .get(self.channels[ch_idx].instrument.saturating_sub(1) as usize)
            .map(|i| i.volume_envelope.is_some())
            .unwrap_or(false);
        let ch = &mut self.channels[ch_idx];
        ch.key_off = true;
        if !has_vol_env {
            ch.volume = 0;
        }
    }

    /// Volume column handling at tick 0
    fn volume_column_init(&mut self, ch_idx: usize) {
        let v = self.channels[ch_idx].vol_column;
        let ch = &mut self.channels[ch_idx];
        match v {
            0x10..=0x50 => ch.volume = (v - 0x10).min(64),
            0x80..=0x8F => ch.volume = ch.volume.saturating_sub(v & 0x0F),
            0x90..=0x9F => ch.volume = (ch.volume + (v & 0x0F)).min(64),
            0xA0..=0xAF => ch.vib_speed = v & 0x0F,
            0xC0..=0xCF => ch.pan = (v & 0x0F) << 4,
            0xD0..=0xDF => {
                // Pan-slide-left with a zero parameter hard-lefts the pan
                if v & 0x0F == 0 {
                    ch.pan = 0;
                }
            }
            0xF0..=0xFF => {
                if v & 0x0F != 0 {
                    ch.tone_porta_speed = (v & 0x0F) << 4;
                }
            }
            _ => {}
        }
    }

    /// Effect column handling at tick 0
    fn effect_init(&mut self, ch_idx: usize) {
        let (effect, param) = {
            let ch = &self.channels[ch_idx];
            (ch.effect, ch.effect_param)
        };

        match effect {
            FX_PORTA_UP => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.last_porta_up = param;
                }
            }
            FX_PORTA_DOWN => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.last_porta_down = param;
                }
            }
            FX_TONE_PORTA => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.tone_porta_speed = param;
                }
            }
            FX_VIBRATO => {
                let ch = &mut self.channels[ch_idx];
                if param >> 4 != 0 {
                    ch.vib_speed = param >> 4;
                }
                if param & 0x0F != 0 {
                    ch.vib_depth = param & 0x0F;
                }
            }
            FX_TONE_PORTA_VOL | FX_VIBRATO_VOL | FX_VOL_SLIDE => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.last_vol_slide = param;
                }
            }
            FX_TREMOLO => {
                let ch = &mut self.channels[ch_idx];
                if param >> 4 != 0 {
                    ch.trem_speed = param >> 4;
                }
                if param & 0x0F != 0 {
                    ch.trem_depth = param & 0x0F;
                }
            }
            FX_SET_PAN => self.channels[ch_idx].pan = param,
            FX_SAMPLE_OFFSET => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.last_sample_offset = param;
                }
                if ch.trigger_voice {
                    let offset = (ch.last_sample_offset as u32) << 8;
                    let sample_idx = ch.sample;
                    ch.trigger_offset = offset;
                    if sample_idx != u32::MAX
                        && offset >= self.samples[sample_idx as usize].length
                    {
                        // Offsets past the sample play nothing
                        let ch = &mut self.channels[ch_idx];
                        ch.trigger_voice = false;
                        ch.volume = 0;
                    }
                }
            }
            FX_POSITION_JUMP => {
                self.pending_jump = Some((param as u16, 0));
            }
            FX_SET_VOLUME => self.channels[ch_idx].volume = param.min(64),
            FX_PATTERN_BREAK => {
                // Decimal-coded row number; an earlier Bxx on the same row
                // supplies the order to break into
                let row = ((param >> 4) * 10 + (param & 0x0F)) as u16;
                let order = self
                    .pending_jump
                    .map(|(o, _)| o)
                    .unwrap_or(self.current_order + 1);
                self.pending_jump = Some((order, row.min(255)));
            }
            FX_EXTENDED => self.extended_init(ch_idx, param),
            FX_SPEED_TEMPO => {
                if param == 0 {
                    // F00 is left alone (Protracker stop), nothing sensible
                    // to do mid-stream
                } else if param < 32 {
                    self.speed = param as u16;
                } else {
                    self.bpm = param as u16;
                }
            }
            FX_GLOBAL_VOLUME => {
                // Values above 64 clamp (not 63)
                self.global_volume = param.min(64);
            }
            FX_GLOBAL_VOL_SLIDE => {
                if param != 0 {
                    self.last_global_vol_slide = param;
                }
            }
            FX_KEY_OFF => {
                if param == 0 {
                    self.key_off(ch_idx);
                }
            }
            FX_ENVELOPE_POS => self.set_envelope_pos(ch_idx, param),
            FX_PAN_SLIDE => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.last_pan_slide = param;
                }
            }
            FX_MULTI_RETRIG => {
                let ch = &mut self.channels[ch_idx];
                if param & 0x0F != 0 {
                    ch.multi_retrig_interval = param & 0x0F;
                }
                if param >> 4 != 0 {
                    ch.multi_retrig_transform = param >> 4;
                }
            }
            FX_TREMOR => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.last_tremor = param;
                }
            }
            FX_EXTRA_FINE_PORTA => {
                let sub = param >> 4;
                let amount = (param & 0x0F) as i32;
                let ch = &mut self.channels[ch_idx];
                match sub {
                    1 => {
                        if amount != 0 {
                            ch.last_xfine_porta_up = amount as u8;
                        }
                        ch.period =
                            (ch.period - ch.last_xfine_porta_up as i32).max(self.tables.min_period());
                        ch.base_period = ch.period;
                    }
                    2 => {
                        if amount != 0 {
                            ch.last_xfine_porta_down = amount as u8;
                        }
                        ch.period = (ch.period + ch.last_xfine_porta_down as i32)
                            .min(self.tables.max_period());
                        ch.base_period = ch.period;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Exy sub-effects at tick 0
    fn extended_init(&mut self, ch_idx: usize, param: u8) {
        let sub = param >> 4;
        let val = param & 0x0F;
        match sub {
            EX_FINE_PORTA_UP => {
                let min = self.tables.min_period();
                let ch = &mut self.channels[ch_idx];
                if val != 0 {
                    ch.last_fine_porta_up = val;
                }
                ch.period = (ch.period - ch.last_fine_porta_up as i32 * 4).max(min);
                ch.base_period = ch.period;
            }
            EX_FINE_PORTA_DOWN => {
                let max = self.tables.max_period();
                let ch = &mut self.channels[ch_idx];
                if val != 0 {
                    ch.last_fine_porta_down = val;
                }
                ch.period = (ch.period + ch.last_fine_porta_down as i32 * 4).min(max);
                ch.base_period = ch.period;
            }
            EX_GLISSANDO => self.channels[ch_idx].glissando = val != 0,
            EX_VIBRATO_WAVE => {
                let ch = &mut self.channels[ch_idx];
                ch.wave_ctrl = (ch.wave_ctrl & 0xF0) | val;
            }
            EX_FINETUNE => {
                let ch = &mut self.channels[ch_idx];
                ch.finetune = ((val as i8).wrapping_sub(8)) << 4;
                ch.finetune_override = true;
            }
            EX_PATTERN_LOOP => {
                if val == 0 {
                    self.channels[ch_idx].pattern_loop_row = self.current_row;
                } else {
                    let jump = {
                        let ch = &mut self.channels[ch_idx];
                        if ch.pattern_loop_count == 0 {
                            ch.pattern_loop_count = val;
                            true
                        } else {
                            ch.pattern_loop_count -= 1;
                            ch.pattern_loop_count != 0
                        }
                    };
                    if jump {
                        self.pattern_loop_jump = Some(self.channels[ch_idx].pattern_loop_row);
                    }
                }
            }
            EX_TREMOLO_WAVE => {
                let ch = &mut self.channels[ch_idx];
                ch.wave_ctrl = (ch.wave_ctrl & 0x0F) | (val << 4);
            }
            EX_COARSE_PAN => self.channels[ch_idx].pan = val << 4,
            EX_RETRIG => {
                // E90 retriggers immediately on the row
                if val == 0 {
                    self.channels[ch_idx].trigger_voice = true;
                }
            }
            EX_FINE_VOL_UP => {
                let ch = &mut self.channels[ch_idx];
                if val != 0 {
                    ch.last_fine_vol_up = val;
                }
                ch.volume = (ch.volume + ch.last_fine_vol_up).min(64);
            }
            EX_FINE_VOL_DOWN => {
                let ch = &mut self.channels[ch_idx];
                if val != 0 {
                    ch.last_fine_vol_down = val;
                }
                ch.volume = ch.volume.saturating_sub(ch.last_fine_vol_down);
            }
            EX_NOTE_CUT => {
                if val == 0 {
                    self.channels[ch_idx].volume = 0;
                }
            }
            EX_PATTERN_DELAY => {
                if self.pattern_delay == 0 && val != 0 {
                    self.pattern_delay = val;
                }
            }
            _ => {}
        }
    }

    /// Lxx: set the volume envelope position
    ///
    /// FastTracker decides whether to move the panning envelope too by
    /// testing the volume envelope's sustain bit rather than anything
    /// about the panning envelope; modules rely on it, so it stays.
    fn set_envelope_pos(&mut self, ch_idx: usize, param: u8) {
        let (has_vol_env, vol_sustain_bit) = self
            .module
            .instruments
            .get(self.channels[ch_idx].instrument.saturating_sub(1) as usize)
            .map(|i| {
                let vol = i.volume_envelope.as_ref();
                (
                    vol.is_some(),
                    vol.map(|e| e.sustain_enabled).unwrap_or(false),
                )
            })
            .unwrap_or((false, false));

        let ch = &mut self.channels[ch_idx];
        if has_vol_env {
            ch.vol_env_pos = param as u16;
        }
        if vol_sustain_bit {
            ch.pan_env_pos = param as u16;
        }
    }

    /// Per-tick effect updates (ticks 1..speed-1, and delayed rows)
    fn process_tick_effects(&mut self) {
        let tick = self.current_tick;
        for ch_idx in 0..self.channels.len() {
            // Note delay fires on its tick regardless of the rest
            if self.channels[ch_idx].note_delay_tick != 0
                && tick == self.channels[ch_idx].note_delay_tick as u16
            {
                let note = self.channels[ch_idx].delayed_note;
                let instrument = self.channels[ch_idx].delayed_instrument;
                self.channels[ch_idx].note_delay_tick = 0;
                self.note_cell(ch_idx, note, instrument);
                self.volume_column_init(ch_idx);
                continue;
            }

            let (effect, param) = {
                let ch = &self.channels[ch_idx];
                (ch.effect, ch.effect_param)
            };

            // Volume column per-tick commands
            let v = self.channels[ch_idx].vol_column;
            match v {
                0x60..=0x6F => {
                    let ch = &mut self.channels[ch_idx];
                    ch.volume = ch.volume.saturating_sub(v & 0x0F);
                }
                0x70..=0x7F => {
                    let ch = &mut self.channels[ch_idx];
                    ch.volume = (ch.volume + (v & 0x0F)).min(64);
                }
                0xB0..=0xBF => {
                    let ch = &mut self.channels[ch_idx];
                    if v & 0x0F != 0 {
                        ch.vib_depth = v & 0x0F;
                    }
                    self.vibrato_tick(ch_idx);
                }
                0xD0..=0xDF => {
                    let ch = &mut self.channels[ch_idx];
                    ch.pan = ch.pan.saturating_sub(v & 0x0F);
                }
                0xE0..=0xEF => {
                    let ch = &mut self.channels[ch_idx];
                    ch.pan = ch.pan.saturating_add(v & 0x0F);
                }
                0xF0..=0xFF => self.tone_porta_tick(ch_idx),
                _ => {}
            }

            match effect {
                FX_ARPEGGIO => {
                    if param != 0 {
                        self.arpeggio_tick(ch_idx, tick, param);
                    }
                }
                FX_PORTA_UP => {
                    let min = self.tables.min_period();
                    let ch = &mut self.channels[ch_idx];
                    ch.period = (ch.period - ch.last_porta_up as i32 * 4).max(min);
                    ch.base_period = ch.period;
                }
                FX_PORTA_DOWN => {
                    let max = self.tables.max_period();
                    let ch = &mut self.channels[ch_idx];
                    ch.period = (ch.period + ch.last_porta_down as i32 * 4).min(max);
                    ch.base_period = ch.period;
                }
                FX_TONE_PORTA => self.tone_porta_tick(ch_idx),
                FX_VIBRATO => self.vibrato_tick(ch_idx),
                FX_TONE_PORTA_VOL => {
                    self.tone_porta_tick(ch_idx);
                    self.volume_slide(ch_idx);
                }
                FX_VIBRATO_VOL => {
                    self.vibrato_tick(ch_idx);
                    self.volume_slide(ch_idx);
                }
                FX_TREMOLO => self.tremolo_tick(ch_idx),
                FX_VOL_SLIDE => self.volume_slide(ch_idx),
                FX_EXTENDED => {
                    let sub = param >> 4;
                    let val = param & 0x0F;
                    match sub {
                        EX_RETRIG => {
                            if val != 0 && tick % val as u16 == 0 {
                                self.channels[ch_idx].trigger_voice = true;
                            }
                        }
                        EX_NOTE_CUT => {
                            if tick == val as u16 {
                                self.channels[ch_idx].volume = 0;
                            }
                        }
                        _ => {}
                    }
                }
                FX_GLOBAL_VOL_SLIDE => {
                    let slide = self.last_global_vol_slide;
                    if slide >> 4 != 0 {
                        self.global_volume = (self.global_volume + (slide >> 4)).min(64);
                    } else {
                        self.global_volume = self.global_volume.saturating_sub(slide & 0x0F);
                    }
                }
                FX_KEY_OFF => {
                    if tick == param as u16 {
                        self.key_off(ch_idx);
                    }
                }
                FX_PAN_SLIDE => {
                    let ch = &mut self.channels[ch_idx];
                    let slide = ch.last_pan_slide;
                    if slide >> 4 != 0 {
                        ch.pan = ch.pan.saturating_add(slide >> 4);
                    } else {
                        ch.pan = ch.pan.saturating_sub(slide & 0x0F);
                    }
                }
                FX_MULTI_RETRIG => self.multi_retrig_tick(ch_idx),
                FX_TREMOR => self.tremor_tick(ch_idx),
                _ => {}
            }
        }
    }

    /// 0xy: cycle base note, +x semitones, +y semitones
    ///
    /// The tick table is indexed with the raw tick counter, reproducing
    /// the original's unmasked read for rows longer than 16 ticks.
    fn arpeggio_tick(&mut self, ch_idx: usize, tick: u16, param: u8) {
        let step = ARPEGGIO_TICK_TAB[(tick as usize) & 0xFF];
        let offset = match step {
            0 => 0,
            1 => (param >> 4) as i32,
            _ => (param & 0x0F) as i32,
        };
        let ch = &mut self.channels[ch_idx];
        if offset == 0 {
            ch.period = ch.base_period;
        } else {
            // Shift the period by whole semitones in its own scale
            let shifted = if self.tables.linear {
                ch.base_period - offset * 64
            } else {
                (ch.base_period as f64 / exp2(offset as f64 / 12.0)).round() as i32
            };
            ch.period = shifted.clamp(self.tables.min_period(), self.tables.max_period());
        }
    }

    /// 3xx per tick: slide the period toward the target
    fn tone_porta_tick(&mut self, ch_idx: usize) {
        let (snap, finetune) = {
            let ch = &self.channels[ch_idx];
            (ch.glissando, ch.finetune)
        };
        let ch = &mut self.channels[ch_idx];
        if ch.target_period == 0 || ch.tone_porta_speed == 0 {
            return;
        }
        let speed = ch.tone_porta_speed as i32 * 4;
        if ch.period < ch.target_period {
            ch.period = (ch.period + speed).min(ch.target_period);
        } else if ch.period > ch.target_period {
            ch.period = (ch.period - speed).max(ch.target_period);
        }
        ch.base_period = ch.period;
        if snap && ch.period != ch.target_period {
            let snapped = self.tables.snap_to_semitone(ch.period, finetune);
            let ch = &mut self.channels[ch_idx];
            ch.period = snapped;
        }
    }

    /// 4xy per tick: nudge the period with the waveform
    fn vibrato_tick(&mut self, ch_idx: usize) {
        let (min, max) = (self.tables.min_period(), self.tables.max_period());
        let ch = &mut self.channels[ch_idx];
        ch.vib_pos = ch.vib_pos.wrapping_add(ch.vib_speed) & 63;
        let wave = waveform_value(ch.vibrato_waveform(), ch.vib_pos);
        // Depth 15 swings about two semitones
        let delta = wave * ch.vib_depth as i32 / 32;
        ch.period = (ch.base_period + delta).clamp(min, max);
    }

    /// 7xy per tick: waveform offset applied to this tick's volume
    fn tremolo_tick(&mut self, ch_idx: usize) {
        let ch = &mut self.channels[ch_idx];
        ch.trem_pos = ch.trem_pos.wrapping_add(ch.trem_speed) & 63;
        let wave = waveform_value(ch.tremolo_waveform(), ch.trem_pos);
        let delta = wave * ch.trem_depth as i32 / 64;
        ch.tick_volume = (ch.volume as i32 + delta).clamp(0, 64) as u8;
    }

    /// Axy per tick, upper nibble wins
    fn volume_slide(&mut self, ch_idx: usize) {
        let ch = &mut self.channels[ch_idx];
        let slide = ch.last_vol_slide;
        if slide >> 4 != 0 {
            ch.volume = (ch.volume + (slide >> 4)).min(64);
        } else {
            ch.volume = ch.volume.saturating_sub(slide & 0x0F);
        }
    }

    /// Rxy per tick: retrigger with a volume transform
    fn multi_retrig_tick(&mut self, ch_idx: usize) {
        let ch = &mut self.channels[ch_idx];
        let interval = ch.multi_retrig_interval;
        if interval == 0 {
            return;
        }
        ch.retrig_counter += 1;
        if ch.retrig_counter >= interval {
            ch.retrig_counter = 0;
            ch.volume = retrig_volume(ch.multi_retrig_transform, ch.volume);
            ch.trigger_voice = true;
            ch.trigger_offset = 0;
        }
    }

    /// Txy per tick: x+1 ticks on, y+1 ticks off
    fn tremor_tick(&mut self, ch_idx: usize) {
        let ch = &mut self.channels[ch_idx];
        let on_ticks = (ch.last_tremor >> 4) + 1;
        let off_ticks = (ch.last_tremor & 0x0F) + 1;
        ch.tremor_counter += 1;
        if ch.tremor_mute {
            if ch.tremor_counter >= off_ticks {
                ch.tremor_mute = false;
                ch.tremor_counter = 0;
            }
        } else if ch.tremor_counter >= on_ticks {
            ch.tremor_mute = true;
            ch.tremor_counter = 0;
        }
    }

    /// Envelope, fade-out and auto-vibrato advancement, every tick
    fn process_envelopes(&mut self) {
        for ch_idx in 0..self.channels.len() {
            let instr_idx = self.channels[ch_idx].instrument.saturating_sub(1) as usize;
            let instrument = self.module.instruments.get(instr_idx);

            let vol_env = instrument.and_then(|i| i.volume_envelope.as_ref());
            let pan_env = instrument.and_then(|i| i.panning_envelope.as_ref());
            let vib = instrument
                .map(|i| (i.vibrato_type, i.vibrato_sweep, i.vibrato_depth, i.vibrato_rate))
                .unwrap_or((0, 0, 0, 0));

            let ch = &mut self.channels[ch_idx];

            // Tremolo writes tick_volume itself; default to the channel volume
            if ch.effect != FX_TREMOLO {
                ch.tick_volume = ch.volume;
            }
            if ch.tremor_mute {
                ch.tick_volume = 0;
            }

            if let Some(env) = vol_env {
                let key_off = ch.key_off;
                advance_envelope_pos(&mut ch.vol_env_pos, env, key_off);
            }
            if let Some(env) = pan_env {
                let key_off = ch.key_off;
                advance_envelope_pos(&mut ch.pan_env_pos, env, key_off);
            }

            // Fade-out after key-off
            if ch.key_off {
                ch.fadeout_amp = ch.fadeout_amp.saturating_sub(ch.fadeout_speed);
            }

            // Instrument auto-vibrato. The instrument waveform numbering
            // differs from the effect one: 0 sine, 1 square, 2 ramp down,
            // 3 ramp up.
            let (vib_type, vib_sweep, vib_depth, vib_rate) = vib;
            if vib_depth > 0 {
                let depth = if vib_sweep > 0 && ch.auto_vib_sweep < vib_sweep as u16 {
                    ch.auto_vib_sweep += 1;
                    vib_depth as i32 * ch.auto_vib_sweep as i32 / vib_sweep as i32
                } else {
                    vib_depth as i32
                };
                ch.auto_vib_pos = ch.auto_vib_pos.wrapping_add(vib_rate);
                let pos = ch.auto_vib_pos >> 2;
                let wave = match vib_type & 3 {
                    0 => waveform_value(0, pos),
                    1 => waveform_value(2, pos),
                    2 => waveform_value(1, pos),
                    _ => -waveform_value(1, pos),
                };
                let delta = wave * depth / 128;
                ch.period = (ch.period + delta)
                    .clamp(self.tables.min_period(), self.tables.max_period());
            }
        }
    }

    /// Move the cursor to the next row, applying jumps, loops and delays
    fn advance_row(&mut self) {
        // Pattern delay repeats the current row speed ticks at a time
        if self.pattern_delay > 0 {
            if self.pattern_delay_count < self.pattern_delay {
                self.pattern_delay_count += 1;
                return;
            }
            self.pattern_delay = 0;
            self.pattern_delay_count = 0;
        }

        if let Some(row) = self.pattern_loop_jump.take() {
            self.current_row = row;
            return;
        }

        if let Some((order, row)) = self.pending_jump.take() {
            self.jump_to(order, row);
            return;
        }

        self.current_row += 1;
        let num_rows = self
            .module
            .pattern_at_order(self.current_order)
            .map(|p| p.num_rows)
            .unwrap_or(64);
        if self.current_row >= num_rows {
            let next = self.current_order + 1;
            self.jump_to(next, 0);
        }
    }

    /// Jump to an order/row, wrapping at the end of the song
    fn jump_to(&mut self, order: u16, row: u16) {
        let song_length = self.module.order_table.len() as u16;
        let mut order = order;
        if order >= song_length {
            order = self.module.restart_position.min(song_length.saturating_sub(1));
        }
        self.current_order = order;
        let num_rows = self
            .module
            .pattern_at_order(order)
            .map(|p| p.num_rows)
            .unwrap_or(64);
        self.current_row = row.min(num_rows.saturating_sub(1));
        // New pattern: loop anchors reset
        for ch in &mut self.channels {
            ch.pattern_loop_count = 0;
            ch.pattern_loop_row = 0;
        }
    }
}

/// Advance an envelope position with sustain hold and loop wrap
fn advance_envelope_pos(pos: &mut u16, env: &modplay_xm::XmEnvelope, key_off: bool) {
    let sustain_tick = env
        .points
        .get(env.sustain_point as usize)
        .map(|&(t, _)| t)
        .unwrap_or(0);
    let at_sustain = env.sustain_enabled && !key_off && *pos >= sustain_tick;
    if !at_sustain {
        *pos = pos.saturating_add(1);
    }
    if env.loop_enabled {
        let loop_start = env
            .points
            .get(env.loop_start as usize)
            .map(|&(t, _)| t)
            .unwrap_or(0);
        let loop_end = env
            .points
            .get(env.loop_end as usize)
            .map(|&(t, _)| t)
            .unwrap_or(0);
        if loop_end > loop_start && *pos >= loop_end {
            *pos = loop_start;
        }
    }
    // Clamp at the envelope's end
    let end = env.points.last().map(|&(t, _)| t).unwrap_or(0);
    if *pos > end {
        *pos = end;
    }
}
