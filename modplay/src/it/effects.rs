//! IT row and tick processing
//!
//! The two-level structure mirrors the XM engine: rows are read at tick
//! 0, per-tick effects run on the later ticks, and slave voices advance
//! their envelopes and fades once per tick. The semantics follow
//! Impulse Tracker, with the old-effects and compatible-Gxx flags
//! selecting the Scream Tracker behaviours for translated S3M modules.

use modplay_it::{effects as fx, extended_effects as sfx, ItNote, NewNoteAction, NOTE_CUT,
    NOTE_FADE, NOTE_OFF};

use super::midi::MacroContext;
use super::tables::{
    amiga_slide, it_waveform, linear_slide, note_to_frequency, retrig_volume, snap_to_semitone,
    VOL_COLUMN_PORTA,
};
use super::ItPlayer;

impl ItPlayer {
    /// Advance the tracker by one tick
    pub(crate) fn advance_tick(&mut self) {
        if self.current_tick == 0 {
            if self.pattern_delay_count > 0 {
                self.process_tick_effects();
            } else {
                self.process_row();
            }
        } else {
            self.process_tick_effects();
            if self.tempo_slide != 0 {
                self.tempo =
                    (self.tempo as i32 + self.tempo_slide as i32).clamp(32, 255) as u16;
            }
        }
        self.process_slaves();

        self.current_tick += 1;
        let row_ticks = self.speed.max(1) + self.fine_pattern_delay as u16;
        if self.current_tick >= row_ticks {
            self.current_tick = 0;
            self.fine_pattern_delay = 0;
            self.advance_row();
        }
    }

    /// Read the current row and run every channel's tick-0 handling
    fn process_row(&mut self) {
        self.tempo_slide = 0;
        let cells: Vec<ItNote> = {
            let pattern = match self.pattern_at(self.current_order) {
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
            if !self.channels[ch_idx].muted {
                self.channel_row(ch_idx, cell);
            }
        }
    }

    /// Tick-0 handling for one channel
    fn channel_row(&mut self, ch_idx: usize, cell: ItNote) {
        {
            let ch = &mut self.channels[ch_idx];
            ch.effect = if cell.has_effect() { cell.effect } else { 0 };
            ch.effect_param = if cell.has_effect() { cell.effect_param } else { 0 };
            ch.vol_column = if cell.has_volume() { cell.volume } else { 0xFF };
            ch.note_cut_tick = 0;
            ch.note_delay_tick = 0;
        }

        // SDx defers the note to its tick
        if cell.has_effect() && cell.effect == fx::EXTENDED {
            let param = self.remembered_extended(ch_idx, cell.effect_param);
            if param >> 4 == sfx::NOTE_DELAY && param & 0x0F != 0 {
                let ch = &mut self.channels[ch_idx];
                ch.delayed_note = if cell.has_note() { cell.note } else { 0xF0 };
                ch.delayed_instrument = if cell.has_instrument() { cell.instrument } else { 0 };
                ch.delayed_volume = if cell.has_volume() { cell.volume } else { 0xFF };
                ch.note_delay_tick = param & 0x0F;
                return;
            }
        }

        self.note_cell(ch_idx, &cell);
        self.volume_column_init(ch_idx);
        self.effect_init(ch_idx);
        let ch = &mut self.channels[ch_idx];
        ch.tick_volume = ch.volume;
        ch.tick_pan = ch.pan;
    }

    /// Resolve S00 against the channel's Sxx memory
    fn remembered_extended(&mut self, ch_idx: usize, param: u8) -> u8 {
        let ch = &mut self.channels[ch_idx];
        if param != 0 {
            ch.extended_mem = param;
        }
        ch.extended_mem
    }

    /// Handle the note/instrument columns of one cell
    pub(crate) fn note_cell(&mut self, ch_idx: usize, cell: &ItNote) {
        if cell.has_instrument() && cell.instrument > 0 {
            self.channels[ch_idx].instrument = cell.instrument;
        }

        if cell.has_note() {
            match cell.note {
                NOTE_OFF => {
                    if let Some(idx) = self.channel_slave(ch_idx) {
                        self.voices[idx].release();
                    }
                    return;
                }
                NOTE_CUT => {
                    if let Some(idx) = self.channel_slave(ch_idx) {
                        self.voices[idx].note_stop = true;
                    }
                    return;
                }
                NOTE_FADE => {
                    if let Some(idx) = self.channel_slave(ch_idx) {
                        self.voices[idx].fade();
                    }
                    return;
                }
                n if n <= 119 => {
                    self.channels[ch_idx].note = n;
                    let tone_porta = {
                        let ch = &self.channels[ch_idx];
                        let vol_porta =
                            ch.vol_column != 0xFF && (193..=202).contains(&ch.vol_column);
                        ch.effect == fx::TONE_PORTA
                            || ch.effect == fx::TONE_PORTA_VOL_SLIDE
                            || vol_porta
                    };
                    if tone_porta && self.channel_slave(ch_idx).is_some() {
                        self.set_porta_target(ch_idx, n);
                    } else {
                        self.trigger_note(ch_idx, n, cell);
                    }
                }
                _ => {}
            }
        } else if cell.has_instrument() && cell.instrument > 0 {
            // Instrument without note resets the volume of the current
            // voice to the sample default
            if let Some(idx) = self.channel_slave(ch_idx) {
                let sample_num = self.voices[idx].sample;
                if let Some(s) = self.module.samples.get(sample_num.saturating_sub(1) as usize) {
                    self.channels[ch_idx].volume = s.default_volume.min(64);
                }
            }
        }
    }

    /// Resolve (translated note, 1-based sample) for a pattern note
    fn resolve_note(&self, ch_idx: usize, note: u8) -> (u8, u8) {
        let instrument = self.channels[ch_idx].instrument;
        if self.module.uses_instruments() {
            match self.module.instruments.get(instrument.saturating_sub(1) as usize) {
                Some(instr) => instr.map_note(note),
                None => (note, 0),
            }
        } else {
            (note, instrument)
        }
    }

    /// Set the tone portamento target without retriggering
    fn set_porta_target(&mut self, ch_idx: usize, note: u8) {
        let (mapped, sample_num) = self.resolve_note(ch_idx, note);
        let c5 = self
            .module
            .samples
            .get(sample_num.saturating_sub(1) as usize)
            .map(|s| s.c5_speed)
            .unwrap_or(8363);
        self.channels[ch_idx].porta_target = note_to_frequency(mapped, c5);
    }

    /// Start a new note: NNA, duplicate check, allocation, voice setup
    fn trigger_note(&mut self, ch_idx: usize, note: u8, cell: &ItNote) {
        let (mapped, sample_num) = self.resolve_note(ch_idx, note);
        if sample_num == 0
            || self
                .samples
                .get(sample_num as usize - 1)
                .map(|s| s.is_empty())
                .unwrap_or(true)
        {
            return;
        }

        let instrument_num = self.channels[ch_idx].instrument;

        // Copy out everything the trigger needs from the instrument, so
        // the NNA/duplicate-check calls below can borrow freely
        let instr = self
            .module
            .instruments
            .get(instrument_num.saturating_sub(1) as usize);
        let midi = instr.map(|i| i.is_midi()).unwrap_or(false);
        let instr_nna = instr.map(|i| i.nna);
        let dup = instr.map(|i| (i.dct, i.dca));
        let (fadeout_speed, instrument_gv, random_vol, random_pan, default_pan_instr) = instr
            .map(|i| {
                (
                    i.fadeout,
                    i.global_volume,
                    i.random_volume,
                    i.random_pan,
                    i.default_pan,
                )
            })
            .unwrap_or((0, 128, 0, 0, None));
        let env_flags = instr.map(|i| {
            (
                i.volume_envelope.is_enabled(),
                i.volume_envelope.has_carry(),
                i.panning_envelope.is_enabled(),
                i.panning_envelope.has_carry(),
                i.pitch_envelope.is_enabled(),
                i.pitch_envelope.has_carry(),
            )
        });

        let nna = self.channels[ch_idx]
            .nna_override
            .take()
            .or(instr_nna)
            .unwrap_or(NewNoteAction::Cut);

        // Envelope iterators of the note being replaced, for carry flags
        let carried = self.channel_slave(ch_idx).map(|idx| {
            let v = &self.voices[idx];
            (v.vol_env, v.pan_env, v.pitch_env)
        });

        let disowned = self.handle_nna(ch_idx, nna);

        if let Some((dct, dca)) = dup {
            self.duplicate_check(dct, dca, midi, mapped, sample_num, instrument_num);
        }

        // Reuse the cut slot when possible, allocate otherwise
        let slave_idx = if !disowned {
            match self.channel_slave(ch_idx) {
                Some(idx) => idx,
                None => self.allocate_voice(midi),
            }
        } else {
            self.allocate_voice(midi)
        };
        self.channels[ch_idx].slave = slave_idx as u16;

        let sample = &self.module.samples[sample_num as usize - 1];
        let c5 = sample.c5_speed;
        let frequency = note_to_frequency(mapped, c5);
        let sample_default_pan = sample.default_pan;
        let sample_default_volume = sample.default_volume.min(64);
        let sample_gv = sample.global_volume.min(64);

        // Default pan: instrument, then sample, then the channel setting
        if let Some(p) = default_pan_instr.or(sample_default_pan) {
            self.channels[ch_idx].pan = p.min(64);
        }

        // Volume: volume column wins, then the sample default
        let vol = if cell.has_volume() && cell.volume <= 64 {
            cell.volume
        } else {
            sample_default_volume
        };
        self.channels[ch_idx].volume = vol;

        let swing_volume = self.rng.swing(random_vol as i32) as i8;
        let swing_pan = self.rng.swing(random_pan as i32 / 4) as i8;

        let voice = &mut self.voices[slave_idx];
        *voice = super::ItVoice::default();
        voice.on = true;
        voice.host = ch_idx as u8;
        voice.instrument = instrument_num;
        voice.sample = sample_num;
        voice.note = mapped;
        voice.midi = midi;
        voice.frequency = frequency;
        voice.base_frequency = frequency;
        voice.fadeout_speed = fadeout_speed;
        voice.sustain = self.samples_sustain[sample_num as usize - 1].is_some();
        voice.sample_gv = sample_gv;
        voice.instrument_gv = instrument_gv.min(128);
        voice.swing_volume = swing_volume;
        voice.swing_pan = swing_pan;
        voice.channel_volume = self.channels[ch_idx].channel_volume;
        voice.pan = self.channels[ch_idx].pan;
        voice.surround = self.channels[ch_idx].surround;
        voice.volume = vol;

        if let Some((ve, vc, pe, pc, te, tc)) = env_flags {
            voice.vol_env.enabled = ve;
            voice.pan_env.enabled = pe;
            voice.pitch_env.enabled = te;
            if let Some((old_vol, old_pan, old_pitch)) = carried {
                if ve && vc {
                    voice.vol_env = old_vol;
                    voice.vol_env.enabled = true;
                }
                if pe && pc {
                    voice.pan_env = old_pan;
                    voice.pan_env.enabled = true;
                }
                if te && tc {
                    voice.pitch_env = old_pitch;
                    voice.pitch_env.enabled = true;
                }
            }
        }

        // Waveform positions reset on trigger unless the random waveform
        // is selected
        let ch = &mut self.channels[ch_idx];
        if ch.vib_waveform < 3 {
            ch.vib_pos = 0;
        }
        if ch.trem_waveform < 3 {
            ch.trem_pos = 0;
        }
        ch.retrig_counter = 0;
        ch.tremor_counter = 0;
        ch.tremor_mute = false;
        ch.porta_target = frequency;
    }

    /// Volume column handling at tick 0
    fn volume_column_init(&mut self, ch_idx: usize) {
        let v = self.channels[ch_idx].vol_column;
        if v == 0xFF {
            return;
        }
        match v {
            0..=64 => self.channels[ch_idx].volume = v,
            65..=74 => {
                let ch = &mut self.channels[ch_idx];
                ch.volume = (ch.volume + (v - 65)).min(64);
            }
            75..=84 => {
                let ch = &mut self.channels[ch_idx];
                ch.volume = ch.volume.saturating_sub(v - 75);
            }
            128..=192 => {
                let ch = &mut self.channels[ch_idx];
                ch.pan = (v - 128).min(64);
                ch.surround = false;
            }
            193..=202 => {
                let speed = VOL_COLUMN_PORTA[(v - 193) as usize];
                let ch = &mut self.channels[ch_idx];
                if speed != 0 {
                    if self.module.uses_compat_gxx() {
                        ch.efg_mem = speed;
                    } else {
                        ch.tone_porta_mem = speed;
                    }
                }
            }
            203..=212 => {
                let ch = &mut self.channels[ch_idx];
                if v - 203 != 0 {
                    ch.vib_depth = v - 203;
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
        if effect == 0 {
            return;
        }

        match effect {
            fx::SET_SPEED => {
                if param != 0 {
                    self.speed = param as u16;
                }
            }
            fx::POSITION_JUMP => self.pending_jump = Some((param as u16, 0)),
            fx::PATTERN_BREAK => {
                let order = self
                    .pending_jump
                    .map(|(o, _)| o)
                    .unwrap_or(self.next_playable_order(self.current_order + 1));
                self.pending_jump = Some((order, param as u16));
            }
            fx::VOLUME_SLIDE | fx::VIBRATO_VOL_SLIDE | fx::TONE_PORTA_VOL_SLIDE => {
                let mem = {
                    let ch = &mut self.channels[ch_idx];
                    if param != 0 {
                        ch.vol_slide_mem = param;
                    }
                    ch.vol_slide_mem
                };
                // Fine slides act on tick 0
                let up = mem >> 4;
                let down = mem & 0x0F;
                if down == 0x0F && up != 0 && up != 0x0F {
                    let ch = &mut self.channels[ch_idx];
                    ch.volume = (ch.volume + up).min(64);
                } else if up == 0x0F && down != 0 && down != 0x0F {
                    let ch = &mut self.channels[ch_idx];
                    ch.volume = ch.volume.saturating_sub(down);
                }
            }
            fx::PORTA_DOWN | fx::PORTA_UP => {
                let compat = self.module.uses_compat_gxx();
                let mem = {
                    let ch = &mut self.channels[ch_idx];
                    if param != 0 {
                        ch.pitch_slide_mem = param;
                        if compat {
                            ch.efg_mem = param;
                        }
                    }
                    ch.pitch_slide_mem
                };
                let up = effect == fx::PORTA_UP;
                let hi = mem >> 4;
                let lo = (mem & 0x0F) as i32;
                // FEx/EEx extra-fine and FFx/EFx fine act at tick 0
                if hi == 0xF && mem & 0x0F != 0 {
                    self.slide_channel_pitch(ch_idx, if up { 4 * lo } else { -4 * lo });
                } else if hi == 0xE && mem & 0x0F != 0 {
                    self.slide_channel_pitch(ch_idx, if up { lo } else { -lo });
                }
            }
            fx::TONE_PORTA => {
                let compat = self.module.uses_compat_gxx();
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    if compat {
                        ch.efg_mem = param;
                    } else {
                        ch.tone_porta_mem = param;
                    }
                }
            }
            fx::VIBRATO | fx::FINE_VIBRATO => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.vibrato_mem = param;
                }
                let p = ch.vibrato_mem;
                if p >> 4 != 0 {
                    ch.vib_speed = p >> 4;
                }
                if p & 0x0F != 0 {
                    ch.vib_depth = p & 0x0F;
                }
            }
            fx::TREMOR => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.tremor_mem = param;
                }
            }
            fx::ARPEGGIO => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.arpeggio_mem = param;
                }
            }
            fx::SET_CHANNEL_VOLUME => {
                let vol = param.min(64);
                self.channels[ch_idx].channel_volume = vol;
                if let Some(idx) = self.channel_slave(ch_idx) {
                    self.voices[idx].channel_volume = vol;
                }
            }
            fx::CHANNEL_VOLUME_SLIDE => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.chan_vol_slide_mem = param;
                }
            }
            fx::SAMPLE_OFFSET => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.offset_mem = param;
                }
                let offset = ((ch.high_offset as u32) << 16) | ((ch.offset_mem as u32) << 8);
                if let Some(idx) = self.channel_slave(ch_idx) {
                    let voice = &mut self.voices[idx];
                    let length = self
                        .samples
                        .get(voice.sample.saturating_sub(1) as usize)
                        .map(|s| s.length)
                        .unwrap_or(0);
                    voice.pos_frac = (offset.min(length) as i64) << 16;
                    voice.backwards = false;
                }
            }
            fx::PANNING_SLIDE => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.pan_slide_mem = param;
                }
                let mem = ch.pan_slide_mem;
                // Fine pan slides at tick 0
                if mem >> 4 == 0xF && mem & 0x0F != 0 {
                    ch.pan = (ch.pan + (mem & 0x0F)).min(64);
                } else if mem & 0x0F == 0x0F && mem >> 4 != 0 {
                    ch.pan = ch.pan.saturating_sub(mem >> 4);
                }
            }
            fx::RETRIGGER => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.retrig_mem = param;
                }
            }
            fx::TREMOLO => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.tremolo_mem = param;
                }
                let p = ch.tremolo_mem;
                if p >> 4 != 0 {
                    ch.trem_speed = p >> 4;
                }
                if p & 0x0F != 0 {
                    ch.trem_depth = p & 0x0F;
                }
            }
            fx::EXTENDED => {
                let p = self.remembered_extended(ch_idx, param);
                self.extended_init(ch_idx, p);
            }
            fx::SET_TEMPO => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.tempo_mem = param;
                }
                let p = ch.tempo_mem;
                match p >> 4 {
                    0 => self.tempo_slide = -((p & 0x0F) as i8),
                    1 => self.tempo_slide = (p & 0x0F) as i8,
                    _ => self.tempo = (p as u16).max(32),
                }
            }
            fx::SET_GLOBAL_VOLUME => self.global_volume = param.min(128),
            fx::GLOBAL_VOLUME_SLIDE => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.global_vol_slide_mem = param;
                }
            }
            fx::SET_PANNING => {
                let ch = &mut self.channels[ch_idx];
                ch.pan = (param >> 2).min(64);
                ch.surround = false;
                if let Some(idx) = self.channel_slave(ch_idx) {
                    let pan = self.channels[ch_idx].pan;
                    self.voices[idx].pan = pan;
                    self.voices[idx].surround = false;
                }
            }
            fx::PANBRELLO => {
                let ch = &mut self.channels[ch_idx];
                if param != 0 {
                    ch.panbrello_mem = param;
                }
                let p = ch.panbrello_mem;
                if p >> 4 != 0 {
                    ch.panbrello_speed = p >> 4;
                }
                if p & 0x0F != 0 {
                    ch.panbrello_depth = p & 0x0F;
                }
            }
            fx::MIDI_MACRO => self.run_midi_macro(ch_idx, param),
            _ => {}
        }
    }

    /// Sxy sub-effects at tick 0
    fn extended_init(&mut self, ch_idx: usize, param: u8) {
        let sub = param >> 4;
        let val = param & 0x0F;
        match sub {
            sfx::GLISSANDO => self.channels[ch_idx].glissando = val != 0,
            sfx::SET_FINETUNE => {
                // Obsolete in IT; kept as a no-op like the original
            }
            sfx::VIBRATO_WAVEFORM => self.channels[ch_idx].vib_waveform = val & 3,
            sfx::TREMOLO_WAVEFORM => self.channels[ch_idx].trem_waveform = val & 3,
            sfx::PANBRELLO_WAVEFORM => self.channels[ch_idx].panbrello_waveform = val & 3,
            sfx::FINE_PATTERN_DELAY => self.fine_pattern_delay = val,
            sfx::INSTRUMENT_CONTROL => self.instrument_control(ch_idx, val),
            sfx::SET_PANNING_COARSE => {
                let ch = &mut self.channels[ch_idx];
                ch.pan = (val << 2).min(64);
                ch.surround = false;
            }
            sfx::SOUND_CONTROL => {
                if val == 1 {
                    self.channels[ch_idx].surround = true;
                    if let Some(idx) = self.channel_slave(ch_idx) {
                        self.voices[idx].surround = true;
                    }
                } else if val == 0 {
                    self.channels[ch_idx].surround = false;
                    if let Some(idx) = self.channel_slave(ch_idx) {
                        self.voices[idx].surround = false;
                    }
                }
            }
            sfx::HIGH_SAMPLE_OFFSET => self.channels[ch_idx].high_offset = val,
            sfx::PATTERN_LOOP => {
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
                        self.pattern_loop_jump =
                            Some(self.channels[ch_idx].pattern_loop_row);
                    }
                }
            }
            sfx::NOTE_CUT => self.channels[ch_idx].note_cut_tick = val,
            sfx::PATTERN_DELAY => {
                if self.pattern_delay == 0 && val != 0 {
                    self.pattern_delay = val;
                }
            }
            sfx::SET_ACTIVE_MACRO => self.channels[ch_idx].active_macro = val,
            _ => {}
        }
    }

    /// S7x: past-note commands, NNA overrides and envelope switches
    fn instrument_control(&mut self, ch_idx: usize, val: u8) {
        match val {
            0 | 1 | 2 => {
                // Past notes: every disowned voice spawned by this channel
                for v in &mut self.voices {
                    if v.on && v.disowned && v.host as usize == ch_idx {
                        match val {
                            0 => v.note_stop = true,
                            1 => v.release(),
                            _ => v.fade(),
                        }
                    }
                }
            }
            3 => self.channels[ch_idx].nna_override = Some(NewNoteAction::Cut),
            4 => self.channels[ch_idx].nna_override = Some(NewNoteAction::Continue),
            5 => self.channels[ch_idx].nna_override = Some(NewNoteAction::NoteOff),
            6 => self.channels[ch_idx].nna_override = Some(NewNoteAction::NoteFade),
            7 | 8 => {
                if let Some(idx) = self.channel_slave(ch_idx) {
                    self.voices[idx].vol_env.enabled = val == 8;
                }
            }
            9 | 10 => {
                if let Some(idx) = self.channel_slave(ch_idx) {
                    self.voices[idx].pan_env.enabled = val == 10;
                }
            }
            11 | 12 => {
                if let Some(idx) = self.channel_slave(ch_idx) {
                    self.voices[idx].pitch_env.enabled = val == 12;
                }
            }
            _ => {}
        }
    }

    /// Zxx: run a macro slot through the filter recogniser
    fn run_midi_macro(&mut self, ch_idx: usize, param: u8) {
        let config = match &self.module.midi_config {
            Some(c) => c.clone(),
            None => return,
        };
        let ch = &self.channels[ch_idx];
        let program = self
            .module
            .instruments
            .get(ch.instrument.saturating_sub(1) as usize)
            .map(|i| i.midi_program)
            .unwrap_or(0);
        let ctx = MacroContext {
            channel: ch_idx as u8,
            note: ch.note,
            velocity: ch.volume,
            param,
            program,
        };
        if param < 0x80 {
            let slot = config.sfx[(ch.active_macro & 0x0F) as usize];
            super::midi::run_macro(&slot, ctx, &mut self.midi);
        } else {
            let slot = config.zxx[(param - 0x80) as usize];
            super::midi::run_macro(&slot, ctx, &mut self.midi);
        }
        // Mirror the recognised parameters onto the channel
        let ch = &mut self.channels[ch_idx];
        ch.filter_cutoff = self.midi.cutoff(ch_idx as u8);
        ch.filter_resonance = self.midi.resonance(ch_idx as u8);
    }

    /// Slide the channel's voice pitch, keeping the base in sync
    fn slide_channel_pitch(&mut self, ch_idx: usize, steps: i32) {
        if let Some(idx) = self.channel_slave(ch_idx) {
            let v = &mut self.voices[idx];
            let slid = if self.module.uses_linear_slides() {
                linear_slide(v.frequency, steps)
            } else {
                amiga_slide(v.frequency, -steps)
            };
            v.frequency = slid;
            v.base_frequency = slid;
        }
    }

    /// Per-tick effect updates
    fn process_tick_effects(&mut self) {
        let tick = self.current_tick;
        for ch_idx in 0..self.channels.len() {
            {
                let ch = &mut self.channels[ch_idx];
                ch.tick_volume = ch.volume;
                ch.tick_pan = ch.pan;
            }

            // Note delay fires on its tick
            if self.channels[ch_idx].note_delay_tick != 0
                && tick == self.channels[ch_idx].note_delay_tick as u16
            {
                let ch = &mut self.channels[ch_idx];
                ch.note_delay_tick = 0;
                let mut cell = ItNote::default();
                if ch.delayed_note != 0xF0 {
                    cell.mask |= ItNote::MASK_NOTE;
                    cell.note = ch.delayed_note;
                }
                if ch.delayed_instrument != 0 {
                    cell.mask |= ItNote::MASK_INSTRUMENT;
                    cell.instrument = ch.delayed_instrument;
                }
                if ch.delayed_volume != 0xFF {
                    cell.mask |= ItNote::MASK_VOLUME;
                    cell.volume = ch.delayed_volume;
                }
                self.note_cell(ch_idx, &cell);
                self.volume_column_init(ch_idx);
                let ch = &mut self.channels[ch_idx];
                ch.tick_volume = ch.volume;
                continue;
            }

            // Note cut (SCx)
            if self.channels[ch_idx].note_cut_tick != 0
                && tick == self.channels[ch_idx].note_cut_tick as u16
            {
                self.channels[ch_idx].note_cut_tick = 0;
                if let Some(idx) = self.channel_slave(ch_idx) {
                    self.voices[idx].note_stop = true;
                }
            }

            // Volume column per-tick commands
            let v = self.channels[ch_idx].vol_column;
            if v != 0xFF {
                match v {
                    85..=94 => {
                        let ch = &mut self.channels[ch_idx];
                        ch.volume = (ch.volume + (v - 85)).min(64);
                    }
                    95..=104 => {
                        let ch = &mut self.channels[ch_idx];
                        ch.volume = ch.volume.saturating_sub(v - 95);
                    }
                    105..=114 => self.slide_channel_pitch(ch_idx, -4 * (v as i32 - 105)),
                    115..=124 => self.slide_channel_pitch(ch_idx, 4 * (v as i32 - 115)),
                    193..=202 => self.tone_porta_tick(ch_idx),
                    203..=212 => self.vibrato_tick(ch_idx),
                    _ => {}
                }
            }

            // Volume-column slides above changed the base volume
            {
                let ch = &mut self.channels[ch_idx];
                ch.tick_volume = ch.volume;
            }

            let (effect, _param) = {
                let ch = &self.channels[ch_idx];
                (ch.effect, ch.effect_param)
            };
            if effect == 0 {
                continue;
            }

            match effect {
                fx::VOLUME_SLIDE => self.volume_slide_tick(ch_idx),
                fx::PORTA_DOWN => {
                    let mem = self.channels[ch_idx].pitch_slide_mem;
                    if mem < 0xE0 {
                        self.slide_channel_pitch(ch_idx, -4 * mem as i32);
                    }
                }
                fx::PORTA_UP => {
                    let mem = self.channels[ch_idx].pitch_slide_mem;
                    if mem < 0xE0 {
                        self.slide_channel_pitch(ch_idx, 4 * mem as i32);
                    }
                }
                fx::TONE_PORTA => self.tone_porta_tick(ch_idx),
                fx::VIBRATO => self.vibrato_tick(ch_idx),
                fx::FINE_VIBRATO => self.fine_vibrato_tick(ch_idx),
                fx::TREMOR => self.tremor_tick(ch_idx),
                fx::ARPEGGIO => self.arpeggio_tick(ch_idx, tick),
                fx::VIBRATO_VOL_SLIDE => {
                    self.vibrato_tick(ch_idx);
                    self.volume_slide_tick(ch_idx);
                }
                fx::TONE_PORTA_VOL_SLIDE => {
                    self.tone_porta_tick(ch_idx);
                    self.volume_slide_tick(ch_idx);
                }
                fx::CHANNEL_VOLUME_SLIDE => {
                    let mem = self.channels[ch_idx].chan_vol_slide_mem;
                    let ch = &mut self.channels[ch_idx];
                    if mem >> 4 != 0 && mem & 0x0F == 0 {
                        ch.channel_volume = (ch.channel_volume + (mem >> 4)).min(64);
                    } else if mem >> 4 == 0 {
                        ch.channel_volume = ch.channel_volume.saturating_sub(mem & 0x0F);
                    }
                    let vol = ch.channel_volume;
                    if let Some(idx) = self.channel_slave(ch_idx) {
                        self.voices[idx].channel_volume = vol;
                    }
                }
                fx::PANNING_SLIDE => {
                    let mem = self.channels[ch_idx].pan_slide_mem;
                    let ch = &mut self.channels[ch_idx];
                    if mem >> 4 != 0 && mem & 0x0F == 0 {
                        // Slide left
                        ch.pan = ch.pan.saturating_sub(mem >> 4);
                    } else if mem >> 4 == 0 {
                        ch.pan = (ch.pan + (mem & 0x0F)).min(64);
                    }
                }
                fx::RETRIGGER => self.retrigger_tick(ch_idx),
                fx::TREMOLO => self.tremolo_tick(ch_idx),
                fx::GLOBAL_VOLUME_SLIDE => {
                    let mem = self.channels[ch_idx].global_vol_slide_mem;
                    if mem >> 4 != 0 && mem & 0x0F == 0 {
                        self.global_volume = (self.global_volume + (mem >> 4)).min(128);
                    } else if mem >> 4 == 0 {
                        self.global_volume = self.global_volume.saturating_sub(mem & 0x0F);
                    }
                }
                fx::PANBRELLO => self.panbrello_tick(ch_idx),
                _ => {}
            }

            // Keep the tick volume current for the mixer; tremolo and
            // retrigger write it themselves
            if effect != fx::TREMOLO {
                let ch = &mut self.channels[ch_idx];
                if effect != fx::RETRIGGER {
                    ch.tick_volume = ch.volume;
                }
            }
        }
    }

    /// Dxy per tick (fine slides already ran at tick 0)
    fn volume_slide_tick(&mut self, ch_idx: usize) {
        let mem = self.channels[ch_idx].vol_slide_mem;
        let up = mem >> 4;
        let down = mem & 0x0F;
        let ch = &mut self.channels[ch_idx];
        if up != 0 && down == 0 {
            ch.volume = (ch.volume + up).min(64);
        } else if down != 0 && up == 0 {
            ch.volume = ch.volume.saturating_sub(down);
        }
    }

    /// Gxx per tick: glide the voice toward the target note
    fn tone_porta_tick(&mut self, ch_idx: usize) {
        let (speed, target, glissando) = {
            let ch = &self.channels[ch_idx];
            let speed = if self.module.uses_compat_gxx() {
                ch.efg_mem
            } else {
                ch.tone_porta_mem
            };
            (speed, ch.porta_target, ch.glissando)
        };
        if speed == 0 || target == 0 {
            return;
        }
        let linear = self.module.uses_linear_slides();
        let c5 = {
            let slave = self.channel_slave(ch_idx);
            slave
                .and_then(|idx| {
                    self.module
                        .samples
                        .get(self.voices[idx].sample.saturating_sub(1) as usize)
                })
                .map(|s| s.c5_speed)
                .unwrap_or(8363)
        };
        if let Some(idx) = self.channel_slave(ch_idx) {
            let v = &mut self.voices[idx];
            let steps = 4 * speed as i32;
            let next = if v.frequency < target {
                let up = if linear {
                    linear_slide(v.frequency, steps)
                } else {
                    amiga_slide(v.frequency, -steps)
                };
                up.min(target)
            } else if v.frequency > target {
                let down = if linear {
                    linear_slide(v.frequency, -steps)
                } else {
                    amiga_slide(v.frequency, steps)
                };
                down.max(target)
            } else {
                target
            };
            v.frequency = if glissando && next != target {
                snap_to_semitone(next, c5)
            } else {
                next
            };
            v.base_frequency = v.frequency;
        }
    }

    /// Hxy per tick
    fn vibrato_tick(&mut self, ch_idx: usize) {
        let old = self.module.uses_old_effects();
        let (waveform, depth) = {
            let ch = &mut self.channels[ch_idx];
            ch.vib_pos = ch.vib_pos.wrapping_add(ch.vib_speed << 2);
            let depth = if old { ch.vib_depth * 2 } else { ch.vib_depth };
            (ch.vib_waveform, depth)
        };
        let pos = self.channels[ch_idx].vib_pos;
        let wave = it_waveform(waveform, pos);
        if let Some(idx) = self.channel_slave(ch_idx) {
            let base = self.voices[idx].base_frequency;
            let steps = wave * depth as i32 / 32;
            let slid = if self.module.uses_linear_slides() {
                linear_slide(base, steps)
            } else {
                amiga_slide(base, -steps)
            };
            self.voices[idx].frequency = slid;
        }
    }

    /// Uxy per tick: quarter-depth vibrato
    fn fine_vibrato_tick(&mut self, ch_idx: usize) {
        let (waveform, depth) = {
            let ch = &mut self.channels[ch_idx];
            ch.vib_pos = ch.vib_pos.wrapping_add(ch.vib_speed << 2);
            (ch.vib_waveform, ch.vib_depth)
        };
        let pos = self.channels[ch_idx].vib_pos;
        let wave = it_waveform(waveform, pos);
        if let Some(idx) = self.channel_slave(ch_idx) {
            let base = self.voices[idx].base_frequency;
            let steps = wave * depth as i32 / 128;
            let slid = if self.module.uses_linear_slides() {
                linear_slide(base, steps)
            } else {
                amiga_slide(base, -steps)
            };
            self.voices[idx].frequency = slid;
        }
    }

    /// Ixy per tick: on/off gate
    fn tremor_tick(&mut self, ch_idx: usize) {
        let old = self.module.uses_old_effects();
        let ch = &mut self.channels[ch_idx];
        let mem = ch.tremor_mem;
        let extra = if old { 1 } else { 0 };
        let on_ticks = (mem >> 4) + extra;
        let off_ticks = (mem & 0x0F) + extra;
        if on_ticks == 0 && off_ticks == 0 {
            return;
        }
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

    /// Jxy per tick
    fn arpeggio_tick(&mut self, ch_idx: usize, tick: u16) {
        let param = self.channels[ch_idx].arpeggio_mem;
        let offset = match tick % 3 {
            0 => 0,
            1 => (param >> 4) as i32,
            _ => (param & 0x0F) as i32,
        };
        if let Some(idx) = self.channel_slave(ch_idx) {
            let base = self.voices[idx].base_frequency;
            self.voices[idx].frequency = linear_slide(base, offset * 16);
        }
    }

    /// Qxy per tick
    fn retrigger_tick(&mut self, ch_idx: usize) {
        let mem = self.channels[ch_idx].retrig_mem;
        let interval = mem & 0x0F;
        if interval == 0 {
            return;
        }
        let ch = &mut self.channels[ch_idx];
        ch.retrig_counter += 1;
        if ch.retrig_counter < interval {
            return;
        }
        ch.retrig_counter = 0;
        let new_vol = retrig_volume(mem >> 4, ch.volume);
        ch.volume = new_vol;
        ch.tick_volume = new_vol;
        if let Some(idx) = self.channel_slave(ch_idx) {
            let v = &mut self.voices[idx];
            v.pos_frac = 0;
            v.backwards = false;
        }
    }

    /// Rxy per tick
    fn tremolo_tick(&mut self, ch_idx: usize) {
        let old = self.module.uses_old_effects();
        let ch = &mut self.channels[ch_idx];
        ch.trem_pos = ch.trem_pos.wrapping_add(ch.trem_speed << 2);
        let wave = it_waveform(ch.trem_waveform, ch.trem_pos);
        let depth = if old { ch.trem_depth * 2 } else { ch.trem_depth };
        let delta = wave * depth as i32 / 64;
        ch.tick_volume = (ch.volume as i32 + delta).clamp(0, 64) as u8;
    }

    /// Yxy per tick
    fn panbrello_tick(&mut self, ch_idx: usize) {
        let ch = &mut self.channels[ch_idx];
        ch.panbrello_pos = ch.panbrello_pos.wrapping_add(ch.panbrello_speed);
        let wave = it_waveform(ch.panbrello_waveform, ch.panbrello_pos);
        let delta = wave * ch.panbrello_depth as i32 / 16;
        ch.tick_pan = (ch.pan as i32 + delta).clamp(0, 64) as u8;
    }

    /// Envelope, fade-out and auto-vibrato advancement for all voices
    fn process_slaves(&mut self) {
        for idx in 0..self.voices.len() {
            if !self.voices[idx].on {
                continue;
            }

            let instr = self
                .module
                .instruments
                .get(self.voices[idx].instrument.saturating_sub(1) as usize);
            let sample = self
                .module
                .samples
                .get(self.voices[idx].sample.saturating_sub(1) as usize);

            // Envelope positions
            if let Some(i) = instr {
                let note_off = self.voices[idx].note_off;
                let v = &mut self.voices[idx];
                if v.vol_env.enabled {
                    advance_it_envelope(&mut v.vol_env, &i.volume_envelope, note_off);
                }
                if v.pan_env.enabled {
                    advance_it_envelope(&mut v.pan_env, &i.panning_envelope, note_off);
                }
                if v.pitch_env.enabled {
                    advance_it_envelope(&mut v.pitch_env, &i.pitch_envelope, note_off);
                }

                // Fade starts at note-off without a volume envelope, or
                // once the volume envelope has run out
                let v = &mut self.voices[idx];
                if (note_off && !v.vol_env.enabled)
                    || (v.vol_env.enabled && v.vol_env.finished)
                {
                    v.fading = true;
                }
            } else {
                // Sample mode: note-off fades immediately
                let v = &mut self.voices[idx];
                if v.note_off {
                    v.fading = true;
                    if v.fadeout_speed == 0 {
                        v.fadeout_speed = 1024;
                    }
                }
            }

            // Fade-out amplitude
            {
                let v = &mut self.voices[idx];
                if v.fading {
                    v.fadeout_amp = v.fadeout_amp.saturating_sub(v.fadeout_speed);
                    if v.fadeout_amp == 0 {
                        v.note_stop = true;
                    }
                }
            }

            // Sample auto-vibrato
            if let Some(s) = sample {
                if s.vibrato_depth > 0 && s.vibrato_speed > 0 {
                    let v = &mut self.voices[idx];
                    // Sweep raises the depth toward its target
                    let target = (s.vibrato_depth as u16) << 8;
                    if s.vibrato_rate == 0 {
                        v.auto_vib_depth = target;
                    } else if v.auto_vib_depth < target {
                        v.auto_vib_depth =
                            (v.auto_vib_depth + s.vibrato_rate as u16).min(target);
                    }
                    v.auto_vib_pos = v.auto_vib_pos.wrapping_add(s.vibrato_speed as u16);
                    let wave = it_waveform(s.vibrato_type & 3, (v.auto_vib_pos & 0xFF) as u8);
                    let steps = wave * (v.auto_vib_depth >> 8) as i32 / 64;
                    let base = v.frequency;
                    v.frequency = if self.module.uses_linear_slides() {
                        linear_slide(base, steps)
                    } else {
                        amiga_slide(base, -steps)
                    };
                }
            }
        }
    }

    /// Move the cursor to the next row, applying jumps, loops and delays
    fn advance_row(&mut self) {
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
            .pattern_at(self.current_order)
            .map(|p| p.num_rows)
            .unwrap_or(64);
        if self.current_row >= num_rows {
            let next = self.current_order + 1;
            self.jump_to(next, 0);
        }
    }

    /// Jump to an order/row, skipping markers and wrapping at the end
    fn jump_to(&mut self, order: u16, row: u16) {
        let order = self.next_playable_order(order);
        self.current_order = order;
        let num_rows = self
            .pattern_at(order)
            .map(|p| p.num_rows)
            .unwrap_or(64);
        self.current_row = row.min(num_rows.saturating_sub(1));
        for ch in &mut self.channels {
            ch.pattern_loop_count = 0;
            ch.pattern_loop_row = 0;
        }
    }
}

/// Advance an IT envelope position with sustain loop, loop and end state
fn advance_it_envelope(
    state: &mut super::EnvelopeState,
    env: &modplay_it::ItEnvelope,
    note_off: bool,
) {
    if env.nodes.is_empty() {
        state.finished = true;
        return;
    }

    state.pos = state.pos.saturating_add(1);

    // Sustain loop holds while the note is on
    if env.has_sustain() && !note_off {
        let begin = env
            .nodes
            .get(env.sustain_begin as usize)
            .map(|&(t, _)| t)
            .unwrap_or(0);
        let end = env
            .nodes
            .get(env.sustain_end as usize)
            .map(|&(t, _)| t)
            .unwrap_or(0);
        if state.pos > end {
            state.pos = begin;
        }
        return;
    }

    if env.has_loop() {
        let begin = env
            .nodes
            .get(env.loop_begin as usize)
            .map(|&(t, _)| t)
            .unwrap_or(0);
        let end = env
            .nodes
            .get(env.loop_end as usize)
            .map(|&(t, _)| t)
            .unwrap_or(0);
        if state.pos > end {
            state.pos = begin;
        }
        return;
    }

    let end = env.end_tick();
    if state.pos >= end {
        state.pos = end;
        state.finished = true;
    }
}
