//! IT engine tests
//!
//! Modules are built in memory in the IT data model, the way the loader
//! would deliver them.

use modplay_it::{
    effects as fx, ItEnvelope, ItEnvelopeFlags, ItFlags, ItInstrument, ItModule, ItNote,
    ItPattern, ItSample, ItSampleFlags, NewNoteAction, SampleData, NOTE_CUT, NOTE_OFF,
};

use super::ItPlayer;

fn test_sample(len: usize, looped: bool) -> ItSample {
    let pcm: Vec<i8> = (0..len)
        .map(|i| if i % 8 < 4 { 90 } else { -90 })
        .collect();
    let mut flags = ItSampleFlags::HAS_DATA;
    if looped {
        flags = flags | ItSampleFlags::LOOP;
    }
    ItSample {
        length: len as u32,
        loop_begin: 0,
        loop_end: if looped { len as u32 } else { 0 },
        flags,
        default_volume: 64,
        global_volume: 64,
        c5_speed: 8363,
        data: SampleData::I8(pcm),
        ..Default::default()
    }
}

fn test_instrument(nna: NewNoteAction, fadeout: u16) -> ItInstrument {
    let mut note_map = [(0u8, 0u8); 120];
    for (i, e) in note_map.iter_mut().enumerate() {
        *e = (i as u8, 1);
    }
    ItInstrument {
        nna,
        fadeout,
        note_map,
        ..Default::default()
    }
}

fn make_module(
    patterns: Vec<ItPattern>,
    instruments: Vec<ItInstrument>,
    samples: Vec<ItSample>,
) -> ItModule {
    ItModule {
        name: "test".into(),
        flags: ItFlags::STEREO | ItFlags::INSTRUMENTS | ItFlags::LINEAR_SLIDES,
        num_channels: 4,
        global_volume: 128,
        mix_volume: 128,
        initial_speed: 6,
        initial_tempo: 125,
        panning_separation: 128,
        channel_pan: [32; 64],
        channel_volume: [64; 64],
        orders: (0..patterns.len() as u8).collect(),
        instruments,
        samples,
        patterns,
        message: None,
        midi_config: None,
    }
}

fn note_cell(note: u8, instrument: u8) -> ItNote {
    ItNote {
        mask: ItNote::MASK_NOTE | ItNote::MASK_INSTRUMENT,
        note,
        instrument,
        ..Default::default()
    }
}

fn effect_cell(effect: u8, param: u8) -> ItNote {
    ItNote {
        mask: ItNote::MASK_EFFECT,
        effect,
        effect_param: param,
        ..Default::default()
    }
}

fn pattern_of(cells: Vec<(u16, usize, ItNote)>, rows: u16) -> ItPattern {
    let mut notes = vec![vec![ItNote::default(); 4]; rows as usize];
    for (row, ch, cell) in cells {
        notes[row as usize][ch] = cell;
    }
    ItPattern {
        num_rows: rows,
        notes,
    }
}

fn active_voices(player: &ItPlayer) -> usize {
    player.voices.iter().filter(|v| v.on).count()
}

#[test]
fn test_set_speed_effect() {
    // An Axx cell leaves the new speed in force after one row
    let pattern = pattern_of(vec![(0, 0, effect_cell(fx::SET_SPEED, 8))], 4);
    let module = make_module(
        vec![pattern],
        vec![test_instrument(NewNoteAction::Cut, 0)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    player.advance_tick();
    assert_eq!(player.speed, 8);
}

#[test]
fn test_pattern_loop_visits_rows_twice() {
    // SB0 on row 0, SB2 on row 5: rows 0-5 play three times, then 6, 7
    let pattern = pattern_of(
        vec![
            (0, 0, effect_cell(fx::EXTENDED, 0xB0)),
            (5, 0, effect_cell(fx::EXTENDED, 0xB2)),
        ],
        8,
    );
    let module = make_module(
        vec![pattern],
        vec![test_instrument(NewNoteAction::Cut, 0)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    player.speed = 1;

    let mut visited = vec![0u16];
    for _ in 0..21 {
        player.advance_tick();
        visited.push(player.current_row);
    }
    assert_eq!(
        visited[..20],
        [0, 1, 2, 3, 4, 5, 0, 1, 2, 3, 4, 5, 0, 1, 2, 3, 4, 5, 6, 7]
    );
}

#[test]
fn test_nna_fade_keeps_two_voices() {
    // NNA = note fade, fade-out 256: after the second trigger the first
    // voice keeps sounding, disowned and fading by 256 per tick
    let pattern = pattern_of(
        vec![(0, 0, note_cell(48, 1)), (1, 0, note_cell(60, 1))],
        4,
    );
    let module = make_module(
        vec![pattern],
        vec![test_instrument(NewNoteAction::NoteFade, 256)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();

    // Row 0
    player.advance_tick();
    assert_eq!(active_voices(&player), 1);

    // Run to row 1
    for _ in 0..6 {
        player.advance_tick();
    }
    assert_eq!(active_voices(&player), 2, "old voice must keep sounding");

    let disowned: Vec<&super::ItVoice> =
        player.voices.iter().filter(|v| v.on && v.disowned).collect();
    assert_eq!(disowned.len(), 1);
    assert!(disowned[0].fading);
    assert_eq!(disowned[0].note, 48);

    // Fade amplitude drops by the instrument fade-out per tick
    let amp_before = disowned[0].fadeout_amp;
    player.advance_tick();
    let faded = player
        .voices
        .iter()
        .find(|v| v.on && v.disowned)
        .expect("disowned voice still alive");
    assert_eq!(amp_before - faded.fadeout_amp, 256);
}

#[test]
fn test_nna_cut_reuses_slot() {
    let pattern = pattern_of(
        vec![(0, 0, note_cell(48, 1)), (1, 0, note_cell(60, 1))],
        4,
    );
    let module = make_module(
        vec![pattern],
        vec![test_instrument(NewNoteAction::Cut, 0)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    for _ in 0..7 {
        player.advance_tick();
    }
    // Only one live (non-stopping) voice remains
    let live = player
        .voices
        .iter()
        .filter(|v| v.on && !v.note_stop)
        .count();
    assert_eq!(live, 1);
}

#[test]
fn test_note_off_releases_and_fades() {
    let mut instr = test_instrument(NewNoteAction::Cut, 128);
    // No volume envelope: note-off goes straight to fading
    instr.volume_envelope = ItEnvelope::default();
    let off = ItNote {
        mask: ItNote::MASK_NOTE,
        note: NOTE_OFF,
        ..Default::default()
    };
    let pattern = pattern_of(vec![(0, 0, note_cell(60, 1)), (1, 0, off)], 4);
    let module = make_module(
        vec![pattern],
        vec![instr],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    for _ in 0..8 {
        player.advance_tick();
    }
    let v = player.voices.iter().find(|v| v.on).expect("voice alive");
    assert!(v.note_off);
    assert!(v.fading);
    assert!(v.fadeout_amp < 32768);
}

#[test]
fn test_note_cut_cell_stops_voice() {
    let cut = ItNote {
        mask: ItNote::MASK_NOTE,
        note: NOTE_CUT,
        ..Default::default()
    };
    let pattern = pattern_of(vec![(0, 0, note_cell(60, 1)), (1, 0, cut)], 4);
    let module = make_module(
        vec![pattern],
        vec![test_instrument(NewNoteAction::Cut, 0)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    for _ in 0..7 {
        player.advance_tick();
    }
    assert!(player.voices.iter().all(|v| !v.on || v.note_stop));
}

#[test]
fn test_surround_command() {
    let cells = vec![
        (0, 0, note_cell(60, 1)),
        (1, 0, effect_cell(fx::EXTENDED, 0x91)),
    ];
    let module = make_module(
        vec![pattern_of(cells, 4)],
        vec![test_instrument(NewNoteAction::Cut, 0)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    for _ in 0..7 {
        player.advance_tick();
    }
    assert!(player.channels[0].surround);
    let v = player.voices.iter().find(|v| v.on).expect("voice");
    assert!(v.surround);
}

#[test]
fn test_duplicate_check_cuts_same_instrument() {
    let mut instr = test_instrument(NewNoteAction::Continue, 0);
    instr.dct = modplay_it::DuplicateCheckType::Instrument;
    instr.dca = modplay_it::DuplicateCheckAction::Cut;
    let pattern = pattern_of(
        vec![(0, 0, note_cell(48, 1)), (1, 0, note_cell(60, 1))],
        4,
    );
    let module = make_module(
        vec![pattern],
        vec![instr],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    for _ in 0..7 {
        player.advance_tick();
    }
    // NNA=Continue would keep the old voice, but the duplicate check
    // (same instrument) cuts it
    let live = player
        .voices
        .iter()
        .filter(|v| v.on && !v.note_stop)
        .count();
    assert_eq!(live, 1);
}

#[test]
fn test_generate_output_is_clamped_and_sized() {
    let pattern = pattern_of(vec![(0, 0, note_cell(60, 1))], 8);
    let module = make_module(
        vec![pattern],
        vec![test_instrument(NewNoteAction::Cut, 0)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();

    let mut out = vec![0i16; 2048];
    player.generate_samples(&mut out);
    assert!(out.iter().any(|&s| s != 0));

    let mut fout = vec![0f32; 512];
    player.generate_float_samples(&mut fout);
    assert!(fout.iter().all(|&s| (-1.0..=1.0).contains(&s)));
}

#[test]
fn test_stop_is_idempotent_and_silences() {
    let pattern = pattern_of(vec![(0, 0, note_cell(60, 1))], 8);
    let module = make_module(
        vec![pattern],
        vec![test_instrument(NewNoteAction::Cut, 0)],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    let mut out = vec![0i16; 256];
    player.generate_samples(&mut out);

    player.stop();
    player.stop();
    let mut out = vec![55i16; 256];
    player.generate_samples(&mut out);
    assert!(out.iter().all(|&s| s == 0));
    // The pattern cursor is retained
    assert_eq!(player.current_order, 0);
}

#[test]
fn test_envelope_carry() {
    let mut instr = test_instrument(NewNoteAction::Continue, 0);
    instr.volume_envelope = ItEnvelope {
        flags: ItEnvelopeFlags::ENABLED | ItEnvelopeFlags::CARRY,
        nodes: vec![(0, 64), (100, 0)],
        ..Default::default()
    };
    let pattern = pattern_of(
        vec![(0, 0, note_cell(48, 1)), (2, 0, note_cell(60, 1))],
        4,
    );
    let module = make_module(
        vec![pattern],
        vec![instr],
        vec![test_sample(64, true)],
    );
    let mut player = ItPlayer::new(module, 44100);
    player.play();
    for _ in 0..13 {
        player.advance_tick();
    }
    // The new voice continued the old envelope position instead of
    // restarting at zero
    let v = player
        .voices
        .iter()
        .find(|v| v.on && !v.disowned)
        .expect("owned voice");
    assert!(v.vol_env.pos > 2, "carried position, got {}", v.vol_env.pos);
}
