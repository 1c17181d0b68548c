//! XM engine tests
//!
//! Modules are built in memory; a square-ish test tone stands in for real
//! sample data.

use modplay_xm::{
    SampleData, XmEnvelope, XmInstrument, XmModule, XmNote, XmPattern, XmSample, LOOP_FORWARD,
};

use super::XmPlayer;

fn test_sample(len: usize, looped: bool) -> XmSample {
    let pcm: Vec<i8> = (0..len)
        .map(|i| if i % 8 < 4 { 90 } else { -90 })
        .collect();
    XmSample {
        length: len as u32,
        loop_start: 0,
        loop_length: if looped { len as u32 } else { 0 },
        volume: 64,
        loop_type: if looped { LOOP_FORWARD } else { 0 },
        panning: 128,
        data: SampleData::I8(pcm),
        ..Default::default()
    }
}

fn test_instrument(looped: bool) -> XmInstrument {
    XmInstrument {
        samples: vec![test_sample(64, looped)],
        ..Default::default()
    }
}

fn make_module(patterns: Vec<XmPattern>, instruments: Vec<XmInstrument>) -> XmModule {
    let song_length = patterns.len() as u16;
    XmModule {
        name: "test".into(),
        num_channels: 4,
        song_length,
        restart_position: 0,
        default_speed: 6,
        default_bpm: 125,
        linear_frequency_table: true,
        order_table: (0..patterns.len() as u8).collect(),
        patterns,
        instruments,
    }
}

fn pattern_of_rows(rows: Vec<Vec<XmNote>>) -> XmPattern {
    XmPattern {
        num_rows: rows.len() as u16,
        notes: rows,
    }
}

fn empty_row() -> Vec<XmNote> {
    vec![XmNote::default(); 4]
}

fn row_with(ch: usize, note: XmNote) -> Vec<XmNote> {
    let mut row = empty_row();
    row[ch] = note;
    row
}

#[test]
fn test_generate_exact_frame_count() {
    let pattern = pattern_of_rows(vec![empty_row(); 8]);
    let module = make_module(vec![pattern], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();

    for &n in &[0usize, 1, 7, 480, 1000] {
        let mut out = vec![1i16; n * 2];
        player.generate_samples(&mut out);
        assert_eq!(out.len(), n * 2);
    }
}

#[test]
fn test_stopped_player_outputs_silence() {
    let pattern = pattern_of_rows(vec![empty_row(); 4]);
    let module = make_module(vec![pattern], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    let mut out = vec![123i16; 64];
    player.generate_samples(&mut out);
    assert!(out.iter().all(|&s| s == 0));
}

#[test]
fn test_row_advance_matches_speed() {
    // Speed 2, 4 rows: after 8 ticks the pattern wraps
    let mut rows = vec![empty_row(); 4];
    rows[0][0] = XmNote {
        effect: 0x0F,
        effect_param: 2,
        ..Default::default()
    };
    let module = make_module(vec![pattern_of_rows(rows)], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();

    player.advance_tick();
    assert_eq!(player.speed, 2);
    let mut seen = vec![player.current_row];
    for _ in 0..7 {
        player.advance_tick();
        seen.push(player.current_row);
    }
    // Two ticks per row; the row index changes on the second tick of each
    assert_eq!(seen, vec![0, 1, 1, 2, 2, 3, 3, 0]);
}

#[test]
fn test_note_trigger_produces_audio() {
    let note = XmNote {
        note: 49,
        instrument: 1,
        ..Default::default()
    };
    let pattern = pattern_of_rows(vec![row_with(0, note), empty_row()]);
    let module = make_module(vec![pattern], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();

    let mut out = vec![0i16; 4096];
    player.generate_samples(&mut out);
    assert!(out.iter().any(|&s| s != 0), "triggered note must be audible");
    // Everything stays inside i16 (the clamp invariant)
    assert!(out.iter().all(|&s| (-32768..=32767).contains(&(s as i32))));
}

#[test]
fn test_vibrato_waveform_lockup_preserved() {
    // Selecting waveform 4 (bit 2 of the control byte) stops the vibrato
    // position from ever being reset by note triggers
    let pattern = pattern_of_rows(vec![empty_row(); 4]);
    let module = make_module(vec![pattern], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();

    player.channels[0].wave_ctrl = 0x04;
    player.channels[0].vib_pos = 13;
    player.note_cell(0, 49, 1);
    assert_eq!(
        player.channels[0].vib_pos, 13,
        "waveform 4 must not reset the vibrato position"
    );

    player.channels[0].wave_ctrl = 0x00;
    player.note_cell(0, 49, 1);
    assert_eq!(player.channels[0].vib_pos, 0);
}

#[test]
fn test_global_volume_clamps_above_64() {
    let note = XmNote {
        effect: 0x10, // Gxx
        effect_param: 80,
        ..Default::default()
    };
    let pattern = pattern_of_rows(vec![row_with(0, note)]);
    let module = make_module(vec![pattern], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();
    player.advance_tick();
    assert_eq!(player.global_volume, 64);
}

#[test]
fn test_pattern_break_is_decimal_coded() {
    let mut rows = vec![empty_row(); 2];
    rows[0][0] = XmNote {
        effect: 0x0D,
        effect_param: 0x25, // decimal 25
        ..Default::default()
    };
    let target = pattern_of_rows(vec![empty_row(); 64]);
    let module = make_module(
        vec![pattern_of_rows(rows), target],
        vec![test_instrument(true)],
    );
    let mut player = XmPlayer::new(module, 44100);
    player.play();

    // One full row at speed 6
    for _ in 0..6 {
        player.advance_tick();
    }
    assert_eq!(player.current_order, 1);
    assert_eq!(player.current_row, 25);
}

#[test]
fn test_pattern_loop_visits_rows_again() {
    // Row 0 sets the loop start, row 2 loops back twice: rows run
    // 0,1,2 three times before reaching row 3
    let mut rows = vec![empty_row(); 4];
    rows[0][0] = XmNote {
        effect: 0x0E,
        effect_param: 0x60,
        ..Default::default()
    };
    rows[2][0] = XmNote {
        effect: 0x0E,
        effect_param: 0x62,
        ..Default::default()
    };
    let module = make_module(vec![pattern_of_rows(rows)], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();
    player.speed = 1;

    let mut visited = Vec::new();
    for _ in 0..12 {
        player.advance_tick();
        visited.push(player.current_row);
    }
    // Rows recorded after each tick (post-advance)
    assert_eq!(visited[..10], [1, 2, 0, 1, 2, 0, 1, 2, 3, 0]);
}

#[test]
fn test_envelope_position_bug_uses_volume_sustain_bit() {
    let mut instr = test_instrument(true);
    instr.volume_envelope = Some(XmEnvelope {
        points: vec![(0, 64), (32, 0)],
        sustain_enabled: true,
        sustain_point: 0,
        ..Default::default()
    });
    instr.panning_envelope = Some(XmEnvelope {
        points: vec![(0, 32), (32, 32)],
        ..Default::default()
    });
    let note = XmNote {
        note: 49,
        instrument: 1,
        effect: 0x15, // Lxx
        effect_param: 9,
        ..Default::default()
    };
    let pattern = pattern_of_rows(vec![row_with(0, note)]);
    let module = make_module(vec![pattern], vec![instr]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();
    player.advance_tick();

    // The volume envelope's sustain bit is set, so BOTH positions moved
    // (envelope advancement adds its regular step on top)
    assert!(player.channels[0].vol_env_pos >= 9);
    assert!(player.channels[0].pan_env_pos >= 9);

    // Without the volume sustain bit the panning envelope stays put
    let mut instr2 = test_instrument(true);
    instr2.volume_envelope = Some(XmEnvelope {
        points: vec![(0, 64), (32, 0)],
        sustain_enabled: false,
        ..Default::default()
    });
    instr2.panning_envelope = Some(XmEnvelope {
        points: vec![(0, 32), (32, 32)],
        ..Default::default()
    });
    let note = XmNote {
        note: 49,
        instrument: 1,
        effect: 0x15,
        effect_param: 9,
        ..Default::default()
    };
    let pattern = pattern_of_rows(vec![row_with(0, note)]);
    let module = make_module(vec![pattern], vec![instr2]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();
    player.advance_tick();
    assert!(player.channels[0].vol_env_pos >= 9);
    assert!(player.channels[0].pan_env_pos < 9);
}

#[test]
fn test_keyoff_without_envelope_cuts_volume() {
    let note = XmNote {
        note: 49,
        instrument: 1,
        ..Default::default()
    };
    let off = XmNote {
        note: 97,
        ..Default::default()
    };
    let pattern = pattern_of_rows(vec![row_with(0, note), row_with(0, off)]);
    let module = make_module(vec![pattern], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();

    for _ in 0..6 {
        player.advance_tick();
    }
    assert_eq!(player.channels[0].volume, 64);
    player.advance_tick();
    assert!(player.channels[0].key_off);
    assert_eq!(player.channels[0].volume, 0);
}

#[test]
fn test_tone_porta_does_not_retrigger() {
    let first = XmNote {
        note: 49,
        instrument: 1,
        ..Default::default()
    };
    let glide = XmNote {
        note: 61,
        effect: 0x03,
        effect_param: 4,
        ..Default::default()
    };
    let pattern = pattern_of_rows(vec![row_with(0, first), row_with(0, glide)]);
    let module = make_module(vec![pattern], vec![test_instrument(true)]);
    let mut player = XmPlayer::new(module, 44100);
    player.play();

    player.advance_tick();
    let start_period = player.channels[0].period;
    for _ in 0..8 {
        player.advance_tick();
    }
    let ch = &player.channels[0];
    assert_eq!(ch.target_period, player.tables.note_to_period(61, 0));
    assert!(
        ch.period < start_period,
        "linear period must fall toward the higher note"
    );
    assert!(ch.period > ch.target_period, "glide is gradual");
}
