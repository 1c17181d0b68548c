//! End-to-end scenarios through the public API
//!
//! Each scenario builds a real module file in memory, loads it through
//! format detection, and checks the rendered PCM or the resulting
//! engine state.

use super::{detect, Backend, Detected, Player};

// =============================================================================
// File builders
// =============================================================================

/// Build a 31-sample MOD: 4 channels, one looped sample, given cells
fn build_mod(cells: &[(usize, usize, [u8; 4])], pcm: &[i8], orders: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0u8; 20]); // title

    for i in 0..31 {
        let mut hdr = [0u8; 30];
        if i == 0 {
            hdr[..4].copy_from_slice(b"loop");
            hdr[22..24].copy_from_slice(&((pcm.len() as u16 / 2).to_be_bytes()));
            hdr[24] = 0; // finetune
            hdr[25] = 64; // volume
            hdr[26..28].copy_from_slice(&0u16.to_be_bytes());
            hdr[28..30].copy_from_slice(&((pcm.len() as u16 / 2).to_be_bytes()));
        }
        out.extend_from_slice(&hdr);
    }

    out.push(orders.len() as u8);
    out.push(127); // restart filler
    let mut order_table = [0u8; 128];
    order_table[..orders.len()].copy_from_slice(orders);
    out.extend_from_slice(&order_table);
    out.extend_from_slice(b"M.K.");

    let num_patterns = orders.iter().copied().max().unwrap_or(0) as usize + 1;
    for pattern in 0..num_patterns {
        for row in 0..64 {
            for ch in 0..4 {
                let cell = cells
                    .iter()
                    .find(|&&(r, c, _)| pattern == 0 && r == row && c == ch)
                    .map(|&(_, _, bytes)| bytes)
                    .unwrap_or([0; 4]);
                out.extend_from_slice(&cell);
            }
        }
    }

    for &s in pcm {
        out.push(s as u8);
    }
    out
}

/// Build a minimal S3M: 4 PCM channels, one sample, one pattern
fn build_s3m(row0: &[(usize, u8, u8, u8, u8)], pcm: &[i8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0u8; 28]); // name
    out.push(0x1A);
    out.push(16);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&2u16.to_le_bytes()); // orders
    out.extend_from_slice(&1u16.to_le_bytes()); // instruments
    out.extend_from_slice(&1u16.to_le_bytes()); // patterns
    out.extend_from_slice(&0u16.to_le_bytes()); // flags
    out.extend_from_slice(&0x1320u16.to_le_bytes()); // cwt
    out.extend_from_slice(&2u16.to_le_bytes()); // unsigned samples
    out.extend_from_slice(b"SCRM");
    out.push(64); // global volume
    out.push(6); // speed
    out.push(125); // tempo
    out.push(0xB0); // master volume, stereo
    out.push(0);
    out.push(0); // no pan table
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&0u16.to_le_bytes()); // special

    let mut settings = [0xFFu8; 32];
    settings[0] = 0;
    settings[1] = 1;
    settings[2] = 8;
    settings[3] = 9;
    out.extend_from_slice(&settings);
    out.extend_from_slice(&[0, 255]); // orders

    let header_end = out.len() + 4;
    let inst_pos = (header_end + 15) & !15;
    let pat_pos = (inst_pos + 80 + pcm.len() + 15) & !15;
    out.extend_from_slice(&((inst_pos / 16) as u16).to_le_bytes());
    out.extend_from_slice(&((pat_pos / 16) as u16).to_le_bytes());
    out.resize(inst_pos, 0);

    // Sample header
    let data_pos = inst_pos + 80;
    out.push(1);
    out.extend_from_slice(&[0u8; 12]);
    let memseg = (data_pos / 16) as u32;
    out.push((memseg >> 16) as u8);
    out.extend_from_slice(&((memseg & 0xFFFF) as u16).to_le_bytes());
    out.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(pcm.len() as u32).to_le_bytes()); // loop end
    out.push(64);
    out.push(0);
    out.push(0);
    out.push(1); // looped
    out.extend_from_slice(&8363u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&[0u8; 28]);
    out.extend_from_slice(b"SCRS");

    for &s in pcm {
        out.push((s as u8) ^ 0x80);
    }

    out.resize(pat_pos, 0);
    let mut packed = Vec::new();
    for &(ch, note, instr, cmd, info) in row0 {
        let mut what = ch as u8 | 0x20;
        if cmd != 0 {
            what |= 0x80;
        }
        packed.push(what);
        packed.push(note);
        packed.push(instr);
        if cmd != 0 {
            packed.push(cmd);
            packed.push(info);
        }
    }
    packed.push(0);
    for _ in 1..64 {
        packed.push(0);
    }
    out.extend_from_slice(&((packed.len() + 2) as u16).to_le_bytes());
    out.extend_from_slice(&packed);
    out
}

/// Wrap a payload in an MMCMP container using stored (uncompressed) blocks
fn wrap_mmcmp(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"ziRCONia");
    out.extend_from_slice(&14u16.to_le_bytes());
    out.extend_from_slice(&0x1310u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // one block
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&24u32.to_le_bytes()); // block table
    out.push(0);
    out.push(0);
    let block_pos = out.len() as u32 + 4;
    out.extend_from_slice(&block_pos.to_le_bytes());

    // Stored block, one sub-block covering the whole file
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // sub-blocks
    out.extend_from_slice(&0u16.to_le_bytes()); // flags: stored
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // unpk_pos
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn square_pcm(len: usize) -> Vec<i8> {
    (0..len).map(|i| if i % 8 < 4 { 100 } else { -100 }).collect()
}

fn rms(frames: &[i16]) -> f64 {
    let sum: f64 = frames.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / frames.len() as f64).sqrt()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_mod_volume_slide_to_silence() {
    // C-4 + A08 on row 0, the slide repeated down the pattern: audio
    // starts loud, falls monotonically, and is gone long before the
    // second half of the render
    let mut cells = vec![(0usize, 0usize, [0x01, 0xAC, 0x1A, 0x08])];
    for row in 1..8 {
        cells.push((row, 0, [0x00, 0x00, 0x0A, 0x08]));
    }
    let file = build_mod(&cells, &square_pcm(32), &[0, 0]);

    let mut player = Player::load_from_data(&file, 22050).unwrap();
    assert_eq!(player.kind(), Detected::XmMod);
    player.play_song();

    let mut out = vec![0i16; 22050 * 2];
    player.generate_samples(&mut out);

    // Early output carries the note
    assert!(out[..4800].iter().any(|&s| s != 0));

    // RMS falls chunk over chunk across the first row
    let chunks: Vec<f64> = (0..5)
        .map(|i| rms(&out[i * 882..(i + 1) * 882]))
        .collect();
    for pair in chunks.windows(2) {
        assert!(
            pair[1] <= pair[0] + 1.0,
            "RMS must not grow during the slide: {:?}",
            chunks
        );
    }
    assert!(chunks[4] < chunks[0], "slide must reduce level: {:?}", chunks);

    // Silence once the slide has run out
    assert!(
        out[17000 * 2..].iter().all(|&s| s == 0),
        "tail must be silent"
    );
}

#[test]
fn test_s3m_speed_effect_translates() {
    // An S3M cell with A08 must arrive in the IT engine as set-speed 8
    let file = build_s3m(&[(0, 0x40, 1, 1, 8)], &square_pcm(32));
    assert_eq!(detect(&file), Detected::ItS3m);

    let mut player = Player::load_from_data(&file, 44100).unwrap();
    player.play_song();
    let mut out = vec![0i16; 1024];
    player.generate_samples(&mut out);

    match &player.backend {
        Backend::It(p) => assert_eq!(p.speed, 8),
        _ => panic!("expected the IT engine"),
    }
}

#[test]
fn test_mmcmp_wrapped_module_plays_identically() {
    let mut cells = vec![(0usize, 0usize, [0x01, 0xAC, 0x00, 0x00])];
    cells.push((4, 0, [0x00, 0xE3, 0x00, 0x00])); // D-4 later in the pattern
    let plain = build_mod(&cells, &square_pcm(64), &[0]);
    let wrapped = wrap_mmcmp(&plain);

    assert_eq!(detect(&plain), Detected::XmMod);
    assert_eq!(detect(&wrapped), Detected::XmMod);

    let mut a = Player::load_from_data(&plain, 44100).unwrap();
    let mut b = Player::load_from_data(&wrapped, 44100).unwrap();
    a.play_song();
    b.play_song();

    let mut out_a = vec![0i16; 8192];
    let mut out_b = vec![0i16; 8192];
    a.generate_samples(&mut out_a);
    b.generate_samples(&mut out_b);
    assert_eq!(out_a, out_b, "wrapped module must render bit-identically");
}

// =============================================================================
// API properties
// =============================================================================

#[test]
fn test_detect_load_roundtrip() {
    // Valid files: detect() agrees with load success
    let module = build_mod(&[(0, 0, [0x01, 0xAC, 0x00, 0x00])], &square_pcm(16), &[0]);
    assert_ne!(detect(&module), Detected::Unknown);
    assert!(Player::load_from_data(&module, 44100).is_ok());

    // Garbage: detect() says unknown and load fails
    let garbage: Vec<u8> = (0..2048).map(|i| (i * 97) as u8).collect();
    assert_eq!(detect(&garbage), Detected::Unknown);
    assert!(Player::load_from_data(&garbage, 44100).is_err());

    assert_eq!(detect(&[]), Detected::Unknown);
    assert!(Player::load_from_data(&[], 44100).is_err());
}

#[test]
fn test_generate_exact_frame_counts() {
    let module = build_mod(&[(0, 0, [0x01, 0xAC, 0x00, 0x00])], &square_pcm(32), &[0]);
    let mut player = Player::load_from_data(&module, 48000).unwrap();
    player.play_song();

    for &frames in &[0usize, 1, 13, 441, 4096] {
        let mut out = vec![777i16; frames * 2];
        player.generate_samples(&mut out);
        assert_eq!(out.len(), frames * 2);
    }
}

#[test]
fn test_output_clamped() {
    let module = build_mod(
        &[
            (0, 0, [0x01, 0xAC, 0x00, 0x00]),
            (0, 1, [0x01, 0xAC, 0x00, 0x00]),
            (0, 2, [0x01, 0xAC, 0x00, 0x00]),
            (0, 3, [0x01, 0xAC, 0x00, 0x00]),
        ],
        &square_pcm(32),
        &[0],
    );
    let mut player = Player::load_from_data(&module, 44100).unwrap();
    player.play_song();
    let mut out = vec![0i16; 8192];
    player.generate_samples(&mut out);
    // i16 storage makes the clamp implicit; the float path must stay
    // normalised as well
    player.play_song();
    let mut fout = vec![0f32; 8192];
    player.generate_float_samples(&mut fout);
    assert!(fout.iter().all(|&s| (-1.0..=1.0).contains(&s)));
}

#[test]
fn test_stop_idempotent_through_api() {
    let module = build_mod(&[(0, 0, [0x01, 0xAC, 0x00, 0x00])], &square_pcm(32), &[0]);
    let mut player = Player::load_from_data(&module, 44100).unwrap();
    player.play_song();
    assert!(player.is_playing());
    player.stop();
    player.stop();
    assert!(!player.is_playing());

    let mut out = vec![9i16; 512];
    player.generate_samples(&mut out);
    assert!(out.iter().all(|&s| s == 0));

    // Restarting after stop works
    player.play_song();
    assert!(player.is_playing());
}

#[test]
fn test_mix_rate_clamping() {
    let module = build_mod(&[(0, 0, [0x01, 0xAC, 0x00, 0x00])], &square_pcm(32), &[0]);
    // Out-of-range rates are clamped rather than rejected
    assert!(Player::load_from_data(&module, 1).is_ok());
    assert!(Player::load_from_data(&module, 1_000_000).is_ok());
}
