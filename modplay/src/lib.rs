//! modplay: a tracker module replayer
//!
//! Loads a memory-resident module in one of four legacy formats —
//! Impulse Tracker (.it), Scream Tracker 3 (.s3m), FastTracker II (.xm)
//! or the Protracker family (.mod) — and synthesises an interleaved
//! stereo PCM stream reproducing what the original trackers played.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ .it / .s3m   │   │ .xm / .mod   │      (MMCMP containers are
//! └──────┬───────┘   └──────┬───────┘       unwrapped first)
//!    modplay-it         modplay-xm
//!        │                  │
//!        ▼                  ▼
//!    ItPlayer            XmPlayer
//!  (64 channels,      (32 channels,
//!   256 NNA voices)    paired voices)
//!        └────────┬─────────┘
//!                 ▼
//!              Player
//!    (format dispatch, public API)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let data = std::fs::read("song.it").unwrap();
//! let mut player = modplay::Player::load_from_data(&data, 44100).unwrap();
//! player.play_song();
//! let mut buffer = vec![0i16; 2 * 1024];
//! player.generate_samples(&mut buffer); // 1024 stereo frames
//! ```
//!
//! The core does no I/O and owns no audio device: callers hand in the
//! file bytes and drain stereo buffers at their own pace.

mod it;
mod sample;
mod xm;

#[cfg(test)]
mod tests;

pub use it::ItPlayer;
pub use xm::XmPlayer;

use std::borrow::Cow;
use std::fmt;

/// Mix rate bounds for the XM/MOD engine
pub const XM_MIX_RATE_RANGE: (u32, u32) = (8000, 96000);

/// Mix rate bounds for the IT/S3M engine
pub const IT_MIX_RATE_RANGE: (u32, u32) = (8000, 64000);

/// Result of probing a byte buffer for a known module format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    /// No recognised signature
    Unknown,
    /// Impulse Tracker or Scream Tracker 3 (IT engine)
    ItS3m,
    /// FastTracker II or Protracker (XM engine)
    XmMod,
}

/// Errors from `Player::load_from_data`
#[derive(Debug)]
pub enum LoadError {
    /// No recognised format signature
    UnknownFormat,
    /// XM/MOD parse failure
    Xm(modplay_xm::XmError),
    /// IT/S3M parse failure
    It(modplay_it::ItError),
    /// MMCMP container decompression failure
    Mmcmp(modplay_mmcmp::MmcmpError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFormat => write!(f, "no recognised module format"),
            Self::Xm(e) => write!(f, "xm/mod load failed: {}", e),
            Self::It(e) => write!(f, "it/s3m load failed: {}", e),
            Self::Mmcmp(e) => write!(f, "mmcmp unwrap failed: {}", e),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::UnknownFormat => None,
            Self::Xm(e) => Some(e),
            Self::It(e) => Some(e),
            Self::Mmcmp(e) => Some(e),
        }
    }
}

impl From<modplay_xm::XmError> for LoadError {
    fn from(e: modplay_xm::XmError) -> Self {
        Self::Xm(e)
    }
}

impl From<modplay_it::ItError> for LoadError {
    fn from(e: modplay_it::ItError) -> Self {
        Self::It(e)
    }
}

impl From<modplay_mmcmp::MmcmpError> for LoadError {
    fn from(e: modplay_mmcmp::MmcmpError) -> Self {
        Self::Mmcmp(e)
    }
}

/// Probe a buffer for a known module format
///
/// Checks at most the first 1084 bytes: `IMPM` at 0 (IT), `SCRM` at 44
/// (S3M), the XM text magic at 0, or a recognised MOD signature at 1080.
/// An MMCMP container is unwrapped and the probe reports the inner
/// format.
pub fn detect(data: &[u8]) -> Detected {
    if modplay_mmcmp::is_mmcmp(data) {
        return match modplay_mmcmp::decompress(data) {
            Ok(inner) => detect_raw(&inner),
            Err(_) => Detected::Unknown,
        };
    }
    detect_raw(data)
}

fn detect_raw(data: &[u8]) -> Detected {
    if data.len() >= 4 && &data[0..4] == modplay_it::IT_MAGIC {
        return Detected::ItS3m;
    }
    if data.len() >= 48 && &data[44..48] == modplay_it::S3M_MAGIC {
        return Detected::ItS3m;
    }
    if data.len() >= 17 && &data[0..17] == modplay_xm::XM_MAGIC {
        return Detected::XmMod;
    }
    let sig_end = modplay_xm::MOD_SIGNATURE_OFFSET + 4;
    if data.len() >= sig_end
        && modplay_xm::signature_channels(&data[modplay_xm::MOD_SIGNATURE_OFFSET..sig_end])
            .is_some()
    {
        return Detected::XmMod;
    }
    Detected::Unknown
}

/// Playback engine behind a loaded player
#[derive(Debug)]
enum Backend {
    Xm(XmPlayer),
    It(ItPlayer),
}

/// An owned playback context for one loaded song
///
/// Bundles the song, both engines' state, the mixer buffer, the RNG and
/// the MIDI filter state behind one handle; every call routes to the
/// engine picked at load time. Dropping the player releases everything.
#[derive(Debug)]
pub struct Player {
    backend: Backend,
}

impl Player {
    /// Detect the format, unwrap MMCMP if present, and load the song
    ///
    /// `mix_rate` is clamped to [8000, 96000] for XM/MOD and
    /// [8000, 64000] for IT/S3M.
    pub fn load_from_data(data: &[u8], mix_rate: u32) -> Result<Self, LoadError> {
        let data: Cow<[u8]> = if modplay_mmcmp::is_mmcmp(data) {
            Cow::Owned(modplay_mmcmp::decompress(data)?)
        } else {
            Cow::Borrowed(data)
        };

        match detect_raw(&data) {
            Detected::ItS3m => {
                let rate = mix_rate.clamp(IT_MIX_RATE_RANGE.0, IT_MIX_RATE_RANGE.1);
                let module = if data.len() >= 4 && &data[0..4] == modplay_it::IT_MAGIC {
                    modplay_it::parse_it(&data)?
                } else {
                    modplay_it::parse_s3m(&data)?
                };
                log::debug!(
                    "loaded IT/S3M module '{}': {} channels, {} patterns",
                    module.name,
                    module.num_channels,
                    module.patterns.len()
                );
                Ok(Self {
                    backend: Backend::It(ItPlayer::new(module, rate)),
                })
            }
            Detected::XmMod => {
                let rate = mix_rate.clamp(XM_MIX_RATE_RANGE.0, XM_MIX_RATE_RANGE.1);
                let module = if data.len() >= 17 && &data[0..17] == modplay_xm::XM_MAGIC {
                    modplay_xm::parse_xm(&data)?
                } else {
                    modplay_xm::parse_mod(&data)?
                };
                log::debug!(
                    "loaded XM/MOD module '{}': {} channels, {} patterns",
                    module.name,
                    module.num_channels,
                    module.patterns.len()
                );
                Ok(Self {
                    backend: Backend::Xm(XmPlayer::new(module, rate)),
                })
            }
            Detected::Unknown => Err(LoadError::UnknownFormat),
        }
    }

    /// Which engine is playing this song
    pub fn kind(&self) -> Detected {
        match self.backend {
            Backend::Xm(_) => Detected::XmMod,
            Backend::It(_) => Detected::ItS3m,
        }
    }

    /// Reset the cursor to order 0, row 0, clear all voices, reseed the
    /// RNG, and start playback
    pub fn play_song(&mut self) {
        match &mut self.backend {
            Backend::Xm(p) => p.play(),
            Backend::It(p) => p.play(),
        }
    }

    /// Halt mixing; the pattern cursor is retained. Idempotent.
    pub fn stop(&mut self) {
        match &mut self.backend {
            Backend::Xm(p) => p.stop(),
            Backend::It(p) => p.stop(),
        }
    }

    /// True while the song is playing
    pub fn is_playing(&self) -> bool {
        match &self.backend {
            Backend::Xm(p) => p.is_playing(),
            Backend::It(p) => p.is_playing(),
        }
    }

    /// Fill `out` with interleaved stereo frames (`out.len() / 2` frames)
    ///
    /// Zero-filled when stopped.
    pub fn generate_samples(&mut self, out: &mut [i16]) {
        match &mut self.backend {
            Backend::Xm(p) => p.generate_samples(out),
            Backend::It(p) => p.generate_samples(out),
        }
    }

    /// Fill `out` with interleaved stereo floats in [-1, 1]
    pub fn generate_float_samples(&mut self, out: &mut [f32]) {
        match &mut self.backend {
            Backend::Xm(p) => p.generate_float_samples(out),
            Backend::It(p) => p.generate_float_samples(out),
        }
    }
}
