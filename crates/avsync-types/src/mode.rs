//! Sync modes, leg types and start policies.

use serde::{Deserialize, Serialize};

/// Which clock a session is slaved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Wall clock follows the video leg.
    VideoMaster,

    /// Wall clock follows the audio leg.
    AudioMaster,

    /// Wall clock is slaved to the program clock reference.
    PcrMaster,

    /// Live network source, paced by the stream itself.
    Iptv,

    /// No trustworthy timestamps: frame-by-frame output.
    FreeRun,

    /// Video paced against a caller-supplied monotonic tick time.
    VideoMono,
}

impl SyncMode {
    /// Live sources: PCR master and IPTV.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::PcrMaster | Self::Iptv)
    }

    /// Modes where a video timestamp jump is reported as a discontinuity.
    pub fn reports_video_discontinuity(&self) -> bool {
        self.is_live() || matches!(self, Self::VideoMaster)
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::VideoMaster => "vmaster",
            Self::AudioMaster => "amaster",
            Self::PcrMaster => "pcrmaster",
            Self::Iptv => "iptv",
            Self::FreeRun => "freerun",
            Self::VideoMono => "vmono",
        }
    }

    /// Parse the short log name back into a mode.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vmaster" => Some(Self::VideoMaster),
            "amaster" => Some(Self::AudioMaster),
            "pcrmaster" => Some(Self::PcrMaster),
            "iptv" => Some(Self::Iptv),
            "freerun" => Some(Self::FreeRun),
            "vmono" => Some(Self::VideoMono),
            _ => None,
        }
    }
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::VideoMaster
    }
}

/// The stream a session leg handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegType {
    Audio,
    Video,
    /// Program clock reference.
    Pcr,
}

impl LegType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Pcr => "pcr",
        }
    }
}

/// How the legs of a session agree on a starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPolicy {
    /// Not configured.
    None,

    /// Video starts first, audio joins.
    VideoFirst,

    /// Audio starts first, video joins.
    AudioFirst,

    /// Whichever leg is ready first starts the clock.
    Asap,

    /// Video waits until the clock has been started.
    Align,

    /// Show the first video frame early, then wait for the clock.
    VideoPeek,
}

impl StartPolicy {
    /// Policies handled in the session without involving the authority.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::None | Self::VideoPeek)
    }
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self::None
    }
}
