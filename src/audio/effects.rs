use serde::{Deserialize, Serialize};

/// Una banda del ecualizador (0..=14), gain en -0.25..=1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub band: u8,
    pub gain: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Karaoke {
    pub level: f32,
    pub mono_level: f32,
    pub filter_band: f32,
    pub filter_width: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timescale {
    pub speed: f32,
    pub pitch: f32,
    pub rate: f32,
}

impl Default for Timescale {
    fn default() -> Self {
        Self {
            speed: 1.0,
            pitch: 1.0,
            rate: 1.0,
        }
    }
}

/// Shared shape of the tremolo and vibrato filters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    pub frequency: f32,
    pub depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rotation {
    pub rotation_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distortion {
    pub sin_offset: f32,
    pub sin_scale: f32,
    pub cos_offset: f32,
    pub cos_scale: f32,
    pub tan_offset: f32,
    pub tan_scale: f32,
    pub offset: f32,
    pub scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMix {
    pub left_to_left: f32,
    pub left_to_right: f32,
    pub right_to_left: f32,
    pub right_to_right: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LowPass {
    pub smoothing: f32,
}

/// Filtros de audio aplicados por el nodo.
///
/// Serialized as the `filters` object of a player update; unset filters are
/// omitted so the node keeps its defaults for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub equalizer: Vec<Band>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Karaoke>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Timescale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Oscillation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<Oscillation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Distortion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_mix: Option<ChannelMix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<LowPass>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        *self == Filters::default()
    }

    pub fn with_timescale(mut self, timescale: Timescale) -> Self {
        self.timescale = Some(timescale);
        self
    }

    pub fn with_rotation(mut self, rotation_hz: f32) -> Self {
        self.rotation = Some(Rotation { rotation_hz });
        self
    }

    pub fn with_equalizer(mut self, bands: Vec<Band>) -> Self {
        self.equalizer = bands;
        self
    }

    pub fn with_karaoke(mut self, karaoke: Karaoke) -> Self {
        self.karaoke = Some(karaoke);
        self
    }

    /// Faster and higher pitched.
    pub fn nightcore() -> Self {
        Self::default().with_timescale(Timescale {
            speed: 1.1,
            pitch: 1.125,
            rate: 1.05,
        })
    }

    pub fn slow_motion() -> Self {
        Self::default().with_timescale(Timescale {
            speed: 0.5,
            pitch: 1.0,
            rate: 0.8,
        })
    }

    /// Audio rotating around the listener ("8D").
    pub fn eight_d() -> Self {
        Self::default().with_rotation(0.2)
    }
}
