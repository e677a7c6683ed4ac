use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;
use crate::image::Image;

/// Aspect ratios the generation service accepts for `imageConfig.aspectRatio`.
pub const SUPPORTED_ASPECT_RATIOS: [(&str, u32, u32); 10] = [
    ("1:1", 1, 1),
    ("2:3", 2, 3),
    ("3:2", 3, 2),
    ("3:4", 3, 4),
    ("4:3", 4, 3),
    ("4:5", 4, 5),
    ("5:4", 5, 4),
    ("9:16", 9, 16),
    ("16:9", 16, 9),
    ("21:9", 21, 9),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionTier {
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
    #[serde(rename = "AUTO")]
    #[default]
    Auto,
}

impl ResolutionTier {
    /// Canonical long-edge size in pixels; `None` for `Auto`.
    pub fn long_edge(self) -> Option<u32> {
        match self {
            Self::OneK => Some(1024),
            Self::TwoK => Some(2048),
            Self::FourK => Some(4096),
            Self::Auto => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneK => "1K",
            Self::TwoK => "2K",
            Self::FourK => "4K",
            Self::Auto => "AUTO",
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionTier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1k" | "1024" => Ok(Self::OneK),
            "2k" | "2048" => Ok(Self::TwoK),
            "4k" | "4096" => Ok(Self::FourK),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "unknown resolution '{other}' (expected 1K, 2K, 4K or AUTO)"
            )),
        }
    }
}

/// Decides the output dimensions for a request.
///
/// Fixed tiers map the long edge to the tier size and keep the input aspect
/// ratio; without an input they are square. `Auto` echoes the input size.
pub fn resolve(
    requested: ResolutionTier,
    input: Option<(u32, u32)>,
) -> Result<(u32, u32), ConfigurationError> {
    if let Some((width, height)) = input {
        if width == 0 || height == 0 {
            return Err(ConfigurationError::DegenerateInput { width, height });
        }
    }

    let Some(long_edge) = requested.long_edge() else {
        return input.ok_or(ConfigurationError::AutoWithoutInput);
    };

    let Some((width, height)) = input else {
        return Ok((long_edge, long_edge));
    };

    if width >= height {
        Ok((long_edge, scale_short_edge(long_edge, height, width)))
    } else {
        Ok((scale_short_edge(long_edge, width, height), long_edge))
    }
}

pub fn resolve_for(
    requested: ResolutionTier,
    input: Option<&Image>,
) -> Result<(u32, u32), ConfigurationError> {
    resolve(requested, input.map(Image::dimensions))
}

fn scale_short_edge(long_edge: u32, short: u32, long: u32) -> u32 {
    let scaled = (long_edge as f64 * short as f64 / long as f64).round() as u32;
    scaled.max(1)
}

/// The `imageSize` hint sent alongside the request.
pub fn size_hint(width: u32, height: u32) -> ResolutionTier {
    let longest = width.max(height);
    if longest >= 4096 {
        ResolutionTier::FourK
    } else if longest >= 2048 {
        ResolutionTier::TwoK
    } else {
        ResolutionTier::OneK
    }
}

/// Nearest supported aspect ratio; degenerate sizes fall back to `1:1`.
pub fn closest_aspect_ratio(width: u32, height: u32) -> &'static str {
    if width == 0 || height == 0 {
        return "1:1";
    }
    let target = width as f64 / height as f64;
    let mut best_key = "1:1";
    let mut best_delta = f64::MAX;
    for (key, w, h) in SUPPORTED_ASPECT_RATIOS {
        let delta = (w as f64 / h as f64 - target).abs();
        if delta < best_delta {
            best_key = key;
            best_delta = delta;
        }
    }
    best_key
}

pub fn reduced_ratio(width: u32, height: u32) -> String {
    if width == 0 || height == 0 {
        return "1:1".to_string();
    }
    let divisor = gcd(width, height);
    format!("{}:{}", width / divisor, height / divisor)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let next = a % b;
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_matches_input_exactly() {
        assert_eq!(resolve(ResolutionTier::Auto, Some((1024, 768))), Ok((1024, 768)));
        assert_eq!(resolve(ResolutionTier::Auto, Some((333, 777))), Ok((333, 777)));
    }

    #[test]
    fn auto_without_input_is_a_configuration_error() {
        assert_eq!(
            resolve(ResolutionTier::Auto, None),
            Err(ConfigurationError::AutoWithoutInput)
        );
    }

    #[test]
    fn fixed_tiers_without_input_are_square() {
        assert_eq!(resolve(ResolutionTier::FourK, None), Ok((4096, 4096)));
        assert_eq!(resolve(ResolutionTier::TwoK, None), Ok((2048, 2048)));
        assert_eq!(resolve(ResolutionTier::OneK, None), Ok((1024, 1024)));
    }

    #[test]
    fn fixed_tiers_keep_input_aspect_on_the_long_edge() {
        assert_eq!(resolve(ResolutionTier::TwoK, Some((1920, 1080))), Ok((2048, 1152)));
        assert_eq!(resolve(ResolutionTier::OneK, Some((600, 1200))), Ok((512, 1024)));
        assert_eq!(resolve(ResolutionTier::FourK, Some((4096, 1))), Ok((4096, 1)));
        assert_eq!(resolve(ResolutionTier::OneK, Some((10_000, 1))), Ok((1024, 1)));
    }

    #[test]
    fn zero_sized_input_is_rejected() {
        assert_eq!(
            resolve(ResolutionTier::OneK, Some((0, 10))),
            Err(ConfigurationError::DegenerateInput {
                width: 0,
                height: 10
            })
        );
    }

    #[test]
    fn tier_parsing_accepts_labels_and_pixel_sizes() {
        assert_eq!("2k".parse::<ResolutionTier>(), Ok(ResolutionTier::TwoK));
        assert_eq!(" AUTO ".parse::<ResolutionTier>(), Ok(ResolutionTier::Auto));
        assert_eq!("4096".parse::<ResolutionTier>(), Ok(ResolutionTier::FourK));
        assert!("8k".parse::<ResolutionTier>().is_err());
        assert_eq!(ResolutionTier::OneK.to_string(), "1K");
    }

    #[test]
    fn size_hint_follows_long_edge() {
        assert_eq!(size_hint(1024, 768), ResolutionTier::OneK);
        assert_eq!(size_hint(1200, 2048), ResolutionTier::TwoK);
        assert_eq!(size_hint(4096, 2304), ResolutionTier::FourK);
    }

    #[test]
    fn aspect_ratio_snaps_to_supported_values() {
        assert_eq!(closest_aspect_ratio(1024, 768), "4:3");
        assert_eq!(closest_aspect_ratio(1920, 1080), "16:9");
        assert_eq!(closest_aspect_ratio(2560, 1080), "21:9");
        assert_eq!(closest_aspect_ratio(0, 10), "1:1");
        assert_eq!(reduced_ratio(1920, 1080), "16:9");
        assert_eq!(reduced_ratio(1000, 700), "10:7");
    }
}
