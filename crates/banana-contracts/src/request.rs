use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ValidationError, ValidationKind};
use crate::image::{Image, Mask};
use crate::resolution::{resolve_for, ResolutionTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    /// Base image is a mist/depth pass.
    DepthRender,
    /// Base image is a colour render used as a layout sketch.
    RegularRender,
    Inpaint,
    Integrate,
    FullEdit,
}

impl GenerationMode {
    pub const ALL: [GenerationMode; 5] = [
        Self::DepthRender,
        Self::RegularRender,
        Self::Inpaint,
        Self::Integrate,
        Self::FullEdit,
    ];

    pub fn requires_mask(self) -> bool {
        matches!(self, Self::Inpaint | Self::Integrate)
    }

    pub fn requires_reference(self) -> bool {
        matches!(self, Self::Integrate)
    }

    pub fn is_render(self) -> bool {
        matches!(self, Self::DepthRender | Self::RegularRender)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DepthRender => "depth_render",
            Self::RegularRender => "regular_render",
            Self::Inpaint => "inpaint",
            Self::Integrate => "integrate",
            Self::FullEdit => "full_edit",
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| format!("unknown generation mode '{}'", raw.trim()))
    }
}

/// A validated request. Only [`build`] / [`RequestBuilder`] construct one, so
/// the mode invariants hold for every value of this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    mode: GenerationMode,
    base_image: Image,
    mask: Option<Mask>,
    reference_image: Option<Image>,
    prompt: String,
    target_resolution: ResolutionTier,
    target: (u32, u32),
}

impl GenerationRequest {
    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    pub fn base_image(&self) -> &Image {
        &self.base_image
    }

    pub fn mask(&self) -> Option<&Mask> {
        self.mask.as_ref()
    }

    pub fn reference_image(&self) -> Option<&Image> {
        self.reference_image.as_ref()
    }

    /// The prompt exactly as supplied.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn target_resolution(&self) -> ResolutionTier {
        self.target_resolution
    }

    /// Output dimensions negotiated for this request.
    pub fn target(&self) -> (u32, u32) {
        self.target
    }
}

pub fn build(
    mode: GenerationMode,
    base_image: Option<Image>,
    mask: Option<Mask>,
    reference_image: Option<Image>,
    prompt: &str,
    resolution: ResolutionTier,
) -> Result<GenerationRequest, ValidationError> {
    let Some(base_image) = base_image else {
        return Err(ValidationError::new(
            ValidationKind::MissingBaseImage,
            "base_image",
            format!("{mode} needs a base image"),
        ));
    };

    if prompt.trim().is_empty() {
        return Err(ValidationError::new(
            ValidationKind::EmptyPrompt,
            "prompt",
            "prompt is empty",
        ));
    }

    match (&mask, mode.requires_mask()) {
        (None, true) => {
            return Err(ValidationError::new(
                ValidationKind::MissingMask,
                "mask",
                format!("{mode} requires a mask"),
            ));
        }
        (Some(_), false) => {
            return Err(ValidationError::new(
                ValidationKind::UnexpectedMask,
                "mask",
                format!("{mode} does not take a mask"),
            ));
        }
        _ => {}
    }

    if mode.requires_reference() && reference_image.is_none() {
        return Err(ValidationError::new(
            ValidationKind::MissingReference,
            "reference_image",
            format!("{mode} requires a reference image"),
        ));
    }

    if let Some(mask) = mask.as_ref() {
        if mask.dimensions() != base_image.dimensions() {
            let (mw, mh) = mask.dimensions();
            let (bw, bh) = base_image.dimensions();
            return Err(ValidationError::new(
                ValidationKind::DimensionMismatch,
                "mask",
                format!("mask is {mw}x{mh} but base image is {bw}x{bh}"),
            ));
        }
    }

    let target = resolve_for(resolution, Some(&base_image))?;

    Ok(GenerationRequest {
        mode,
        base_image,
        mask,
        reference_image,
        prompt: prompt.to_string(),
        target_resolution: resolution,
        target,
    })
}

/// Chained form of [`build`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    mode: GenerationMode,
    base_image: Option<Image>,
    mask: Option<Mask>,
    reference_image: Option<Image>,
    prompt: String,
    resolution: ResolutionTier,
}

impl RequestBuilder {
    pub fn new(mode: GenerationMode, prompt: impl Into<String>) -> Self {
        Self {
            mode,
            base_image: None,
            mask: None,
            reference_image: None,
            prompt: prompt.into(),
            resolution: ResolutionTier::Auto,
        }
    }

    pub fn base_image(mut self, image: Image) -> Self {
        self.base_image = Some(image);
        self
    }

    pub fn mask(mut self, mask: Mask) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn reference_image(mut self, image: Image) -> Self {
        self.reference_image = Some(image);
        self
    }

    pub fn resolution(mut self, resolution: ResolutionTier) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn build(self) -> Result<GenerationRequest, ValidationError> {
        build(
            self.mode,
            self.base_image,
            self.mask,
            self.reference_image,
            &self.prompt,
            self.resolution,
        )
    }
}
