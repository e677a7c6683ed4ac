//! Mode-specific instructions wrapped around the user's prompt, and the
//! order in which the images are attached. The numbering in the preambles
//! must follow [`image_order`].

use banana_contracts::request::{GenerationMode, GenerationRequest};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
    Base,
    Mask,
    Reference,
}

impl ImageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Mask => "mask",
            Self::Reference => "reference",
        }
    }
}

/// Renders put an optional style reference first so the service takes its
/// aspect cue from it; edits attach base, mask, reference.
pub fn image_order(request: &GenerationRequest) -> Vec<ImageRole> {
    let has_reference = request.reference_image().is_some();
    let mut order = Vec::with_capacity(3);
    if request.mode().is_render() {
        if has_reference {
            order.push(ImageRole::Reference);
        }
        order.push(ImageRole::Base);
        return order;
    }
    order.push(ImageRole::Base);
    if request.mask().is_some() {
        order.push(ImageRole::Mask);
    }
    if has_reference {
        order.push(ImageRole::Reference);
    }
    order
}

/// Text part sent to the service. With `frame` off the prompt goes out
/// verbatim.
pub fn framed_prompt(request: &GenerationRequest, frame: bool) -> String {
    if !frame {
        return request.prompt().to_string();
    }
    let preamble = preamble(request.mode(), request.reference_image().is_some());
    format!("{preamble}\n\nUser instructions: {}", request.prompt().trim())
}

fn preamble(mode: GenerationMode, has_reference: bool) -> &'static str {
    match (mode, has_reference) {
        (GenerationMode::DepthRender, false) => DEPTH_RENDER,
        (GenerationMode::DepthRender, true) => DEPTH_RENDER_WITH_STYLE,
        (GenerationMode::RegularRender, false) => REGULAR_RENDER,
        (GenerationMode::RegularRender, true) => REGULAR_RENDER_WITH_STYLE,
        (GenerationMode::Inpaint, false) => INPAINT,
        (GenerationMode::Inpaint, true) => INPAINT_WITH_STYLE,
        (GenerationMode::Integrate, _) => INTEGRATE,
        (GenerationMode::FullEdit, false) => FULL_EDIT,
        (GenerationMode::FullEdit, true) => FULL_EDIT_WITH_STYLE,
    }
}

const DEPTH_RENDER: &str = "\
The attached image is a DEPTH MAP of a 3D scene.
- Brightness encodes distance: white is nearest to the camera, black is farthest.
- Treat it as the scene's geometry and layout, not as its appearance.

Task:
1. Recover the scene structure from the depth map.
2. Produce a photorealistic render with that exact composition and camera.
3. Choose fitting materials, colours and lighting.";

const DEPTH_RENDER_WITH_STYLE: &str = "\
Two images are attached.

IMAGE 1 is a STYLE REFERENCE.
- Take from it: colour palette, materials, surface detail, lighting mood.
- Do not take: composition, object placement, camera angle.

IMAGE 2 is a DEPTH MAP.
- White is nearest to the camera, black is farthest.
- It defines composition, object placement and 3D structure.

Task:
1. Recover the scene structure from IMAGE 2.
2. Dress that structure in the look of IMAGE 1.
3. Produce a photorealistic render matching the aspect ratio of IMAGE 1.";

const REGULAR_RENDER: &str = "\
The attached image is a rough 3D render used only as a layout sketch.
- Keep the composition, camera and object positions.
- Its materials, colours and lighting are placeholders.

Task:
1. Replace every material with a photorealistic equivalent.
2. Rebuild the lighting with believable sources, soft shadows and bounce light.
3. Grade the colours into a coherent palette and add atmospheric depth.
4. Add natural surface imperfections. Aim for high-end product photography.";

const REGULAR_RENDER_WITH_STYLE: &str = "\
Two images are attached.

IMAGE 1 is the STYLE REFERENCE and the main visual guide.
- Match its lighting, materials, colour palette, texture quality and mood.

IMAGE 2 is a rough 3D render used only for composition.
- Keep its object positions and camera.
- Ignore its colours, materials, lighting and render quality.

Task: rebuild IMAGE 2's layout so that it looks like it belongs in IMAGE 1.
Transform boldly rather than touching up IMAGE 2.";

const INPAINT: &str = "\
Two images are attached.

IMAGE 1 is the picture to edit.
IMAGE 2 is a black and white MASK of the same size.
- White pixels mark the region to regenerate.
- Black pixels must stay identical to IMAGE 1.

Task: apply the instructions inside the white region only, blending the
edit seamlessly with the surrounding lighting, perspective and grain.";

const INPAINT_WITH_STYLE: &str = "\
Three images are attached.

IMAGE 1 is the picture to edit.
IMAGE 2 is a black and white MASK of the same size.
- White pixels mark the region to regenerate.
- Black pixels must stay identical to IMAGE 1.
IMAGE 3 is a STYLE REFERENCE for the regenerated region.

Task: apply the instructions inside the white region only, in the style of
IMAGE 3, blending seamlessly with the rest of IMAGE 1.";

const INTEGRATE: &str = "\
Three images are attached.

IMAGE 1 is the scene.
IMAGE 2 is a black and white MASK of the same size marking where an object goes.
- White pixels mark the placement region.
- Black pixels must stay identical to IMAGE 1.
IMAGE 3 shows the OBJECT to integrate.

Task: place the object from IMAGE 3 into the white region of IMAGE 1.
Match the scene's perspective, scale, lighting direction, shadows and colour
temperature so the object looks photographed in place.";

const FULL_EDIT: &str = "\
The attached image is the picture to edit.

Task: apply the instructions to the whole image while keeping its
composition and camera unless told otherwise.";

const FULL_EDIT_WITH_STYLE: &str = "\
Two images are attached.

IMAGE 1 is the picture to edit.
IMAGE 2 is a STYLE REFERENCE.

Task: apply the instructions to the whole of IMAGE 1, borrowing the look of
IMAGE 2, while keeping IMAGE 1's composition and camera unless told
otherwise.";
