use serde::Serialize;

/// Named bundle of prompt fragments and sampling parameters controlling the
/// visual style of generated images.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StylePreset {
    pub name: &'static str,
    pub positive_fragment: &'static str,
    pub negative_fragment: &'static str,
    pub step_count: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
}

/// Model repo the service starts with; any model following the same diffusers
/// layout can be switched in at runtime.
pub const DEFAULT_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";

// All presets stay at 512x512 so a single loaded model serves every style on
// memory-constrained hardware.
const PRESETS: &[StylePreset] = &[
    StylePreset {
        name: "cartoon",
        positive_fragment:
            "cartoon style, clean lines, bright colors, comic book art, illustration, animated style",
        negative_fragment:
            "realistic, photograph, photorealistic, blurry, low quality, distorted, nsfw, dark, scary",
        step_count: 20,
        guidance_scale: 7.0,
        width: 512,
        height: 512,
    },
    StylePreset {
        name: "anime",
        positive_fragment:
            "anime style, cel shaded, detailed character design, manga art, japanese animation",
        negative_fragment:
            "realistic, photograph, 3d render, blurry, low quality, distorted, nsfw, western style",
        step_count: 25,
        guidance_scale: 8.0,
        width: 512,
        height: 512,
    },
    StylePreset {
        name: "storybook",
        positive_fragment:
            "children's book illustration, watercolor style, soft colors, storybook art, whimsical, friendly",
        negative_fragment:
            "dark, scary, realistic, photograph, blurry, low quality, nsfw, violent",
        step_count: 30,
        guidance_scale: 7.5,
        width: 512,
        height: 512,
    },
    StylePreset {
        name: "realistic",
        positive_fragment:
            "photorealistic, cinematic lighting, professional photography, detailed, high quality",
        negative_fragment:
            "cartoon, anime, artistic, painting, blurry, low quality, distorted, nsfw",
        step_count: 35,
        guidance_scale: 6.0,
        width: 512,
        height: 512,
    },
];

/// Fixed style table built at startup. Lookup is total: unknown names resolve
/// to the default preset, so callers may pass arbitrary style tags without
/// pre-validating them.
#[derive(Debug, Clone, Default)]
pub struct StyleRegistry;

impl StyleRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a style tag, falling back to the default preset for unknown
    /// names. Never fails.
    pub fn get(&self, name: &str) -> &'static StylePreset {
        PRESETS
            .iter()
            .find(|preset| preset.name == name)
            .unwrap_or(self.default_preset())
    }

    pub fn default_preset(&self) -> &'static StylePreset {
        &PRESETS[0]
    }

    /// Style tags in declaration order, for listing endpoints.
    pub fn names(&self) -> Vec<&'static str> {
        PRESETS.iter().map(|preset| preset.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_styles_resolve() {
        let registry = StyleRegistry::new();
        assert_eq!(registry.get("storybook").step_count, 30);
        assert_eq!(registry.get("anime").guidance_scale, 8.0);
    }

    #[test]
    fn unknown_style_falls_back_to_default() {
        let registry = StyleRegistry::new();
        let preset = registry.get("vaporwave");
        assert_eq!(preset, registry.default_preset());
        assert_eq!(preset.name, "cartoon");
    }

    #[test]
    fn empty_style_falls_back_to_default() {
        let registry = StyleRegistry::new();
        assert_eq!(registry.get(""), registry.default_preset());
    }

    #[test]
    fn presets_are_well_formed() {
        for preset in PRESETS {
            assert!(preset.step_count > 0, "{}", preset.name);
            assert!(preset.guidance_scale > 0.0, "{}", preset.name);
            assert!(preset.width > 0 && preset.height > 0, "{}", preset.name);
            assert!(!preset.positive_fragment.is_empty(), "{}", preset.name);
        }
    }

    #[test]
    fn names_lists_every_preset() {
        let registry = StyleRegistry::new();
        assert_eq!(
            registry.names(),
            vec!["cartoon", "anime", "storybook", "realistic"]
        );
    }
}
