//! 对外模型目录：对外 id → 上游模型名、模式、可用凭证池。

use crate::token_pool::PoolKind;

pub const IMAGE_GENERATION_MODEL: &str = "grok-imagine-1.0";
pub const IMAGE_EDIT_MODEL: &str = "grok-imagine-1.0-edit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub upstream_model: &'static str,
    pub upstream_mode: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    /// 只能使用 super 池的凭证
    pub super_only: bool,
    pub is_heavy: bool,
    pub is_image: bool,
    pub is_video: bool,
}

impl ModelInfo {
    /// 选凭证时按顺序尝试的池：普通模型先 basic 后 super。
    pub fn pools(&self) -> &'static [PoolKind] {
        if self.super_only {
            &[PoolKind::Super]
        } else {
            &[PoolKind::Basic, PoolKind::Super]
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.upstream_mode.contains("THINKING") || self.upstream_mode == "MODEL_MODE_EXPERT"
    }
}

const fn chat(
    id: &'static str,
    upstream_model: &'static str,
    upstream_mode: &'static str,
    display_name: &'static str,
    description: &'static str,
) -> ModelInfo {
    ModelInfo {
        id,
        upstream_model,
        upstream_mode,
        display_name,
        description,
        super_only: false,
        is_heavy: false,
        is_image: false,
        is_video: false,
    }
}

static MODELS: &[ModelInfo] = &[
    chat("grok-3", "grok-3", "MODEL_MODE_GROK_3", "Grok 3", "Standard Grok 3 model"),
    chat(
        "grok-3-mini",
        "grok-3",
        "MODEL_MODE_GROK_3_MINI_THINKING",
        "Grok 3 Mini",
        "Grok 3 mini with thinking",
    ),
    chat(
        "grok-3-thinking",
        "grok-3",
        "MODEL_MODE_GROK_3_THINKING",
        "Grok 3 Thinking",
        "Grok 3 with reasoning",
    ),
    chat("grok-4", "grok-4", "MODEL_MODE_GROK_4", "Grok 4", "Standard Grok 4 model"),
    chat(
        "grok-4-mini",
        "grok-4-mini",
        "MODEL_MODE_GROK_4_MINI_THINKING",
        "Grok 4 Mini",
        "Grok 4 mini with thinking",
    ),
    chat(
        "grok-4-thinking",
        "grok-4",
        "MODEL_MODE_GROK_4_THINKING",
        "Grok 4 Thinking",
        "Grok 4 with reasoning",
    ),
    ModelInfo {
        super_only: true,
        is_heavy: true,
        ..chat(
            "grok-4-heavy",
            "grok-4",
            "MODEL_MODE_HEAVY",
            "Grok 4 Heavy",
            "Multi-agent Grok 4 (super accounts only)",
        )
    },
    chat(
        "grok-4.1-mini",
        "grok-4-1-thinking-1129",
        "MODEL_MODE_GROK_4_1_MINI_THINKING",
        "Grok 4.1 Mini",
        "Grok 4.1 mini with thinking",
    ),
    chat(
        "grok-4.1-fast",
        "grok-4-1-thinking-1129",
        "MODEL_MODE_FAST",
        "Grok 4.1 Fast",
        "Grok 4.1 fast responses",
    ),
    chat(
        "grok-4.1-expert",
        "grok-4-1-thinking-1129",
        "MODEL_MODE_EXPERT",
        "Grok 4.1 Expert",
        "Grok 4.1 expert mode",
    ),
    chat(
        "grok-4.1-thinking",
        "grok-4-1-thinking-1129",
        "MODEL_MODE_GROK_4_1_THINKING",
        "Grok 4.1 Thinking",
        "Grok 4.1 with reasoning",
    ),
    chat(
        "grok-4.20-beta",
        "grok-420",
        "MODEL_MODE_GROK_420",
        "Grok 4.20 Beta",
        "Grok 4.20 beta",
    ),
    ModelInfo {
        is_image: true,
        ..chat(
            IMAGE_GENERATION_MODEL,
            "grok-3",
            "MODEL_MODE_FAST",
            "Grok Imagine 1.0",
            "Image generation",
        )
    },
    ModelInfo {
        is_image: true,
        ..chat(
            IMAGE_EDIT_MODEL,
            "imagine-image-edit",
            "MODEL_MODE_FAST",
            "Grok Imagine 1.0 Edit",
            "Image editing",
        )
    },
    ModelInfo {
        is_video: true,
        ..chat(
            "grok-imagine-1.0-video",
            "grok-3",
            "MODEL_MODE_FAST",
            "Grok Imagine 1.0 Video",
            "Video generation",
        )
    },
];

pub fn list() -> &'static [ModelInfo] {
    MODELS
}

pub fn get(id: &str) -> Option<&'static ModelInfo> {
    let id = id.trim();
    MODELS.iter().find(|m| m.id == id)
}
