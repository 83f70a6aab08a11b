use crate::api_keys::ApiKey;
use crate::util::model::ModelInfo;

/// 额度桶；每个桶对应 daily_usage 表的一个计数列与 api_keys 表的一个上限列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Chat,
    Heavy,
    Image,
    Video,
}

impl Bucket {
    pub const UNLIMITED: i64 = -1;

    pub fn used_column(self) -> &'static str {
        match self {
            Bucket::Chat => "chat_used",
            Bucket::Heavy => "heavy_used",
            Bucket::Image => "image_used",
            Bucket::Video => "video_used",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Bucket::Chat => "chat",
            Bucket::Heavy => "heavy",
            Bucket::Image => "image",
            Bucket::Video => "video",
        }
    }

    pub fn limit_of(self, key: &ApiKey) -> i64 {
        match self {
            Bucket::Chat => key.chat_limit,
            Bucket::Heavy => key.heavy_limit,
            Bucket::Image => key.image_limit,
            Bucket::Video => key.video_limit,
        }
    }
}

/// 一次入站请求的计费类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Chat,
    /// 同时消耗 heavy 与 chat 两个桶
    Heavy,
    Image { count: i64 },
    Video,
}

/// 聊天接口调用图片模型时，上游一次固定返回两张。
const CHAT_IMAGE_BATCH: i64 = 2;

impl QuotaKind {
    /// `image_count` 为图片接口的 n；聊天接口传 None。
    pub fn classify(model: &ModelInfo, image_count: Option<i64>) -> Self {
        if model.is_heavy {
            QuotaKind::Heavy
        } else if model.is_video {
            QuotaKind::Video
        } else if model.is_image {
            let count = image_count.filter(|n| *n > 0).unwrap_or(CHAT_IMAGE_BATCH);
            QuotaKind::Image {
                count: count.max(1),
            }
        } else {
            QuotaKind::Chat
        }
    }

    pub fn buckets(self) -> Vec<(Bucket, i64)> {
        match self {
            QuotaKind::Chat => vec![(Bucket::Chat, 1)],
            QuotaKind::Heavy => vec![(Bucket::Heavy, 1), (Bucket::Chat, 1)],
            QuotaKind::Image { count } => vec![(Bucket::Image, count)],
            QuotaKind::Video => vec![(Bucket::Video, 1)],
        }
    }

    /// 超额时对外报告的桶名，例如 "heavy/chat"。
    pub fn label(self) -> String {
        self.buckets()
            .iter()
            .map(|(b, _)| b.name())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::model;

    #[test]
    fn classify_models() {
        let heavy = model::get("grok-4-heavy").unwrap();
        assert_eq!(QuotaKind::classify(heavy, None), QuotaKind::Heavy);
        assert_eq!(QuotaKind::Heavy.label(), "heavy/chat");

        let video = model::get("grok-imagine-1.0-video").unwrap();
        assert_eq!(QuotaKind::classify(video, None), QuotaKind::Video);

        let image = model::get("grok-imagine-1.0").unwrap();
        assert_eq!(
            QuotaKind::classify(image, None),
            QuotaKind::Image { count: 2 }
        );
        assert_eq!(
            QuotaKind::classify(image, Some(5)),
            QuotaKind::Image { count: 5 }
        );
        assert_eq!(
            QuotaKind::classify(image, Some(0)),
            QuotaKind::Image { count: 2 }
        );

        let chat = model::get("grok-4.1-fast").unwrap();
        assert_eq!(QuotaKind::classify(chat, None), QuotaKind::Chat);
        assert_eq!(QuotaKind::Chat.label(), "chat");
    }
}
