//! 每 Key 每日额度：账本（原子条件自增）+ 请求类型到额度桶的映射。

pub mod enforce;
pub mod kind;
pub mod ledger;

pub use enforce::enforce_daily_quota;
pub use kind::{Bucket, QuotaKind};
pub use ledger::{BucketUpdate, DailyUsage, Ledger, local_day};
