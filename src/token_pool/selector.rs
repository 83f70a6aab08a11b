//! 候选凭证的挑选策略。候选集已过滤掉冷却中与本请求已用过的凭证。

use super::types::TokenRecord;
use crate::util::random::random_usize;
use std::sync::Arc;

pub trait SelectionPolicy: Send + Sync + std::fmt::Debug {
    /// 返回被选中候选的下标；候选为空时返回 None。
    fn pick(&self, candidates: &[TokenRecord]) -> Option<usize>;
}

/// 默认策略：失败次数最少者优先，相同则选最久未使用的。
#[derive(Debug, Default, Clone, Copy)]
pub struct FewestFailuresThenLru;

impl SelectionPolicy for FewestFailuresThenLru {
    fn pick(&self, candidates: &[TokenRecord]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.failed_count, t.last_used_at))
            .map(|(i, _)| i)
    }
}

/// Power of Two Choices：随机抽两个，取更健康的一个。
///
/// 高并发下比全局最优更不容易让所有请求挤到同一个凭证上。
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerOfTwoChoices;

impl SelectionPolicy for PowerOfTwoChoices {
    fn pick(&self, candidates: &[TokenRecord]) -> Option<usize> {
        match candidates.len() {
            0 => None,
            1 => Some(0),
            n => {
                let (a, b) = random_pair_distinct(n);
                let key = |i: usize| (candidates[i].failed_count, candidates[i].last_used_at);
                Some(if key(a) <= key(b) { a } else { b })
            }
        }
    }
}

fn random_pair_distinct(n: usize) -> (usize, usize) {
    // n >= 2
    let i1 = random_usize(n);
    let j = random_usize(n - 1);
    let i2 = if j >= i1 { j + 1 } else { j };
    (i1, i2)
}

/// TOKEN_SELECTION 配置项：`p2c` / `power_of_two` 选随机两选一，其它取默认策略。
pub fn policy_from_name(name: &str) -> Arc<dyn SelectionPolicy> {
    match name.trim().to_lowercase().as_str() {
        "p2c" | "power_of_two" | "power_of_two_choices" => Arc::new(PowerOfTwoChoices),
        _ => Arc::new(FewestFailuresThenLru),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_pool::PoolKind;

    fn rec(token: &str, failed: i64, used: i64) -> TokenRecord {
        TokenRecord {
            token: token.to_string(),
            pool: PoolKind::Basic,
            failed_count: failed,
            last_fail_reason: String::new(),
            last_fail_at: 0,
            cooldown_until: 0,
            last_used_at: used,
        }
    }

    #[test]
    fn fewest_failures_then_lru() {
        let p = FewestFailuresThenLru;
        let c = vec![rec("a", 2, 1), rec("b", 0, 50), rec("c", 0, 10)];
        assert_eq!(p.pick(&c), Some(2));
        assert_eq!(p.pick(&[]), None);
    }

    #[test]
    fn p2c_never_picks_the_worse_of_two() {
        let p = PowerOfTwoChoices;
        let c = vec![rec("good", 0, 0), rec("bad", 9, 0)];
        for _ in 0..100 {
            assert_eq!(p.pick(&c), Some(0));
        }
        assert_eq!(p.pick(&c[..1]), Some(0));
    }

    #[test]
    fn random_pair_is_distinct() {
        for _ in 0..200 {
            let (a, b) = random_pair_distinct(3);
            assert_ne!(a, b);
            assert!(a < 3 && b < 3);
        }
    }
}
