//! 轻量随机数：线程本地 xorshift64*，种子取自 uuid v4，不额外引入 rand。

use std::cell::Cell;

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(seed());
}

fn seed() -> u64 {
    let u = uuid::Uuid::new_v4().as_u128();
    let s = (u as u64) ^ ((u >> 64) as u64);
    // xorshift 零种子会退化
    if s == 0 { 0x9E37_79B9_7F4A_7C15 } else { s }
}

pub fn next_u64() -> u64 {
    RNG_STATE.with(|state| {
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
}

/// [0, upper) 内的随机下标；upper <= 1 时恒为 0。
pub fn random_usize(upper: usize) -> usize {
    if upper <= 1 {
        return 0;
    }
    (next_u64() % upper as u64) as usize
}

/// 不放回地随机取 k 个元素（k 超过长度时取全部，顺序随机）。
pub fn sample<T: Clone>(items: &[T], k: usize) -> Vec<T> {
    let mut pool: Vec<T> = items.to_vec();
    let k = k.min(pool.len());
    // 部分 Fisher-Yates
    for i in 0..k {
        let j = i + random_usize(pool.len() - i);
        pool.swap(i, j);
    }
    pool.truncate(k);
    pool
}
