//! Triangle discovery over the tradable pair universe.
//!
//! A triangle is three pairs connecting exactly three coins. Its key is the three coin symbols
//! sorted and concatenated, so the same cycle found through different pair orderings collapses
//! to one entry. The orientation kept is the one produced by the first ordered triple in input
//! order, i.e. indices `i < j < k`.

use crate::error::ArbError;
use crate::market::{Coin, CoinPair};
use itertools::Itertools;
use log::{debug, info};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triangle {
    pub pair_ab: CoinPair,
    pub pair_bc: CoinPair,
    pub pair_ac: CoinPair,
    pub coin_a: Coin,
    pub coin_b: Coin,
    pub coin_c: Coin,
    pub key: String,
}

impl Triangle {
    /// The cycle A -> B -> C -> A as (pair, coin given up) per leg.
    pub fn legs(&self) -> [(&CoinPair, &Coin); 3] {
        [
            (&self.pair_ab, &self.coin_a),
            (&self.pair_bc, &self.coin_b),
            (&self.pair_ac, &self.coin_c),
        ]
    }

    pub fn coins(&self) -> [&Coin; 3] {
        [&self.coin_a, &self.coin_b, &self.coin_c]
    }
}

impl fmt::Display for Triangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}->{}->{}: {} -> {} -> {}]",
            self.key,
            self.coin_a,
            self.coin_b,
            self.coin_c,
            self.pair_ab.symbol,
            self.pair_bc.symbol,
            self.pair_ac.symbol
        )
    }
}

fn coin_set<'a>(pairs: &[&'a CoinPair]) -> HashSet<&'a Coin> {
    pairs
        .iter()
        .flat_map(|p| [&p.base, &p.quote])
        .collect()
}

pub fn triangle_key(coins: [&Coin; 3]) -> String {
    coins.iter().map(|c| c.as_str()).sorted_unstable().join("")
}

/// Three distinct symbols spanning exactly three distinct coins.
pub fn is_triangle(a: &CoinPair, b: &CoinPair, c: &CoinPair) -> bool {
    a.symbol != b.symbol
        && a.symbol != c.symbol
        && b.symbol != c.symbol
        && coin_set(&[a, b, c]).len() == 3
}

fn find_pair_for_coins<'a>(
    x: &Coin,
    y: &Coin,
    candidates: [&'a CoinPair; 3],
) -> Result<&'a CoinPair, ArbError> {
    let forward = format!("{}{}", x, y);
    let backward = format!("{}{}", y, x);
    candidates
        .into_iter()
        .find(|p| p.symbol == forward || p.symbol == backward)
        .ok_or_else(|| {
            ArbError::InvariantViolation(format!(
                "no pair for coins {}/{} among {}, {}, {}",
                x, y, candidates[0].symbol, candidates[1].symbol, candidates[2].symbol
            ))
        })
}

/// Orients a qualifying triple: A and B come from `a`, C is the coin `b` adds.
pub fn make_triangle(a: &CoinPair, b: &CoinPair, c: &CoinPair) -> Result<Triangle, ArbError> {
    let coin_a = a.base.clone();
    let coin_b = a.quote.clone();
    let coin_c = if b.base == coin_a || b.base == coin_b {
        b.quote.clone()
    } else {
        b.base.clone()
    };

    let candidates = [a, b, c];
    let pair_ab = find_pair_for_coins(&coin_a, &coin_b, candidates)?.clone();
    let pair_bc = find_pair_for_coins(&coin_b, &coin_c, candidates)?.clone();
    let pair_ac = find_pair_for_coins(&coin_a, &coin_c, candidates)?.clone();
    let key = triangle_key([&coin_a, &coin_b, &coin_c]);

    Ok(Triangle {
        pair_ab,
        pair_bc,
        pair_ac,
        coin_a,
        coin_b,
        coin_c,
        key,
    })
}

fn shares_coin(a: &CoinPair, b: &CoinPair) -> bool {
    b.contains(&a.base) || b.contains(&a.quote)
}

/// Builds every triangle in `pairs`, sorted by key. Fails if a qualifying triple cannot be
/// oriented, which means the pair list itself is inconsistent.
pub fn build_triangles(pairs: &[CoinPair]) -> Result<Vec<Triangle>, ArbError> {
    let started = Instant::now();
    info!("Analyzing {} pairs for triangles...", pairs.len());

    let found: Vec<((usize, usize, usize), Triangle)> = (0..pairs.len())
        .into_par_iter()
        .map(|i| -> Result<Vec<_>, ArbError> {
            let mut local = Vec::new();
            for j in (i + 1)..pairs.len() {
                // Two pairs without a common coin already span four coins
                if !shares_coin(&pairs[i], &pairs[j]) {
                    continue;
                }
                for k in (j + 1)..pairs.len() {
                    if is_triangle(&pairs[i], &pairs[j], &pairs[k]) {
                        let triangle = make_triangle(&pairs[i], &pairs[j], &pairs[k])?;
                        local.push(((i, j, k), triangle));
                    }
                }
            }
            Ok(local)
        })
        .collect::<Result<Vec<_>, ArbError>>()?
        .into_iter()
        .flatten()
        .collect();

    // Keep the lexicographically first triple per key
    let mut best: HashMap<String, ((usize, usize, usize), Triangle)> =
        HashMap::with_capacity(found.len());
    for (idx, triangle) in found {
        match best.get(&triangle.key) {
            Some((existing, _)) if *existing <= idx => {}
            _ => {
                best.insert(triangle.key.clone(), (idx, triangle));
            }
        }
    }

    let mut triangles: Vec<Triangle> = best.into_values().map(|(_, t)| t).collect();
    triangles.sort_by(|x, y| x.key.cmp(&y.key));

    info!(
        "Found {} triangles in {:?}",
        triangles.len(),
        started.elapsed()
    );
    for triangle in triangles.iter().take(5) {
        debug!("Triangle {}", triangle);
    }
    Ok(triangles)
}
