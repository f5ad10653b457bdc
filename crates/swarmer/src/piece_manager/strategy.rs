//! Order in which missing pieces are chosen.
use std::{fmt::Display, str::FromStr};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Which missing piece is started next. Pieces that already have blocks in
/// flight or received are always finished first, regardless of the
/// strategy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStrategy {
    /// Ascending piece index.
    #[default]
    #[serde(rename = "sequential")]
    Sequential,

    /// Pieces held by the fewest known peers first, ties broken by index.
    #[serde(rename = "rarest")]
    RarestFirst,

    /// A random order, fixed when the torrent starts.
    #[serde(rename = "random")]
    Random,
}

impl PieceStrategy {
    /// The static order of the pieces for this strategy. Rarest first is
    /// recomputed on every selection and starts from the sequential order.
    pub(crate) fn initial_order(&self, pieces: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..pieces).collect();
        if *self == PieceStrategy::Random {
            order.shuffle(&mut rand::thread_rng());
        }
        order
    }

    /// Sort `candidates` (missing pieces, in the static order) by how
    /// available they are.
    pub(crate) fn rank(&self, candidates: &mut [usize], availability: &[u32]) {
        if *self == PieceStrategy::RarestFirst {
            candidates.sort_by_key(|&i| (availability[i], i));
        }
    }
}

impl FromStr for PieceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "rarest" | "rarest-first" => Ok(Self::RarestFirst),
            "random" => Ok(Self::Random),
            other => Err(format!(
                "unknown piece strategy `{other}`, expected one of \
                 sequential, rarest, random"
            )),
        }
    }
}

impl Display for PieceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::RarestFirst => write!(f, "rarest"),
            Self::Random => write!(f, "random"),
        }
    }
}
