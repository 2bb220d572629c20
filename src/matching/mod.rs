//! Descriptor matching between two frames

pub mod brute_force;
pub mod flann;

use std::fmt;
use std::str::FromStr;

use log::debug;
use space::Metric;

use crate::error::{Error, Result};
use crate::features::descriptor::{
    euclidean_distance, hamming_distance, BinaryDescriptor, Descriptors, FloatDescriptor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherType {
    BruteForce,
    Flann,
}

impl MatcherType {
    pub const ALL: [MatcherType; 2] = [Self::BruteForce, Self::Flann];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BruteForce => "MAT_BF",
            Self::Flann => "MAT_FLANN",
        }
    }
}

impl FromStr for MatcherType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|matcher| matcher.as_str() == s)
            .ok_or_else(|| Error::UnknownMatcher(s.to_string()))
    }
}

impl fmt::Display for MatcherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorType {
    /// Best match per query descriptor
    NearestNeighbour,
    /// Two best matches followed by the distance ratio filter
    KNearest,
}

impl SelectorType {
    pub const ALL: [SelectorType; 2] = [Self::NearestNeighbour, Self::KNearest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NearestNeighbour => "SEL_NN",
            Self::KNearest => "SEL_KNN",
        }
    }
}

impl FromStr for SelectorType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|selector| selector.as_str() == s)
            .ok_or_else(|| Error::UnknownSelector(s.to_string()))
    }
}

impl fmt::Display for SelectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correspondence between descriptor `query_idx` of the previous frame
/// and descriptor `train_idx` of the current one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub query_idx: usize,
    pub train_idx: usize,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    /// Lowe's ratio for `SEL_KNN`
    pub ratio: f32,
    /// Mutual nearest neighbour check for brute force `SEL_NN`
    pub cross_check: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            ratio: 0.8,
            cross_check: true,
        }
    }
}

/// Hamming distance between binary rows, counted with `bitarray`
#[derive(Debug, Default, Clone, Copy)]
pub struct Hamming;

impl Metric<BinaryDescriptor> for Hamming {
    type Unit = u32;
    fn distance(&self, a: &BinaryDescriptor, b: &BinaryDescriptor) -> Self::Unit {
        hamming_distance(a, b)
    }
}

/// L2 distance between gradient histograms.
///
/// The unit is the bit pattern of the non-negative `f32` distance, which
/// orders the same way as the float itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct L2;

impl Metric<FloatDescriptor> for L2 {
    type Unit = u32;
    fn distance(&self, a: &FloatDescriptor, b: &FloatDescriptor) -> Self::Unit {
        euclidean_distance(a, b).to_bits()
    }
}

/// A descriptor row together with the metric it is matched under
pub trait Descriptor: Copy + 'static {
    type Metric: Metric<Self, Unit = u32> + Default;

    /// Descriptor distance of a metric unit
    fn from_unit(unit: u32) -> f32;

    /// Up to `k` `(train index, unit)` neighbours of every query row from
    /// the approximate index for this descriptor family
    fn flann_knn(query: &[Self], train: &[Self], k: usize) -> Vec<Vec<(usize, u32)>>;
}

impl Descriptor for BinaryDescriptor {
    type Metric = Hamming;

    fn from_unit(unit: u32) -> f32 {
        unit as f32
    }

    fn flann_knn(query: &[Self], train: &[Self], k: usize) -> Vec<Vec<(usize, u32)>> {
        let index = flann::LshIndex::new(train, flann::LshParams::default());
        query.iter().map(|row| index.knn(row, k)).collect()
    }
}

impl Descriptor for FloatDescriptor {
    type Metric = L2;

    fn from_unit(unit: u32) -> f32 {
        f32::from_bits(unit)
    }

    fn flann_knn(query: &[Self], train: &[Self], k: usize) -> Vec<Vec<(usize, u32)>> {
        let index = flann::KdForest::new(train, flann::KdForestParams::default());
        query.iter().map(|row| index.knn(row, k)).collect()
    }
}

/// Matches the descriptors of the previous frame (`source`) against the
/// current frame (`reference`).
pub fn match_descriptors(
    source: &Descriptors,
    reference: &Descriptors,
    matcher: MatcherType,
    selector: SelectorType,
    options: MatchOptions,
) -> Result<Vec<Match>> {
    match (source, reference) {
        (Descriptors::Binary(query), Descriptors::Binary(train)) => {
            Ok(match_rows(query, train, matcher, selector, options))
        }
        (Descriptors::Float(query), Descriptors::Float(train)) => {
            Ok(match_rows(query, train, matcher, selector, options))
        }
        _ => Err(Error::DescriptorMismatch(
            source.category().as_str(),
            reference.category().as_str(),
        )),
    }
}

fn match_rows<D: Descriptor>(
    query: &[D],
    train: &[D],
    matcher: MatcherType,
    selector: SelectorType,
    options: MatchOptions,
) -> Vec<Match> {
    if query.is_empty() || train.is_empty() {
        return Vec::new();
    }
    if matcher == MatcherType::BruteForce
        && selector == SelectorType::NearestNeighbour
        && options.cross_check
    {
        return brute_force::cross_checked(query, train);
    }

    let k = match selector {
        SelectorType::NearestNeighbour => 1,
        SelectorType::KNearest => 2,
    };
    let neighbours = match matcher {
        MatcherType::BruteForce => brute_force::knn(query, train, k),
        MatcherType::Flann => D::flann_knn(query, train, k),
    };
    let knn_matches = neighbours
        .into_iter()
        .enumerate()
        .map(|(query_idx, found)| {
            found
                .into_iter()
                .map(|(train_idx, unit)| Match {
                    query_idx,
                    train_idx,
                    distance: D::from_unit(unit),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    match selector {
        SelectorType::NearestNeighbour => knn_matches
            .into_iter()
            .filter_map(|found| found.into_iter().next())
            .collect(),
        SelectorType::KNearest => {
            let matches = ratio_filter(&knn_matches, options.ratio);
            debug!("# keypoints removed = {}", knn_matches.len() - matches.len());
            matches
        }
    }
}

/// Lowe's ratio test on the two best candidates of every query.
///
/// Queries with fewer than two candidates are skipped, as are those whose
/// second best distance is zero.
pub fn ratio_filter(knn_matches: &[Vec<Match>], ratio: f32) -> Vec<Match> {
    knn_matches
        .iter()
        .filter_map(|candidates| match candidates.as_slice() {
            [best, second, ..] if second.distance > 0.0 && best.distance / second.distance < ratio => {
                Some(*best)
            }
            _ => None,
        })
        .collect()
}
