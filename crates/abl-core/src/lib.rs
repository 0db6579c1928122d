//! Core domain model for the approved ball list.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Brand that makes bowling equipment. The upstream catalog is queried once per brand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Brand {
    #[serde(rename = "900 Global")]
    Global,
    #[serde(rename = "BIG Bowling")]
    BigBowling,
    #[serde(rename = "Brunswick")]
    Brunswick,
    #[serde(rename = "Columbia")]
    Columbia300,
    #[serde(rename = "DV8")]
    Dv8,
    #[serde(rename = "Ebonite")]
    Ebonite,
    #[serde(rename = "Hammer")]
    Hammer,
    #[serde(rename = "Motiv")]
    Motiv,
    #[serde(rename = "Radical")]
    Radical,
    #[serde(rename = "Roto Grip")]
    RotoGrip,
    #[serde(rename = "Storm")]
    Storm,
    #[serde(rename = "Swag")]
    Swag,
    #[serde(rename = "Track Inc.")]
    Track,
}

impl Brand {
    /// Every active brand, in a stable order.
    pub const ALL: [Brand; 13] = [
        Brand::Global,
        Brand::BigBowling,
        Brand::Brunswick,
        Brand::Columbia300,
        Brand::Dv8,
        Brand::Ebonite,
        Brand::Hammer,
        Brand::Motiv,
        Brand::Radical,
        Brand::RotoGrip,
        Brand::Storm,
        Brand::Swag,
        Brand::Track,
    ];

    /// Name as stored and as sent upstream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Brand::Global => "900 Global",
            Brand::BigBowling => "BIG Bowling",
            Brand::Brunswick => "Brunswick",
            Brand::Columbia300 => "Columbia",
            Brand::Dv8 => "DV8",
            Brand::Ebonite => "Ebonite",
            Brand::Hammer => "Hammer",
            Brand::Motiv => "Motiv",
            Brand::Radical => "Radical",
            Brand::RotoGrip => "Roto Grip",
            Brand::Storm => "Storm",
            Brand::Swag => "Swag",
            Brand::Track => "Track Inc.",
        }
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown brand: {0:?}")]
pub struct UnknownBrand(pub String);

impl FromStr for Brand {
    type Err = UnknownBrand;

    /// Exact, case-sensitive match against the stored names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Brand::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| UnknownBrand(s.to_string()))
    }
}

/// A bowling ball on the approved list.
///
/// `id` is storage metadata assigned by the store; two balls describe the same
/// real-world ball iff their brand and name match (see [`Ball::same_ball`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ball {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub brand: Brand,
    pub name: String,
    pub approval_date: NaiveDate,
    pub image_url: String,
}

impl Ball {
    pub fn new(
        brand: Brand,
        name: impl Into<String>,
        approval_date: NaiveDate,
        image_url: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            brand,
            name: name.into(),
            approval_date,
            image_url: image_url.into(),
        }
    }

    /// Business identity: `(brand, name)`. Approval date, image and id are ignored.
    pub fn same_ball(&self, other: &Ball) -> bool {
        self.brand == other.brand && self.name == other.name
    }
}

/// Conjunctive predicates for listing balls. `None` means "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallFilter {
    pub brand: Option<Brand>,
    pub name: Option<String>,
    pub approval_date: Option<NaiveDate>,
}

impl BallFilter {
    pub fn brand(brand: Brand) -> Self {
        Self {
            brand: Some(brand),
            ..Self::default()
        }
    }
}

/// One page of a listing.
///
/// `total_count` is the size of the whole filtered set, not `balls.len()`.
/// `next_page_token` is empty when there are no further pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListBallsResult {
    pub balls: Vec<Ball>,
    pub next_page_token: String,
    pub total_count: usize,
}
