//! # Glicko-2 rating engine
//!
//! A pure implementation of the Glicko-2 rating system as described by
//! Glickman, specialized for one rating period per match series: a player is
//! updated against a list of opponents with fractional scores in `[0, 1]`.
//!
//! The update is a pure function of its inputs. Persistence, scheduling and
//! score extraction live elsewhere; this crate only does the math, which
//! keeps it trivially property-testable.
//!
//! # Usage Example
//!
//! ```
//! use glicko2::{rate, MatchResult, Rating};
//!
//! let player = Rating::default();
//! let opponent = Rating::default();
//!
//! // Player took 60% of the decisive games in the series.
//! let updated = rate(player, &[MatchResult::new(opponent, 0.6)]);
//! assert!(updated.rating > player.rating);
//! assert!(updated.rd < player.rd);
//! ```
#![warn(missing_docs)]

use std::f64::consts::PI;

/// System constant constraining volatility change between periods.
const TAU: f64 = 0.5;
/// Convergence tolerance for the volatility iteration.
const EPSILON: f64 = 0.000_001;
/// Conversion factor between the Glicko and Glicko-2 scales.
const SCALE: f64 = 173.7178;

/// Rating every player starts from.
pub const DEFAULT_RATING: f64 = 1500.0;
/// Rating deviation every player starts from.
pub const DEFAULT_RD: f64 = 350.0;
/// Volatility every player starts from.
pub const DEFAULT_VOLATILITY: f64 = 0.06;

/// A player's rating state: the `(rating, RD, volatility)` triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rating {
    /// Rating on the public (Glicko) scale, 1500-centered.
    pub rating: f64,
    /// Rating deviation on the public scale.
    pub rd: f64,
    /// Volatility, the expected fluctuation of the rating.
    pub volatility: f64,
}

impl Default for Rating {
    fn default() -> Self {
        Rating {
            rating: DEFAULT_RATING,
            rd: DEFAULT_RD,
            volatility: DEFAULT_VOLATILITY,
        }
    }
}

/// One opponent faced during the rating period, with the achieved score.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    /// The opponent's rating state before the update.
    pub opponent: Rating,
    /// Achieved score against this opponent, in `[0, 1]`.
    pub score: f64,
}

impl MatchResult {
    /// Pair an opponent with the score achieved against them.
    pub fn new(opponent: Rating, score: f64) -> Self {
        MatchResult { opponent, score }
    }
}

fn to_glicko2_scale(rating: f64, rd: f64) -> (f64, f64) {
    ((rating - DEFAULT_RATING) / SCALE, rd / SCALE)
}

fn from_glicko2_scale(mu: f64, phi: f64) -> (f64, f64) {
    (mu * SCALE + DEFAULT_RATING, phi * SCALE)
}

fn g(phi: f64) -> f64 {
    1.0 / (1.0 + 3.0 * phi * phi / (PI * PI)).sqrt()
}

fn expectation(mu: f64, mu_j: f64, phi_j: f64) -> f64 {
    1.0 / (1.0 + (-g(phi_j) * (mu - mu_j)).exp())
}

/// Solve for the new volatility with the Illinois variant of regula falsi.
fn new_volatility(delta: f64, phi: f64, v: f64, sigma: f64) -> f64 {
    let a = (sigma * sigma).ln();
    let delta_sq = delta * delta;
    let phi_sq = phi * phi;

    let f = |x: f64| {
        let e_x = x.exp();
        let num = e_x * (delta_sq - phi_sq - v - e_x);
        let denom = 2.0 * (phi_sq + v + e_x) * (phi_sq + v + e_x);
        num / denom - (x - a) / (TAU * TAU)
    };

    let mut big_a = a;
    let mut big_b = if delta_sq > phi_sq + v {
        (delta_sq - phi_sq - v).ln()
    } else {
        let mut k = 1.0;
        while f(a - k * TAU) < 0.0 {
            k += 1.0;
        }
        a - k * TAU
    };

    let mut f_a = f(big_a);
    let mut f_b = f(big_b);

    while (big_b - big_a).abs() > EPSILON {
        let big_c = big_a + (big_a - big_b) * f_a / (f_b - f_a);
        let f_c = f(big_c);

        if f_c * f_b < 0.0 {
            big_a = big_b;
            f_a = f_b;
        } else {
            f_a /= 2.0;
        }

        big_b = big_c;
        f_b = f_c;
    }

    (big_a / 2.0).exp()
}

/// Update a player's rating after a rating period.
///
/// With an empty result list this is the inactivity step: the rating and
/// volatility are unchanged and the deviation grows by the volatility.
pub fn rate(player: Rating, results: &[MatchResult]) -> Rating {
    let (mu, phi) = to_glicko2_scale(player.rating, player.rd);
    let sigma = player.volatility;

    if results.is_empty() {
        let phi_star = (phi * phi + sigma * sigma).sqrt();
        let (rating, rd) = from_glicko2_scale(mu, phi_star);
        return Rating {
            rating,
            rd,
            volatility: sigma,
        };
    }

    let mut v_inv = 0.0;
    for result in results {
        let (mu_j, phi_j) = to_glicko2_scale(result.opponent.rating, result.opponent.rd);
        let g_phi_j = g(phi_j);
        let e = expectation(mu, mu_j, phi_j);
        v_inv += g_phi_j * g_phi_j * e * (1.0 - e);
    }
    let v = 1.0 / v_inv;

    let mut improvement = 0.0;
    for result in results {
        let (mu_j, phi_j) = to_glicko2_scale(result.opponent.rating, result.opponent.rd);
        improvement += g(phi_j) * (result.score - expectation(mu, mu_j, phi_j));
    }
    let delta = v * improvement;

    let sigma_new = new_volatility(delta, phi, v, sigma);
    let phi_star = (phi * phi + sigma_new * sigma_new).sqrt();
    let phi_new = 1.0 / (1.0 / (phi_star * phi_star) + 1.0 / v).sqrt();
    let mu_new = mu + phi_new * phi_new * improvement;

    let (rating, rd) = from_glicko2_scale(mu_new, phi_new);
    Rating {
        rating,
        rd,
        volatility: sigma_new,
    }
}
