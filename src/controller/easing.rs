//! # Easing Curves
//!
//! CSS-style cubic-bezier easing. The curve is anchored at (0,0) and (1,1);
//! the four configured numbers are the two inner control points
//! `x1, y1, x2, y2`. An input `x` in [0,1] is mapped to the curve's `y`.
//!
//! ```
//! use tsw_controller::controller::easing::CubicBezier;
//!
//! let linear = CubicBezier::linear();
//! assert!((linear.ease(0.25) - 0.25).abs() < 1e-6);
//! ```

const NEWTON_ITERATIONS: usize = 8;
const NEWTON_EPSILON: f64 = 1e-7;
const BISECTION_ITERATIONS: usize = 32;

/// Cubic-bezier easing function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicBezier {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl Default for CubicBezier {
    fn default() -> Self {
        Self::linear()
    }
}

impl CubicBezier {
    #[must_use]
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        // x must stay monotonic for the curve to be a function of x
        Self {
            x1: x1.clamp(0.0, 1.0),
            y1,
            x2: x2.clamp(0.0, 1.0),
            y2,
        }
    }

    /// Identity curve `[0, 0, 1, 1]`.
    #[must_use]
    pub fn linear() -> Self {
        Self { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 }
    }

    /// Build from a configured curve; anything but four numbers gives the identity.
    #[must_use]
    pub fn from_points(points: Option<&[f64]>) -> Self {
        match points {
            Some(&[x1, y1, x2, y2]) => Self::new(x1, y1, x2, y2),
            _ => Self::linear(),
        }
    }

    #[inline]
    fn sample(t: f64, p1: f64, p2: f64) -> f64 {
        // B(t) with P0 = 0 and P3 = 1
        let mt = 1.0 - t;
        3.0 * mt * mt * t * p1 + 3.0 * mt * t * t * p2 + t * t * t
    }

    #[inline]
    fn sample_derivative(t: f64, p1: f64, p2: f64) -> f64 {
        let mt = 1.0 - t;
        3.0 * mt * mt * p1 + 6.0 * mt * t * (p2 - p1) + 3.0 * t * t * (1.0 - p2)
    }

    /// Find the curve parameter whose x equals `target_x`.
    ///
    /// Newton-Raphson first, falling back to bisection when the slope is flat.
    fn solve_t(&self, target_x: f64) -> f64 {
        let mut t = target_x;
        for _ in 0..NEWTON_ITERATIONS {
            let error = Self::sample(t, self.x1, self.x2) - target_x;
            if error.abs() < NEWTON_EPSILON {
                return t;
            }
            let slope = Self::sample_derivative(t, self.x1, self.x2);
            if slope.abs() < NEWTON_EPSILON {
                break;
            }
            t = (t - error / slope).clamp(0.0, 1.0);
        }

        let (mut lo, mut hi) = (0.0, 1.0);
        t = target_x;
        for _ in 0..BISECTION_ITERATIONS {
            let x = Self::sample(t, self.x1, self.x2);
            if (x - target_x).abs() < NEWTON_EPSILON {
                break;
            }
            if x < target_x {
                lo = t;
            } else {
                hi = t;
            }
            t = (lo + hi) / 2.0;
        }
        t
    }

    /// Map `x` in [0,1] (clamped) to the eased value.
    #[must_use]
    pub fn ease(&self, x: f64) -> f64 {
        let x = x.clamp(0.0, 1.0);
        if x == 0.0 || x == 1.0 {
            return x;
        }
        if self.x1 == self.y1 && self.x2 == self.y2 {
            return x;
        }
        Self::sample(self.solve_t(x), self.y1, self.y2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_is_identity() {
        let curve = CubicBezier::linear();
        for i in 0..=10 {
            let x = i as f64 / 10.0;
            assert!((curve.ease(x) - x).abs() < 1e-9);
        }
    }

    #[test]
    fn test_endpoints_are_fixed() {
        let curve = CubicBezier::new(0.42, 0.0, 0.58, 1.0);
        assert_eq!(curve.ease(0.0), 0.0);
        assert_eq!(curve.ease(1.0), 1.0);
    }

    #[test]
    fn test_ease_in_out_is_symmetric() {
        let curve = CubicBezier::new(0.42, 0.0, 0.58, 1.0);
        assert!((curve.ease(0.5) - 0.5).abs() < 1e-4);
        let low = curve.ease(0.2);
        let high = curve.ease(0.8);
        assert!((low + high - 1.0).abs() < 1e-4);
        assert!(low < 0.2);
    }

    #[test]
    fn test_ease_in_is_slow_at_start() {
        let curve = CubicBezier::new(0.42, 0.0, 1.0, 1.0);
        assert!(curve.ease(0.25) < 0.25);
    }

    #[test]
    fn test_monotonic() {
        let curve = CubicBezier::new(0.1, 0.7, 0.9, 0.3);
        let mut previous = 0.0;
        for i in 1..=100 {
            let y = curve.ease(i as f64 / 100.0);
            assert!(y >= previous - 1e-6, "curve decreased at {}", i);
            previous = y;
        }
    }

    #[test]
    fn test_input_is_clamped() {
        let curve = CubicBezier::new(0.42, 0.0, 0.58, 1.0);
        assert_eq!(curve.ease(-0.5), 0.0);
        assert_eq!(curve.ease(1.5), 1.0);
    }

    #[test]
    fn test_from_points() {
        assert_eq!(CubicBezier::from_points(None), CubicBezier::linear());
        assert_eq!(CubicBezier::from_points(Some(&[0.1, 0.2])), CubicBezier::linear());
        assert_eq!(
            CubicBezier::from_points(Some(&[0.1, 0.2, 0.3, 0.4])),
            CubicBezier::new(0.1, 0.2, 0.3, 0.4)
        );
    }
}
