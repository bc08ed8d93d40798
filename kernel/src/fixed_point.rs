/*
 * Q17.14 Fixed-Point Arithmetic
 *
 * The advanced scheduler computes load averages and per-thread CPU usage
 * with real numbers, but the kernel has no FPU context saving. Values are
 * therefore kept in a signed 32-bit integer with 14 fraction bits.
 *
 * Negation and absolute value use ordinary two's-complement arithmetic.
 */

/// Number of fraction bits.
const Q: u32 = 14;

/// Scaling factor (1.0 in fixed-point).
const F: i32 = 1 << Q;

/// A signed Q17.14 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fp(i32);

impl Fp {
    pub const ZERO: Fp = Fp(0);

    /// Convert an integer to fixed-point.
    pub const fn from_int(n: i32) -> Fp {
        Fp(n * F)
    }

    /// Construct from a fraction. `denominator` must be nonzero.
    pub const fn from_fraction(numerator: i32, denominator: i32) -> Fp {
        Fp(((numerator as i64 * F as i64) / denominator as i64) as i32)
    }

    /// Convert to an integer, rounding toward zero.
    pub const fn trunc(self) -> i32 {
        self.0 / F
    }

    /// Convert to an integer, rounding to nearest.
    pub const fn round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    pub const fn add(self, other: Fp) -> Fp {
        Fp(self.0 + other.0)
    }

    pub const fn sub(self, other: Fp) -> Fp {
        Fp(self.0 - other.0)
    }

    pub const fn add_int(self, n: i32) -> Fp {
        Fp(self.0 + n * F)
    }

    pub const fn sub_int(self, n: i32) -> Fp {
        Fp(self.0 - n * F)
    }

    /// Multiply two fixed-point values. The intermediate product needs
    /// 64 bits before shifting back down.
    pub const fn mul(self, other: Fp) -> Fp {
        Fp(((self.0 as i64 * other.0 as i64) / F as i64) as i32)
    }

    pub const fn mul_int(self, n: i32) -> Fp {
        Fp(self.0 * n)
    }

    /// Divide two fixed-point values. `other` must be nonzero.
    pub const fn div(self, other: Fp) -> Fp {
        Fp(((self.0 as i64 * F as i64) / other.0 as i64) as i32)
    }

    pub const fn div_int(self, n: i32) -> Fp {
        Fp(self.0 / n)
    }

    pub const fn neg(self) -> Fp {
        Fp(-self.0)
    }

    pub const fn abs(self) -> Fp {
        if self.0 < 0 { Fp(-self.0) } else { self }
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }
}
