//! Abstract arithmetic over constant addresses.
//!
//! Numbers are abstracted by their sign and booleans by their truth value.
//! A constant address holds a *set* of lattice points, so every operator is lifted
//! pointwise: the result is the union of the table entries for every pair of points.
//!
//! ```text
//!          {-0+}               {TF}
//!       /    |    \           /    \
//!    {-0}  {-+}  {0+}       {T}    {F}
//!     | \  /  \  / |          \    /
//!    {-}   {0}   {+}           { }
//!       \   |   /
//!          { }
//! ```
//!
//! | `+`   | `-`   | `0`  | `+`   |
//! |-------|-------|------|-------|
//! | **-** | -     | -    | -0+   |
//! | **0** | -     | 0    | +     |
//! | **+** | -0+   | +    | +     |
//!
//! Booleans used as numbers count as `T = +`, `F = 0`;
//! numbers used as booleans count as `- = +  = T`, `0 = F`.
//!
//! Comparisons are all derived from the sign of the difference `a - b`.

use std::fmt::{Display, Formatter};

use log::{debug, warn};

use crate::address::{Addr, BOOLEAN, FALSE, NEG, NUMERIC, POS, TRUE, ZERO};

const SIGNS: [u8; 3] = [NEG, ZERO, POS];

const ADD: [[u8; 3]; 3] = [
    // NEG       ZERO  POS
    [NEG, NEG, NEG | ZERO | POS], // NEG
    [NEG, ZERO, POS],             // ZERO
    [NEG | ZERO | POS, POS, POS], // POS
];

const MUL: [[u8; 3]; 3] = [
    // NEG  ZERO  POS
    [POS, ZERO, NEG], // NEG
    [ZERO, ZERO, ZERO], // ZERO
    [NEG, ZERO, POS], // POS
];

// Remainder takes the sign of the dividend, or zero.
const REM: [[u8; 3]; 3] = [
    // NEG         ZERO  POS
    [NEG | ZERO, 0, NEG | ZERO], // NEG
    [ZERO, 0, ZERO],             // ZERO
    [POS | ZERO, 0, POS | ZERO], // POS
];

fn lift2(a: u8, b: u8, table: &[[u8; 3]; 3]) -> u8 {
    let mut res = 0;
    for (i, &x) in SIGNS.iter().enumerate() {
        if a & x == 0 {
            continue;
        }
        for (j, &y) in SIGNS.iter().enumerate() {
            if b & y != 0 {
                res |= table[i][j];
            }
        }
    }
    res
}

/// Numeric view of a mask: booleans are read as `T = +`, `F = 0`.
pub fn to_numeric(a: u8) -> u8 {
    let mut res = a & NUMERIC;
    if a & TRUE != 0 {
        res |= POS;
    }
    if a & FALSE != 0 {
        res |= ZERO;
    }
    res
}

/// Boolean view of a mask: non-zero numbers are true.
pub fn to_boolean(a: u8) -> u8 {
    let mut res = a & BOOLEAN;
    if a & (NEG | POS) != 0 {
        res |= TRUE;
    }
    if a & ZERO != 0 {
        res |= FALSE;
    }
    res
}

pub fn neg(a: u8) -> u8 {
    let a = to_numeric(a);
    let mut res = a & ZERO;
    if a & NEG != 0 {
        res |= POS;
    }
    if a & POS != 0 {
        res |= NEG;
    }
    res
}

pub fn add(a: u8, b: u8) -> u8 {
    lift2(to_numeric(a), to_numeric(b), &ADD)
}

pub fn sub(a: u8, b: u8) -> u8 {
    add(a, neg(b))
}

pub fn mul(a: u8, b: u8) -> u8 {
    lift2(to_numeric(a), to_numeric(b), &MUL)
}

/// Drops zero from a divisor, warning when it was possible.
fn nonzero_divisor(b: u8) -> u8 {
    let b = to_numeric(b);
    if b & ZERO != 0 {
        warn!("divided by zero");
    }
    b & !ZERO
}

/// Division follows the sign rules of multiplication over a non-zero divisor.
pub fn div(a: u8, b: u8) -> u8 {
    mul(a, nonzero_divisor(b))
}

pub fn rem(a: u8, b: u8) -> u8 {
    lift2(to_numeric(a), nonzero_divisor(b), &REM)
}

pub fn not(a: u8) -> u8 {
    let a = to_boolean(a);
    let mut res = 0;
    if a & TRUE != 0 {
        res |= FALSE;
    }
    if a & FALSE != 0 {
        res |= TRUE;
    }
    res
}

fn truth(x: bool) -> u8 {
    if x {
        TRUE
    } else {
        FALSE
    }
}

fn lift_bool(a: u8, b: u8, f: impl Fn(bool, bool) -> bool) -> u8 {
    let a = to_boolean(a);
    let b = to_boolean(b);
    let mut res = 0;
    for x in [true, false] {
        if a & truth(x) == 0 {
            continue;
        }
        for y in [true, false] {
            if b & truth(y) != 0 {
                res |= truth(f(x, y));
            }
        }
    }
    res
}

pub fn and(a: u8, b: u8) -> u8 {
    lift_bool(a, b, |x, y| x && y)
}

pub fn or(a: u8, b: u8) -> u8 {
    lift_bool(a, b, |x, y| x || y)
}

pub fn xor(a: u8, b: u8) -> u8 {
    lift_bool(a, b, |x, y| x ^ y)
}

/// Sign bit of a number as a boolean: negative numbers have it set.
pub fn sign_bit(a: u8) -> u8 {
    let a = to_numeric(a);
    let mut res = 0;
    if a & NEG != 0 {
        res |= TRUE;
    }
    if a & (ZERO | POS) != 0 {
        res |= FALSE;
    }
    res
}

/// Inverse of [`sign_bit`].
pub fn sign_bit_to_numeric(s: u8) -> u8 {
    let mut res = 0;
    if s & TRUE != 0 {
        res |= NEG;
    }
    if s & FALSE != 0 {
        res |= ZERO | POS;
    }
    res
}

pub fn bit_and(a: u8, b: u8) -> u8 {
    sign_bit_to_numeric(and(sign_bit(a), sign_bit(b)))
}

pub fn bit_or(a: u8, b: u8) -> u8 {
    sign_bit_to_numeric(or(sign_bit(a), sign_bit(b)))
}

pub fn bit_xor(a: u8, b: u8) -> u8 {
    sign_bit_to_numeric(xor(sign_bit(a), sign_bit(b)))
}

fn compare(a: u8, b: u8, on_neg: u8, on_zero: u8, on_pos: u8) -> u8 {
    let d = sub(a, b);
    let mut res = 0;
    if d & NEG != 0 {
        res |= on_neg;
    }
    if d & ZERO != 0 {
        res |= on_zero;
    }
    if d & POS != 0 {
        res |= on_pos;
    }
    res
}

pub fn eq(a: u8, b: u8) -> u8 {
    compare(a, b, FALSE, TRUE, FALSE)
}

pub fn ne(a: u8, b: u8) -> u8 {
    compare(a, b, TRUE, FALSE, TRUE)
}

pub fn gt(a: u8, b: u8) -> u8 {
    compare(a, b, FALSE, FALSE, TRUE)
}

pub fn ge(a: u8, b: u8) -> u8 {
    compare(a, b, FALSE, TRUE, TRUE)
}

pub fn lt(a: u8, b: u8) -> u8 {
    gt(b, a)
}

pub fn le(a: u8, b: u8) -> u8 {
    ge(b, a)
}

/// Unary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

/// Binary operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl UnOp {
    pub fn eval_bits(self, a: u8) -> u8 {
        match self {
            UnOp::Neg => neg(a),
            UnOp::Not => not(a),
        }
    }

    /// Applies the operator to a constant address.
    ///
    /// Returns `None` for non-constant operands.
    pub fn eval(self, a: Addr) -> Option<Addr> {
        let x = a.const_bits()?;
        let res = self.eval_bits(x);
        debug!("{}{} => {}", self, a, Addr::constant(res));
        Some(Addr::constant(res))
    }
}

impl BinOp {
    pub fn eval_bits(self, a: u8, b: u8) -> u8 {
        match self {
            BinOp::Add => add(a, b),
            BinOp::Sub => sub(a, b),
            BinOp::Mul => mul(a, b),
            BinOp::Div => div(a, b),
            BinOp::Rem => rem(a, b),
            BinOp::And => and(a, b),
            BinOp::Or => or(a, b),
            BinOp::Xor => xor(a, b),
            BinOp::BitAnd => bit_and(a, b),
            BinOp::BitOr => bit_or(a, b),
            BinOp::BitXor => bit_xor(a, b),
            BinOp::Eq => eq(a, b),
            BinOp::Ne => ne(a, b),
            BinOp::Lt => lt(a, b),
            BinOp::Le => le(a, b),
            BinOp::Gt => gt(a, b),
            BinOp::Ge => ge(a, b),
        }
    }

    /// Applies the operator to two constant addresses.
    ///
    /// Returns `None` if either operand is not a constant.
    pub fn eval(self, a: Addr, b: Addr) -> Option<Addr> {
        let x = a.const_bits()?;
        let y = b.const_bits()?;
        let res = self.eval_bits(x, y);
        if res == 0 {
            warn!("{} {} {} yields an empty constant, operand types might mismatch", a, self, b);
        }
        Some(Addr::constant(res))
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }
}

impl Display for UnOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UnOp::Neg => write!(f, "-"),
            UnOp::Not => write!(f, "!"),
        }
    }
}

impl Display for BinOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Xor => "^^",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_add() {
        assert_eq!(add(NEG, POS), NEG | ZERO | POS);
        assert_eq!(add(NEG, NEG), NEG);
        assert_eq!(add(ZERO, POS), POS);
        assert_eq!(add(ZERO, ZERO), ZERO);
        assert_eq!(add(NEG | ZERO, ZERO), NEG | ZERO);
        assert_eq!(add(0, POS), 0);
    }

    #[test]
    fn test_mul() {
        assert_eq!(mul(NEG, NEG), POS);
        assert_eq!(mul(NEG, POS), NEG);
        assert_eq!(mul(ZERO, NUMERIC), ZERO);
        assert_eq!(mul(NEG | POS, POS), NEG | POS);
    }

    #[test]
    fn test_sub_and_neg() {
        assert_eq!(neg(NEG), POS);
        assert_eq!(neg(ZERO), ZERO);
        assert_eq!(neg(NEG | ZERO), POS | ZERO);
        assert_eq!(sub(POS, NEG), POS);
        assert_eq!(sub(POS, POS), NUMERIC);
        assert_eq!(sub(ZERO, POS), NEG);
    }

    #[test]
    fn test_div_excludes_zero_divisor() {
        assert_eq!(div(POS, NEG), NEG);
        assert_eq!(div(POS, NEG | ZERO), NEG);
        assert_eq!(div(POS, ZERO), 0);
        assert_eq!(div(ZERO, POS), ZERO);
    }

    #[test]
    fn test_rem() {
        assert_eq!(rem(NEG, POS), NEG | ZERO);
        assert_eq!(rem(POS, NEG), POS | ZERO);
        assert_eq!(rem(ZERO, NEG), ZERO);
        assert_eq!(rem(POS, ZERO), 0);
    }

    #[test]
    fn test_not_involution() {
        for x in [TRUE, FALSE, BOOLEAN] {
            assert_eq!(not(not(x)), x);
        }
        assert_eq!(not(TRUE), FALSE);
    }

    #[test]
    fn test_logic() {
        assert_eq!(and(TRUE, FALSE), FALSE);
        assert_eq!(and(TRUE, TRUE), TRUE);
        assert_eq!(and(BOOLEAN, TRUE), BOOLEAN);
        assert_eq!(or(FALSE, FALSE), FALSE);
        assert_eq!(or(BOOLEAN, TRUE), TRUE);
        assert_eq!(xor(TRUE, TRUE), FALSE);
        assert_eq!(xor(TRUE, FALSE), TRUE);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(to_numeric(TRUE), POS);
        assert_eq!(to_numeric(FALSE), ZERO);
        assert_eq!(to_boolean(NEG), TRUE);
        assert_eq!(to_boolean(ZERO), FALSE);
        assert_eq!(not(ZERO), TRUE);
    }

    #[test]
    fn test_bitwise_through_sign_bit() {
        assert_eq!(sign_bit(NEG), TRUE);
        assert_eq!(sign_bit(ZERO | POS), FALSE);
        assert_eq!(bit_and(NEG, NEG), NEG);
        assert_eq!(bit_and(NEG, POS), ZERO | POS);
        assert_eq!(bit_or(NEG, POS), NEG);
        assert_eq!(bit_xor(NEG, NEG), ZERO | POS);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eq(ZERO, ZERO), TRUE);
        assert_eq!(eq(NEG, POS), FALSE);
        assert_eq!(eq(POS, POS), BOOLEAN);
        assert_eq!(ne(ZERO, ZERO), FALSE);
        assert_eq!(gt(POS, NEG), TRUE);
        assert_eq!(gt(ZERO, ZERO), FALSE);
        assert_eq!(ge(ZERO, ZERO), TRUE);
        assert_eq!(ge(NEG, POS), FALSE);
        assert_eq!(lt(NEG, POS), TRUE);
        assert_eq!(le(ZERO, ZERO), TRUE);
        assert_eq!(le(POS, ZERO), FALSE);
    }

    #[test]
    fn test_ge_is_not_lt() {
        for a in 1..=NUMERIC {
            for b in 1..=NUMERIC {
                assert_eq!(ge(a, b), not(lt(a, b)), "a = {}, b = {}", a, b);
                assert_eq!(le(a, b), not(gt(a, b)), "a = {}, b = {}", a, b);
            }
        }
    }

    #[test]
    fn test_eval_addr() {
        assert_eq!(BinOp::Add.eval(Addr::NEG, Addr::POS), Some(Addr::constant(NUMERIC)));
        assert_eq!(BinOp::Mul.eval(Addr::NEG, Addr::NEG), Some(Addr::POS));
        assert_eq!(BinOp::Add.eval(Addr::object(1), Addr::POS), None);
        assert_eq!(UnOp::Not.eval(Addr::TRUE), Some(Addr::FALSE));
        assert!(BinOp::Le.is_comparison());
        assert!(!BinOp::Add.is_comparison());
    }
}
