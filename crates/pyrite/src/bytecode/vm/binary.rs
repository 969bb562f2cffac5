//! Binary operators and comparisons.

use super::VM;
use crate::{
    bytecode::op::Opcode,
    exception::{RunError, RunResult},
    heap::HeapData,
    value::Value,
};

impl VM<'_> {
    pub(super) fn binary_op(&mut self, op: Opcode, left: Value, right: Value) -> RunResult<Value> {
        match op {
            Opcode::Add => self.add(left, right),
            Opcode::Sub => self.arith(op, left, right),
            Opcode::Mul => self.mul(left, right),
            Opcode::FloorDiv | Opcode::Mod => self.arith(op, left, right),
            Opcode::CompareEq => Ok(Value::Bool(left.py_eq(&right, self.heap, &self.program.interns))),
            Opcode::CompareNe => Ok(Value::Bool(!left.py_eq(&right, self.heap, &self.program.interns))),
            Opcode::CompareLt | Opcode::CompareLe | Opcode::CompareGt | Opcode::CompareGe => {
                self.ordered_compare(op, left, right)
            }
            _ => Err(Self::corrupt("not a binary operator")),
        }
    }

    /// `+` concatenates strings and lists, adds numbers.
    fn add(&mut self, left: Value, right: Value) -> RunResult<Value> {
        if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
            return Ok(Value::Int(a.wrapping_add(b)));
        }
        let interns = &self.program.interns;
        if let (Some(a), Some(b)) = (left.as_str(self.heap, interns), right.as_str(self.heap, interns)) {
            let mut out = String::with_capacity(a.len() + b.len());
            out.push_str(a);
            out.push_str(b);
            return Ok(Value::Ref(self.heap.allocate_str(out)));
        }
        if let (Value::Ref(a), Value::Ref(b)) = (left, right)
            && let (HeapData::List(xs), HeapData::List(ys)) = (self.heap.get(a), self.heap.get(b))
        {
            let mut items = Vec::with_capacity(xs.len() + ys.len());
            items.extend_from_slice(xs);
            items.extend_from_slice(ys);
            return Ok(Value::Ref(self.heap.allocate(HeapData::List(items))));
        }
        Err(self.binary_type_error("+", left, right))
    }

    /// `*` multiplies numbers and repeats strings and lists by an int.
    fn mul(&mut self, left: Value, right: Value) -> RunResult<Value> {
        if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
            return Ok(Value::Int(a.wrapping_mul(b)));
        }
        // normalize to (sequence, count)
        let (seq, count) = match (left.as_number(), right.as_number()) {
            (None, Some(n)) => (left, n),
            (Some(n), None) => (right, n),
            _ => return Err(self.binary_type_error("*", left, right)),
        };
        let count = usize::try_from(count).unwrap_or(0);
        let interns = &self.program.interns;
        if let Some(s) = seq.as_str(self.heap, interns) {
            let repeated = s.repeat(count);
            return Ok(Value::Ref(self.heap.allocate_str(repeated)));
        }
        if let Value::Ref(id) = seq
            && let HeapData::List(items) = self.heap.get(id)
        {
            let mut out = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                out.extend_from_slice(items);
            }
            return Ok(Value::Ref(self.heap.allocate(HeapData::List(out))));
        }
        Err(self.binary_type_error("*", left, right))
    }

    /// `-`, `//`, and `%` on numbers. Division and modulo floor toward
    /// negative infinity like Python, not toward zero.
    fn arith(&mut self, op: Opcode, left: Value, right: Value) -> RunResult<Value> {
        let symbol = match op {
            Opcode::Sub => "-",
            Opcode::FloorDiv => "//",
            _ => "%",
        };
        let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
            return Err(self.binary_type_error(symbol, left, right));
        };
        let result = match op {
            Opcode::Sub => a.wrapping_sub(b),
            Opcode::FloorDiv => {
                if b == 0 {
                    return Err(RunError::zero_division());
                }
                floor_div(a, b)
            }
            _ => {
                if b == 0 {
                    return Err(RunError::zero_division());
                }
                floor_mod(a, b)
            }
        };
        Ok(Value::Int(result))
    }

    /// `<`, `<=`, `>`, `>=` on numbers or on strings; mixed operands raise.
    fn ordered_compare(&mut self, op: Opcode, left: Value, right: Value) -> RunResult<Value> {
        let ordering = if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
            a.cmp(&b)
        } else {
            let interns = &self.program.interns;
            match (left.as_str(self.heap, interns), right.as_str(self.heap, interns)) {
                (Some(a), Some(b)) => a.cmp(b),
                _ => {
                    let symbol = compare_symbol(op);
                    return Err(RunError::type_error_compare(
                        symbol,
                        &left.type_name(self.heap, &self.program.interns),
                        &right.type_name(self.heap, &self.program.interns),
                    ));
                }
            }
        };
        let result = match op {
            Opcode::CompareLt => ordering.is_lt(),
            Opcode::CompareLe => ordering.is_le(),
            Opcode::CompareGt => ordering.is_gt(),
            _ => ordering.is_ge(),
        };
        Ok(Value::Bool(result))
    }

    fn binary_type_error(&self, symbol: &str, left: Value, right: Value) -> RunError {
        RunError::type_error_binary(
            symbol,
            &left.type_name(self.heap, &self.program.interns),
            &right.type_name(self.heap, &self.program.interns),
        )
    }
}

fn compare_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::CompareLt => "<",
        Opcode::CompareLe => "<=",
        Opcode::CompareGt => ">",
        _ => ">=",
    }
}

/// Floor division: `-7 // 2 == -4`.
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q }
}

/// Floored modulo: the result has the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_div_rounds_toward_negative_infinity() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
    }

    #[test]
    fn floor_mod_takes_divisor_sign() {
        assert_eq!(floor_mod(7, 3), 1);
        assert_eq!(floor_mod(-7, 3), 2);
        assert_eq!(floor_mod(7, -3), -2);
        assert_eq!(floor_mod(-7, -3), -1);
    }
}
