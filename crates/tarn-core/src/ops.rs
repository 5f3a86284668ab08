//! Arithmetic, relational and logical opcode handlers. Binary ops dispatch
//! on the pair of type tags; anything outside the table fails with
//! `Invalid operation on T1 and T2`, which enters the normal throw pathway.

use crate::error::RuntimeError;
use crate::instruction::Instruction;
use crate::value::{Type, Value};
use crate::vm::{Flow, VM};

impl VM {
    fn invalid_op(&self, lh: &Value, rh: &Value) -> RuntimeError {
        self.new_error(format!(
            "Invalid operation on {} and {}",
            lh.type_of(),
            rh.type_of()
        ))
    }

    fn invalid_unary(&self, v: &Value) -> RuntimeError {
        self.new_error(format!("Invalid operation on {}", v.type_of()))
    }

    fn divide_by_zero(&self) -> RuntimeError {
        self.new_error("Attempt to divide by zero")
    }

    /// Concatenate into a fresh string, charging both operand sizes
    /// against the allocation quota before the result exists.
    fn concat(&mut self, lh: &Value, rh: &Value) -> Result<Value, RuntimeError> {
        self.add_allocations(lh.size())?;
        self.add_allocations(rh.size())?;
        Ok(Value::string(format!("{lh}{rh}")))
    }

    pub fn add_values(&mut self, lh: &Value, rh: &Value) -> Result<Value, RuntimeError> {
        match (lh.type_of(), rh.type_of()) {
            (Type::Int, Type::Int) => Ok(Value::Int(lh.to_int().wrapping_add(rh.to_int()))),
            (Type::Int, Type::Float) | (Type::Float, Type::Int) | (Type::Float, Type::Float) => {
                Ok(Value::Float(lh.to_float() + rh.to_float()))
            }
            (Type::Int | Type::Float | Type::Rune, Type::Rune)
            | (Type::Rune, Type::Int) => {
                Ok(Value::rune_from_i64(lh.to_rune().wrapping_add(rh.to_rune())))
            }
            // either side a string makes it a concatenation
            (Type::Int | Type::Float | Type::Rune | Type::Bool | Type::Object, Type::String) => {
                self.concat(lh, rh)
            }
            (Type::String, Type::String | Type::Int | Type::Float | Type::Bool | Type::Rune) => {
                self.concat(lh, rh)
            }
            (Type::String, Type::Null) => Ok(lh.clone()),
            (Type::String, Type::Undefined) => self.concat(lh, rh),
            (Type::String, Type::Object) => self.concat(lh, rh),
            (Type::Null | Type::Undefined, Type::Null | Type::String | Type::Int | Type::Float) => {
                Ok(rh.clone())
            }
            _ => Err(self.invalid_op(lh, rh)),
        }
    }

    pub fn sub_values(&self, lh: &Value, rh: &Value) -> Result<Value, RuntimeError> {
        match (lh.type_of(), rh.type_of()) {
            (Type::Int, Type::Int) => Ok(Value::Int(lh.to_int().wrapping_sub(rh.to_int()))),
            (Type::Int, Type::Float) | (Type::Float, Type::Int) | (Type::Float, Type::Float) => {
                Ok(Value::Float(lh.to_float() - rh.to_float()))
            }
            (Type::Rune, Type::Rune | Type::Int) => {
                Ok(Value::rune_from_i64(lh.to_rune().wrapping_sub(rh.to_rune())))
            }
            (Type::Rune, Type::String) => match single_byte(rh) {
                Some(r) => Ok(Value::rune_from_i64(lh.to_rune().wrapping_sub(r))),
                None => Err(self.invalid_op(lh, rh)),
            },
            // a length-1 string participates through rune coercion
            (Type::String, Type::Rune | Type::Int) => match single_byte(lh) {
                Some(l) => Ok(Value::rune_from_i64(l.wrapping_sub(rh.to_rune()))),
                None => Err(self.invalid_op(lh, rh)),
            },
            (Type::String, Type::String) => match (single_byte(lh), single_byte(rh)) {
                (Some(l), Some(r)) => Ok(Value::rune_from_i64(l.wrapping_sub(r))),
                _ => Err(self.invalid_op(lh, rh)),
            },
            _ => Err(self.invalid_op(lh, rh)),
        }
    }

    pub fn mul_values(&self, lh: &Value, rh: &Value) -> Result<Value, RuntimeError> {
        match (lh.type_of(), rh.type_of()) {
            (Type::Int, Type::Int) => Ok(Value::Int(lh.to_int().wrapping_mul(rh.to_int()))),
            (Type::Int, Type::Float) | (Type::Float, Type::Int) | (Type::Float, Type::Float) => {
                Ok(Value::Float(lh.to_float() * rh.to_float()))
            }
            (Type::Int | Type::Rune, Type::Rune) | (Type::Rune, Type::Int) => {
                Ok(Value::rune_from_i64(lh.to_rune().wrapping_mul(rh.to_rune())))
            }
            _ => Err(self.invalid_op(lh, rh)),
        }
    }

    pub fn div_values(&self, lh: &Value, rh: &Value) -> Result<Value, RuntimeError> {
        if lh.type_of() == Type::Rune || rh.type_of() == Type::Rune {
            if !matches!(lh.type_of(), Type::Int | Type::Rune)
                || !matches!(rh.type_of(), Type::Int | Type::Rune)
            {
                return Err(self.invalid_op(lh, rh));
            }
            let divisor = rh.to_rune();
            if divisor == 0 {
                return Err(self.divide_by_zero());
            }
            return Ok(Value::rune_from_i64(lh.to_rune() / divisor));
        }
        if !matches!(lh.type_of(), Type::Int | Type::Float)
            || !matches!(rh.type_of(), Type::Int | Type::Float)
        {
            return Err(self.invalid_op(lh, rh));
        }
        let divisor = rh.to_float();
        if divisor == 0.0 {
            return Err(self.divide_by_zero());
        }
        Ok(Value::Float(lh.to_float() / divisor))
    }

    pub fn mod_values(&self, lh: &Value, rh: &Value) -> Result<Value, RuntimeError> {
        match (lh.type_of(), rh.type_of()) {
            (Type::Int, Type::Int) => {
                let divisor = rh.to_int();
                if divisor == 0 {
                    return Err(self.divide_by_zero());
                }
                Ok(Value::Int(lh.to_int().wrapping_rem(divisor)))
            }
            (Type::Rune, Type::Rune | Type::Int) => {
                let divisor = rh.to_rune();
                if divisor == 0 {
                    return Err(self.divide_by_zero());
                }
                Ok(Value::rune_from_i64(lh.to_rune() % divisor))
            }
            _ => Err(self.invalid_op(lh, rh)),
        }
    }

    pub fn less_than(&self, lh: &Value, rh: &Value) -> Result<bool, RuntimeError> {
        match (lh.type_of(), rh.type_of()) {
            (Type::Int, Type::Int) => Ok(lh.to_int() < rh.to_int()),
            (Type::Int | Type::Float, Type::Int | Type::Float) => {
                Ok(lh.to_float() < rh.to_float())
            }
            // null compares as 0 against numerics, and sorts before strings
            (Type::Int | Type::Float, Type::Null) => Ok(lh.to_float() < 0.0),
            (Type::Null, Type::Int | Type::Float) => Ok(0.0 < rh.to_float()),
            (Type::Null, Type::String | Type::Rune) => Ok(true),
            (Type::String, Type::Null) => Ok(false),
            (Type::Rune, Type::Rune | Type::Int) => Ok(lh.to_rune() < rh.to_rune()),
            (Type::Rune, Type::String) => match single_byte(rh) {
                Some(r) => Ok(lh.to_rune() < r),
                None => Err(self.invalid_op(lh, rh)),
            },
            (Type::String, Type::Rune) => match single_byte(lh) {
                Some(l) => Ok(l < rh.to_rune()),
                None => Err(self.invalid_op(lh, rh)),
            },
            (Type::String, Type::String) => {
                Ok(lh.as_str().unwrap_or_default() < rh.as_str().unwrap_or_default())
            }
            _ => Err(self.invalid_op(lh, rh)),
        }
    }

    pub fn less_or_equal(&self, lh: &Value, rh: &Value) -> Result<bool, RuntimeError> {
        match (lh.type_of(), rh.type_of()) {
            (Type::Int, Type::Int) => Ok(lh.to_int() <= rh.to_int()),
            (Type::Int | Type::Float, Type::Int | Type::Float) => {
                Ok(lh.to_float() <= rh.to_float())
            }
            (Type::Rune, Type::Rune | Type::Int) => Ok(lh.to_rune() <= rh.to_rune()),
            (Type::Rune, Type::String) => match single_byte(rh) {
                Some(r) => Ok(lh.to_rune() <= r),
                None => Err(self.invalid_op(lh, rh)),
            },
            (Type::String, Type::Rune) => match single_byte(lh) {
                Some(l) => Ok(l <= rh.to_rune()),
                None => Err(self.invalid_op(lh, rh)),
            },
            (Type::String, Type::String) => {
                Ok(lh.as_str().unwrap_or_default() <= rh.as_str().unwrap_or_default())
            }
            _ => Err(self.invalid_op(lh, rh)),
        }
    }

    // ── Opcode wrappers ───────────────────────────────────────────────

    pub(crate) fn exec_add(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        let out = self.add_values(&lh, &rh)?;
        self.set(i.a, out);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_sub(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        let out = self.sub_values(&lh, &rh)?;
        self.set(i.a, out);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_mul(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        let out = self.mul_values(&lh, &rh)?;
        self.set(i.a, out);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_div(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        let out = self.div_values(&lh, &rh)?;
        self.set(i.a, out);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_mod(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        let out = self.mod_values(&lh, &rh)?;
        self.set(i.a, out);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_int_op(
        &mut self,
        i: &Instruction,
        op: impl Fn(i64, i64) -> i64,
    ) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        match (&lh, &rh) {
            (Value::Int(a), Value::Int(b)) => {
                self.set(i.a, Value::Int(op(*a, *b)));
                Ok(Flow::Next)
            }
            _ => Err(self.invalid_op(&lh, &rh)),
        }
    }

    pub(crate) fn exec_unm(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let v = self.get(i.b);
        let out = match &v {
            Value::Int(n) => Value::Int(n.wrapping_neg()),
            Value::Float(f) => Value::Float(-f),
            other => return Err(self.invalid_unary(other)),
        };
        self.set(i.a, out);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_not(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let v = self.get(i.b);
        self.set(i.a, Value::Bool(!v.is_truthy()));
        Ok(Flow::Next)
    }

    pub(crate) fn exec_bnt(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let v = self.get(i.b);
        match &v {
            Value::Int(n) => {
                self.set(i.a, Value::Int(!n));
                Ok(Flow::Next)
            }
            other => Err(self.invalid_unary(other)),
        }
    }

    /// `inc` / `dec`: in-place on the A operand.
    pub(crate) fn exec_step(&mut self, i: &Instruction, delta: i64) -> Result<Flow, RuntimeError> {
        let v = self.get(i.a);
        let out = match &v {
            Value::Int(n) => Value::Int(n.wrapping_add(delta)),
            Value::Float(f) => Value::Float(f + delta as f64),
            other => return Err(self.invalid_unary(other)),
        };
        self.set(i.a, out);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_lst(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        let out = self.less_than(&lh, &rh)?;
        self.set(i.a, Value::Bool(out));
        Ok(Flow::Next)
    }

    pub(crate) fn exec_lse(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let lh = self.get(i.b);
        let rh = self.get(i.c);
        let out = self.less_or_equal(&lh, &rh)?;
        self.set(i.a, Value::Bool(out));
        Ok(Flow::Next)
    }

    /// `mob`: A receives B, C receives B's truthiness.
    pub(crate) fn exec_mob(&mut self, i: &Instruction) -> Result<Flow, RuntimeError> {
        let v = self.get(i.b);
        let truthy = v.is_truthy();
        self.set(i.a, v);
        self.set(i.c, Value::Bool(truthy));
        Ok(Flow::Next)
    }
}

/// The single byte of a length-1 string, for rune coercion.
fn single_byte(v: &Value) -> Option<i64> {
    let s = v.as_str()?;
    if s.len() == 1 {
        Some(s.as_bytes()[0] as i64)
    } else {
        None
    }
}
