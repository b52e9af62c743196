//! The execution unit: one method per primitive operation.
//!
//! Every operation is vectorized. The element count is taken from the output
//! operand (1 for scalars) and each operand's own offset is honored
//! independently, so an operation can read from and write into arbitrary
//! windows of shared buffers. Elements outside the written window are never
//! touched.

mod kernels;

use std::rc::Rc;

use vireo_core::{EngineError, ErrorKind, ValueKind};

use crate::memory::container::Buffer;
use crate::memory::{ContainerRef, ValueContainer};

/// Executes the operation of each instruction, as dispatched by the dispatch
/// unit.
#[derive(Debug, Default)]
pub struct ExecutionUnit;

fn int64_parts(c: &ContainerRef, n: usize) -> Result<(Buffer<i64>, usize), EngineError> {
    let c = c.borrow();
    let buffer = c.int64_buffer()?;
    c.check_window(n)?;
    Ok((buffer, c.offset()))
}

fn float64_parts(c: &ContainerRef, n: usize) -> Result<(Buffer<f64>, usize), EngineError> {
    let c = c.borrow();
    let buffer = c.float64_buffer()?;
    c.check_window(n)?;
    Ok((buffer, c.offset()))
}

fn bool_parts(c: &ContainerRef, n: usize) -> Result<(Buffer<bool>, usize), EngineError> {
    let c = c.borrow();
    let buffer = c.bool_buffer()?;
    c.check_window(n)?;
    Ok((buffer, c.offset()))
}

fn text_parts(c: &ContainerRef, n: usize) -> Result<(Buffer<String>, usize), EngineError> {
    let c = c.borrow();
    let buffer = c.text_buffer()?;
    c.check_window(n)?;
    Ok((buffer, c.offset()))
}

fn expect_kind(container: &ValueContainer, kind: ValueKind) -> Result<(), EngineError> {
    if !container.has_data() {
        return Err(ErrorKind::EmptyOperand.into());
    }
    if container.kind() != kind {
        return Err(ErrorKind::OperandTypeMismatch {
            expected: kind,
            actual: container.kind(),
        }
        .into());
    }
    Ok(())
}

fn unsupported(kind: ValueKind) -> EngineError {
    ErrorKind::UnsupportedOperandType { kind }.into()
}

impl ExecutionUnit {
    pub fn new() -> Self {
        ExecutionUnit
    }

    // ---- arithmetic ----

    pub fn add(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = int64_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x.wrapping_add(*y));
            }
            ValueKind::Float64 => {
                let (ob, oo) = float64_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x + y);
            }
            ValueKind::Text => {
                let (ob, oo) = text_parts(out, n)?;
                let (ab, ao) = text_parts(a, n)?;
                let (bb, bo) = text_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| {
                    let mut joined = x.clone();
                    joined.push_str(y);
                    joined
                });
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    pub fn sub(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = int64_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x.wrapping_sub(*y));
            }
            ValueKind::Float64 => {
                let (ob, oo) = float64_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x - y);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    pub fn mul(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = int64_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x.wrapping_mul(*y));
            }
            ValueKind::Float64 => {
                let (ob, oo) = float64_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x * y);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    pub fn div(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = int64_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                check_no_zero(&bb, bo, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x.wrapping_div(*y));
            }
            ValueKind::Float64 => {
                let (ob, oo) = float64_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x / y);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    pub fn rem(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = int64_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                check_no_zero(&bb, bo, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x.wrapping_rem(*y));
            }
            ValueKind::Float64 => {
                let (ob, oo) = float64_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x % y);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    pub fn neg(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = int64_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                kernels::unary(&ob, oo, &ab, ao, n, |x| x.wrapping_neg());
            }
            ValueKind::Float64 => {
                let (ob, oo) = float64_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                kernels::unary(&ob, oo, &ab, ao, n, |x| -x);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    // ---- comparison (the output is always bool) ----

    pub fn eq(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x == y);
            }
            ValueKind::Float64 => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x == y);
            }
            ValueKind::Bool => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = bool_parts(a, n)?;
                let (bb, bo) = bool_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x == y);
            }
            ValueKind::Text => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = text_parts(a, n)?;
                let (bb, bo) = text_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x == y);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    pub fn neq(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x != y);
            }
            ValueKind::Float64 => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x != y);
            }
            ValueKind::Bool => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = bool_parts(a, n)?;
                let (bb, bo) = bool_parts(b, n)?;
                kernels::binary(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x != y);
            }
            ValueKind::Text => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = text_parts(a, n)?;
                let (bb, bo) = text_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, |x, y| x != y);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    pub fn geq(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        self.ordering(kind, out, a, b, |x, y| x >= y, |x, y| x >= y)
    }

    pub fn leq(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        self.ordering(kind, out, a, b, |x, y| x <= y, |x, y| x <= y)
    }

    pub fn gt(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        self.ordering(kind, out, a, b, |x, y| x > y, |x, y| x > y)
    }

    pub fn lt(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        self.ordering(kind, out, a, b, |x, y| x < y, |x, y| x < y)
    }

    /// Ordering comparisons are numeric-only.
    fn ordering(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
        int_op: impl Fn(&i64, &i64) -> bool,
        float_op: impl Fn(&f64, &f64) -> bool,
    ) -> Result<(), EngineError> {
        let n = out.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = int64_parts(a, n)?;
                let (bb, bo) = int64_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, int_op);
            }
            ValueKind::Float64 => {
                let (ob, oo) = bool_parts(out, n)?;
                let (ab, ao) = float64_parts(a, n)?;
                let (bb, bo) = float64_parts(b, n)?;
                kernels::compare(&ob, oo, &ab, ao, &bb, bo, n, float_op);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    // ---- logical (bool only) ----

    /// Vector logical AND with short-circuit evaluation: the left operand is
    /// copied into the output first; if every element of it is false, the
    /// result is the left operand verbatim and the right operand is never
    /// read. The right operand's container may not even have been computed
    /// yet when the script-level `&&` short-circuits.
    pub fn and(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        if kind != ValueKind::Bool {
            return Err(unsupported(kind));
        }
        let n = out.borrow().size();
        let (ob, oo) = bool_parts(out, n)?;
        let (ab, ao) = bool_parts(a, n)?;

        let mut all_left_false = true;
        if Rc::ptr_eq(&ob, &ab) {
            let mut buf = ob.borrow_mut();
            for i in 0..n {
                let value = buf[ao + i];
                buf[oo + i] = value;
                all_left_false &= !value;
            }
        } else {
            let mut out_buf = ob.borrow_mut();
            let a_buf = ab.borrow();
            for i in 0..n {
                let value = a_buf[ao + i];
                out_buf[oo + i] = value;
                all_left_false &= !value;
            }
        }
        if all_left_false {
            return Ok(());
        }

        let (bb, bo) = bool_parts(b, n)?;
        kernels::binary(&ob, oo, &ob, oo, &bb, bo, n, |x, y| *x && *y);
        Ok(())
    }

    /// Vector logical OR, the dual of [`ExecutionUnit::and`]: the right
    /// operand is skipped only when every element of the left operand is
    /// true.
    pub fn or(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
        b: &ContainerRef,
    ) -> Result<(), EngineError> {
        if kind != ValueKind::Bool {
            return Err(unsupported(kind));
        }
        let n = out.borrow().size();
        let (ob, oo) = bool_parts(out, n)?;
        let (ab, ao) = bool_parts(a, n)?;

        let mut all_left_true = true;
        if Rc::ptr_eq(&ob, &ab) {
            let mut buf = ob.borrow_mut();
            for i in 0..n {
                let value = buf[ao + i];
                buf[oo + i] = value;
                all_left_true &= value;
            }
        } else {
            let mut out_buf = ob.borrow_mut();
            let a_buf = ab.borrow();
            for i in 0..n {
                let value = a_buf[ao + i];
                out_buf[oo + i] = value;
                all_left_true &= value;
            }
        }
        if all_left_true {
            return Ok(());
        }

        let (bb, bo) = bool_parts(b, n)?;
        kernels::binary(&ob, oo, &ob, oo, &bb, bo, n, |x, y| *x || *y);
        Ok(())
    }

    pub fn not(
        &self,
        kind: ValueKind,
        out: &ContainerRef,
        a: &ContainerRef,
    ) -> Result<(), EngineError> {
        if kind != ValueKind::Bool {
            return Err(unsupported(kind));
        }
        let n = out.borrow().size();
        let (ob, oo) = bool_parts(out, n)?;
        let (ab, ao) = bool_parts(a, n)?;
        kernels::unary(&ob, oo, &ab, ao, n, |x| !x);
        Ok(())
    }

    // ---- allocation ----

    pub fn alloc_scalar(&self, kind: ValueKind, target: &ContainerRef) -> Result<(), EngineError> {
        target.borrow_mut().allocate(kind, 1, &[])
    }

    /// Array allocation: each operand supplies one dimension's length, so
    /// the rank is the number of length operands and the element count is
    /// their product.
    pub fn alloc_vector(
        &self,
        kind: ValueKind,
        target: &ContainerRef,
        length_operands: &[ContainerRef],
    ) -> Result<(), EngineError> {
        let mut lengths = Vec::with_capacity(length_operands.len());
        let mut count = 1usize;
        for operand in length_operands {
            let value = operand.borrow().get_int64_scalar()?;
            let length = usize::try_from(value)
                .map_err(|_| ErrorKind::InvalidArrayLength { length: value })?;
            count = count
                .checked_mul(length)
                .ok_or(ErrorKind::InvalidArrayLength { length: value })?;
            lengths.push(length);
        }
        target.borrow_mut().allocate(kind, count, &lengths)
    }

    /// Allocation sized from a reference container's rank and lengths.
    pub fn alloc_same_lengths(
        &self,
        kind: ValueKind,
        target: &ContainerRef,
        reference: &ContainerRef,
    ) -> Result<(), EngineError> {
        let (count, lengths) = {
            let reference = reference.borrow();
            (reference.size(), reference.lengths().to_vec())
        };
        target.borrow_mut().allocate(kind, count, &lengths)
    }

    // ---- transfer ----

    /// Value copy. Element counts must match; the one catchable case is an
    /// oversized array assigned into a rank-0 destination.
    pub fn mov(
        &self,
        kind: ValueKind,
        dest: &ContainerRef,
        src: &ContainerRef,
    ) -> Result<(), EngineError> {
        let (dest_size, dest_rank) = {
            let dest = dest.borrow();
            (dest.size(), dest.rank())
        };
        let src_size = src.borrow().size();
        if dest_size != src_size {
            if dest_rank == 0 && src_size != 1 {
                return Err(ErrorKind::ArrayTooLargeForScalar { size: src_size }.into());
            }
            return Err(ErrorKind::OperandSizeMismatch {
                expected: dest_size,
                actual: src_size,
            }
            .into());
        }

        let n = dest_size;
        match kind {
            ValueKind::Int64 => {
                let (db, doff) = int64_parts(dest, n)?;
                let (sb, soff) = int64_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            ValueKind::Float64 => {
                let (db, doff) = float64_parts(dest, n)?;
                let (sb, soff) = float64_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            ValueKind::Bool => {
                let (db, doff) = bool_parts(dest, n)?;
                let (sb, soff) = bool_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            ValueKind::Text => {
                let (db, doff) = text_parts(dest, n)?;
                let (sb, soff) = text_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    /// Reference-assign: pure aliasing. The destination's prior contents are
    /// not type-checked, since it may still be unallocated; the source must
    /// already hold data of the declared kind.
    pub fn ref_assign(
        &self,
        kind: ValueKind,
        dest: &ContainerRef,
        src: &ContainerRef,
    ) -> Result<(), EngineError> {
        expect_kind(&src.borrow(), kind)?;
        if Rc::ptr_eq(dest, src) {
            return Ok(());
        }
        let src = src.borrow();
        dest.borrow_mut().refer_to(&src);
        Ok(())
    }

    /// Broadcast one scalar into every element of the destination.
    pub fn fill(
        &self,
        kind: ValueKind,
        dest: &ContainerRef,
        src: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = dest.borrow().size();
        match kind {
            ValueKind::Int64 => {
                let value = src.borrow().get_int64_scalar()?;
                let (db, doff) = int64_parts(dest, n)?;
                kernels::fill(&db, doff, n, value);
            }
            ValueKind::Float64 => {
                let value = src.borrow().get_float64_scalar()?;
                let (db, doff) = float64_parts(dest, n)?;
                kernels::fill(&db, doff, n, value);
            }
            ValueKind::Bool => {
                let value = src.borrow().get_bool_scalar()?;
                let (db, doff) = bool_parts(dest, n)?;
                kernels::fill(&db, doff, n, value);
            }
            ValueKind::Text => {
                let value = src.borrow().get_text_scalar()?;
                let (db, doff) = text_parts(dest, n)?;
                kernels::fill(&db, doff, n, value);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    // ---- array element access ----

    /// Copies one element out of `src` at the given multi-dimensional index.
    /// Later mutation of the destination does not affect the source array.
    pub fn movelm(
        &self,
        kind: ValueKind,
        dest: &ContainerRef,
        src: &ContainerRef,
        indices: &[ContainerRef],
    ) -> Result<(), EngineError> {
        let flat = flatten_index("MOVELM", src, indices)?;
        src.borrow().check_window(flat + 1)?;
        match kind {
            ValueKind::Int64 => {
                let (db, doff) = int64_parts(dest, 1)?;
                let (sb, soff) = int64_parts(src, 1)?;
                kernels::copy(&db, doff, &sb, soff + flat, 1);
            }
            ValueKind::Float64 => {
                let (db, doff) = float64_parts(dest, 1)?;
                let (sb, soff) = float64_parts(src, 1)?;
                kernels::copy(&db, doff, &sb, soff + flat, 1);
            }
            ValueKind::Bool => {
                let (db, doff) = bool_parts(dest, 1)?;
                let (sb, soff) = bool_parts(src, 1)?;
                kernels::copy(&db, doff, &sb, soff + flat, 1);
            }
            ValueKind::Text => {
                let (db, doff) = text_parts(dest, 1)?;
                let (sb, soff) = text_parts(src, 1)?;
                kernels::copy(&db, doff, &sb, soff + flat, 1);
            }
            _ => return Err(unsupported(kind)),
        }
        Ok(())
    }

    /// Makes `dest` an aliasing scalar view of the element of `src` at the
    /// given multi-dimensional index. Later mutation through the view
    /// propagates back into the source array.
    pub fn refelm(
        &self,
        kind: ValueKind,
        dest: &ContainerRef,
        src: &ContainerRef,
        indices: &[ContainerRef],
    ) -> Result<(), EngineError> {
        let flat = flatten_index("REFELM", src, indices)?;
        {
            let src = src.borrow();
            expect_kind(&src, kind)?;
            src.check_window(flat + 1)?;
        }
        let snapshot = src.borrow().clone();
        dest.borrow_mut().refer_to_element(&snapshot, flat);
        Ok(())
    }

    // ---- cast ----

    pub fn cast(
        &self,
        dest_kind: ValueKind,
        src_kind: ValueKind,
        dest: &ContainerRef,
        src: &ContainerRef,
    ) -> Result<(), EngineError> {
        let n = dest.borrow().size();
        let failed_type = || ErrorKind::CastFailedByType {
            from: src_kind,
            to: dest_kind,
        };

        match (dest_kind, src_kind) {
            (ValueKind::Int64, ValueKind::Int64) => {
                let (db, doff) = int64_parts(dest, n)?;
                let (sb, soff) = int64_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            (ValueKind::Int64, ValueKind::Float64) => {
                let (db, doff) = int64_parts(dest, n)?;
                let (sb, soff) = float64_parts(src, n)?;
                kernels::convert(&db, doff, &sb, soff, n, |x| Ok::<_, EngineError>(*x as i64))?;
            }
            (ValueKind::Int64, ValueKind::Text) => {
                let (db, doff) = int64_parts(dest, n)?;
                let (sb, soff) = text_parts(src, n)?;
                // Text that spells a float but is cast to int goes through a
                // float parse truncated toward zero.
                kernels::convert(&db, doff, &sb, soff, n, |text| {
                    text.parse::<i64>()
                        .or_else(|_| text.parse::<f64>().map(|value| value as i64))
                        .map_err(|_| {
                            EngineError::from(ErrorKind::CastFailedByValue {
                                value: text.clone(),
                                to: ValueKind::Int64,
                            })
                        })
                })?;
            }
            (ValueKind::Float64, ValueKind::Int64) => {
                let (db, doff) = float64_parts(dest, n)?;
                let (sb, soff) = int64_parts(src, n)?;
                kernels::convert(&db, doff, &sb, soff, n, |x| Ok::<_, EngineError>(*x as f64))?;
            }
            (ValueKind::Float64, ValueKind::Float64) => {
                let (db, doff) = float64_parts(dest, n)?;
                let (sb, soff) = float64_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            (ValueKind::Float64, ValueKind::Text) => {
                let (db, doff) = float64_parts(dest, n)?;
                let (sb, soff) = text_parts(src, n)?;
                kernels::convert(&db, doff, &sb, soff, n, |text| {
                    text.parse::<f64>().map_err(|_| {
                        EngineError::from(ErrorKind::CastFailedByValue {
                            value: text.clone(),
                            to: ValueKind::Float64,
                        })
                    })
                })?;
            }
            (ValueKind::Bool, ValueKind::Bool) => {
                let (db, doff) = bool_parts(dest, n)?;
                let (sb, soff) = bool_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            (ValueKind::Bool, ValueKind::Text) => {
                let (db, doff) = bool_parts(dest, n)?;
                let (sb, soff) = text_parts(src, n)?;
                // Only the literal tokens are accepted.
                kernels::convert(&db, doff, &sb, soff, n, |text| match text.as_str() {
                    "true" => Ok(true),
                    "false" => Ok(false),
                    _ => Err(EngineError::from(ErrorKind::CastFailedByValue {
                        value: text.clone(),
                        to: ValueKind::Bool,
                    })),
                })?;
            }
            (ValueKind::Text, ValueKind::Int64) => {
                let (db, doff) = text_parts(dest, n)?;
                let (sb, soff) = int64_parts(src, n)?;
                kernels::convert(&db, doff, &sb, soff, n, |x| {
                    Ok::<_, EngineError>(x.to_string())
                })?;
            }
            (ValueKind::Text, ValueKind::Float64) => {
                let (db, doff) = text_parts(dest, n)?;
                let (sb, soff) = float64_parts(src, n)?;
                kernels::convert(&db, doff, &sb, soff, n, |x| {
                    Ok::<_, EngineError>(x.to_string())
                })?;
            }
            (ValueKind::Text, ValueKind::Bool) => {
                let (db, doff) = text_parts(dest, n)?;
                let (sb, soff) = bool_parts(src, n)?;
                kernels::convert(&db, doff, &sb, soff, n, |x| {
                    Ok::<_, EngineError>(x.to_string())
                })?;
            }
            (ValueKind::Text, ValueKind::Text) => {
                let (db, doff) = text_parts(dest, n)?;
                let (sb, soff) = text_parts(src, n)?;
                kernels::copy(&db, doff, &sb, soff, n);
            }
            _ => return Err(failed_type().into()),
        }
        Ok(())
    }
}

fn check_no_zero(buffer: &Buffer<i64>, offset: usize, n: usize) -> Result<(), EngineError> {
    if buffer.borrow()[offset..offset + n].contains(&0) {
        return Err(ErrorKind::DivisionByZero.into());
    }
    Ok(())
}

/// Flattens multi-dimensional index operands into a single element offset
/// with row-major scaling: the last index operand varies fastest. Every
/// index is bounds-checked against its dimension's declared length.
fn flatten_index(
    opcode: &str,
    src: &ContainerRef,
    indices: &[ContainerRef],
) -> Result<usize, EngineError> {
    let lengths = src.borrow().lengths().to_vec();
    if indices.len() != lengths.len() {
        return Err(ErrorKind::OperandCountMismatch {
            opcode: opcode.to_string(),
            expected: lengths.len() + 2,
            actual: indices.len() + 2,
        }
        .into());
    }

    let mut flat = 0usize;
    let mut scale = 1usize;
    for dim in (0..lengths.len()).rev() {
        let index = indices[dim].borrow().get_int64_scalar()?;
        let length = lengths[dim];
        if index < 0 || index as usize >= length {
            return Err(ErrorKind::InvalidArrayIndex {
                index,
                upper: length as i64 - 1,
            }
            .into());
        }
        flat += (index as usize) * scale;
        scale *= length;
    }
    Ok(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::container_ref;

    fn int_array(values: &[i64]) -> ContainerRef {
        container_ref(ValueContainer::int64_array(values, &[values.len()]))
    }

    fn int_scalar(value: i64) -> ContainerRef {
        container_ref(ValueContainer::int64_scalar(value))
    }

    #[test]
    fn add_is_elementwise() {
        let exec = ExecutionUnit::new();
        let out = int_array(&[-1, -1, -1]);
        let a = int_array(&[1, 2, 3]);
        let b = int_array(&[4, 5, 6]);
        exec.add(ValueKind::Int64, &out, &a, &b).unwrap();
        assert_eq!(*out.borrow().int64_buffer().unwrap().borrow(), vec![5, 7, 9]);
    }

    #[test]
    fn offsets_are_independent_and_sentinels_survive() {
        let exec = ExecutionUnit::new();
        // out and a are element views at different offsets of different
        // buffers; b is a plain scalar.
        let out_backing = container_ref(ValueContainer::int64_array(&[9, 9, 9, 9], &[4]));
        let out = container_ref(ValueContainer::new());
        out.borrow_mut()
            .refer_to_element(&out_backing.borrow().clone(), 1);

        let a_backing = container_ref(ValueContainer::int64_array(&[0, 10, 20], &[3]));
        let a = container_ref(ValueContainer::new());
        a.borrow_mut()
            .refer_to_element(&a_backing.borrow().clone(), 2);

        exec.add(ValueKind::Int64, &out, &a, &int_scalar(5)).unwrap();
        // Only index 1 of out's backing buffer changes; the sentinels around
        // the written window survive.
        assert_eq!(
            *out_backing.borrow().int64_buffer().unwrap().borrow(),
            vec![9, 25, 9, 9]
        );
    }

    #[test]
    fn text_add_concatenates() {
        let exec = ExecutionUnit::new();
        let out = container_ref(ValueContainer::text_array(&["", ""], &[2]));
        let a = container_ref(ValueContainer::text_array(&["ab", "cd"], &[2]));
        let b = container_ref(ValueContainer::text_array(&["XY", "ZW"], &[2]));
        exec.add(ValueKind::Text, &out, &a, &b).unwrap();
        assert_eq!(
            *out.borrow().text_buffer().unwrap().borrow(),
            vec!["abXY".to_string(), "cdZW".to_string()]
        );
    }

    #[test]
    fn integer_arithmetic_wraps() {
        let exec = ExecutionUnit::new();
        let out = int_scalar(0);
        let a = int_scalar(i64::MAX);
        let b = int_scalar(1);
        exec.add(ValueKind::Int64, &out, &a, &b).unwrap();
        assert_eq!(out.borrow().get_int64_scalar().unwrap(), i64::MIN);
    }

    #[test]
    fn integer_division_by_zero_is_a_defect() {
        let exec = ExecutionUnit::new();
        let out = int_scalar(0);
        let err = exec
            .div(ValueKind::Int64, &out, &int_scalar(1), &int_scalar(0))
            .unwrap_err();
        assert!(err.is_defect());
        assert!(matches!(err.kind, ErrorKind::DivisionByZero));
    }

    #[test]
    fn subtract_on_text_is_unsupported() {
        let exec = ExecutionUnit::new();
        let out = container_ref(ValueContainer::text_scalar(""));
        let a = container_ref(ValueContainer::text_scalar("a"));
        let b = container_ref(ValueContainer::text_scalar("b"));
        let err = exec.sub(ValueKind::Text, &out, &a, &b).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedOperandType { .. }));
    }

    #[test]
    fn comparisons_write_bool_output() {
        let exec = ExecutionUnit::new();
        let out = container_ref(ValueContainer::bool_array(&[false; 3], &[3]));
        let a = int_array(&[1, 5, 3]);
        let b = int_array(&[1, 2, 9]);
        exec.eq(ValueKind::Int64, &out, &a, &b).unwrap();
        assert_eq!(
            *out.borrow().bool_buffer().unwrap().borrow(),
            vec![true, false, false]
        );
        exec.lt(ValueKind::Int64, &out, &a, &b).unwrap();
        assert_eq!(
            *out.borrow().bool_buffer().unwrap().borrow(),
            vec![false, false, true]
        );
    }

    #[test]
    fn and_short_circuits_when_every_left_element_is_false() {
        let exec = ExecutionUnit::new();
        let out = container_ref(ValueContainer::bool_array(&[true, true], &[2]));
        let a = container_ref(ValueContainer::bool_array(&[false, false], &[2]));
        // The right operand is deliberately unallocated: it must not be read.
        let b = container_ref(ValueContainer::new());
        exec.and(ValueKind::Bool, &out, &a, &b).unwrap();
        assert_eq!(
            *out.borrow().bool_buffer().unwrap().borrow(),
            vec![false, false]
        );
    }

    #[test]
    fn and_reads_right_operand_when_any_left_element_is_true() {
        let exec = ExecutionUnit::new();
        let out = container_ref(ValueContainer::bool_array(&[false, false], &[2]));
        let a = container_ref(ValueContainer::bool_array(&[true, false], &[2]));
        let b = container_ref(ValueContainer::bool_array(&[true, true], &[2]));
        exec.and(ValueKind::Bool, &out, &a, &b).unwrap();
        assert_eq!(
            *out.borrow().bool_buffer().unwrap().borrow(),
            vec![true, false]
        );
    }

    #[test]
    fn or_short_circuits_when_every_left_element_is_true() {
        let exec = ExecutionUnit::new();
        let out = container_ref(ValueContainer::bool_array(&[false, false], &[2]));
        let a = container_ref(ValueContainer::bool_array(&[true, true], &[2]));
        let b = container_ref(ValueContainer::new());
        exec.or(ValueKind::Bool, &out, &a, &b).unwrap();
        assert_eq!(
            *out.borrow().bool_buffer().unwrap().borrow(),
            vec![true, true]
        );
    }

    #[test]
    fn mov_of_oversized_array_into_scalar_is_catchable() {
        let exec = ExecutionUnit::new();
        let dest = int_scalar(0);
        let src = int_array(&[1, 2, 3]);
        let err = exec.mov(ValueKind::Int64, &dest, &src).unwrap_err();
        assert!(!err.is_defect());
        assert!(matches!(
            err.kind,
            ErrorKind::ArrayTooLargeForScalar { size: 3 }
        ));
    }

    #[test]
    fn mov_copies_without_aliasing() {
        let exec = ExecutionUnit::new();
        let dest = int_array(&[0, 0]);
        let src = int_array(&[7, 8]);
        exec.mov(ValueKind::Int64, &dest, &src).unwrap();
        src.borrow().int64_buffer().unwrap().borrow_mut()[0] = 99;
        assert_eq!(*dest.borrow().int64_buffer().unwrap().borrow(), vec![7, 8]);
    }

    #[test]
    fn ref_assign_aliases_the_buffer() {
        let exec = ExecutionUnit::new();
        let dest = container_ref(ValueContainer::new());
        let src = int_array(&[7, 8]);
        exec.ref_assign(ValueKind::Int64, &dest, &src).unwrap();
        assert!(dest.borrow().shares_buffer_with(&src.borrow()));
        dest.borrow().int64_buffer().unwrap().borrow_mut()[1] = -1;
        assert_eq!(*src.borrow().int64_buffer().unwrap().borrow(), vec![7, -1]);
    }

    #[test]
    fn alloc_vector_multiplies_lengths() {
        let exec = ExecutionUnit::new();
        let target = container_ref(ValueContainer::new());
        exec.alloc_vector(
            ValueKind::Float64,
            &target,
            &[int_scalar(2), int_scalar(3)],
        )
        .unwrap();
        let target = target.borrow();
        assert_eq!(target.size(), 6);
        assert_eq!(target.lengths(), &[2, 3]);
        assert_eq!(target.rank(), 2);
    }

    #[test]
    fn alloc_vector_rejects_negative_lengths() {
        let exec = ExecutionUnit::new();
        let target = container_ref(ValueContainer::new());
        let err = exec
            .alloc_vector(ValueKind::Int64, &target, &[int_scalar(-4)])
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::InvalidArrayLength { length: -4 }
        ));
    }

    #[test]
    fn alloc_same_lengths_copies_shape_from_stack_style_reference() {
        let exec = ExecutionUnit::new();
        let reference = container_ref(ValueContainer::int64_array(&[0; 6], &[2, 3]));
        let target = container_ref(ValueContainer::new());
        exec.alloc_same_lengths(ValueKind::Bool, &target, &reference)
            .unwrap();
        let target = target.borrow();
        assert_eq!(target.lengths(), &[2, 3]);
        assert_eq!(target.kind(), ValueKind::Bool);
    }

    #[test]
    fn fill_broadcasts_a_scalar() {
        let exec = ExecutionUnit::new();
        let dest = int_array(&[0, 0, 0]);
        exec.fill(ValueKind::Int64, &dest, &int_scalar(7)).unwrap();
        assert_eq!(
            *dest.borrow().int64_buffer().unwrap().borrow(),
            vec![7, 7, 7]
        );
    }

    #[test]
    fn movelm_copies_and_refelm_aliases() {
        let exec = ExecutionUnit::new();
        let src = int_array(&[10, 20, 30]);

        let copied = int_scalar(0);
        exec.movelm(ValueKind::Int64, &copied, &src, &[int_scalar(1)])
            .unwrap();
        assert_eq!(copied.borrow().get_int64_scalar().unwrap(), 20);
        copied.borrow_mut().set_int64_scalar(-1).unwrap();
        // The copy does not propagate back.
        assert_eq!(
            *src.borrow().int64_buffer().unwrap().borrow(),
            vec![10, 20, 30]
        );

        let view = container_ref(ValueContainer::new());
        exec.refelm(ValueKind::Int64, &view, &src, &[int_scalar(1)])
            .unwrap();
        view.borrow_mut().set_int64_scalar(-1).unwrap();
        // The view does propagate back.
        assert_eq!(
            *src.borrow().int64_buffer().unwrap().borrow(),
            vec![10, -1, 30]
        );
    }

    #[test]
    fn element_access_flattens_row_major_last_index_fastest() {
        let exec = ExecutionUnit::new();
        let values: Vec<i64> = (0..24).collect();
        let src = container_ref(ValueContainer::int64_array(&values, &[2, 3, 4]));
        let view = container_ref(ValueContainer::new());
        exec.refelm(
            ValueKind::Int64,
            &view,
            &src,
            &[int_scalar(1), int_scalar(0), int_scalar(2)],
        )
        .unwrap();
        // 1*(3*4) + 0*4 + 2 = 14
        assert_eq!(view.borrow().get_int64_scalar().unwrap(), 14);

        view.borrow_mut().set_int64_scalar(-7).unwrap();
        assert_eq!(src.borrow().int64_buffer().unwrap().borrow()[14], -7);
    }

    #[test]
    fn out_of_range_index_is_catchable() {
        let exec = ExecutionUnit::new();
        let src = int_array(&[1, 2, 3]);
        let dest = int_scalar(0);
        let err = exec
            .movelm(ValueKind::Int64, &dest, &src, &[int_scalar(3)])
            .unwrap_err();
        assert!(!err.is_defect());
        assert!(matches!(
            err.kind,
            ErrorKind::InvalidArrayIndex { index: 3, upper: 2 }
        ));
    }

    #[test]
    fn cast_int_text_round_trip() {
        let exec = ExecutionUnit::new();
        let text = container_ref(ValueContainer::text_scalar(""));
        exec.cast(ValueKind::Text, ValueKind::Int64, &text, &int_scalar(-42))
            .unwrap();
        assert_eq!(text.borrow().get_text_scalar().unwrap(), "-42");

        let back = int_scalar(0);
        exec.cast(ValueKind::Int64, ValueKind::Text, &back, &text)
            .unwrap();
        assert_eq!(back.borrow().get_int64_scalar().unwrap(), -42);
    }

    #[test]
    fn cast_float_text_round_trip() {
        let exec = ExecutionUnit::new();
        let text = container_ref(ValueContainer::text_scalar(""));
        let value = container_ref(ValueContainer::float64_scalar(1.5));
        exec.cast(ValueKind::Text, ValueKind::Float64, &text, &value)
            .unwrap();
        assert_eq!(text.borrow().get_text_scalar().unwrap(), "1.5");

        let back = container_ref(ValueContainer::float64_scalar(0.0));
        exec.cast(ValueKind::Float64, ValueKind::Text, &back, &text)
            .unwrap();
        assert_eq!(back.borrow().get_float64_scalar().unwrap(), 1.5);
    }

    #[test]
    fn cast_int_from_float_looking_text_truncates_toward_zero() {
        let exec = ExecutionUnit::new();
        let text = container_ref(ValueContainer::text_scalar("-123.75"));
        let out = int_scalar(0);
        exec.cast(ValueKind::Int64, ValueKind::Text, &out, &text)
            .unwrap();
        assert_eq!(out.borrow().get_int64_scalar().unwrap(), -123);
    }

    #[test]
    fn cast_failures_carry_the_right_kind() {
        let exec = ExecutionUnit::new();
        let out = int_scalar(0);
        let bad = container_ref(ValueContainer::text_scalar("not a number"));
        let err = exec
            .cast(ValueKind::Int64, ValueKind::Text, &out, &bad)
            .unwrap_err();
        assert!(!err.is_defect());
        assert!(matches!(err.kind, ErrorKind::CastFailedByValue { .. }));

        let bool_out = container_ref(ValueContainer::bool_scalar(false));
        let err = exec
            .cast(ValueKind::Bool, ValueKind::Int64, &bool_out, &out)
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CastFailedByType { .. }));
    }

    #[test]
    fn cast_bool_text_accepts_only_literal_tokens() {
        let exec = ExecutionUnit::new();
        let out = container_ref(ValueContainer::bool_scalar(false));
        let text = container_ref(ValueContainer::text_scalar("true"));
        exec.cast(ValueKind::Bool, ValueKind::Text, &out, &text)
            .unwrap();
        assert!(out.borrow().get_bool_scalar().unwrap());

        let bad = container_ref(ValueContainer::text_scalar("TRUE"));
        let err = exec
            .cast(ValueKind::Bool, ValueKind::Text, &out, &bad)
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CastFailedByValue { .. }));
    }

    #[test]
    fn in_place_update_through_element_view() {
        // The compiled pattern for a[i] = a[i] + 1: the output and one input
        // are the same element view into the array's buffer.
        let exec = ExecutionUnit::new();
        let array = int_array(&[5, 6, 7]);
        let view = container_ref(ValueContainer::new());
        exec.refelm(ValueKind::Int64, &view, &array, &[int_scalar(2)])
            .unwrap();
        exec.add(ValueKind::Int64, &view, &view, &int_scalar(1))
            .unwrap();
        assert_eq!(
            *array.borrow().int64_buffer().unwrap().borrow(),
            vec![5, 6, 8]
        );
    }
}
