// This module is the execution and verification harness. It turns a CompiledMethod into a typed
// `unsafe extern "C"` function pointer after checking that the requested Rust signature matches
// the method's declared parameter and return types, invokes vector kernels over caller-provided
// lane buffers, and compares the observed lanes against reference values computed in Rust.
// Integer lanes are compared exactly; floating point lanes are compared within an epsilon that
// each caller states explicitly.

//! Typed invocation of compiled methods and lane-wise result checking.

use crate::codegen::{compile_with, CompileOptions, CompiledMethod};
use crate::core::error::{Error, HarnessError, HarnessResult};
use crate::cpu::{Cpu, VectorOp};
use crate::tree::{parse, DataType, VECTOR_BYTES};
use log::debug;
use std::fmt;

/// A Rust type that can be passed to a compiled method.
pub trait NativeArg: Copy {
    const TYPE: DataType;
}

/// A Rust type that a compiled method can return.
pub trait NativeReturn {
    const TYPE: DataType;
}

macro_rules! native_type {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl NativeArg for $ty {
                const TYPE: DataType = DataType::$dt;
            }
            impl NativeReturn for $ty {
                const TYPE: DataType = DataType::$dt;
            }
        )*
    };
}

native_type! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float,
    f64 => Double,
}

impl<T> NativeArg for *const T {
    const TYPE: DataType = DataType::Address;
}

impl<T> NativeArg for *mut T {
    const TYPE: DataType = DataType::Address;
}

impl<T> NativeReturn for *const T {
    const TYPE: DataType = DataType::Address;
}

impl<T> NativeReturn for *mut T {
    const TYPE: DataType = DataType::Address;
}

impl NativeReturn for () {
    const TYPE: DataType = DataType::NoType;
}

/// A function pointer type a compiled entry point can be viewed as.
///
/// # Safety
///
/// Implementors must be `extern "C"` function pointers whose parameter and
/// return types are described exactly by [`EntrySignature::params`] and
/// [`EntrySignature::return_type`].
pub unsafe trait EntrySignature: Copy {
    fn params() -> Vec<DataType>;
    fn return_type() -> DataType;

    /// # Safety
    ///
    /// `entry` must point to executable code following this signature.
    unsafe fn from_entry(entry: *const u8) -> Self;
}

macro_rules! entry_signature {
    ($($arg:ident),*) => {
        unsafe impl<R: NativeReturn, $($arg: NativeArg),*> EntrySignature
            for unsafe extern "C" fn($($arg),*) -> R
        {
            fn params() -> Vec<DataType> {
                vec![$(<$arg as NativeArg>::TYPE),*]
            }

            fn return_type() -> DataType {
                R::TYPE
            }

            unsafe fn from_entry(entry: *const u8) -> Self {
                std::mem::transmute_copy::<*const u8, Self>(&entry)
            }
        }
    };
}

entry_signature!();
entry_signature!(A);
entry_signature!(A, B);
entry_signature!(A, B, C);
entry_signature!(A, B, C, D);
entry_signature!(A, B, C, D, E);
entry_signature!(A, B, C, D, E, F);

fn describe(params: &[DataType], ret: DataType) -> String {
    let params: Vec<&str> = params.iter().map(|p| p.name()).collect();
    format!("({}) -> {}", params.join(", "), ret)
}

impl CompiledMethod {
    /// Views the entry point as `F`, which must match the declared signature exactly.
    pub fn entry_point<F: EntrySignature>(&self) -> HarnessResult<F> {
        if F::params() != self.params() || F::return_type() != self.return_type() {
            return Err(HarnessError::SignatureMismatch {
                declared: describe(self.params(), self.return_type()),
                requested: describe(&F::params(), F::return_type()),
            });
        }
        // SAFETY: the signature was checked against the declaration the code was generated for.
        Ok(unsafe { F::from_entry(self.entry_ptr()) })
    }
}

/// How observed lanes are compared with the reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    Exact,
    /// Absolute difference allowed per lane.
    Epsilon(f64),
}

/// Element type of a 128-bit vector.
pub trait Lane: NativeArg + Default + PartialEq + fmt::Debug + fmt::Display {
    const VECTOR: DataType;

    /// Reference result of `op` on one lane.
    fn apply(op: VectorOp, a: Self, b: Self) -> Self;

    fn within(self, other: Self, tolerance: Tolerance) -> bool;

    fn lanes() -> usize {
        VECTOR_BYTES as usize / std::mem::size_of::<Self>()
    }
}

macro_rules! int_lane {
    ($($ty:ty => $vector:ident),*) => {
        $(
            impl Lane for $ty {
                const VECTOR: DataType = DataType::$vector;

                fn apply(op: VectorOp, a: Self, b: Self) -> Self {
                    match op {
                        VectorOp::Add => a.wrapping_add(b),
                        VectorOp::Sub => a.wrapping_sub(b),
                        VectorOp::Mul => a.wrapping_mul(b),
                        VectorOp::Div => a.checked_div(b).unwrap_or(0),
                    }
                }

                fn within(self, other: Self, tolerance: Tolerance) -> bool {
                    match tolerance {
                        Tolerance::Exact => self == other,
                        Tolerance::Epsilon(e) => (self as f64 - other as f64).abs() <= e,
                    }
                }
            }
        )*
    };
}

macro_rules! float_lane {
    ($($ty:ty => $vector:ident),*) => {
        $(
            impl Lane for $ty {
                const VECTOR: DataType = DataType::$vector;

                fn apply(op: VectorOp, a: Self, b: Self) -> Self {
                    match op {
                        VectorOp::Add => a + b,
                        VectorOp::Sub => a - b,
                        VectorOp::Mul => a * b,
                        VectorOp::Div => a / b,
                    }
                }

                fn within(self, other: Self, tolerance: Tolerance) -> bool {
                    match tolerance {
                        Tolerance::Exact => self == other,
                        Tolerance::Epsilon(e) => ((self - other) as f64).abs() <= e,
                    }
                }
            }
        )*
    };
}

int_lane!(i8 => VectorInt8, i16 => VectorInt16, i32 => VectorInt32, i64 => VectorInt64);
float_lane!(f32 => VectorFloat, f64 => VectorDouble);

/// Reference results of `op` applied lane by lane.
pub fn reference<T: Lane>(op: VectorOp, a: &[T], b: &[T]) -> Vec<T> {
    a.iter().zip(b).map(|(x, y)| T::apply(op, *x, *y)).collect()
}

/// Compares every lane; reports the first one outside the tolerance.
pub fn verify_lanes<T: Lane>(expected: &[T], observed: &[T], tolerance: Tolerance) -> HarnessResult<()> {
    if expected.len() != observed.len() {
        return Err(HarnessError::LaneCount {
            expected: expected.len(),
            found: observed.len(),
        });
    }
    match expected
        .iter()
        .zip(observed)
        .position(|(e, o)| !o.within(*e, tolerance))
    {
        Some(lane) => Err(HarnessError::Mismatch {
            lane,
            expected: expected[lane].to_string(),
            observed: observed[lane].to_string(),
        }),
        None => Ok(()),
    }
}

/// Runs a `(Address out, Address a, Address b) -> NoType` kernel over one vector.
pub fn run_vector_binary<T: Lane>(method: &CompiledMethod, a: &[T], b: &[T]) -> HarnessResult<Vec<T>> {
    for input in [a, b] {
        if input.len() != T::lanes() {
            return Err(HarnessError::LaneCount {
                expected: T::lanes(),
                found: input.len(),
            });
        }
    }
    let entry = method.entry_point::<unsafe extern "C" fn(*mut T, *const T, *const T)>()?;
    let mut out = vec![T::default(); T::lanes()];
    // SAFETY: all three buffers hold one full vector and outlive the call.
    unsafe { entry(out.as_mut_ptr(), a.as_ptr(), b.as_ptr()) };
    Ok(out)
}

/// IR of `out[0..16] = a[0..16] op b[0..16]` for one vector type.
pub fn vector_binary_ir(op: VectorOp, vector: DataType) -> String {
    format!(
        "(method name=vector_{op_name} return=NoType args=[Address,Address,Address]\n\
         \x20 (block\n\
         \x20   (vstorei type={vector} offset=0 (aload parm=0)\n\
         \x20     ({mnemonic} (vloadi type={vector} (aload parm=1)) (vloadi type={vector} (aload parm=2))))\n\
         \x20   (return)))",
        op_name = &op.mnemonic()[1..],
        mnemonic = op.mnemonic(),
    )
}

/// Parses, compiles, runs and checks a vector kernel in one go; returns the
/// observed lanes.
pub fn check_vector_binary<T: Lane>(
    cpu: &Cpu,
    options: &CompileOptions,
    op: VectorOp,
    a: &[T],
    b: &[T],
    expected: &[T],
    tolerance: Tolerance,
) -> Result<Vec<T>, Error> {
    let text = vector_binary_ir(op, T::VECTOR);
    let method = parse(&text)?;
    let compiled = compile_with(&method, cpu, options)?;
    let observed = run_vector_binary(&compiled, a, b)?;
    debug!("{} {}: {:?}", op.mnemonic(), T::VECTOR, observed);
    verify_lanes(expected, &observed, tolerance)?;
    Ok(observed)
}
