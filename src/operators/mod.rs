//! Functions for linking and calling math intrinsics in JIT-compiled code.
//!
//! Cranelift has native instructions for arithmetic, `fabs` and `sqrt`, but not for the
//! transcendental functions. Those are provided as `extern "C"` shims that are registered
//! with the JIT builder under a fixed symbol name, declared in the module as imports and
//! called from the generated code.
//!
//! All intrinsics operate on 64-bit floating point numbers (f64). Trigonometric functions
//! expect arguments in radians.

use std::collections::HashMap;

use cranelift::prelude::*;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;

/// Sign of `x`: `1` for positive, `-1` for negative, `0` for either zero, NaN for NaN.
pub fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        // 0 * x keeps NaN as NaN
        x * 0.0
    }
}

extern "C" fn lambdify_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn lambdify_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn lambdify_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn lambdify_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn lambdify_tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn lambdify_sign(x: f64) -> f64 {
    sign(x)
}

extern "C" fn lambdify_pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

/// External functions the generated code may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Intrinsic {
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Sign,
    Pow,
}

impl Intrinsic {
    pub(crate) const ALL: [Intrinsic; 7] = [
        Intrinsic::Exp,
        Intrinsic::Ln,
        Intrinsic::Sin,
        Intrinsic::Cos,
        Intrinsic::Tan,
        Intrinsic::Sign,
        Intrinsic::Pow,
    ];

    /// Symbol name the shim is registered under.
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Intrinsic::Exp => "lambdify_exp",
            Intrinsic::Ln => "lambdify_ln",
            Intrinsic::Sin => "lambdify_sin",
            Intrinsic::Cos => "lambdify_cos",
            Intrinsic::Tan => "lambdify_tan",
            Intrinsic::Sign => "lambdify_sign",
            Intrinsic::Pow => "lambdify_pow",
        }
    }

    fn address(self) -> *const u8 {
        match self {
            Intrinsic::Exp => lambdify_exp as *const u8,
            Intrinsic::Ln => lambdify_ln as *const u8,
            Intrinsic::Sin => lambdify_sin as *const u8,
            Intrinsic::Cos => lambdify_cos as *const u8,
            Intrinsic::Tan => lambdify_tan as *const u8,
            Intrinsic::Sign => lambdify_sign as *const u8,
            Intrinsic::Pow => lambdify_pow as *const u8,
        }
    }

    fn arity(self) -> usize {
        match self {
            Intrinsic::Pow => 2,
            _ => 1,
        }
    }
}

/// Makes every intrinsic shim resolvable by the JIT linker.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    for intrinsic in Intrinsic::ALL {
        builder.symbol(intrinsic.symbol(), intrinsic.address());
    }
}

/// Links an intrinsic to make it available for JIT compilation.
///
/// Declares the external function in the Cranelift module with the signature
/// `(f64, ...) -> f64` matching its arity.
///
/// # Errors
/// Returns `BuilderError::DeclarationError` if the module rejects the declaration.
pub(crate) fn link(module: &mut dyn Module, intrinsic: Intrinsic) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    for _ in 0..intrinsic.arity() {
        sig.params.push(AbiParam::new(types::F64));
    }
    sig.returns.push(AbiParam::new(types::F64));

    module
        .declare_function(intrinsic.symbol(), Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))
}

/// Per-function cache of imported intrinsics.
///
/// Each intrinsic is linked and declared in the function under construction at most once.
#[derive(Default)]
pub(crate) struct IntrinsicCache {
    refs: HashMap<Intrinsic, codegen::ir::FuncRef>,
}

impl IntrinsicCache {
    /// Generates Cranelift IR instructions that call `intrinsic` with `args`.
    pub(crate) fn call(
        &mut self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        intrinsic: Intrinsic,
        args: &[Value],
    ) -> Result<Value, BuilderError> {
        let func_ref = match self.refs.get(&intrinsic) {
            Some(func_ref) => *func_ref,
            None => {
                let func_id = link(module, intrinsic)?;
                let func_ref = module.declare_func_in_func(func_id, builder.func);
                self.refs.insert(intrinsic, func_ref);
                func_ref
            }
        };
        let call = builder.ins().call(func_ref, args);
        builder
            .inst_results(call)
            .first()
            .copied()
            .ok_or_else(|| BuilderError::FunctionError(format!("{intrinsic:?} returned nothing")))
    }
}
