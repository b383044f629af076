//! This module provides functionality for JIT compilation of lowered programs.
//! It uses Cranelift as the backend compiler to generate native machine code.
//!
//! The main entry points are:
//! - `build_function()` - Compiles a single program into a JIT function
//! - `build_combined_function()` - Compiles multiple programs into a single JIT function
//! - `get_clif_ir()` - Renders the Cranelift IR a program compiles to, for inspection

use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    errors::{BuilderError, LambdifyError},
    lower::{LinearOp, Program},
    operators::{self, Intrinsic, IntrinsicCache},
    types::{CombinedFunction, ScalarFunction},
};
use cranelift::prelude::*;
use cranelift_codegen::{
    ir::{immediates::Offset32, Signature},
    Context,
};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use isa::TargetIsa;

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

/// Builds a JIT-compiled function from a lowered program.
///
/// The resulting function is wrapped in a safe interface that handles pointer safety.
///
/// # Arguments
/// * `program` - The stack program to compile
///
/// # Returns
/// A thread-safe function that takes a slice of f64 values and returns an f64 result.
/// The function panics if the slice is shorter than the program's input count.
///
/// # Errors
/// Returns a `LambdifyError::Build` if the program is malformed or compilation fails.
pub fn build_function(program: &Program) -> Result<ScalarFunction, LambdifyError> {
    program.validate()?;
    let mut module = create_module()?;
    let mut ctx = module.make_context();
    ctx.func.signature = scalar_signature(&module);

    build_function_body(&mut ctx, program, &mut module)?;
    let func_id = declare_and_define(&mut module, &mut ctx, "lambdified")?;
    let code = finalize(&mut module, func_id)?;

    tracing::debug!(ops = program.ops.len(), "compiled JIT kernel");

    let n_inputs = program.n_inputs;
    Ok(Arc::new(move |input: &[f64]| {
        assert!(
            input.len() >= n_inputs,
            "kernel reads {n_inputs} inputs, got {}",
            input.len()
        );
        // SAFETY: the function was compiled with signature extern "C" fn(*const f64) -> f64,
        // only reads the first `n_inputs` values and its module is never freed
        unsafe {
            let f: extern "C" fn(*const f64) -> f64 = std::mem::transmute(code.0);
            f(input.as_ptr())
        }
    }))
}

/// Renders the Cranelift IR generated for `program` before machine code emission.
///
/// # Errors
/// Returns a `LambdifyError::Build` if the program is malformed.
pub fn get_clif_ir(program: &Program) -> Result<String, LambdifyError> {
    program.validate()?;
    let mut module = create_module()?;
    let mut ctx = module.make_context();
    ctx.func.signature = scalar_signature(&module);
    build_function_body(&mut ctx, program, &mut module)?;
    Ok(ctx.func.display().to_string())
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// This function detects the host machine architecture and configures appropriate
/// compilation flags for optimal code generation.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - A compiler setting is rejected
/// - Code generation configuration fails
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();
    let mut set = |name: &str, value: &str| {
        flag_builder
            .set(name, value)
            .map_err(|e| BuilderError::Setting(format!("{name}={value}: {e}")))
    };

    // cranelift-jit rejects position independent code; libcalls are resolved through
    // the symbol table instead of colocated relocations
    set("use_colocated_libcalls", "false")?;
    set("is_pic", "false")?;
    set("opt_level", "speed")?;

    #[cfg(debug_assertions)]
    set("enable_verifier", "true")?;
    #[cfg(not(debug_assertions))]
    set("enable_verifier", "false")?;

    tracing::trace!(host = %target_lexicon::Triple::host(), "creating ISA");
    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a new JIT module with the math intrinsics resolvable.
fn create_module() -> Result<JITModule, BuilderError> {
    let isa = create_isa()?;
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    operators::register_symbols(&mut builder);
    Ok(JITModule::new(builder))
}

/// Signature `fn(input_ptr) -> f64`.
fn scalar_signature(module: &JITModule) -> Signature {
    let mut sig = module.make_signature();
    sig.params
        .push(AbiParam::new(module.target_config().pointer_type()));
    sig.returns.push(AbiParam::new(types::F64));
    sig
}

/// Builds the function body by generating Cranelift IR from the program.
fn build_function_body(
    ctx: &mut Context,
    program: &Program,
    module: &mut dyn Module,
) -> Result<(), BuilderError> {
    let mut builder_ctx = FunctionBuilderContext::new();
    let mut func_builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);

    let entry_block = func_builder.create_block();
    func_builder.append_block_params_for_function_params(entry_block);
    func_builder.switch_to_block(entry_block);
    func_builder.seal_block(entry_block);

    let input_ptr = func_builder.block_params(entry_block)[0];
    let mut intrinsics = IntrinsicCache::default();
    let mut var_cache = HashMap::new();

    let result = emit_program(
        &mut func_builder,
        module,
        &mut intrinsics,
        &mut var_cache,
        input_ptr,
        program,
    )?;
    func_builder.ins().return_(&[result]);
    func_builder.finalize();

    Ok(())
}

fn declare_and_define(
    module: &mut JITModule,
    ctx: &mut Context,
    name: &str,
) -> Result<FuncId, BuilderError> {
    let func_id = module
        .declare_function(name, Linkage::Local, &ctx.func.signature)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    module
        .define_function(func_id, ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;

    module.clear_context(ctx);
    Ok(func_id)
}

/// Finalizes all definitions and returns the address of `func_id`.
///
/// The module is intentionally leaked: compiled code must outlive every clone of the
/// returned closures, which may be shared across threads.
fn finalize(
    module: &mut JITModule,
    func_id: FuncId,
) -> Result<Arc<ThreadSafeFunction>, BuilderError> {
    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;
    Ok(Arc::new(ThreadSafeFunction(
        module.get_finalized_function(func_id),
    )))
}

fn pop(stack: &mut Vec<Value>, position: usize) -> Result<Value, BuilderError> {
    stack
        .pop()
        .ok_or_else(|| BuilderError::MalformedProgram(format!("stack underflow at op {position}")))
}

/// Emits IR for every op of `program` and returns the value left on the stack.
///
/// Variable loads are cached in `var_cache`, so programs emitted into the same block
/// read each input at most once.
fn emit_program(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    intrinsics: &mut IntrinsicCache,
    var_cache: &mut HashMap<u32, Value>,
    input_ptr: Value,
    program: &Program,
) -> Result<Value, BuilderError> {
    if let Some(c) = program.constant_result {
        return Ok(builder.ins().f64const(c));
    }

    let mut stack: Vec<Value> = Vec::with_capacity(program.max_stack_depth());
    for (position, op) in program.ops.iter().enumerate() {
        let value = match op {
            LinearOp::LoadConst(v) => builder.ins().f64const(*v),
            LinearOp::LoadVar(idx) => match var_cache.get(idx) {
                Some(cached) => *cached,
                None => {
                    let offset = i32::try_from(u64::from(*idx) * 8).map_err(|_| {
                        BuilderError::MalformedProgram(format!("input index {idx} out of range"))
                    })?;
                    let mem = MemFlags::new().with_aligned().with_readonly().with_notrap();
                    let loaded =
                        builder
                            .ins()
                            .load(types::F64, mem, input_ptr, Offset32::new(offset));
                    var_cache.insert(*idx, loaded);
                    loaded
                }
            },

            LinearOp::Add | LinearOp::Sub | LinearOp::Mul | LinearOp::Div | LinearOp::PowExpr => {
                let r = pop(&mut stack, position)?;
                let l = pop(&mut stack, position)?;
                match op {
                    LinearOp::Add => builder.ins().fadd(l, r),
                    LinearOp::Sub => builder.ins().fsub(l, r),
                    LinearOp::Mul => builder.ins().fmul(l, r),
                    LinearOp::Div => builder.ins().fdiv(l, r),
                    _ => intrinsics.call(builder, module, Intrinsic::Pow, &[l, r])?,
                }
            }

            LinearOp::Fma | LinearOp::Fmsub => {
                let c = pop(&mut stack, position)?;
                let b = pop(&mut stack, position)?;
                let a = pop(&mut stack, position)?;
                // a*b - c  ==  fma(a, b, -c)
                let c = if matches!(op, LinearOp::Fmsub) {
                    builder.ins().fneg(c)
                } else {
                    c
                };
                builder.ins().fma(a, b, c)
            }

            LinearOp::PowConst(e) => {
                let base = pop(&mut stack, position)?;
                generate_optimized_power(builder, base, *e)
            }
            LinearOp::PowFloat(e) => {
                let base = pop(&mut stack, position)?;
                let exponent = builder.ins().f64const(*e);
                intrinsics.call(builder, module, Intrinsic::Pow, &[base, exponent])?
            }

            unary => {
                let v = pop(&mut stack, position)?;
                match unary {
                    LinearOp::Abs => builder.ins().fabs(v),
                    LinearOp::Neg => builder.ins().fneg(v),
                    LinearOp::Sqrt => builder.ins().sqrt(v),
                    LinearOp::Sign => intrinsics.call(builder, module, Intrinsic::Sign, &[v])?,
                    LinearOp::Exp => intrinsics.call(builder, module, Intrinsic::Exp, &[v])?,
                    LinearOp::Ln => intrinsics.call(builder, module, Intrinsic::Ln, &[v])?,
                    LinearOp::Sin => intrinsics.call(builder, module, Intrinsic::Sin, &[v])?,
                    LinearOp::Cos => intrinsics.call(builder, module, Intrinsic::Cos, &[v])?,
                    LinearOp::Tan => intrinsics.call(builder, module, Intrinsic::Tan, &[v])?,
                    other => {
                        return Err(BuilderError::MalformedProgram(format!(
                            "unexpected op {other:?} at {position}"
                        )))
                    }
                }
            }
        };
        stack.push(value);
    }

    // The stack must contain exactly one value.
    match (stack.pop(), stack.is_empty()) {
        (Some(result), true) => Ok(result),
        _ => Err(BuilderError::MalformedProgram(
            "program does not leave exactly one value".to_string(),
        )),
    }
}

/// Generates optimized power operation with inlining for common exponents and binary exponentiation
fn generate_optimized_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    match exp {
        0 => builder.ins().f64const(1.0),
        1 => base,
        2 => builder.ins().fmul(base, base),
        3 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, base)
        }
        4 => {
            let square = builder.ins().fmul(base, base);
            builder.ins().fmul(square, square)
        }
        -1 => {
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, base)
        }
        -2 => {
            let square = builder.ins().fmul(base, base);
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, square)
        }
        _ => {
            // Binary exponentiation for other cases
            let mut remaining = exp.unsigned_abs();
            let mut result: Option<Value> = None;
            let mut current_base = base;

            while remaining > 0 {
                if remaining & 1 == 1 {
                    result = Some(match result {
                        Some(acc) => builder.ins().fmul(acc, current_base),
                        None => current_base,
                    });
                }
                if remaining > 1 {
                    current_base = builder.ins().fmul(current_base, current_base);
                }
                remaining >>= 1;
            }

            let result = match result {
                Some(value) => value,
                None => builder.ins().f64const(1.0),
            };
            if exp < 0 {
                let one = builder.ins().f64const(1.0);
                builder.ins().fdiv(one, result)
            } else {
                result
            }
        }
    }
}

/// Builds a JIT-compiled function that evaluates multiple programs together.
///
/// This function generates machine code that evaluates every program in a single call,
/// storing results directly in an output buffer. Inputs shared between programs are
/// loaded once.
///
/// # Arguments
/// * `programs` - Programs to compile together, all reading the same input layout
/// * `results_len` - Expected length of the results array (must match number of programs)
///
/// # Returns
/// A thread-safe function that:
/// - Takes a slice of input values
/// - Takes a mutable slice for results
/// - Evaluates all programs
/// - Stores results directly in the output slice
///
/// # Errors
/// Returns a `LambdifyError::Build` if compilation fails
///
/// # Panics
/// The returned function panics if the results slice length doesn't match `results_len`
/// or the input slice is shorter than the programs' input count.
pub fn build_combined_function(
    programs: &[Program],
    results_len: usize,
) -> Result<CombinedFunction, LambdifyError> {
    for program in programs {
        program.validate()?;
    }
    let n_inputs = programs.iter().map(|p| p.n_inputs).max().unwrap_or(0);

    let mut module = create_module()?;
    let mut ctx = module.make_context();
    let mut builder_context = FunctionBuilderContext::new();

    // Create function signature: fn(input_ptr: *const f64, output_ptr: *mut f64)
    let pointer_type = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer_type)); // input_ptr
    sig.params.push(AbiParam::new(pointer_type)); // output_ptr
    ctx.func.signature = sig;

    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_context);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);

        let input_ptr = builder.block_params(entry_block)[0];
        let output_ptr = builder.block_params(entry_block)[1];

        let mut intrinsics = IntrinsicCache::default();
        let mut var_cache = HashMap::new();
        let results = programs
            .iter()
            .map(|program| {
                emit_program(
                    &mut builder,
                    &mut module,
                    &mut intrinsics,
                    &mut var_cache,
                    input_ptr,
                    program,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Store results in output array
        for (i, result) in results.iter().enumerate() {
            let offset = i32::try_from(i * 8).map_err(|_| {
                BuilderError::MalformedProgram(format!("output index {i} out of range"))
            })?;
            builder
                .ins()
                .store(MemFlags::new(), *result, output_ptr, Offset32::new(offset));
        }

        // Return void since we wrote directly to output buffer
        builder.ins().return_(&[]);
        builder.finalize();
    }

    let func_id = declare_and_define(&mut module, &mut ctx, "combined")?;
    let code = finalize(&mut module, func_id)?;

    tracing::debug!(outputs = results_len, "compiled combined JIT kernel");

    Ok(Arc::new(move |inputs: &[f64], results: &mut [f64]| {
        assert_eq!(
            results.len(),
            results_len,
            "Results buffer has incorrect length"
        );
        assert!(
            inputs.len() >= n_inputs,
            "kernel reads {n_inputs} inputs, got {}",
            inputs.len()
        );
        // SAFETY: compiled with signature extern "C" fn(*const f64, *mut f64), writes
        // exactly `results_len` values and reads at most `n_inputs` values
        unsafe {
            let f: extern "C" fn(*const f64, *mut f64) = std::mem::transmute(code.0);
            f(inputs.as_ptr(), results.as_mut_ptr());
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::parse;
    use crate::lower::lower;
    use crate::opt::optimize;

    fn program(text: &str, vars: &[&str]) -> Program {
        let var_map = vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.to_string(), i as u32))
            .collect();
        lower(&parse(text).unwrap(), &var_map).unwrap()
    }

    #[test]
    fn test_build_function() {
        let f = build_function(&program("2*x + y^2", &["x", "y"])).unwrap();
        assert_eq!(f(&[1.0, 2.0]), 6.0);
        assert_eq!(f(&[-1.0, 0.5]), -1.75);
    }

    #[test]
    fn test_host_isa_is_not_pic() {
        let isa = create_isa().unwrap();
        assert!(!isa.flags().is_pic());
        assert!(!isa.flags().use_colocated_libcalls());

        // A module built on the host ISA compiles and runs
        let f = build_function(&program("x * exp(y)", &["x", "y"])).unwrap();
        assert_eq!(f(&[3.0, 0.0]), 3.0);
    }

    #[test]
    fn test_intrinsics() {
        let p = program(
            "exp(x) + ln(y) - sin(x) * cos(y) + tan(x) + sign(y - 3) + sqrt(y) + x^1.5 + y^x",
            &["x", "y"],
        );
        let f = build_function(&p).unwrap();
        let (x, y) = (0.4f64, 2.0f64);
        let expected = x.exp() + y.ln() - x.sin() * y.cos() + x.tan() - 1.0 + y.sqrt()
            + x.powf(1.5)
            + y.powf(x);
        assert!((f(&[x, y]) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_integer_powers() {
        for exp in [-7i64, -2, -1, 0, 1, 2, 3, 4, 5, 13] {
            let f = build_function(&program(&format!("x^({exp})"), &["x"])).unwrap();
            let expected = 1.7f64.powi(exp as i32);
            assert!(((f(&[1.7]) - expected) / expected).abs() < 1e-12, "exp {exp}");
        }
    }

    #[test]
    fn test_optimized_program_with_fma() {
        let p = optimize(program("x*y + z", &["x", "y", "z"]));
        assert!(p.ops.contains(&LinearOp::Fma));
        let f = build_function(&p).unwrap();
        assert_eq!(f(&[2.0, 3.0, 4.0]), 10.0);
    }

    #[test]
    fn test_constant_and_unused_inputs() {
        let f = build_function(&program("3 + 4", &["x"])).unwrap();
        assert_eq!(f(&[100.0]), 7.0);

        // Only y is read, x must still occupy slot 0
        let f = build_function(&program("y * 2", &["x", "y"])).unwrap();
        assert_eq!(f(&[100.0, 4.0]), 8.0);
    }

    #[test]
    fn test_combined_function() {
        let programs = vec![
            program("x + y", &["x", "y"]),
            program("x * y", &["x", "y"]),
            program("5", &["x", "y"]),
        ];
        let f = build_combined_function(&programs, 3).unwrap();
        let mut out = vec![0.0; 3];
        f(&[2.0, 3.0], &mut out);
        assert_eq!(out, vec![5.0, 6.0, 5.0]);
    }

    #[test]
    fn test_clif_ir() {
        let ir = get_clif_ir(&program("x * y + sin(x)", &["x", "y"])).unwrap();
        assert!(ir.contains("fmul"));
        assert!(ir.contains("call"));
    }

    #[test]
    fn test_malformed_program() {
        let bad = Program {
            ops: vec![LinearOp::Add],
            n_inputs: 0,
            constant_result: None,
        };
        assert!(matches!(
            build_function(&bad),
            Err(LambdifyError::Build(BuilderError::MalformedProgram(_)))
        ));
    }
}
