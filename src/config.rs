//! Compilation and evaluation options.
//!
//! Options are plain data and can be written by hand or read from TOML:
//!
//! ```toml
//! backend = "interpreter"
//! derivative_order = 1
//! chunk_size = 4096
//! ```
//!
//! Every key is optional; missing keys take their default.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::LambdifyError;

/// Which engine evaluates lowered programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Cranelift-compiled native code
    #[default]
    Jit,
    /// Array-oriented stack interpreter, no compilation step
    Interpreter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LambdifyOptions {
    pub backend: Backend,
    /// Simplify the graph after parameter substitution
    pub simplify: bool,
    /// Run the peephole optimiser on lowered programs
    pub optimize: bool,
    /// Highest derivative order compiled up front (0, 1 or 2)
    pub derivative_order: u8,
    /// Points per work item in array evaluation
    pub chunk_size: usize,
    /// Evaluate chunks on the rayon thread pool
    pub parallel: bool,
}

impl Default for LambdifyOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Jit,
            simplify: true,
            optimize: true,
            derivative_order: 2,
            chunk_size: 1024,
            parallel: true,
        }
    }
}

impl LambdifyOptions {
    /// Loads options from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, LambdifyError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LambdifyError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parses options from a TOML string and validates them.
    pub fn from_toml_str(content: &str) -> Result<Self, LambdifyError> {
        let options: Self = toml::from_str(content)
            .map_err(|e| LambdifyError::Config(format!("TOML parsing error: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), LambdifyError> {
        if self.derivative_order > 2 {
            return Err(LambdifyError::Config(format!(
                "derivative_order must be 0, 1 or 2, got {}",
                self.derivative_order
            )));
        }
        if self.chunk_size == 0 {
            return Err(LambdifyError::Config(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_derivative_order(mut self, order: u8) -> Self {
        self.derivative_order = order;
        self
    }

    pub fn with_simplify(mut self, simplify: bool) -> Self {
        self.simplify = simplify;
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}
