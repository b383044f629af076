use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use lambdify_jit::config::{Backend, LambdifyOptions};
use lambdify_jit::convert::parse;
use lambdify_jit::errors::LambdifyError;
use lambdify_jit::logging::init_cli_logger;
use lambdify_jit::model::Model;
use lambdify_jit::substitute::Substitution;

#[derive(Parser, Debug)]
#[command(name = "lambdify")]
#[command(about = "Substitute, differentiate and compile mathematical expressions")]
#[command(version)]
struct Cli {
    /// TOML file with compilation options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the evaluation backend from the config
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate an expression at a point
    Eval(EvalArgs),
    /// Print the symbolic partial derivative
    Diff {
        expression: String,
        /// Variables to differentiate by, in order
        #[arg(required = true)]
        variables: Vec<String>,
    },
    /// Replace symbols by values or sub-expressions and print the result
    Subs {
        expression: String,
        /// Replacements as NAME=EXPR
        #[arg(required = true, value_parser = parse_assignment)]
        replacements: Vec<(String, String)>,
    },
    /// Print Rust source of an element-wise function
    Source {
        expression: String,
        /// Name of the generated function
        #[arg(long, default_value = "lambdified")]
        name: String,
        #[command(flatten)]
        parameters: ParameterArgs,
    },
    /// Print the Cranelift IR of the compiled kernel
    Ir {
        expression: String,
        #[command(flatten)]
        parameters: ParameterArgs,
    },
}

#[derive(Args, Debug)]
struct EvalArgs {
    expression: String,
    /// Variable values as NAME=VALUE
    #[arg(long = "at", value_parser = parse_value)]
    point: Vec<(String, f64)>,
    /// Also print the gradient
    #[arg(short, long)]
    gradient: bool,
    #[command(flatten)]
    parameters: ParameterArgs,
}

#[derive(Args, Debug)]
struct ParameterArgs {
    /// Parameters fixed before compilation, as NAME=VALUE
    #[arg(long = "param", value_parser = parse_value)]
    params: Vec<(String, f64)>,
}

impl ParameterArgs {
    fn substitution(&self) -> Substitution {
        self.params.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

fn parse_assignment(text: &str) -> Result<(String, String), String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{text}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing name in '{text}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_value(text: &str) -> Result<(String, f64), String> {
    let (name, value) = parse_assignment(text)?;
    let value = value
        .parse::<f64>()
        .map_err(|e| format!("invalid number for '{name}': {e}"))?;
    Ok((name, value))
}

fn main() {
    let cli = Cli::parse();
    init_cli_logger(cli.verbose);

    if let Err(e) = run(cli) {
        tracing::error!(error = ?e, "command failed");
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn load_options(cli: &Cli) -> Result<LambdifyOptions, LambdifyError> {
    let mut options = match &cli.config {
        Some(path) => LambdifyOptions::from_file(path)?,
        None => LambdifyOptions::default(),
    };
    if let Some(backend) = cli.backend {
        options = options.with_backend(backend);
    }
    tracing::debug!(?options, "loaded options");
    Ok(options)
}

fn build_model(
    expression: &str,
    parameters: &ParameterArgs,
    options: LambdifyOptions,
) -> Result<Model, LambdifyError> {
    Model::builder(expression)
        .parameters(&parameters.substitution())
        .options(options)
        .build()
}

fn run(cli: Cli) -> Result<(), LambdifyError> {
    let options = load_options(&cli)?;

    match &cli.command {
        Command::Eval(args) => {
            let order = options.derivative_order.min(u8::from(args.gradient));
            let model = build_model(
                &args.expression,
                &args.parameters,
                options.with_derivative_order(order),
            )?;
            let values = model
                .sorted_variables()
                .iter()
                .map(|name| {
                    args.point
                        .iter()
                        .rev()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| *v)
                        .ok_or_else(|| LambdifyError::UnboundSymbol(name.clone()))
                })
                .collect::<Result<Vec<f64>, _>>()?;

            println!("{} {}", "Model:".cyan().bold(), model);
            println!("{} {}", "Value:".cyan().bold(), model.eval(&values)?);
            if args.gradient {
                let gradient = model.gradient(&values)?;
                println!("{}", "Gradient:".cyan().bold());
                for (name, value) in model.sorted_variables().iter().zip(gradient) {
                    println!("  d/d{name} = {value}");
                }
            }
        }
        Command::Diff {
            expression,
            variables,
        } => {
            let expr = parse(expression)?;
            let wrt: Vec<&str> = variables.iter().map(String::as_str).collect();
            let derivative = expr.derive_wrt(&wrt);
            println!(
                "{} {}",
                format!("d/d{}:", wrt.join(" d/d")).cyan().bold(),
                derivative
            );
        }
        Command::Subs {
            expression,
            replacements,
        } => {
            let expr = parse(expression)?;
            let mut subs = Substitution::new();
            for (name, value) in replacements {
                subs.insert(name.as_str(), parse(value)?);
            }
            let mut result = expr.substitute(&subs);
            if options.simplify {
                result = result.simplify();
            }
            println!("{} {}", "Result:".cyan().bold(), result);
        }
        Command::Source {
            expression,
            name,
            parameters,
        } => {
            let model = build_model(expression, parameters, options.with_derivative_order(0))?;
            print!("{}", model.source(name));
        }
        Command::Ir {
            expression,
            parameters,
        } => {
            let model = build_model(expression, parameters, options.with_derivative_order(0))?;
            println!("{} {}", "CLIF IR for".cyan().bold(), model);
            println!("{}", model.clif_ir()?);
        }
    }
    Ok(())
}
