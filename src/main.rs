use std::env;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

mod config;
mod event_bus;
mod interpreter;
mod literal;
mod llm_manager;
mod logger;
mod planner;
mod providers;
mod ui;

use config::{Config, OutputFormat, Overrides, ProviderKind};
use event_bus::EventBus;
use llm_manager::LLMManager;
use planner::Planner;
use ui::UIHandler;

const EXAMPLE_GOAL: &str =
    "Build and launch a simple e-commerce MVP (web + mobile-responsive) in 3 months.";

#[derive(Parser)]
#[command(name = "smart_task_planner", version, about = "Turn a goal into a task plan")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,
    /// Completion service to use
    #[arg(short, long, value_enum)]
    provider: Option<ProviderKind>,
    /// Model name (overrides GENAI_MODEL and the config file)
    #[arg(short, long)]
    model: Option<String>,
    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,
    /// Upper bound on generated tokens
    #[arg(long)]
    max_output_tokens: Option<usize>,
    /// Request JSON-only output from services that support it
    #[arg(long)]
    strict_json: bool,
    /// Output format
    #[arg(short, long, value_enum)]
    format: Option<OutputFormat>,
    /// Print the raw model output before the plan
    #[arg(long)]
    show_raw: bool,
    /// Use a known-good example goal
    #[arg(long)]
    example: bool,
    /// Disable colored output
    #[arg(long)]
    no_color: bool,
    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
    /// Debug logging, including raw service responses
    #[arg(long)]
    debug: bool,
    /// Natural-language goal; read from stdin when omitted
    #[arg(trailing_var_arg = true)]
    goal: Vec<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            provider: self.provider,
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            strict_json: self.strict_json,
            output_format: self.format,
            no_color: self.no_color,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    logger::init(args.verbose, args.debug);

    let mut config = Config::load(&args.config)?;
    config.apply_env_overrides(|key| env::var(key).ok());
    config.merge_with_args(&args.overrides());
    let ui = UIHandler::new(&config.ui);

    let setup = config
        .validate()
        .and_then(|_| providers::build(&config, |key| env::var(key).ok()));
    let provider = match setup {
        Ok(provider) => provider,
        Err(e) => {
            println!("{}", ui.render_error(&e.to_string()));
            return Ok(ExitCode::FAILURE);
        }
    };

    let goal = if args.example {
        EXAMPLE_GOAL.to_string()
    } else if !args.goal.is_empty() {
        args.goal.join(" ")
    } else {
        read_goal().context("Failed to read goal from stdin")?
    };

    let event_bus = Arc::new(EventBus::new(64));
    let llm = LLMManager::new(provider, Some(event_bus.clone()), config.retry.clone());
    ui.banner(llm.provider().name(), llm.provider().model_name());
    info!("Planning goal: {}", goal);

    let planner = Planner::new().with_event_bus(event_bus.clone());
    let spinner = ui.start_spinner(&event_bus);
    let outcome = planner
        .plan(&goal, &llm, &config.generation.options())
        .await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    let metrics = event_bus.get_metrics().await;
    info!(
        "API calls: {} ({} errors, {} retries), approx tokens: {}, plans interpreted: {}, interpretation failures: {}",
        metrics.total_api_calls,
        metrics.api_errors,
        metrics.retries,
        metrics.total_tokens,
        metrics.plans_interpreted,
        metrics.interpretation_failures
    );

    match outcome {
        Ok(result) => {
            print!("{}", ui.render_result(&result, args.show_raw));
            if config.ui.output_format == OutputFormat::Json {
                println!();
            }
            if result.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }
        Err(e) => {
            println!("{}", ui.render_error(&e.to_string()));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn read_goal() -> io::Result<String> {
    eprint!("Enter your goal: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
