//! Diffusion Lab CLI: the guided lab runner, exercises and a few one-off tools.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dlab_core::{
    config::DEFAULT_OUTPUT_DIR, DevicePreference, LabConfig, LoadOptions, TokenSource,
    DEFAULT_MODEL_ID,
};
use tracing_subscriber::EnvFilter;

mod console;
mod exercises;
mod lab;
mod tools;
mod validate;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(
    name = "dlab",
    author,
    version,
    about = "Diffusion Lab: learn text-to-image generation hands-on"
)]
struct Cli {
    /// Device to run on: auto, cpu, cuda[:N], mps
    #[arg(long, global = true, env = "DLAB_DEVICE", default_value = "auto")]
    device: DevicePreference,

    /// Model to load (Hugging Face model ID)
    #[arg(long, global = true, env = "DLAB_MODEL", default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Hugging Face token source: env[:VAR], literal:TOKEN, path:FILE, cache or none
    #[arg(long, global = true, default_value = "env")]
    token_source: TokenSource,

    /// Directory generated images are written to
    #[arg(long, global = true, env = "DLAB_OUTPUT_DIR", default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Model revision to fetch
    #[arg(long, global = true, default_value = "main")]
    revision: String,

    /// Do not show images in the terminal, only save them
    #[arg(long, global = true)]
    no_display: bool,

    /// Disable attention slicing (faster, more memory)
    #[arg(long, global = true)]
    no_attention_slicing: bool,

    /// Use flash attention in the U-Net (CUDA builds with `--features flash-attn`)
    #[arg(long, global = true)]
    flash_attn: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk through the guided lab: basic generation, prompts, guidance scale, model info
    Run,

    /// Run the practice exercises
    Exercise {
        #[arg(value_enum, default_value_t = ExerciseName::All)]
        which: ExerciseName,
    },

    /// Generate a single image
    Generate {
        /// Text description of the desired image
        #[arg(short, long)]
        prompt: String,

        /// What to avoid in the image
        #[arg(short, long)]
        negative_prompt: Option<String>,

        /// Number of denoising steps
        #[arg(long, default_value_t = 50)]
        steps: usize,

        /// How closely to follow the prompt
        #[arg(short, long, default_value_t = 7.5)]
        guidance_scale: f64,

        #[arg(long, default_value_t = 512)]
        width: usize,

        #[arg(long, default_value_t = 512)]
        height: usize,

        /// Random seed for reproducibility
        #[arg(short, long)]
        seed: Option<u64>,

        /// File name inside the output directory
        #[arg(short, long, default_value = "generated.png")]
        filename: String,
    },

    /// Generate the same prompt with several schedulers
    CompareSchedulers {
        #[arg(short, long)]
        prompt: String,

        /// Comma separated scheduler names
        #[arg(
            long,
            value_delimiter = ',',
            default_value = "DDIMScheduler,DDPMScheduler,EulerAncestralDiscreteScheduler,UniPCMultistepScheduler"
        )]
        schedulers: Vec<String>,

        #[arg(long, default_value_t = 20)]
        steps: usize,

        #[arg(short, long, default_value_t = 42)]
        seed: u64,
    },

    /// Show device, authentication and model information
    Info {
        /// Load the model before reporting
        #[arg(long)]
        load: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check that the lab is ready to use
    Validate,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExerciseName {
    Simple,
    Parameters,
    Negative,
    Batch,
    All,
}

/// Options shared by every command after parsing.
pub struct Settings {
    pub config: LabConfig,
    pub model: String,
    pub display: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        let load_options = LoadOptions {
            revision: self.revision.clone(),
            attention_slicing: !self.no_attention_slicing,
            use_flash_attn: self.flash_attn,
            ..Default::default()
        };
        Settings {
            config: LabConfig {
                device: self.device,
                token_source: self.token_source.clone(),
                output_dir: self.output_dir.clone(),
                load_options,
            },
            model: self.model.clone(),
            display: !self.no_display,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();
    tracing::debug!(command = ?cli.command, device = ?settings.config.device, "starting");

    match cli.command {
        Command::Run => lab::run(&settings),
        Command::Exercise { which } => exercises::run(&settings, which),
        Command::Generate {
            prompt,
            negative_prompt,
            steps,
            guidance_scale,
            width,
            height,
            seed,
            filename,
        } => {
            let mut request = dlab_core::GenerationRequest::new(prompt)
                .with_steps(steps)
                .with_guidance_scale(guidance_scale)
                .with_size(width, height);
            if let Some(negative_prompt) = negative_prompt {
                request = request.with_negative_prompt(negative_prompt);
            }
            if let Some(seed) = seed {
                request = request.with_seed(seed);
            }
            tools::generate(&settings, request, &filename)
        }
        Command::CompareSchedulers {
            prompt,
            schedulers,
            steps,
            seed,
        } => tools::compare_schedulers(&settings, &prompt, &schedulers, steps, seed),
        Command::Info { load, json } => tools::info(&settings, load, json),
        Command::Validate => validate::run(&settings),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dlab",
            "generate",
            "--prompt",
            "a red apple",
            "--seed",
            "123",
            "--device",
            "cpu",
            "--token-source",
            "none",
            "--no-attention-slicing",
        ])
        .unwrap();
        let settings = cli.settings();
        assert_eq!(settings.config.device, DevicePreference::Cpu);
        assert_eq!(settings.config.token_source, TokenSource::None);
        assert!(!settings.config.load_options.attention_slicing);
        assert!(matches!(cli.command, Command::Generate { seed: Some(123), .. }));
    }

    #[test]
    fn splits_scheduler_lists() {
        let cli = Cli::try_parse_from([
            "dlab",
            "compare-schedulers",
            "-p",
            "a lake",
            "--schedulers",
            "ddim,NotAScheduler",
        ])
        .unwrap();
        match cli.command {
            Command::CompareSchedulers { schedulers, .. } => {
                assert_eq!(schedulers, vec!["ddim", "NotAScheduler"])
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_devices() {
        assert!(Cli::try_parse_from(["dlab", "--device", "tpu", "run"]).is_err());
    }
}
