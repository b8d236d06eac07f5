//! Noise schedulers a loaded pipeline can switch between.
//!
//! The numeric schedulers live in `candle-transformers`; this module only names
//! them, carries the shared noise schedule parameters read from a model's
//! `scheduler/scheduler_config.json`, and builds the candle scheduler for a
//! given number of inference steps.

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    ddpm::DDPMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{self, SchedulerConfig},
    uni_pc::{KarrasSigmaSchedule, SigmaSchedule, UniPCSchedulerConfig},
};
use serde::{Deserialize, Serialize};

/// The schedulers this lab knows how to build. Names follow the hub's
/// `_class_name` convention, short aliases are accepted when parsing.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchedulerKind {
    #[serde(rename = "DDIMScheduler", alias = "ddim")]
    Ddim,
    #[serde(rename = "DDPMScheduler", alias = "ddpm")]
    Ddpm,
    #[serde(
        rename = "EulerAncestralDiscreteScheduler",
        alias = "euler_a",
        alias = "euler-ancestral"
    )]
    EulerAncestralDiscrete,
    #[serde(rename = "UniPCMultistepScheduler", alias = "unipc")]
    UniPcMultistep,
}

serde_plain::derive_display_from_serialize!(SchedulerKind);
serde_plain::derive_fromstr_from_deserialize!(SchedulerKind);

impl SchedulerKind {
    pub const ALL: [SchedulerKind; 4] = [
        Self::Ddim,
        Self::Ddpm,
        Self::EulerAncestralDiscrete,
        Self::UniPcMultistep,
    ];

    /// Whether `step` draws fresh noise. Stochastic schedulers are only
    /// reproducible on devices whose random source can be seeded.
    pub fn is_stochastic(&self) -> bool {
        matches!(self, Self::Ddpm | Self::EulerAncestralDiscrete)
    }
}

/// Outcome of looking a scheduler up by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchedulerChoice {
    Known(SchedulerKind),
    Unrecognized(String),
}

impl SchedulerChoice {
    pub fn from_name(name: &str) -> Self {
        match name.trim().parse::<SchedulerKind>() {
            Ok(kind) => Self::Known(kind),
            Err(_) => Self::Unrecognized(name.to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetaScheduleName {
    #[serde(rename = "linear")]
    Linear,
    #[serde(rename = "scaled_linear")]
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredcosCapV2,
}

impl From<BetaScheduleName> for schedulers::BetaSchedule {
    fn from(value: BetaScheduleName) -> Self {
        match value {
            BetaScheduleName::Linear => Self::Linear,
            BetaScheduleName::ScaledLinear => Self::ScaledLinear,
            BetaScheduleName::SquaredcosCapV2 => Self::SquaredcosCapV2,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredictionKind {
    #[serde(rename = "epsilon")]
    Epsilon,
    #[serde(rename = "v_prediction")]
    VPrediction,
    #[serde(rename = "sample")]
    Sample,
}

impl From<PredictionKind> for schedulers::PredictionType {
    fn from(value: PredictionKind) -> Self {
        match value {
            PredictionKind::Epsilon => Self::Epsilon,
            PredictionKind::VPrediction => Self::VPrediction,
            PredictionKind::Sample => Self::Sample,
        }
    }
}

/// Noise schedule parameters shared by every scheduler of a model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerParams {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaScheduleName,
    #[serde(rename = "num_train_timesteps")]
    pub train_timesteps: usize,
    pub prediction_type: PredictionKind,
    pub steps_offset: usize,
    pub clip_sample: bool,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaScheduleName::ScaledLinear,
            train_timesteps: 1000,
            prediction_type: PredictionKind::Epsilon,
            steps_offset: 1,
            clip_sample: false,
        }
    }
}

impl SchedulerParams {
    /// Noise levels `sqrt((1 - alpha_bar) / alpha_bar)` at the first and last
    /// training timestep. `None` for the cosine schedule, which has no beta range.
    pub fn sigma_range(&self) -> Option<(f64, f64)> {
        let n = self.train_timesteps;
        if n < 2 {
            return None;
        }
        let (start, end) = match self.beta_schedule {
            BetaScheduleName::Linear => (self.beta_start, self.beta_end),
            BetaScheduleName::ScaledLinear => (self.beta_start.sqrt(), self.beta_end.sqrt()),
            BetaScheduleName::SquaredcosCapV2 => return None,
        };
        let sigma = |alpha_bar: f64| ((1.0 - alpha_bar) / alpha_bar).sqrt();

        let mut alpha_bar = 1.0;
        let mut sigma_min = 0.0;
        for i in 0..n {
            let t = start + (end - start) * i as f64 / (n - 1) as f64;
            let beta = match self.beta_schedule {
                BetaScheduleName::ScaledLinear => t * t,
                _ => t,
            };
            alpha_bar *= 1.0 - beta;
            if i == 0 {
                sigma_min = sigma(alpha_bar);
            }
        }
        Some((sigma_min, sigma(alpha_bar)))
    }

    /// UniPC is parameterized by sigmas rather than betas. The prediction type
    /// and training length carry over as is; the beta range becomes the sigma
    /// range of candle's Karras schedule.
    fn unipc_config(&self) -> UniPCSchedulerConfig {
        let defaults = UniPCSchedulerConfig::default();
        let sigma_schedule = match (self.sigma_range(), defaults.sigma_schedule) {
            (Some((sigma_min, sigma_max)), SigmaSchedule::Karras(karras)) => {
                SigmaSchedule::Karras(KarrasSigmaSchedule {
                    sigma_min,
                    sigma_max,
                    rho: karras.rho,
                })
            }
            (_, schedule) => schedule,
        };
        UniPCSchedulerConfig {
            sigma_schedule,
            prediction_type: self.prediction_type.into(),
            num_training_timesteps: self.train_timesteps,
            ..defaults
        }
    }
}

#[derive(Deserialize)]
struct HubSchedulerConfig {
    #[serde(rename = "_class_name", default)]
    class_name: Option<String>,
    #[serde(flatten)]
    params: SchedulerParams,
}

/// The active scheduler of a pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Scheduler {
    pub kind: SchedulerKind,
    pub params: SchedulerParams,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Ddim,
            params: SchedulerParams::default(),
        }
    }
}

impl Scheduler {
    /// A fresh scheduler of `kind` sharing the noise schedule of `current`.
    pub fn from_config(kind: SchedulerKind, current: &Scheduler) -> Self {
        Self {
            kind,
            params: current.params.clone(),
        }
    }

    /// Parse a hub `scheduler_config.json`. Classes without a candle
    /// implementation (PNDM for Stable Diffusion 1.5) fall back to DDIM.
    pub fn from_hub_config(json: &str) -> Result<Self> {
        let config: HubSchedulerConfig =
            serde_json::from_str(json).context("failed to parse scheduler config")?;
        let kind = match config.class_name.as_deref().map(SchedulerChoice::from_name) {
            Some(SchedulerChoice::Known(kind)) => kind,
            Some(SchedulerChoice::Unrecognized(name)) => {
                tracing::info!(scheduler = %name, "scheduler has no candle implementation, using DDIMScheduler");
                SchedulerKind::Ddim
            }
            None => SchedulerKind::Ddim,
        };
        Ok(Self {
            kind,
            params: config.params,
        })
    }

    /// Build the candle scheduler for `steps` inference steps.
    pub fn build(&self, steps: usize) -> candle_core::Result<Box<dyn schedulers::Scheduler>> {
        let p = &self.params;
        match self.kind {
            SchedulerKind::Ddim => DDIMSchedulerConfig {
                beta_start: p.beta_start,
                beta_end: p.beta_end,
                beta_schedule: p.beta_schedule.into(),
                steps_offset: p.steps_offset,
                prediction_type: p.prediction_type.into(),
                train_timesteps: p.train_timesteps,
                ..Default::default()
            }
            .build(steps),
            SchedulerKind::Ddpm => DDPMSchedulerConfig {
                beta_start: p.beta_start,
                beta_end: p.beta_end,
                beta_schedule: p.beta_schedule.into(),
                clip_sample: p.clip_sample,
                prediction_type: p.prediction_type.into(),
                train_timesteps: p.train_timesteps,
                ..Default::default()
            }
            .build(steps),
            SchedulerKind::EulerAncestralDiscrete => EulerAncestralDiscreteSchedulerConfig {
                beta_start: p.beta_start,
                beta_end: p.beta_end,
                beta_schedule: p.beta_schedule.into(),
                steps_offset: p.steps_offset,
                prediction_type: p.prediction_type.into(),
                train_timesteps: p.train_timesteps,
                ..Default::default()
            }
            .build(steps),
            SchedulerKind::UniPcMultistep => p.unipc_config().build(steps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SD15_CONFIG: &str = r#"{
        "_class_name": "PNDMScheduler",
        "_diffusers_version": "0.6.0",
        "beta_end": 0.012,
        "beta_schedule": "scaled_linear",
        "beta_start": 0.00085,
        "num_train_timesteps": 1000,
        "set_alpha_to_one": false,
        "skip_prk_steps": true,
        "steps_offset": 1,
        "trained_betas": null,
        "clip_sample": false
    }"#;

    #[test]
    fn names_round_trip_through_display() {
        for kind in SchedulerKind::ALL {
            assert_eq!(kind.to_string().parse::<SchedulerKind>().unwrap(), kind);
        }
        assert_eq!(SchedulerKind::Ddim.to_string(), "DDIMScheduler");
    }

    #[test]
    fn classifies_names() {
        assert_eq!(
            SchedulerChoice::from_name("EulerAncestralDiscreteScheduler"),
            SchedulerChoice::Known(SchedulerKind::EulerAncestralDiscrete)
        );
        assert_eq!(
            SchedulerChoice::from_name("ddim"),
            SchedulerChoice::Known(SchedulerKind::Ddim)
        );
        assert_eq!(
            SchedulerChoice::from_name("NotAScheduler"),
            SchedulerChoice::Unrecognized("NotAScheduler".to_string())
        );
    }

    #[test]
    fn unsupported_hub_class_falls_back_to_ddim() -> Result<()> {
        let scheduler = Scheduler::from_hub_config(SD15_CONFIG)?;
        assert_eq!(scheduler.kind, SchedulerKind::Ddim);
        assert_eq!(scheduler.params, SchedulerParams::default());
        Ok(())
    }

    #[test]
    fn reads_v_prediction_models() -> Result<()> {
        let json = r#"{"_class_name": "DDIMScheduler", "prediction_type": "v_prediction", "beta_schedule": "linear"}"#;
        let scheduler = Scheduler::from_hub_config(json)?;
        assert_eq!(scheduler.params.prediction_type, PredictionKind::VPrediction);
        assert_eq!(scheduler.params.beta_schedule, BetaScheduleName::Linear);
        assert_eq!(scheduler.params.train_timesteps, 1000);
        Ok(())
    }

    #[test]
    fn fresh_scheduler_keeps_noise_schedule() {
        let current = Scheduler {
            kind: SchedulerKind::Ddim,
            params: SchedulerParams {
                beta_end: 0.02,
                ..Default::default()
            },
        };
        let swapped = Scheduler::from_config(SchedulerKind::Ddpm, &current);
        assert_eq!(swapped.kind, SchedulerKind::Ddpm);
        assert_eq!(swapped.params, current.params);
    }

    #[test]
    fn sigma_range_follows_beta_schedule() {
        let (sigma_min, sigma_max) = SchedulerParams::default().sigma_range().unwrap();
        assert!((sigma_min - 0.02917).abs() < 1e-4, "sigma_min {sigma_min}");
        assert!((sigma_max - 14.6146).abs() < 1e-3, "sigma_max {sigma_max}");

        let linear = SchedulerParams {
            beta_start: 0.0001,
            beta_end: 0.02,
            beta_schedule: BetaScheduleName::Linear,
            ..Default::default()
        };
        let (_, linear_max) = linear.sigma_range().unwrap();
        assert!((linear_max - 157.41).abs() < 0.1, "sigma_max {linear_max}");

        let cosine = SchedulerParams {
            beta_schedule: BetaScheduleName::SquaredcosCapV2,
            ..Default::default()
        };
        assert_eq!(cosine.sigma_range(), None);
    }

    #[test]
    fn unipc_keeps_prediction_type_and_training_length() {
        let params = SchedulerParams {
            prediction_type: PredictionKind::VPrediction,
            train_timesteps: 500,
            ..Default::default()
        };
        let config = params.unipc_config();
        assert!(matches!(
            config.prediction_type,
            schedulers::PredictionType::VPrediction
        ));
        assert_eq!(config.num_training_timesteps, 500);
    }

    #[test]
    fn unipc_step_depends_on_prediction_type() -> candle_core::Result<()> {
        use candle_core::{DType, Device, Tensor};

        let epsilon = Scheduler::from_config(SchedulerKind::UniPcMultistep, &Scheduler::default());
        let v_prediction = Scheduler {
            kind: SchedulerKind::UniPcMultistep,
            params: SchedulerParams {
                prediction_type: PredictionKind::VPrediction,
                ..Default::default()
            },
        };

        let sample = Tensor::ones((1, 4, 8, 8), DType::F32, &Device::Cpu)?;
        let model_output = (Tensor::ones((1, 4, 8, 8), DType::F32, &Device::Cpu)? * 0.5)?;
        let step = |scheduler: &Scheduler| -> candle_core::Result<Tensor> {
            let mut built = scheduler.build(20)?;
            let timestep = built.timesteps()[0];
            built.step(&model_output, timestep, &sample)
        };

        let diff = (step(&epsilon)? - step(&v_prediction)?)?
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        assert!(diff > 1e-3, "v-prediction was treated as epsilon");
        Ok(())
    }

    #[test]
    fn builds_every_known_scheduler() -> candle_core::Result<()> {
        for kind in SchedulerKind::ALL {
            let scheduler = Scheduler::from_config(kind, &Scheduler::default()).build(20)?;
            assert!(!scheduler.timesteps().is_empty(), "{kind} has no timesteps");
        }
        Ok(())
    }
}
