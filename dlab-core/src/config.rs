use std::path::PathBuf;

use crate::{Credentials, DevicePreference, LoadOptions, TokenSource};

/// Default directory generated images are written to.
pub const DEFAULT_OUTPUT_DIR: &str = "outputs";

/// Everything a session needs from its environment. Read once when the
/// session is built; later changes to the environment are not observed.
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub device: DevicePreference,
    pub token_source: TokenSource,
    pub output_dir: PathBuf,
    pub load_options: LoadOptions,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::Auto,
            token_source: TokenSource::default(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            load_options: LoadOptions::default(),
        }
    }
}

impl LabConfig {
    /// Configuration for an offline CPU session without a token.
    pub fn cpu_unauthenticated() -> Self {
        Self {
            device: DevicePreference::Cpu,
            token_source: TokenSource::None,
            ..Default::default()
        }
    }

    pub fn with_device(mut self, device: DevicePreference) -> Self {
        self.device = device;
        self
    }

    pub fn with_token_source(mut self, token_source: TokenSource) -> Self {
        self.token_source = token_source;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::from_source(&self.token_source)
    }
}
