//! Setup checks. The process exits non-zero when any check fails.

use std::fs;

use anyhow::{bail, Result};
use dlab_core::{Credentials, DevicePreference, LabSession, ModelInfo, ResolvedDevice};

use crate::{
    console::{banner, section},
    Settings,
};

/// Token shipped in dry-run setups; never accepted by the hub.
const PLACEHOLDER_TOKEN: &str = "hf_test_token_for_dry_run";

type Check = fn(&Settings) -> bool;

pub fn run(settings: &Settings) -> Result<()> {
    banner("Validating Diffusion Lab Setup");

    let checks: [(&str, Check); 4] = [
        ("Environment", check_environment),
        ("Device", check_device),
        ("Lab Functionality", check_lab_functionality),
        ("Output Directory", check_output_dir),
    ];

    let total = checks.len();
    let mut passed = 0;
    for (name, check) in checks {
        section(name);
        if check(settings) {
            passed += 1;
        }
    }

    println!("\nValidation results: {passed}/{total} checks passed");
    if passed == total {
        println!("\nAll validation checks passed, the lab is ready to use!");
        println!("\nTo start generating images:");
        println!("1. dlab run");
        println!("2. dlab exercise");
        return Ok(());
    }
    if passed == total - 1 {
        println!("\nMost checks passed, you're almost ready!");
    }
    bail!("{} of {total} validation checks failed", total - passed)
}

fn token_problem(credentials: &Credentials) -> Option<&'static str> {
    match credentials.token() {
        None | Some(PLACEHOLDER_TOKEN) => Some("no valid Hugging Face token found"),
        Some(_) if !credentials.looks_valid() => {
            Some("Hugging Face token format looks incorrect, it should start with 'hf_'")
        }
        Some(_) => None,
    }
}

fn check_environment(settings: &Settings) -> bool {
    println!("token source: {}", settings.config.token_source);
    match token_problem(&settings.config.credentials()) {
        None => {
            println!("ok: environment configuration looks good");
            true
        }
        Some(problem) => {
            println!("fail: {problem}");
            println!("      get one from https://huggingface.co/settings/tokens");
            false
        }
    }
}

fn check_device(settings: &Settings) -> bool {
    let device = settings.config.device.resolve();
    println!("requested: {:?}, resolved: {device}", settings.config.device);
    println!(
        "compiled backends: cuda={} metal={}",
        cfg!(feature = "cuda"),
        cfg!(feature = "metal")
    );
    let compiled = match device {
        ResolvedDevice::Cpu => true,
        ResolvedDevice::Cuda(_) => cfg!(feature = "cuda"),
        ResolvedDevice::Metal(_) => cfg!(feature = "metal"),
    };
    if !compiled {
        println!("fail: {device} requested but this build has no support for it");
        return false;
    }
    println!("ok: device {device}");
    true
}

fn check_lab_functionality(settings: &Settings) -> bool {
    let session = LabSession::new(settings.config.clone().with_device(DevicePreference::Cpu));
    println!("ok: session initialization on {}", session.device());
    match session.get_model_info() {
        ModelInfo::NotLoaded => {
            println!("ok: model info reports '{}'", ModelInfo::NotLoaded);
            true
        }
        other => {
            println!("fail: fresh session already reports a model: {other}");
            false
        }
    }
}

fn check_output_dir(settings: &Settings) -> bool {
    let dir = &settings.config.output_dir;
    let writable = fs::create_dir_all(dir)
        .and_then(|()| fs::metadata(dir))
        .map(|meta| !meta.permissions().readonly());
    match writable {
        Ok(true) => {
            println!("ok: {} is writable", dir.display());
            true
        }
        Ok(false) => {
            println!("fail: {} is read-only", dir.display());
            false
        }
        Err(e) => {
            println!("fail: cannot create {}: {e}", dir.display());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_and_malformed_tokens_fail() {
        assert!(token_problem(&Credentials::default()).is_some());
        assert!(token_problem(&Credentials::new(Some(PLACEHOLDER_TOKEN.into()))).is_some());
        assert!(token_problem(&Credentials::new(Some("abc123".into()))).is_some());
        assert!(token_problem(&Credentials::new(Some("hf_real".into()))).is_none());
    }
}
