use std::path::PathBuf;

use anyhow::Result;
use dlab_core::{output, GenerationRequest, LabSession};
use serde_json::json;

use crate::{console::show, Settings};

pub fn generate(settings: &Settings, request: GenerationRequest, filename: &str) -> Result<()> {
    let mut session = LabSession::new(settings.config.clone());
    session.load_model(&settings.model)?;
    generate_with(&mut session, settings, request, filename)?;
    Ok(())
}

/// Generate on an already loaded session. A failed save fails the command.
fn generate_with(
    session: &mut LabSession,
    settings: &Settings,
    request: GenerationRequest,
    filename: &str,
) -> Result<PathBuf> {
    let generated = session.generate_image(request)?;
    show(session, settings, &generated.image, &generated.request.prompt);
    let path = session.save_image(&generated.image, filename)?;
    println!("saved {}", path.display());
    Ok(path)
}

pub fn compare_schedulers(
    settings: &Settings,
    prompt: &str,
    schedulers: &[String],
    steps: usize,
    seed: u64,
) -> Result<()> {
    let mut session = LabSession::new(settings.config.clone());
    session.load_model(&settings.model)?;
    let request = GenerationRequest::new(prompt).with_steps(steps).with_seed(seed);
    compare_with(&mut session, settings, &request, schedulers)?;
    Ok(())
}

fn compare_with(
    session: &mut LabSession,
    settings: &Settings,
    request: &GenerationRequest,
    schedulers: &[String],
) -> Result<Vec<PathBuf>> {
    let comparison = session.compare_schedulers(request, schedulers)?;
    println!(
        "generated {} of {} requested schedulers",
        comparison.images.len(),
        schedulers.len()
    );

    let mut saved = Vec::with_capacity(comparison.images.len() + 1);
    for (image, title) in comparison.images.iter().zip(&comparison.titles) {
        saved.push(session.save_image(image, &format!("scheduler_{title}.png"))?);
    }
    if let Some(sheet) = output::contact_sheet(&comparison.images) {
        show(session, settings, &sheet, &comparison.titles.join(" | "));
        saved.push(session.save_image(&sheet, "scheduler_comparison.png")?);
    }
    for path in &saved {
        println!("saved {}", path.display());
    }
    Ok(saved)
}

pub fn info(settings: &Settings, load: bool, as_json: bool) -> Result<()> {
    let mut session = LabSession::new(settings.config.clone());
    if load {
        session.load_model(&settings.model)?;
    }
    let info = session.get_model_info();

    if as_json {
        let report = json!({
            "device": session.device().to_string(),
            "auth": session.auth_status(),
            "output_dir": session.output_dir().display().to_string(),
            "model": info,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("device: {}", session.device());
        println!("hub: {}", session.auth_status());
        println!("output dir: {}", session.output_dir().display());
        println!("{info}");
    }
    Ok(())
}
