//! Practice exercises. Each one reports its own failure and the rest still run.

use anyhow::Result;
use dlab_core::{DevicePreference, GenerationRequest, LabSession};

use crate::{
    console::{banner, present, section},
    ExerciseName, Settings,
};

const WIZARD_NEGATIVE_PROMPT: &str = "blurry, low quality, bad anatomy, distorted";

pub fn run(settings: &Settings, which: ExerciseName) -> Result<()> {
    banner("Starting Diffusion Lab Exercises");

    // 1a pins itself to the CPU, the others share one session on the configured device
    if matches!(which, ExerciseName::Simple | ExerciseName::All) {
        simple_generation(settings);
    }

    if which != ExerciseName::Simple {
        let mut session = LabSession::new(settings.config.clone());
        if matches!(which, ExerciseName::Parameters | ExerciseName::All) {
            parameter_exploration(&mut session, settings);
        }
        if matches!(which, ExerciseName::Negative | ExerciseName::All) {
            negative_prompts(&mut session, settings);
        }
        if matches!(which, ExerciseName::Batch | ExerciseName::All) {
            batch_generation(&mut session, settings);
        }
    }

    println!("\nAll exercises completed!");
    Ok(())
}

/// Load the configured model unless it is already the one loaded.
fn ensure_loaded(session: &mut LabSession, settings: &Settings) -> dlab_core::Result<()> {
    if session.current_model() == Some(settings.model.as_str()) {
        return Ok(());
    }
    println!("Loading model... (this may take a few minutes)");
    session.load_model(&settings.model)
}

fn simple_generation(settings: &Settings) {
    section("Exercise 1a: Simple Generation");
    let mut session = LabSession::new(settings.config.clone().with_device(DevicePreference::Cpu));

    let result = ensure_loaded(&mut session, settings).and_then(|()| {
        let request = GenerationRequest::new("a red apple on a wooden table")
            .with_steps(25)
            .with_guidance_scale(7.5)
            .with_seed(123);
        session.generate_image(request)
    });
    match result {
        Ok(generated) => {
            present(&session, settings, &generated.image, "A red apple", "exercise_1a_apple.png");
            println!("Exercise 1a completed!");
        }
        Err(e) => {
            println!("Exercise 1a failed: {e:#}");
            println!("Make sure you have a valid Hugging Face token configured.");
        }
    }
}

fn parameter_exploration(session: &mut LabSession, settings: &Settings) {
    section("Exercise 1b: Parameter Exploration");
    if let Err(e) = ensure_loaded(session, settings) {
        println!("Exercise 1b failed: {e:#}");
        return;
    }

    let prompt = "a majestic lion in the savanna";
    for (i, scale) in [5.0, 10.0, 15.0].into_iter().enumerate() {
        println!("Generating with guidance scale: {scale:.1}");
        let request = GenerationRequest::new(prompt)
            .with_guidance_scale(scale)
            .with_steps(20)
            .with_seed(100 + i as u64);
        let saved = session.generate_image(request).and_then(|generated| {
            session.save_image(&generated.image, &format!("exercise_1b_lion_scale_{scale:.1}.png"))
        });
        if let Err(e) = saved {
            println!("Failed to generate with scale {scale:.1}: {e:#}");
        }
    }
    println!("Exercise 1b completed! Check your output images.");
}

fn negative_prompts(session: &mut LabSession, settings: &Settings) {
    section("Exercise 1c: Negative Prompts");
    let result = ensure_loaded(session, settings).and_then(|()| {
        let prompt = "portrait of a wise old wizard";
        println!("Generating without negative prompt...");
        let plain = session.generate_image(GenerationRequest::new(prompt).with_steps(25).with_seed(42))?;
        println!("Generating with negative prompt...");
        let guided = session.generate_image(
            GenerationRequest::new(prompt)
                .with_negative_prompt(WIZARD_NEGATIVE_PROMPT)
                .with_steps(25)
                .with_seed(42),
        )?;
        Ok((plain.into_image(), guided.into_image()))
    });

    match result {
        Ok((plain, guided)) => {
            present(session, settings, &plain, "Without negative prompt", "exercise_1c_wizard_no_negative.png");
            present(session, settings, &guided, "With negative prompt", "exercise_1c_wizard_with_negative.png");
            println!("Exercise 1c completed! Compare the two wizard images.");
        }
        Err(e) => println!("Exercise 1c failed: {e:#}"),
    }
}

fn batch_generation(session: &mut LabSession, settings: &Settings) {
    section("Bonus Exercise: Batch Generation");
    let result = ensure_loaded(session, settings).and_then(|()| {
        for i in 0..4 {
            println!("Generating variation {}/4...", i + 1);
            let request = GenerationRequest::new("a peaceful zen garden")
                .with_steps(20)
                .with_seed(200 + i as u64);
            let generated = session.generate_image(request)?;
            session.save_image(&generated.image, &format!("bonus_zen_garden_variation_{}.png", i + 1))?;
        }
        Ok(())
    });
    match result {
        Ok(()) => println!("Bonus exercise completed!"),
        Err(e) => println!("Bonus exercise failed: {e:#}"),
    }
}
