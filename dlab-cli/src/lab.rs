//! The guided lab: four short labs run in order, each allowed to fail on its own.

use anyhow::Result;
use dlab_core::{output, GenerationRequest, LabSession};

use crate::{
    console::{banner, present, section},
    Settings,
};

const INTRO: &str = "
This lab teaches diffusion models through hands-on examples:

1. Basic text-to-image generation
2. Exploring different prompts
3. Understanding guidance scale
4. Inspecting the loaded model
";

const LAB2_PROMPTS: [&str; 3] = [
    "a cute robot painting a picture, cartoon style",
    "a majestic dragon flying over a medieval castle",
    "a futuristic city with flying cars, cyberpunk style",
];

const LAB3_GUIDANCE_SCALES: [f64; 3] = [1.0, 7.5, 15.0];

pub fn run(settings: &Settings) -> Result<()> {
    banner("Welcome to the Diffusion Models Lab!");
    println!("{INTRO}");

    section("Lab Initialization");
    let mut session = LabSession::new(settings.config.clone());
    println!("device: {}", session.device());
    println!("hub: {}", session.auth_status());

    section("Lab 1: Basic Text-to-Image Generation");
    if let Err(e) = basic_generation(&mut session, settings) {
        println!("Error in Lab 1: {e:#}");
        println!("This might be due to a missing Hugging Face token or model access issues.");
    }

    section("Lab 2: Exploring Different Prompts");
    match prompt_exploration(&mut session) {
        Ok(()) => println!(
            "All images generated! Check the '{}' folder.",
            session.output_dir().display()
        ),
        Err(e) => println!("Error in Lab 2: {e:#}"),
    }

    section("Lab 3: Understanding Guidance Scale");
    if let Err(e) = guidance_scale(&mut session, settings) {
        println!("Error in Lab 3: {e:#}");
    }

    section("Lab 4: Model Information");
    println!("Current model information:");
    println!("{}", session.get_model_info());

    banner("Lab Complete!");
    println!(
        "
Congratulations! You've completed the basic diffusion models lab.

Next steps:
1. Try the exercises with `dlab exercise`
2. Compare samplers with `dlab compare-schedulers`
3. Experiment with different models and parameters
"
    );
    Ok(())
}

fn basic_generation(session: &mut LabSession, settings: &Settings) -> dlab_core::Result<()> {
    println!("Loading Stable Diffusion model...");
    session.load_model(&settings.model)?;

    let prompt = "a beautiful sunset over mountains, digital art";
    println!("Generating image with prompt: '{prompt}'");
    let image = session
        .generate_image(GenerationRequest::new(prompt).with_steps(20).with_seed(42))?
        .into_image();
    present(session, settings, &image, "Lab 1: Basic Generation", "lab1_basic_generation.png");
    Ok(())
}

fn prompt_exploration(session: &mut LabSession) -> dlab_core::Result<()> {
    for (i, prompt) in LAB2_PROMPTS.iter().enumerate() {
        println!("Generating image {}/{}: '{prompt}'", i + 1, LAB2_PROMPTS.len());
        let request = GenerationRequest::new(*prompt)
            .with_steps(20)
            .with_seed(42 + i as u64);
        let image = session.generate_image(request)?.into_image();
        session.save_image(&image, &format!("lab2_prompt_{}.png", i + 1))?;
    }
    Ok(())
}

fn guidance_scale(session: &mut LabSession, settings: &Settings) -> dlab_core::Result<()> {
    let prompt = "a serene lake with mountains in the background";
    let mut images = Vec::with_capacity(LAB3_GUIDANCE_SCALES.len());
    for scale in LAB3_GUIDANCE_SCALES {
        println!("Generating with guidance scale: {scale:.1}");
        let request = GenerationRequest::new(prompt)
            .with_guidance_scale(scale)
            .with_steps(20)
            .with_seed(42);
        let image = session.generate_image(request)?.into_image();
        session.save_image(&image, &format!("lab3_guidance_{scale:.1}.png"))?;
        images.push(image);
    }

    if let Some(sheet) = output::contact_sheet(&images) {
        let titles = LAB3_GUIDANCE_SCALES.map(|s| format!("{s:.1}")).join(" | ");
        present(
            session,
            settings,
            &sheet,
            &format!("Guidance scale: {titles}"),
            "lab3_guidance_comparison.png",
        );
    }
    Ok(())
}
