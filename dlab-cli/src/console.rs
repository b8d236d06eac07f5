use dlab_core::LabSession;
use image::DynamicImage;

use crate::Settings;

pub fn banner(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("  {title}");
    println!("{}", "=".repeat(60));
}

pub fn section(title: &str) {
    println!("\n--- {title} ---");
}

/// Show the image unless display is off.
pub fn show(session: &LabSession, settings: &Settings, image: &DynamicImage, title: &str) {
    if settings.display {
        // display errors are already logged by the session
        let _ = session.display_image(image, title);
    }
}

/// Show, then save. Save failures are reported and do not stop the caller.
pub fn present(session: &LabSession, settings: &Settings, image: &DynamicImage, title: &str, filename: &str) {
    show(session, settings, image, title);
    match session.save_image(image, filename) {
        Ok(path) => println!("saved {}", path.display()),
        Err(e) => eprintln!("could not save {filename}: {e}"),
    }
}
