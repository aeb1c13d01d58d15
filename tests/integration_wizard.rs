//! Integration tests for the wizard model.
//!
//! These tests drive the wizard the way a UI would:
//! - Load a main image and an overlay from disk
//! - Register the overlay while polling from the foreground
//! - Save through a save delegate

use assert_fs::prelude::*;
use image::{DynamicImage, GrayImage, Luma};
use image_load_wizard::core::image::ImageFormat;
use image_load_wizard::core::registration::{RegistrationInit, RegistrationMetric, WorkerState};
use image_load_wizard::core::wizard::{
    DynamicImageSaver, ImageLoadWizardModel, MainImageLoadDelegate, Observer, OverlayLoadDelegate,
    SummaryItem, WizardHints,
};
use image_load_wizard::error::ImageIoError;
use image_load_wizard::events::{EventKind, SourceId};
use predicates::prelude::*;
use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Two gaussian blobs shifted by `(dx, dy)`
fn blob_image(dx: f32, dy: f32) -> GrayImage {
    GrayImage::from_fn(48, 48, |x, y| {
        let blob = |cx: f32, cy: f32, sigma: f32, amplitude: f32| {
            let ddx = x as f32 - cx - dx;
            let ddy = y as f32 - cy - dy;
            amplitude * (-(ddx * ddx + ddy * ddy) / (2.0 * sigma * sigma)).exp()
        };
        let value = blob(16.0, 20.0, 4.0, 1.0) + blob(30.0, 30.0, 3.0, 0.6);
        Luma([(value.clamp(0.0, 1.0) * 255.0).round() as u8])
    })
}

#[derive(Default)]
struct Recorder {
    seen: RefCell<Vec<(EventKind, Option<SourceId>)>>,
}

impl Observer for Recorder {
    fn notify(&self, kind: EventKind, source: Option<SourceId>) {
        self.seen.borrow_mut().push((kind, source));
    }
}

fn load_main(path: &Path) -> ImageLoadWizardModel {
    let mut main = ImageLoadWizardModel::new(WizardHints::default());
    main.initialize_for_load(Box::new(MainImageLoadDelegate::new()));
    main.load_image(path).unwrap();
    main
}

#[test]
fn overlay_registration_end_to_end() {
    let temp = assert_fs::TempDir::new().unwrap();
    let main_png = temp.child("main.png");
    let overlay_png = temp.child("overlay.png");
    blob_image(0.0, 0.0).save(main_png.path()).unwrap();
    blob_image(2.0, 3.0).save(overlay_png.path()).unwrap();

    let main = load_main(main_png.path());
    let reference = main.loaded_image().unwrap().pixels();

    let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
    wizard.initialize_for_load(Box::new(OverlayLoadDelegate::new(reference)));
    let recorder = Arc::new(Recorder::default());
    wizard.add_observer(&recorder);

    wizard.load_image(overlay_png.path()).unwrap();
    assert!(wizard.use_registration());
    assert!(wizard.warnings().is_empty());

    wizard.batch(|w| {
        w.set_registration_metric(RegistrationMetric::MeanSquares);
        w.set_registration_init(RegistrationInit::Identity);
    });
    wizard.perform_registration().unwrap();

    // Poll like a UI timer would
    let deadline = Instant::now() + Duration::from_secs(60);
    while !wizard.registration_state().is_terminal() {
        wizard.process_events();
        assert!(Instant::now() < deadline, "registration did not finish");
        thread::sleep(Duration::from_millis(5));
    }
    wizard.process_events();

    assert_eq!(wizard.registration_state(), WorkerState::Converged);
    let kinds: Vec<EventKind> = recorder.seen.borrow().iter().map(|(k, _)| *k).collect();
    assert!(kinds.contains(&EventKind::ImageLoaded));
    assert!(kinds.contains(&EventKind::RegistrationProgress));
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::RegistrationSettingsChange)
            .count(),
        1
    );

    wizard.update_image_transform_from_registration().unwrap();
    let transform = wizard.loaded_image().unwrap().transform;
    assert!((transform.offset[0] - 2.0).abs() < 1.0);
    assert!((transform.offset[1] - 3.0).abs() < 1.0);

    let report = wizard.registration_report().unwrap();
    assert_eq!(report.state, WorkerState::Converged);
    assert!(report.iterations > 0);
    assert!(serde_json::to_string(&report).unwrap().contains("\"converged\""));

    wizard.finalize().unwrap();
    assert_eq!(wizard.history(), &[overlay_png.path().to_path_buf()]);
}

#[test]
fn corrupt_file_is_rejected_without_state_change() {
    let temp = assert_fs::TempDir::new().unwrap();
    let corrupt = temp.child("broken.png");
    corrupt.write_str("this is not a valid image file").unwrap();

    let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
    wizard.initialize_for_load(Box::new(MainImageLoadDelegate::new()));

    let result = wizard.load_image(corrupt.path());

    assert!(matches!(result, Err(ImageIoError::Decode { .. })));
    assert!(!wizard.is_image_loaded());
    assert_eq!(wizard.summary_item(SummaryItem::Filename), "");
}

#[test]
fn detection_uses_content_not_extension() {
    let temp = assert_fs::TempDir::new().unwrap();
    let mislabeled = temp.child("scan.jpg");
    blob_image(0.0, 0.0).save_with_format(mislabeled.path(), image::ImageFormat::Png).unwrap();

    let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
    wizard.initialize_for_load(Box::new(MainImageLoadDelegate::new()));

    let guess = wizard.guess_file_format(mislabeled.path());
    assert!(guess.file_exists);
    assert_eq!(guess.format, Some(ImageFormat::Png));

    wizard.load_image(mislabeled.path()).unwrap();
    assert_eq!(wizard.loaded_image().unwrap().format, ImageFormat::Png);
    assert_eq!(
        wizard.hints().known_formats.get(mislabeled.path()),
        Some(&ImageFormat::Png)
    );
}

#[test]
fn save_mode_writes_lossless_formats_only() {
    let temp = assert_fs::TempDir::new().unwrap();
    let target = temp.child("labels.tif");

    let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
    wizard.initialize_for_save(
        Box::new(DynamicImageSaver::new(
            DynamicImage::ImageLuma8(blob_image(0.0, 0.0)),
            "Segmentation",
        )),
        "Save Segmentation",
    );

    wizard.set_selected_format(Some(ImageFormat::Jpeg));
    let rejected = wizard.save_image(temp.child("labels.jpg").path());
    assert!(matches!(rejected, Err(ImageIoError::UnsupportedFormat { .. })));
    temp.child("labels.jpg").assert(predicate::path::missing());

    wizard.set_selected_format(None);
    wizard.save_image(target.path()).unwrap();

    target.assert(predicate::path::is_file());
    assert_eq!(wizard.history(), &[target.path().to_path_buf()]);
    assert_eq!(wizard.browse_directory(""), temp.path().to_path_buf());
}

#[test]
fn hints_survive_a_json_round_trip_on_disk() {
    let temp = assert_fs::TempDir::new().unwrap();
    let file = temp.child("hints.json");

    let mut hints = WizardHints::default();
    hints.suggested_format = Some(ImageFormat::Tiff);
    hints.registration = hints.registration.clone().max_iterations(25);
    file.write_str(&serde_json::to_string_pretty(&hints).unwrap())
        .unwrap();
    file.assert(predicate::str::contains("max_iterations"));

    let text = std::fs::read_to_string(file.path()).unwrap();
    let parsed: WizardHints = serde_json::from_str(&text).unwrap();
    let wizard = ImageLoadWizardModel::new(parsed);

    assert_eq!(wizard.suggested_format(), Some(ImageFormat::Tiff));
    assert_eq!(wizard.registration_config().max_iterations, 25);
}
