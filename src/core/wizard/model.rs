//! The wizard model: load/save workflow state plus the registration run.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::core::image::{FormatDetector, ImageFormat, LoadedImage, MagicFormatDetector};
use crate::core::registration::{
    AffineTransform, ProgressReading, RegistrationConfig, RegistrationInit, RegistrationMetric, RegistrationMode,
    RegistrationReport, RegistrationWorker, WorkerState,
};
use crate::error::{ImageIoError, RegistrationError, WizardError};
use crate::events::{EventBucket, EventChannel, EventKind, EventReceiver, EventSender, SourceId};

use super::delegate::{LoadDelegate, Observer, SaveDelegate};
use super::types::{FormatGuess, SummaryItem, WizardHints, WizardMode};

/// Handle returned by [`ImageLoadWizardModel::add_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(usize);

/// State behind the image IO wizard.
///
/// Lives on the foreground thread. The only cross-thread traffic is the
/// registration worker's progress channel and its marker events, which
/// [`process_events`](Self::process_events) turns into observer
/// notifications.
pub struct ImageLoadWizardModel {
    id: SourceId,
    mode: Option<WizardMode>,
    load_delegate: Option<Box<dyn LoadDelegate>>,
    save_delegate: Option<Box<dyn SaveDelegate>>,
    display_name: String,
    detector: Box<dyn FormatDetector>,
    hints: WizardHints,
    selected_format: Option<ImageFormat>,
    loaded_image: Option<LoadedImage>,
    warnings: Vec<String>,
    history: Vec<PathBuf>,
    sticky_overlay: bool,
    sticky_overlay_colormap: String,
    registration: RegistrationConfig,
    worker: Option<RegistrationWorker>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    bucket: EventBucket,
    batch_depth: u32,
    observers: Vec<(ObserverId, Weak<dyn Observer>)>,
    next_observer: usize,
}

impl ImageLoadWizardModel {
    pub fn new(hints: WizardHints) -> Self {
        Self::with_detector(hints, Box::new(MagicFormatDetector))
    }

    /// Use a custom format detection collaborator
    pub fn with_detector(hints: WizardHints, detector: Box<dyn FormatDetector>) -> Self {
        let (events_tx, events_rx) = EventChannel::new();
        Self {
            id: SourceId::new(),
            mode: None,
            load_delegate: None,
            save_delegate: None,
            display_name: String::new(),
            detector,
            sticky_overlay: hints.sticky_overlay,
            sticky_overlay_colormap: hints.sticky_overlay_colormap.clone(),
            registration: hints.registration.clone(),
            hints,
            selected_format: None,
            loaded_image: None,
            warnings: Vec::new(),
            history: Vec::new(),
            worker: None,
            events_tx,
            events_rx,
            bucket: EventBucket::new(),
            batch_depth: 0,
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Identity of this model as a notification source
    pub fn id(&self) -> SourceId {
        self.id
    }

    // ---------------------------------------------------------------
    // Observers and notification batching
    // ---------------------------------------------------------------

    pub fn add_observer<O: Observer + 'static>(&mut self, observer: &Arc<O>) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        let weak: Weak<dyn Observer> = Arc::downgrade(observer) as Weak<dyn Observer>;
        self.observers.push((id, weak));
        id
    }

    pub fn remove_observer(&mut self, id: ObserverId) {
        self.observers.retain(|(existing, _)| *existing != id);
    }

    /// Run `f` with notifications deferred; each distinct notification is
    /// delivered once when the outermost batch ends.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.batch_depth += 1;
        let result = f(self);
        self.batch_depth -= 1;
        if self.batch_depth == 0 {
            self.flush();
        }
        result
    }

    fn fire(&mut self, kind: EventKind) {
        self.bucket.put_event(kind, Some(self.id));
        if self.batch_depth == 0 {
            self.flush();
        }
    }

    /// Deliver every pending notification, then empty the bucket.
    fn flush(&mut self) -> usize {
        if self.bucket.is_empty() {
            return 0;
        }
        debug!(pending = %self.bucket, "Flushing wizard notifications");

        self.observers.retain(|(_, weak)| weak.strong_count() > 0);
        let records: Vec<_> = self.bucket.drain().collect();
        let live: Vec<Arc<dyn Observer>> = self
            .observers
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();

        for record in &records {
            for observer in &live {
                observer.notify(record.kind(), record.source());
            }
        }
        records.len()
    }

    /// Drain registration markers and notify observers.
    ///
    /// Call this from the foreground on a timer or idle hook. Markers from
    /// a previous run are ignored. Returns the number of distinct
    /// notifications delivered.
    pub fn process_events(&mut self) -> usize {
        let current = self.worker.as_ref().map(|w| SourceId::from(w.run_id()));
        let events = self.events_rx.drain();
        if let Some(worker) = &self.worker {
            worker.acknowledge_progress();
        }
        for event in events {
            if Some(event.source()) == current {
                self.bucket.put_event(event.kind(), Some(event.source()));
            }
        }
        if self.batch_depth == 0 {
            self.flush()
        } else {
            0
        }
    }

    // ---------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------

    pub fn initialize_for_load(&mut self, delegate: Box<dyn LoadDelegate>) {
        self.reset();
        self.display_name = delegate.display_name().to_string();
        self.load_delegate = Some(delegate);
        self.save_delegate = None;
        self.mode = Some(WizardMode::Load);
        self.fire(EventKind::StateChange);
    }

    pub fn initialize_for_save(&mut self, delegate: Box<dyn SaveDelegate>, display_name: &str) {
        self.reset();
        self.display_name = display_name.to_string();
        self.save_delegate = Some(delegate);
        self.load_delegate = None;
        self.mode = Some(WizardMode::Save);
        self.fire(EventKind::StateChange);
    }

    pub fn mode(&self) -> Option<WizardMode> {
        self.mode
    }

    pub fn is_load_mode(&self) -> bool {
        self.mode == Some(WizardMode::Load)
    }

    pub fn is_save_mode(&self) -> bool {
        self.mode == Some(WizardMode::Save)
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Name of the history list filenames are recorded under
    pub fn history_name(&self) -> Option<&str> {
        match (&self.load_delegate, &self.save_delegate) {
            (Some(delegate), _) => Some(delegate.history_name()),
            (_, Some(delegate)) => Some(delegate.history_name()),
            _ => None,
        }
    }

    /// Filenames accepted by `finalize` and `save_image`, oldest first
    pub fn history(&self) -> &[PathBuf] {
        &self.history
    }

    pub fn hints(&self) -> &WizardHints {
        &self.hints
    }

    /// Forget the loaded image and tear down any registration run.
    pub fn reset(&mut self) {
        self.teardown_registration();
        self.loaded_image = None;
        self.selected_format = None;
        self.warnings.clear();
    }

    // ---------------------------------------------------------------
    // Formats and files
    // ---------------------------------------------------------------

    /// Whether the current mode can read or write `format`
    pub fn can_handle_file_format(&self, format: ImageFormat) -> bool {
        match self.mode {
            Some(WizardMode::Save) => format.is_lossless(),
            _ => true,
        }
    }

    /// Guess the format of `path`.
    ///
    /// Load mode needs the file to exist and tries remembered formats,
    /// then the detector. Save mode uses remembered formats and the
    /// extension only.
    pub fn guess_file_format(&self, path: &Path) -> FormatGuess {
        let file_exists = path.is_file();
        let remembered = self.hints.known_formats.get(path).copied();

        let format = match self.mode {
            Some(WizardMode::Save) => remembered.or_else(|| ImageFormat::from_path(path)),
            _ if !file_exists => None,
            _ => remembered.or_else(|| self.detector.detect(path)),
        };

        FormatGuess {
            format,
            file_exists,
        }
    }

    pub fn file_format_by_name(&self, name: &str) -> Option<ImageFormat> {
        ImageFormat::from_name(name)
    }

    pub fn file_format_name(&self, format: ImageFormat) -> &'static str {
        format.name()
    }

    pub fn default_format_for_save(&self) -> ImageFormat {
        self.hints.default_save_format
    }

    pub fn set_selected_format(&mut self, format: Option<ImageFormat>) {
        if self.selected_format != format {
            self.selected_format = format;
            self.fire(EventKind::FormatChange);
        }
    }

    pub fn selected_format(&self) -> Option<ImageFormat> {
        self.selected_format
    }

    /// Directory a file browser should open in for `file`
    pub fn browse_directory(&self, file: &str) -> PathBuf {
        let candidate = if file.trim().is_empty() {
            self.history.last().and_then(|p| p.parent()).map(Path::to_path_buf)
        } else {
            let path = PathBuf::from(file);
            if path.is_dir() {
                Some(path)
            } else {
                path.parent().map(Path::to_path_buf)
            }
        };

        candidate
            .filter(|dir| dir.is_dir())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn file_size_in_bytes(&self, file: &Path) -> Result<u64, ImageIoError> {
        std::fs::metadata(file)
            .map(|m| m.len())
            .map_err(|source| ImageIoError::Io {
                path: file.to_path_buf(),
                source,
            })
    }

    pub fn suggested_filename(&self) -> Option<&Path> {
        self.hints.suggested_filename.as_deref()
    }

    pub fn set_suggested_filename(&mut self, path: Option<PathBuf>) {
        self.hints.suggested_filename = path;
    }

    pub fn suggested_format(&self) -> Option<ImageFormat> {
        self.hints.suggested_format
    }

    pub fn set_suggested_format(&mut self, format: Option<ImageFormat>) {
        self.hints.suggested_format = format;
    }

    // ---------------------------------------------------------------
    // Loading and saving
    // ---------------------------------------------------------------

    /// Read `path`, validate it through the delegate, and keep it.
    ///
    /// Any registration run from a previous image is torn down first.
    pub fn load_image(&mut self, path: &Path) -> Result<(), ImageIoError> {
        if !self.is_load_mode() {
            return Err(ImageIoError::NotInitialized("loading"));
        }

        let format = match self.selected_format {
            Some(format) => format,
            None => self
                .guess_file_format(path)
                .format
                .ok_or_else(|| ImageIoError::FormatNotDetermined {
                    path: path.to_path_buf(),
                })?,
        };
        if !self.can_handle_file_format(format) {
            return Err(ImageIoError::UnsupportedFormat {
                format: format.name().to_string(),
            });
        }

        self.teardown_registration();
        self.loaded_image = None;
        self.warnings.clear();

        let image = LoadedImage::open(path, format)?;
        if let Some(delegate) = &self.load_delegate {
            delegate.validate(&image, &mut self.warnings)?;
        }

        info!(
            path = %path.display(),
            format = %format,
            width = image.width,
            height = image.height,
            warnings = self.warnings.len(),
            "Loaded image"
        );
        self.hints.known_formats.insert(path.to_path_buf(), format);
        self.loaded_image = Some(image);
        self.fire(EventKind::ImageLoaded);
        Ok(())
    }

    /// Write through the save delegate and record the filename.
    pub fn save_image(&mut self, path: &Path) -> Result<(), ImageIoError> {
        if !self.is_save_mode() {
            return Err(ImageIoError::NotInitialized("saving"));
        }

        let format = self
            .selected_format
            .or_else(|| self.guess_file_format(path).format)
            .unwrap_or(self.hints.default_save_format);
        if !self.can_handle_file_format(format) {
            return Err(ImageIoError::UnsupportedFormat {
                format: format.name().to_string(),
            });
        }

        let delegate = self
            .save_delegate
            .as_mut()
            .ok_or(ImageIoError::NotInitialized("saving"))?;
        delegate.save(path, format)?;

        info!(path = %path.display(), format = %format, "Saved image");
        self.hints.known_formats.insert(path.to_path_buf(), format);
        self.remember(path.to_path_buf());
        Ok(())
    }

    pub fn is_image_loaded(&self) -> bool {
        self.loaded_image.is_some()
    }

    pub fn loaded_image(&self) -> Option<&LoadedImage> {
        self.loaded_image.as_ref()
    }

    /// Warnings produced by the last `load_image`
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Text for one row of the summary page; empty when nothing is loaded
    pub fn summary_item(&self, item: SummaryItem) -> String {
        let Some(image) = &self.loaded_image else {
            return String::new();
        };

        match item {
            SummaryItem::Filename => image.path.display().to_string(),
            SummaryItem::Dims => format!("{} x {}", image.width, image.height),
            SummaryItem::Spacing => format!("{} x {}", image.spacing[0], image.spacing[1]),
            SummaryItem::Origin => format!("({}, {})", image.origin[0], image.origin[1]),
            SummaryItem::Orientation => {
                let m = image.transform.matrix;
                format!("[{:.3} {:.3}; {:.3} {:.3}]", m[0][0], m[0][1], m[1][0], m[1][1])
            }
            SummaryItem::Components => image.components.to_string(),
            SummaryItem::DataType => image.data_type.clone(),
            SummaryItem::FileSize => format_bytes(image.file_size),
        }
    }

    /// Accept the loaded image and leave the wizard.
    ///
    /// A registration run must have reached a terminal state first.
    pub fn finalize(&mut self) -> Result<(), WizardError> {
        if let Some(worker) = &self.worker {
            let state = worker.state();
            if !state.is_terminal() {
                return Err(RegistrationError::InvalidState {
                    operation: "finalize",
                    state,
                }
                .into());
            }
        }

        if let Some(image) = &self.loaded_image {
            let path = image.path.clone();
            if let Some(delegate) = self.load_delegate.as_mut() {
                delegate.on_finalize(image);
            }
            self.remember(path);
        }
        Ok(())
    }

    fn remember(&mut self, path: PathBuf) {
        self.history.retain(|existing| existing != &path);
        self.history.push(path);
    }

    // ---------------------------------------------------------------
    // Overlay display settings
    // ---------------------------------------------------------------

    pub fn is_overlay(&self) -> bool {
        self.load_delegate
            .as_ref()
            .map(|d| d.is_overlay())
            .unwrap_or(false)
    }

    /// Whether the image being loaded should be registered
    pub fn use_registration(&self) -> bool {
        self.load_delegate
            .as_ref()
            .map(|d| d.is_overlay() && d.use_registration())
            .unwrap_or(false)
    }

    pub fn sticky_overlay(&self) -> bool {
        self.sticky_overlay
    }

    pub fn set_sticky_overlay(&mut self, sticky: bool) {
        if self.sticky_overlay != sticky {
            self.sticky_overlay = sticky;
            self.fire(EventKind::ValueChange);
        }
    }

    pub fn sticky_overlay_colormap(&self) -> &str {
        &self.sticky_overlay_colormap
    }

    pub fn set_sticky_overlay_colormap(&mut self, colormap: &str) {
        if self.sticky_overlay_colormap != colormap {
            self.sticky_overlay_colormap = colormap.to_string();
            self.fire(EventKind::ValueChange);
        }
    }

    // ---------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------

    pub fn registration_config(&self) -> &RegistrationConfig {
        &self.registration
    }

    pub fn registration_mode(&self) -> RegistrationMode {
        self.registration.mode
    }

    pub fn set_registration_mode(&mut self, mode: RegistrationMode) {
        if self.registration.mode != mode {
            self.registration.mode = mode;
            self.fire(EventKind::RegistrationSettingsChange);
        }
    }

    pub fn registration_metric(&self) -> RegistrationMetric {
        self.registration.metric
    }

    pub fn set_registration_metric(&mut self, metric: RegistrationMetric) {
        if self.registration.metric != metric {
            self.registration.metric = metric;
            self.fire(EventKind::RegistrationSettingsChange);
        }
    }

    pub fn registration_init(&self) -> RegistrationInit {
        self.registration.init
    }

    pub fn set_registration_init(&mut self, init: RegistrationInit) {
        if self.registration.init != init {
            self.registration.init = init;
            self.fire(EventKind::RegistrationSettingsChange);
        }
    }

    /// Modes a user may pick, with their labels
    pub fn registration_mode_domain(&self) -> Vec<(RegistrationMode, String)> {
        RegistrationMode::ALL
            .into_iter()
            .filter(|mode| mode.is_supported())
            .map(|mode| (mode, mode.to_string()))
            .collect()
    }

    pub fn registration_metric_domain(&self) -> Vec<(RegistrationMetric, String)> {
        RegistrationMetric::ALL
            .into_iter()
            .map(|metric| (metric, metric.to_string()))
            .collect()
    }

    pub fn registration_init_domain(&self) -> Vec<(RegistrationInit, String)> {
        RegistrationInit::ALL
            .into_iter()
            .map(|init| (init, init.to_string()))
            .collect()
    }

    /// Register the loaded overlay to the delegate's main image on a
    /// background thread, replacing any previous run.
    pub fn perform_registration(&mut self) -> Result<(), WizardError> {
        let overlay = self
            .loaded_image
            .as_ref()
            .ok_or(ImageIoError::NoImageLoaded)?
            .pixels();
        if !self.use_registration() {
            return Err(WizardError::Config(
                "registration is not enabled for this image".to_string(),
            ));
        }
        let reference = self
            .load_delegate
            .as_ref()
            .and_then(|d| d.reference_image())
            .ok_or_else(|| WizardError::Config("no main image to register against".to_string()))?;

        self.teardown_registration();
        let mut worker = RegistrationWorker::new(reference, overlay, self.events_tx.clone());
        worker.start(self.registration.clone())?;
        self.worker = Some(worker);
        self.fire(EventKind::StateChange);
        Ok(())
    }

    /// Apply the converged registration transform to the loaded image.
    ///
    /// Fails with `NotReady`, touching nothing, unless the run converged.
    pub fn update_image_transform_from_registration(&mut self) -> Result<(), WizardError> {
        let worker = self.worker.as_ref().ok_or(RegistrationError::NotReady)?;
        let image = self
            .loaded_image
            .as_mut()
            .ok_or(ImageIoError::NoImageLoaded)?;
        worker.apply_result_transform(image)?;
        self.fire(EventKind::ValueChange);
        Ok(())
    }

    /// Latest objective value of the current run
    pub fn registration_objective(&self) -> Result<f64, RegistrationError> {
        self.worker
            .as_ref()
            .ok_or(RegistrationError::Unavailable)?
            .objective()
    }

    pub fn registration_progress(&self) -> Option<ProgressReading> {
        self.worker.as_ref().map(|w| w.progress().try_read())
    }

    /// Transform reached by the latest iteration, for live display.
    ///
    /// Read-only; the loaded image keeps its transform until
    /// `update_image_transform_from_registration` succeeds.
    pub fn registration_preview_transform(&self) -> Option<AffineTransform> {
        self.worker.as_ref().and_then(|w| w.preview_transform())
    }

    /// `Idle` when no run exists
    pub fn registration_state(&self) -> WorkerState {
        self.worker
            .as_ref()
            .map(|w| w.state())
            .unwrap_or(WorkerState::Idle)
    }

    pub fn registration_failure(&self) -> Option<RegistrationError> {
        self.worker.as_ref().and_then(|w| w.failure())
    }

    pub fn registration_report(&self) -> Option<RegistrationReport> {
        self.worker.as_ref().map(|w| w.report())
    }

    pub fn cancel_registration(&self) {
        if let Some(worker) = &self.worker {
            worker.cancel();
        }
    }

    /// Block until the current run ends. For drivers without an event loop.
    pub fn wait_for_registration(&mut self) -> WorkerState {
        match self.worker.as_mut() {
            Some(worker) => worker.join(),
            None => WorkerState::Idle,
        }
    }

    fn teardown_registration(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!(run_id = %worker.run_id(), "Tearing down registration run");
            worker.cancel();
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::IntensityImage;
    use crate::core::registration::blobs;
    use crate::core::wizard::delegate::{DynamicImageSaver, OverlayLoadDelegate};
    use image::{DynamicImage, GrayImage, Luma};
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        seen: RefCell<Vec<(EventKind, Option<SourceId>)>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<EventKind> {
            self.seen.borrow().iter().map(|(kind, _)| *kind).collect()
        }

        fn count(&self, kind: EventKind) -> usize {
            self.kinds().into_iter().filter(|k| *k == kind).count()
        }
    }

    impl Observer for Recorder {
        fn notify(&self, kind: EventKind, source: Option<SourceId>) {
            self.seen.borrow_mut().push((kind, source));
        }
    }

    fn write_png(dir: &TempDir, name: &str, pixels: &IntensityImage) -> PathBuf {
        let path = dir.path().join(name);
        let gray = GrayImage::from_fn(pixels.width(), pixels.height(), |x, y| {
            let value = pixels.get(x, y).unwrap_or(0.0);
            Luma([(value.clamp(0.0, 1.0) * 255.0).round() as u8])
        });
        gray.save_with_format(&path, image::ImageFormat::Png).unwrap();
        path
    }

    fn overlay_wizard() -> ImageLoadWizardModel {
        let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
        wizard.initialize_for_load(Box::new(OverlayLoadDelegate::new(blobs(0.0, 0.0))));
        wizard
    }

    #[test]
    fn batch_delivers_one_notification_per_distinct_kind() {
        let mut wizard = overlay_wizard();
        let recorder = Arc::new(Recorder::default());
        wizard.add_observer(&recorder);

        wizard.batch(|w| {
            w.set_selected_format(Some(ImageFormat::Png));
            w.set_selected_format(Some(ImageFormat::Tiff));
            w.set_registration_mode(RegistrationMode::Affine);
            w.set_registration_metric(RegistrationMetric::MeanSquares);
        });

        assert_eq!(
            recorder.kinds(),
            vec![EventKind::FormatChange, EventKind::RegistrationSettingsChange]
        );
        assert!(recorder.seen.borrow().iter().all(|(_, s)| *s == Some(wizard.id())));
    }

    #[test]
    fn unchanged_settings_do_not_notify() {
        let mut wizard = overlay_wizard();
        let recorder = Arc::new(Recorder::default());
        wizard.add_observer(&recorder);

        wizard.set_registration_mode(wizard.registration_mode());
        wizard.set_sticky_overlay(wizard.sticky_overlay());

        assert!(recorder.kinds().is_empty());
    }

    #[test]
    fn dropped_and_removed_observers_are_not_notified() {
        let mut wizard = overlay_wizard();
        let kept = Arc::new(Recorder::default());
        let removed = Arc::new(Recorder::default());
        let dropped = Arc::new(Recorder::default());
        wizard.add_observer(&kept);
        let handle = wizard.add_observer(&removed);
        wizard.add_observer(&dropped);
        wizard.remove_observer(handle);
        drop(dropped);

        wizard.set_sticky_overlay_colormap("Hot");

        assert_eq!(kept.kinds(), vec![EventKind::ValueChange]);
        assert!(removed.kinds().is_empty());
        assert_eq!(wizard.observers.len(), 1);
    }

    #[test]
    fn guess_format_depends_on_mode() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.png");
        let wizard = overlay_wizard();

        let guess = wizard.guess_file_format(&missing);
        assert_eq!(guess.format, None);
        assert!(!guess.file_exists);

        let mut saver = ImageLoadWizardModel::new(WizardHints::default());
        saver.initialize_for_save(
            Box::new(DynamicImageSaver::new(
                DynamicImage::ImageLuma8(GrayImage::new(4, 4)),
                "Segmentation",
            )),
            "Save Segmentation",
        );
        assert_eq!(saver.guess_file_format(&missing).format, Some(ImageFormat::Png));
        assert!(!saver.can_handle_file_format(ImageFormat::Jpeg));
        assert!(wizard.can_handle_file_format(ImageFormat::Jpeg));
    }

    #[test]
    fn remembered_format_wins_over_detection() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "scan.dat", &blobs(0.0, 0.0));
        let mut hints = WizardHints::default();
        hints.known_formats.insert(path.clone(), ImageFormat::Png);
        let mut wizard = ImageLoadWizardModel::new(hints);
        wizard.initialize_for_load(Box::new(OverlayLoadDelegate::new(blobs(0.0, 0.0))));

        assert_eq!(wizard.guess_file_format(&path).format, Some(ImageFormat::Png));
    }

    #[test]
    fn load_fills_summary_and_notifies() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(1.0, 1.0));
        let mut wizard = overlay_wizard();
        let recorder = Arc::new(Recorder::default());
        wizard.add_observer(&recorder);

        assert_eq!(wizard.summary_item(SummaryItem::Dims), "");
        wizard.load_image(&path).unwrap();

        assert!(wizard.is_image_loaded());
        assert!(wizard.warnings().is_empty());
        assert_eq!(wizard.summary_item(SummaryItem::Dims), "48 x 48");
        assert_eq!(wizard.summary_item(SummaryItem::Components), "1");
        let size = wizard.summary_item(SummaryItem::FileSize);
        assert!(size.ends_with("bytes") || size.ends_with("KB"));
        assert_eq!(recorder.kinds(), vec![EventKind::ImageLoaded]);
    }

    #[test]
    fn load_without_initialization_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(0.0, 0.0));
        let mut wizard = ImageLoadWizardModel::new(WizardHints::default());

        let result = wizard.load_image(&path);
        assert!(matches!(result, Err(ImageIoError::NotInitialized(_))));
    }

    #[test]
    fn registration_queries_without_a_run() {
        let mut wizard = overlay_wizard();

        assert_eq!(wizard.registration_state(), WorkerState::Idle);
        assert_eq!(wizard.registration_objective(), Err(RegistrationError::Unavailable));
        assert!(matches!(
            wizard.update_image_transform_from_registration(),
            Err(WizardError::Registration(RegistrationError::NotReady))
        ));
        assert!(matches!(
            wizard.perform_registration(),
            Err(WizardError::ImageIo(ImageIoError::NoImageLoaded))
        ));
        wizard.cancel_registration();
    }

    #[test]
    fn deformable_registration_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(2.0, 0.0));
        let mut wizard = overlay_wizard();
        wizard.load_image(&path).unwrap();
        wizard.set_registration_mode(RegistrationMode::Deformable);

        let result = wizard.perform_registration();

        assert!(matches!(
            result,
            Err(WizardError::Registration(RegistrationError::UnsupportedMode(_)))
        ));
        assert_eq!(wizard.registration_state(), WorkerState::Idle);
        assert!(!wizard
            .registration_mode_domain()
            .iter()
            .any(|(mode, _)| *mode == RegistrationMode::Deformable));
    }

    #[test]
    fn registration_requires_an_overlay_that_wants_it() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(1.0, 0.0));
        let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
        wizard.initialize_for_load(Box::new(
            OverlayLoadDelegate::new(blobs(0.0, 0.0)).without_registration(),
        ));
        wizard.load_image(&path).unwrap();

        assert!(wizard.is_overlay());
        assert!(!wizard.use_registration());
        assert!(matches!(wizard.perform_registration(), Err(WizardError::Config(_))));
        assert_eq!(wizard.registration_state(), WorkerState::Idle);
    }

    #[test]
    fn converged_registration_updates_image_transform() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(3.0, -2.0));
        let mut wizard = overlay_wizard();
        let recorder = Arc::new(Recorder::default());
        wizard.add_observer(&recorder);
        wizard.load_image(&path).unwrap();
        wizard.set_registration_metric(RegistrationMetric::MeanSquares);
        wizard.set_registration_init(RegistrationInit::Identity);

        wizard.perform_registration().unwrap();
        assert_eq!(wizard.wait_for_registration(), WorkerState::Converged);
        wizard.process_events();

        assert_eq!(recorder.count(EventKind::RegistrationProgress), 1);
        assert!(wizard.registration_objective().is_ok());
        let reading = wizard.registration_progress().unwrap();
        assert!(reading.has_result);

        wizard.update_image_transform_from_registration().unwrap();
        let transform = wizard.loaded_image().unwrap().transform;
        assert!(transform.offset[0] > 1.0);
        assert!(transform.offset[1] < -1.0);

        wizard.finalize().unwrap();
        assert_eq!(wizard.history(), &[path]);
    }

    #[test]
    fn finalize_refuses_a_running_registration() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(3.0, -2.0));
        let mut wizard = overlay_wizard();
        wizard.load_image(&path).unwrap();
        wizard.registration = RegistrationConfig::new()
            .metric(RegistrationMetric::MeanSquares)
            .max_iterations(u64::MAX)
            .step_bounds(2.0, 0.0);

        wizard.perform_registration().unwrap();
        let result = wizard.finalize();
        assert!(matches!(
            result,
            Err(WizardError::Registration(RegistrationError::InvalidState { .. }))
        ));

        wizard.cancel_registration();
        assert_eq!(wizard.wait_for_registration(), WorkerState::Cancelled);
        let before = wizard.loaded_image().unwrap().transform;
        assert!(wizard.update_image_transform_from_registration().is_err());
        assert_eq!(wizard.loaded_image().unwrap().transform, before);
        wizard.finalize().unwrap();
    }

    #[test]
    fn preview_follows_the_run_without_touching_the_image() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(3.0, -2.0));
        let mut wizard = overlay_wizard();
        wizard.load_image(&path).unwrap();
        wizard.registration = RegistrationConfig::new()
            .metric(RegistrationMetric::MeanSquares)
            .init(RegistrationInit::Identity)
            .max_iterations(u64::MAX)
            .step_bounds(2.0, 0.0);
        assert_eq!(wizard.registration_preview_transform(), None);

        wizard.perform_registration().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
        loop {
            match wizard.registration_preview_transform() {
                Some(transform) if transform != AffineTransform::identity() => break,
                _ => {}
            }
            assert!(std::time::Instant::now() < deadline, "preview never moved");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert_eq!(
            wizard.loaded_image().unwrap().transform,
            AffineTransform::identity()
        );
        wizard.cancel_registration();
        assert_eq!(wizard.wait_for_registration(), WorkerState::Cancelled);
        assert_eq!(
            wizard.loaded_image().unwrap().transform,
            AffineTransform::identity()
        );
    }

    #[test]
    fn polling_acknowledges_progress_markers() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(3.0, -2.0));
        let mut wizard = overlay_wizard();
        let recorder = Arc::new(Recorder::default());
        wizard.add_observer(&recorder);
        wizard.load_image(&path).unwrap();
        wizard.registration = RegistrationConfig::new()
            .metric(RegistrationMetric::MeanSquares)
            .max_iterations(u64::MAX)
            .step_bounds(2.0, 0.0);

        wizard.perform_registration().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
        while recorder.count(EventKind::RegistrationProgress) < 2 {
            wizard.process_events();
            assert!(std::time::Instant::now() < deadline, "progress stalled");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        wizard.cancel_registration();
        assert_eq!(wizard.wait_for_registration(), WorkerState::Cancelled);
        assert!(wizard.events_rx.drain().len() <= 2);
    }

    #[test]
    fn reloading_tears_down_the_previous_run() {
        let dir = TempDir::new().unwrap();
        let path = write_png(&dir, "overlay.png", &blobs(1.0, 0.0));
        let mut wizard = overlay_wizard();
        wizard.load_image(&path).unwrap();
        wizard.perform_registration().unwrap();

        wizard.load_image(&path).unwrap();

        assert_eq!(wizard.registration_state(), WorkerState::Idle);
        assert!(wizard.registration_report().is_none());
        assert_eq!(wizard.process_events(), 0);
    }

    #[test]
    fn save_records_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.png");
        let mut wizard = ImageLoadWizardModel::new(WizardHints::default());
        wizard.initialize_for_save(
            Box::new(DynamicImageSaver::new(
                DynamicImage::ImageLuma8(GrayImage::new(4, 4)),
                "Segmentation",
            )),
            "Save Segmentation",
        );

        wizard.save_image(&path).unwrap();

        assert!(path.exists());
        assert_eq!(wizard.history_name(), Some("Segmentation"));
        assert_eq!(wizard.history(), &[path.clone()]);
        assert_eq!(wizard.browse_directory(""), dir.path().to_path_buf());
        assert_eq!(
            wizard.file_size_in_bytes(&path).unwrap(),
            std::fs::metadata(&path).unwrap().len()
        );
    }

    #[test]
    fn byte_sizes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
