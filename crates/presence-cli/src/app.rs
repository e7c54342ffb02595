//! The operations both the menu and the subcommands run.

use crate::input::LineReader;
use crate::terminal::TerminalDriver;
use anyhow::{Context, Result};
use presence_core::ledger::TIMESTAMP_FORMAT;
use presence_core::{
    gallery, AttendanceEvent, Config, FaceGallery, LedgerStore, RegisterOutcome, ScrfdLocator,
    SessionController, SessionError, SessionState, TemplateMatcher, TrackMode, TrackSummary,
};
use presence_hw::Camera;
use tabled::settings::Style;
use tabled::{Table, Tabled};

pub struct App {
    config: Config,
    input: LineReader,
}

#[derive(Tabled)]
struct LogRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Timestamp")]
    timestamp: String,
}

impl App {
    pub fn new(config: Config, input: LineReader) -> Self {
        Self { config, input }
    }

    /// Terminal input shared by prompts and sessions.
    pub fn input(&mut self) -> &mut LineReader {
        &mut self.input
    }

    fn gallery(&self) -> FaceGallery {
        FaceGallery::new(&self.config.gallery_dir)
    }

    fn ledger(&self) -> LedgerStore {
        LedgerStore::new(&self.config.ledger_path)
    }

    fn open_locator(&self) -> Result<ScrfdLocator> {
        ScrfdLocator::load(&self.config.scrfd_model_path(), self.config.detector)
            .context("failed to load face detector")
    }

    fn open_camera(&self) -> Result<Camera> {
        let camera = Camera::open(&self.config.camera_device)
            .with_context(|| format!("camera unavailable: {}", self.config.camera_device))?;
        camera.warm_up(self.config.warmup_frames);
        Ok(camera)
    }

    pub fn register(&mut self, name: &str) -> Result<RegisterOutcome> {
        // Reject bad names before touching the camera.
        let name = gallery::validate_name(name)?;
        let gallery = self.gallery();
        let mut locator = self.open_locator()?;
        let camera = self.open_camera()?;
        let mut driver = TerminalDriver::new(&mut self.input, self.config.preview_path.clone());

        println!("Registering {name}. Face the camera, type 's' and Enter to save, 'q' to cancel.");
        let outcome = SessionController::new(camera, &mut locator)
            .with_timeout(self.config.session_timeout())
            .register(&gallery, name, &mut driver)?;

        match &outcome {
            RegisterOutcome::Saved(_) => {}
            RegisterOutcome::Cancelled => println!("Cancelled, face not saved."),
            RegisterOutcome::TimedOut => println!("Timed out, face not saved."),
        }
        Ok(outcome)
    }

    pub fn track(&mut self, mode: TrackMode) -> Result<TrackSummary> {
        let state = SessionState::start(&self.gallery(), self.ledger())?;
        if state.gallery().is_empty() {
            return Err(SessionError::NoRegisteredFaces.into());
        }
        tracing::debug!(identities = ?state.gallery().names().collect::<Vec<_>>(), "gallery snapshot");

        let mut locator = self.open_locator()?;
        let camera = self.open_camera()?;
        let mut driver = TerminalDriver::new(&mut self.input, self.config.preview_path.clone());

        match mode {
            TrackMode::Continuous => {
                println!("Tracking attendance. Type 'p' to pause, 'c' to continue, 'q' to quit (then Enter).")
            }
            TrackMode::SingleShot => println!("Look at the camera. Type 'q' and Enter to cancel."),
        }
        let summary = SessionController::new(camera, &mut locator)
            .with_timeout(self.config.session_timeout())
            .track(state, &TemplateMatcher, mode, &mut driver)?;

        println!("Marked {} this session.", summary.marked.len());
        Ok(summary)
    }

    pub fn show_log(&self) -> Result<()> {
        let events = self.ledger().events()?;
        println!("{}", render_log(&events));
        Ok(())
    }

    /// Clear the log if `confirmed`. Returns whether anything was done.
    pub fn clear_log(&self, confirmed: bool) -> Result<bool> {
        if !confirmed {
            println!("Attendance log left unchanged.");
            return Ok(false);
        }
        self.ledger().clear()?;
        println!("Attendance log has been cleared!");
        Ok(true)
    }

    pub fn list_devices(&self) {
        let devices = Camera::list_devices();
        if devices.is_empty() {
            println!("No video capture devices found.");
        }
        for dev in devices {
            let marker = if dev.path == self.config.camera_device { "*" } else { " " };
            println!("{marker} {}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
        }
    }
}

fn render_log(events: &[AttendanceEvent]) -> String {
    if events.is_empty() {
        return "No attendance recorded yet.".to_string();
    }
    let rows = events.iter().map(|e| LogRow {
        name: e.name.clone(),
        timestamp: e.timestamp.format(TIMESTAMP_FORMAT).to_string(),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}
