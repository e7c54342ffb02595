//! Session controller.
//!
//! A session owns the camera for its whole lifetime and runs one frame at a
//! time: acquire, locate, match, record, render, then poll the shell for a
//! command. Shells plug in through [`SessionDriver`]; they never see the loop.
//!
//! ```text
//! Idle -> Capturing -> Detecting -> Capturing ... -> Terminated
//!             |  ^
//!       Pause v  | Resume
//!            Paused
//! ```

use crate::detector::{DetectorError, FaceLocator};
use crate::gallery::{validate_name, FaceGallery, Gallery, GalleryError};
use crate::ledger::{AttendanceLedger, LedgerError, LedgerStore};
use crate::matcher::Matcher;
use crate::types::{DetectedFace, Overlay};
use chrono::{Local, NaiveDateTime, Timelike};
use image::GrayImage;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long a paused session waits between command polls.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The camera could not be opened or read.
#[derive(Error, Debug)]
#[error("camera unavailable: {0}")]
pub struct CaptureError(pub String);

/// Blocking source of grayscale frames. Dropping it releases the device.
pub trait FrameSource {
    fn acquire(&mut self) -> Result<GrayImage, CaptureError>;
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("face locator failed: {0}")]
    Locator(#[from] DetectorError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("no registered faces in the gallery")]
    NoRegisteredFaces,
}

/// Commands a shell can issue while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Save,
    Quit,
}

/// Things the shell may want to tell its user about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Marked { name: String, timestamp: NaiveDateTime },
    /// The identity stays marked for this run even though the row was not written.
    MarkFailed { name: String, error: String },
    Paused,
    Resumed,
    NoFaceToSave,
    Registered { name: String, path: PathBuf },
}

/// The shell side of a session: command input and feedback output.
pub trait SessionDriver {
    /// Next pending command, without blocking.
    fn poll_command(&mut self) -> Option<Command>;
    fn render(&mut self, frame: &GrayImage, overlays: &[Overlay]);
    fn notify(&mut self, event: &SessionEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
    /// Keep going until quit, marking each identity once.
    Continuous,
    /// Stop as soon as one identity has been marked.
    SingleShot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Capturing,
    Detecting,
    Paused,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Quit,
    Matched,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSummary {
    pub reason: EndReason,
    /// Identities marked this run, in marking order.
    pub marked: Vec<String>,
    pub frames: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Saved(PathBuf),
    Cancelled,
    TimedOut,
}

/// Everything a tracking run needs that does not outlive it.
#[derive(Debug)]
pub struct SessionState {
    gallery: Gallery,
    ledger: AttendanceLedger,
    paused: bool,
}

impl SessionState {
    pub fn new(gallery: Gallery, ledger: AttendanceLedger) -> Self {
        Self {
            gallery,
            ledger,
            paused: false,
        }
    }

    /// Snapshot the gallery and open the ledger for a fresh run.
    pub fn start(gallery: &FaceGallery, ledger: LedgerStore) -> Result<Self, SessionError> {
        Ok(Self::new(gallery.load(), AttendanceLedger::open(ledger)?))
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }
}

/// Drives one session over a frame source it owns.
pub struct SessionController<'l, S, L> {
    source: S,
    locator: &'l mut L,
    phase: Phase,
    deadline: Option<Instant>,
    frames: u64,
}

impl<'l, S: FrameSource, L: FaceLocator> SessionController<'l, S, L> {
    /// `source` should have been opened just now; the controller releases it when the session ends.
    pub fn new(source: S, locator: &'l mut L) -> Self {
        let mut controller = Self {
            source,
            locator,
            phase: Phase::Idle,
            deadline: None,
            frames: 0,
        };
        controller.enter(Phase::Capturing);
        controller
    }

    /// End the session with `TimedOut` once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Identify faces frame by frame and mark attendance.
    pub fn track<M: Matcher, D: SessionDriver>(
        mut self,
        mut state: SessionState,
        matcher: &M,
        mode: TrackMode,
        driver: &mut D,
    ) -> Result<TrackSummary, SessionError> {
        if state.gallery.is_empty() {
            self.enter(Phase::Terminated);
            return Err(SessionError::NoRegisteredFaces);
        }
        tracing::info!(identities = state.gallery.len(), ?mode, "tracking started");

        let mut marked = Vec::new();
        let reason = loop {
            if self.expired() {
                break EndReason::TimedOut;
            }

            if !state.paused {
                let frame = self.next_frame()?;
                let faces = self.locator.locate(&frame)?;

                let mut overlays = Vec::with_capacity(faces.len());
                let mut matched = false;
                for bbox in faces {
                    let Some(face) = DetectedFace::from_frame(&frame, bbox) else {
                        continue;
                    };
                    let result = matcher.identify(&face, &state.gallery);
                    overlays.push(Overlay {
                        bbox,
                        label: result.label().to_string(),
                    });

                    let Some(name) = result.name() else {
                        continue;
                    };
                    let timestamp = now();
                    match state.ledger.record_if_new(name, timestamp) {
                        Ok(true) => {
                            marked.push(name.to_string());
                            driver.notify(&SessionEvent::Marked {
                                name: name.to_string(),
                                timestamp,
                            });
                            if mode == TrackMode::SingleShot {
                                matched = true;
                                break;
                            }
                        }
                        Ok(false) => {}
                        Err(e) if mode == TrackMode::SingleShot => return Err(e.into()),
                        Err(e) => {
                            tracing::error!(name, error = %e, "failed to record attendance");
                            driver.notify(&SessionEvent::MarkFailed {
                                name: name.to_string(),
                                error: e.to_string(),
                            });
                        }
                    }
                }

                driver.render(&frame, &overlays);
                self.enter(Phase::Capturing);
                if matched {
                    break EndReason::Matched;
                }
            } else {
                std::thread::sleep(PAUSE_POLL_INTERVAL);
            }

            match driver.poll_command() {
                Some(Command::Quit) => break EndReason::Quit,
                Some(Command::Pause) if !state.paused => {
                    state.paused = true;
                    self.enter(Phase::Paused);
                    driver.notify(&SessionEvent::Paused);
                }
                Some(Command::Resume) if state.paused => {
                    state.paused = false;
                    self.enter(Phase::Capturing);
                    driver.notify(&SessionEvent::Resumed);
                }
                _ => {}
            }
        };

        self.enter(Phase::Terminated);
        tracing::info!(?reason, marked = marked.len(), frames = self.frames, "tracking ended");
        Ok(TrackSummary {
            reason,
            marked,
            frames: self.frames,
        })
    }

    /// Show located faces until the shell asks to save, then store the first face as `name`.
    pub fn register<D: SessionDriver>(
        mut self,
        gallery: &FaceGallery,
        name: &str,
        driver: &mut D,
    ) -> Result<RegisterOutcome, SessionError> {
        let name = match validate_name(name) {
            Ok(name) => name,
            Err(e) => {
                self.enter(Phase::Terminated);
                return Err(e.into());
            }
        };
        tracing::info!(name, "registration started");

        let outcome = loop {
            if self.expired() {
                break RegisterOutcome::TimedOut;
            }

            let frame = self.next_frame()?;
            let faces = self.locator.locate(&frame)?;
            let overlays: Vec<Overlay> = faces
                .iter()
                .map(|bbox| Overlay {
                    bbox: *bbox,
                    label: name.to_string(),
                })
                .collect();
            driver.render(&frame, &overlays);
            self.enter(Phase::Capturing);

            match driver.poll_command() {
                Some(Command::Save) => match faces.first() {
                    Some(bbox) => {
                        let path = gallery.register(name, &frame, bbox)?;
                        driver.notify(&SessionEvent::Registered {
                            name: name.to_string(),
                            path: path.clone(),
                        });
                        break RegisterOutcome::Saved(path);
                    }
                    None => driver.notify(&SessionEvent::NoFaceToSave),
                },
                Some(Command::Quit) => break RegisterOutcome::Cancelled,
                _ => {}
            }
        };

        self.enter(Phase::Terminated);
        tracing::info!(name, ?outcome, frames = self.frames, "registration ended");
        Ok(outcome)
    }

    fn next_frame(&mut self) -> Result<GrayImage, SessionError> {
        let frame = self.source.acquire().map_err(|e| {
            tracing::error!(error = %e, "frame acquisition failed");
            e
        })?;
        self.frames += 1;
        self.enter(Phase::Detecting);
        Ok(frame)
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::trace!(from = ?self.phase, to = ?phase, "session phase");
            self.phase = phase;
        }
    }
}

/// Local wall-clock time at whole-second precision.
fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::TemplateMatcher;
    use crate::types::BoundingBox;
    use image::Luma;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Camera fake: serves `frame` forever (or fails after `fail_after` reads).
    struct FakeCamera {
        frame: GrayImage,
        fail_after: Option<usize>,
        reads: Rc<Cell<usize>>,
        released: Rc<Cell<bool>>,
    }

    impl FrameSource for FakeCamera {
        fn acquire(&mut self) -> Result<GrayImage, CaptureError> {
            if self.fail_after.is_some_and(|n| self.reads.get() >= n) {
                return Err(CaptureError("device unplugged".into()));
            }
            self.reads.set(self.reads.get() + 1);
            Ok(self.frame.clone())
        }
    }

    impl Drop for FakeCamera {
        fn drop(&mut self) {
            self.released.set(true);
        }
    }

    struct FixedLocator(Vec<BoundingBox>);

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, _frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Replays `commands` one per poll, then quits.
    #[derive(Default)]
    struct ScriptedDriver {
        commands: VecDeque<Option<Command>>,
        events: Vec<SessionEvent>,
        renders: Vec<Vec<String>>,
    }

    impl ScriptedDriver {
        fn new(commands: impl IntoIterator<Item = Option<Command>>) -> Self {
            Self {
                commands: commands.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl SessionDriver for ScriptedDriver {
        fn poll_command(&mut self) -> Option<Command> {
            self.commands.pop_front().unwrap_or(Some(Command::Quit))
        }

        fn render(&mut self, _frame: &GrayImage, overlays: &[Overlay]) {
            self.renders.push(overlays.iter().map(|o| o.label.clone()).collect());
        }

        fn notify(&mut self, event: &SessionEvent) {
            self.events.push(event.clone());
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        faces: FaceGallery,
        ledger: LedgerStore,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                faces: FaceGallery::new(dir.path().join("known_faces")),
                ledger: LedgerStore::new(dir.path().join("attendance.csv")),
                _dir: dir,
            }
        }

        fn state(&self) -> SessionState {
            SessionState::start(&self.faces, self.ledger.clone()).unwrap()
        }
    }

    fn alice_face() -> GrayImage {
        GrayImage::from_fn(50, 60, |x, y| Luma([(40 + x * 3 + y * 2) as u8]))
    }

    const ALICE_BOX: BoundingBox = BoundingBox {
        x: 40.0,
        y: 30.0,
        width: 50.0,
        height: 60.0,
        confidence: 0.9,
    };

    fn frame_with_alice() -> GrayImage {
        let mut frame = GrayImage::new(200, 150);
        image::imageops::replace(&mut frame, &alice_face(), 40, 30);
        frame
    }

    fn camera(frame: GrayImage, fail_after: Option<usize>) -> (FakeCamera, Rc<Cell<usize>>, Rc<Cell<bool>>) {
        let reads = Rc::new(Cell::new(0));
        let released = Rc::new(Cell::new(false));
        let cam = FakeCamera {
            frame,
            fail_after,
            reads: reads.clone(),
            released: released.clone(),
        };
        (cam, reads, released)
    }

    fn fixture_with_alice() -> Fixture {
        let fx = Fixture::new();
        fx.faces.register("Alice", &frame_with_alice(), &ALICE_BOX).unwrap();
        fx
    }

    #[test]
    fn test_single_shot_ends_after_first_mark() {
        let fx = fixture_with_alice();
        let (cam, reads, released) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(vec![ALICE_BOX]);
        let mut driver = ScriptedDriver::new([None, None, None]);

        let summary = SessionController::new(cam, &mut locator)
            .track(fx.state(), &TemplateMatcher, TrackMode::SingleShot, &mut driver)
            .unwrap();

        assert_eq!(summary.reason, EndReason::Matched);
        assert_eq!(summary.marked, vec!["Alice".to_string()]);
        assert_eq!(reads.get(), 1);
        assert!(released.get());
        assert_eq!(driver.renders, vec![vec!["Alice".to_string()]]);
        assert!(matches!(&driver.events[..], [SessionEvent::Marked { name, .. }] if name == "Alice"));

        let events = fx.ledger.events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Alice");
    }

    #[test]
    fn test_continuous_marks_each_identity_once() {
        let fx = fixture_with_alice();
        let (cam, reads, released) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(vec![ALICE_BOX]);
        let mut driver = ScriptedDriver::new([None, None, Some(Command::Quit)]);

        let summary = SessionController::new(cam, &mut locator)
            .track(fx.state(), &TemplateMatcher, TrackMode::Continuous, &mut driver)
            .unwrap();

        assert_eq!(summary.reason, EndReason::Quit);
        assert_eq!(summary.frames, 3);
        assert_eq!(reads.get(), 3);
        assert!(released.get());
        assert_eq!(driver.renders.len(), 3);
        assert!(driver.renders.iter().all(|labels| labels == &["Alice"]));
        assert_eq!(fx.ledger.events().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_face_is_labelled_and_not_recorded() {
        let fx = fixture_with_alice();
        let stranger = GrayImage::from_pixel(200, 150, Luma([250]));
        let (cam, _, _) = camera(stranger, None);
        let mut locator = FixedLocator(vec![ALICE_BOX]);
        let mut driver = ScriptedDriver::new([None, Some(Command::Quit)]);

        let summary = SessionController::new(cam, &mut locator)
            .track(fx.state(), &TemplateMatcher, TrackMode::Continuous, &mut driver)
            .unwrap();

        assert!(summary.marked.is_empty());
        assert_eq!(driver.renders[0], vec!["Unknown".to_string()]);
        assert!(fx.ledger.events().unwrap().is_empty());
    }

    #[test]
    fn test_frame_without_faces_is_not_an_error() {
        let fx = fixture_with_alice();
        let (cam, _, _) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(Vec::new());
        let mut driver = ScriptedDriver::new([None, Some(Command::Quit)]);

        let summary = SessionController::new(cam, &mut locator)
            .track(fx.state(), &TemplateMatcher, TrackMode::Continuous, &mut driver)
            .unwrap();

        assert_eq!(summary.frames, 2);
        assert!(driver.renders.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_new_session_is_capturing() {
        let (cam, reads, released) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(Vec::new());
        let controller = SessionController::new(cam, &mut locator);
        assert_eq!(controller.phase(), Phase::Capturing);
        drop(controller);
        assert_eq!(reads.get(), 0);
        assert!(released.get());
    }

    #[test]
    fn test_pause_suspends_acquisition() {
        let fx = fixture_with_alice();
        let (cam, reads, _) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(Vec::new());
        let mut driver = ScriptedDriver::new([
            Some(Command::Pause),
            None,
            Some(Command::Pause),
            Some(Command::Resume),
            Some(Command::Quit),
        ]);

        let summary = SessionController::new(cam, &mut locator)
            .track(fx.state(), &TemplateMatcher, TrackMode::Continuous, &mut driver)
            .unwrap();

        // One frame before the pause, one after the resume.
        assert_eq!(reads.get(), 2);
        assert_eq!(summary.frames, 2);
        assert_eq!(driver.events, vec![SessionEvent::Paused, SessionEvent::Resumed]);
    }

    #[test]
    fn test_capture_failure_propagates_and_releases() {
        let fx = fixture_with_alice();
        let (cam, _, released) = camera(frame_with_alice(), Some(1));
        let mut locator = FixedLocator(Vec::new());
        let mut driver = ScriptedDriver::new([None, None]);

        let err = SessionController::new(cam, &mut locator)
            .track(fx.state(), &TemplateMatcher, TrackMode::Continuous, &mut driver)
            .unwrap_err();

        assert!(matches!(err, SessionError::Capture(_)));
        assert!(released.get());
    }

    #[test]
    fn test_empty_gallery_fails_fast() {
        let fx = Fixture::new();
        let (cam, reads, released) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(vec![ALICE_BOX]);
        let mut driver = ScriptedDriver::default();

        let err = SessionController::new(cam, &mut locator)
            .track(fx.state(), &TemplateMatcher, TrackMode::SingleShot, &mut driver)
            .unwrap_err();

        assert!(matches!(err, SessionError::NoRegisteredFaces));
        assert_eq!(reads.get(), 0);
        assert!(released.get());
    }

    #[test]
    fn test_deadline_times_out() {
        let fx = fixture_with_alice();
        let (cam, reads, _) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(vec![ALICE_BOX]);
        let mut driver = ScriptedDriver::default();

        let summary = SessionController::new(cam, &mut locator)
            .with_timeout(Some(Duration::ZERO))
            .track(fx.state(), &TemplateMatcher, TrackMode::SingleShot, &mut driver)
            .unwrap();

        assert_eq!(summary.reason, EndReason::TimedOut);
        assert_eq!(reads.get(), 0);
        assert!(fx.ledger.events().unwrap().is_empty());
    }

    #[test]
    fn test_register_saves_first_face() {
        let fx = Fixture::new();
        let (cam, _, released) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(vec![ALICE_BOX, BoundingBox::new(0.0, 0.0, 20.0, 20.0)]);
        let mut driver = ScriptedDriver::new([None, Some(Command::Save)]);

        let outcome = SessionController::new(cam, &mut locator)
            .register(&fx.faces, "Alice", &mut driver)
            .unwrap();

        let RegisterOutcome::Saved(path) = outcome else {
            panic!("expected Saved, got {outcome:?}");
        };
        assert!(path.exists());
        assert!(released.get());
        assert_eq!(driver.renders[0], vec!["Alice".to_string(), "Alice".to_string()]);
        assert_eq!(fx.faces.load().get("Alice"), Some(&alice_face()));
    }

    #[test]
    fn test_register_save_without_face_keeps_going() {
        let fx = Fixture::new();
        let (cam, reads, _) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(Vec::new());
        let mut driver = ScriptedDriver::new([Some(Command::Save), None, Some(Command::Quit)]);

        let outcome = SessionController::new(cam, &mut locator)
            .register(&fx.faces, "Alice", &mut driver)
            .unwrap();

        assert_eq!(outcome, RegisterOutcome::Cancelled);
        assert_eq!(reads.get(), 3);
        assert_eq!(driver.events, vec![SessionEvent::NoFaceToSave]);
        assert!(fx.faces.load().is_empty());
    }

    #[test]
    fn test_register_quit_leaves_gallery_untouched() {
        let fx = fixture_with_alice();
        let before = fx.faces.load().get("Alice").cloned();
        let (cam, _, _) = camera(GrayImage::from_pixel(200, 150, Luma([7])), None);
        let mut locator = FixedLocator(vec![ALICE_BOX]);
        let mut driver = ScriptedDriver::new([Some(Command::Quit)]);

        let outcome = SessionController::new(cam, &mut locator)
            .register(&fx.faces, "Alice", &mut driver)
            .unwrap();

        assert_eq!(outcome, RegisterOutcome::Cancelled);
        assert_eq!(fx.faces.load().get("Alice").cloned(), before);
    }

    #[test]
    fn test_register_degenerate_box_is_empty_capture() {
        let fx = Fixture::new();
        let (cam, _, released) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(vec![BoundingBox::new(500.0, 500.0, 10.0, 10.0)]);
        let mut driver = ScriptedDriver::new([Some(Command::Save)]);

        let err = SessionController::new(cam, &mut locator)
            .register(&fx.faces, "Alice", &mut driver)
            .unwrap_err();

        assert!(matches!(err, SessionError::Gallery(GalleryError::EmptyCapture)));
        assert!(released.get());
        assert!(fx.faces.load().is_empty());
    }

    #[test]
    fn test_register_invalid_name_reads_no_frames() {
        let fx = Fixture::new();
        let (cam, reads, _) = camera(frame_with_alice(), None);
        let mut locator = FixedLocator(vec![ALICE_BOX]);
        let mut driver = ScriptedDriver::default();

        let err = SessionController::new(cam, &mut locator)
            .register(&fx.faces, "../Alice", &mut driver)
            .unwrap_err();

        assert!(matches!(err, SessionError::Gallery(GalleryError::InvalidName(_))));
        assert_eq!(reads.get(), 0);
    }
}
