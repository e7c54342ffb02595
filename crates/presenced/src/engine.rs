use image::GrayImage;
use presence_core::{
    Command, Config, FaceGallery, LedgerStore, Overlay, RegisterOutcome, ScrfdLocator, SessionController,
    SessionDriver, SessionEvent, SessionState, TemplateMatcher, TrackMode,
};
use presence_hw::Camera;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] presence_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] presence_core::DetectorError),
    #[error(transparent)]
    Session(#[from] presence_core::SessionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        name: String,
        reply: oneshot::Sender<Result<RegisterOutcome, EngineError>>,
    },
    Track {
        reply: oneshot::Sender<Result<Option<String>, EngineError>>,
    },
}

/// Counts requests that are queued or running, and gates cancels on it.
///
/// A cancel is only sent while some request is outstanding, and leftover
/// commands are drained when a request finishes, under the same lock.
struct CancelGate {
    outstanding: Mutex<usize>,
    commands: std_mpsc::Sender<Command>,
}

impl CancelGate {
    fn new(commands: std_mpsc::Sender<Command>) -> Self {
        Self {
            outstanding: Mutex::new(0),
            commands,
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) {
        *self.lock() += 1;
    }

    /// Returns whether a session was there to receive the cancel.
    fn cancel(&self) -> Result<bool, EngineError> {
        let outstanding = self.lock();
        if *outstanding == 0 {
            return Ok(false);
        }
        self.commands.send(Command::Quit).map_err(|_| EngineError::ChannelClosed)?;
        Ok(true)
    }

    /// Called once per request, after its session ended or it was never sent.
    fn finish(&self, rx: Option<&std_mpsc::Receiver<Command>>) {
        let mut outstanding = self.lock();
        *outstanding = outstanding.saturating_sub(1);
        if let Some(rx) = rx {
            while let Ok(command) = rx.try_recv() {
                tracing::debug!(?command, "dropping command left over from finished session");
            }
        }
    }

    fn is_busy(&self) -> bool {
        *self.lock() > 0
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gate: Arc<CancelGate>,
}

impl EngineHandle {
    async fn submit(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.gate.begin();
        if self.tx.send(request).await.is_err() {
            self.gate.finish(None);
            return Err(EngineError::ChannelClosed);
        }
        Ok(())
    }

    /// Register the first face seen under `name`.
    pub async fn register(&self, name: String) -> Result<RegisterOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(EngineRequest::Register { name, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Mark the first recognized person. `None` when cancelled or timed out.
    pub async fn track(&self) -> Result<Option<String>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(EngineRequest::Track { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the running or next queued session. Does nothing while idle.
    pub fn cancel(&self) -> Result<bool, EngineError> {
        self.gate.cancel()
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }
}

/// Everything the engine thread needs besides the detector.
struct EngineContext {
    camera_device: String,
    warmup_frames: usize,
    timeout: Option<Duration>,
    gallery: FaceGallery,
    ledger: LedgerStore,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The detector loads up front so a missing model fails at startup. The
/// camera is opened per session and released when the session ends.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let model_path = config.scrfd_model_path();
    let mut locator = ScrfdLocator::load(&model_path, config.detector)?;
    tracing::info!(path = %model_path, "SCRFD detector loaded");

    let ctx = EngineContext {
        camera_device: config.camera_device.clone(),
        warmup_frames: config.warmup_frames,
        timeout: config.service_timeout(),
        gallery: FaceGallery::new(&config.gallery_dir),
        ledger: LedgerStore::new(&config.ledger_path),
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (cmd_tx, cmd_rx) = std_mpsc::channel::<Command>();
    let gate = Arc::new(CancelGate::new(cmd_tx));
    let engine_gate = Arc::clone(&gate);

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { name, reply } => {
                        let mut driver = ServiceDriver::new(&cmd_rx, true);
                        let result = run_register(&ctx, &mut locator, &name, &mut driver);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Track { reply } => {
                        let mut driver = ServiceDriver::new(&cmd_rx, false);
                        let result = run_track(&ctx, &mut locator, &mut driver);
                        let _ = reply.send(result);
                    }
                }
                engine_gate.finish(Some(&cmd_rx));
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, gate })
}

fn open_camera(ctx: &EngineContext) -> Result<Camera, EngineError> {
    let camera = Camera::open(&ctx.camera_device)?;
    camera.warm_up(ctx.warmup_frames);
    Ok(camera)
}

fn run_register(
    ctx: &EngineContext,
    locator: &mut ScrfdLocator,
    name: &str,
    driver: &mut ServiceDriver<'_>,
) -> Result<RegisterOutcome, EngineError> {
    presence_core::gallery::validate_name(name).map_err(presence_core::SessionError::from)?;
    let camera = open_camera(ctx)?;
    let outcome = SessionController::new(camera, locator)
        .with_timeout(ctx.timeout)
        .register(&ctx.gallery, name, driver)?;
    tracing::info!(name, ?outcome, "register finished");
    Ok(outcome)
}

fn run_track(
    ctx: &EngineContext,
    locator: &mut ScrfdLocator,
    driver: &mut ServiceDriver<'_>,
) -> Result<Option<String>, EngineError> {
    // Snapshot before opening the camera so an empty gallery fails without it.
    let state = SessionState::start(&ctx.gallery, ctx.ledger.clone())?;
    if state.gallery().is_empty() {
        return Err(presence_core::SessionError::NoRegisteredFaces.into());
    }
    let camera = open_camera(ctx)?;
    let summary = SessionController::new(camera, locator)
        .with_timeout(ctx.timeout)
        .track(state, &TemplateMatcher, TrackMode::SingleShot, driver)?;
    tracing::info!(reason = ?summary.reason, frames = summary.frames, "track finished");
    Ok(summary.marked.into_iter().next())
}

/// Session driver with no user at the keyboard.
///
/// Commands arrive over the engine's command channel. In auto-save mode it
/// asks to save as soon as a frame with a face has been rendered.
pub struct ServiceDriver<'a> {
    commands: &'a std_mpsc::Receiver<Command>,
    auto_save: bool,
    face_in_view: bool,
}

impl<'a> ServiceDriver<'a> {
    pub fn new(commands: &'a std_mpsc::Receiver<Command>, auto_save: bool) -> Self {
        Self {
            commands,
            auto_save,
            face_in_view: false,
        }
    }
}

impl SessionDriver for ServiceDriver<'_> {
    fn poll_command(&mut self) -> Option<Command> {
        match self.commands.try_recv() {
            Ok(command) => Some(command),
            Err(std_mpsc::TryRecvError::Disconnected) => Some(Command::Quit),
            Err(std_mpsc::TryRecvError::Empty) => {
                (self.auto_save && self.face_in_view).then_some(Command::Save)
            }
        }
    }

    fn render(&mut self, frame: &GrayImage, overlays: &[Overlay]) {
        self.face_in_view = !overlays.is_empty();
        tracing::trace!(
            width = frame.width(),
            height = frame.height(),
            faces = overlays.len(),
            "frame processed"
        );
    }

    fn notify(&mut self, event: &SessionEvent) {
        tracing::debug!(?event, "session event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::BoundingBox;

    fn overlay() -> Overlay {
        Overlay {
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            label: "Alice".into(),
        }
    }

    #[test]
    fn test_driver_forwards_commands() {
        let (tx, rx) = std_mpsc::channel();
        let mut driver = ServiceDriver::new(&rx, false);
        assert_eq!(driver.poll_command(), None);

        tx.send(Command::Quit).unwrap();
        assert_eq!(driver.poll_command(), Some(Command::Quit));
        assert_eq!(driver.poll_command(), None);
    }

    #[test]
    fn test_driver_quits_when_handle_dropped() {
        let (tx, rx) = std_mpsc::channel::<Command>();
        drop(tx);
        let mut driver = ServiceDriver::new(&rx, false);
        assert_eq!(driver.poll_command(), Some(Command::Quit));
    }

    #[test]
    fn test_auto_save_waits_for_face() {
        let (_tx, rx) = std_mpsc::channel();
        let mut driver = ServiceDriver::new(&rx, true);
        let frame = GrayImage::new(4, 4);

        driver.render(&frame, &[]);
        assert_eq!(driver.poll_command(), None);

        driver.render(&frame, &[overlay()]);
        assert_eq!(driver.poll_command(), Some(Command::Save));
    }

    #[test]
    fn test_cancel_beats_auto_save() {
        let (tx, rx) = std_mpsc::channel();
        let mut driver = ServiceDriver::new(&rx, true);
        driver.render(&GrayImage::new(4, 4), &[overlay()]);
        tx.send(Command::Quit).unwrap();
        assert_eq!(driver.poll_command(), Some(Command::Quit));
    }

    #[test]
    fn test_cancel_while_idle_is_dropped() {
        let (tx, rx) = std_mpsc::channel();
        let gate = CancelGate::new(tx);
        assert!(!gate.cancel().unwrap());
        assert!(rx.try_recv().is_err());
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_cancel_reaches_queued_request() {
        let (tx, rx) = std_mpsc::channel();
        let gate = CancelGate::new(tx);

        // Request queued, engine has not picked it up yet.
        gate.begin();
        assert!(gate.is_busy());
        assert!(gate.cancel().unwrap());

        let mut driver = ServiceDriver::new(&rx, false);
        assert_eq!(driver.poll_command(), Some(Command::Quit));
        gate.finish(Some(&rx));
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_leftover_cancel_drained_when_session_ends() {
        let (tx, rx) = std_mpsc::channel();
        let gate = CancelGate::new(tx);

        gate.begin();
        assert!(gate.cancel().unwrap());
        // The session ended on its own before reading the cancel.
        gate.finish(Some(&rx));

        gate.begin();
        let mut driver = ServiceDriver::new(&rx, false);
        assert_eq!(driver.poll_command(), None);
    }

    #[test]
    fn test_spawn_without_model_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            model_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let err = spawn_engine(&config).err().unwrap();
        assert!(matches!(err, EngineError::Detector(_)));
    }
}
