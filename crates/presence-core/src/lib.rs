//! presence-core: face identification and attendance engine.
//!
//! Locates faces with SCRFD via ONNX Runtime, identifies them against a
//! gallery of grayscale reference crops by template distance, and records
//! each identified person once per session in a CSV ledger.

pub mod config;
pub mod detector;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod session;
pub mod types;

pub use config::Config;
pub use detector::{DetectorError, FaceLocator, LocatorParams, ScrfdLocator};
pub use gallery::{FaceGallery, Gallery, GalleryError};
pub use ledger::{AttendanceEvent, AttendanceLedger, LedgerError, LedgerStore};
pub use matcher::{Matcher, TemplateMatcher};
pub use session::{
    CaptureError, Command, EndReason, FrameSource, RegisterOutcome, SessionController, SessionDriver,
    SessionError, SessionEvent, SessionState, TrackMode, TrackSummary,
};
pub use types::{BoundingBox, DetectedFace, MatchResult, Overlay};
