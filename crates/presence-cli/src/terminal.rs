use crate::input::{parse_command, LineReader};
use crate::preview;
use image::GrayImage;
use presence_core::ledger::TIMESTAMP_FORMAT;
use presence_core::{Command, Overlay, SessionDriver, SessionEvent};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Session driver for an interactive terminal.
///
/// Commands are typed lines; feedback is printed, and frames go to the
/// optional preview file.
pub struct TerminalDriver<'a> {
    input: &'a mut LineReader,
    queued: VecDeque<Command>,
    preview_path: Option<PathBuf>,
    last_labels: Option<Vec<String>>,
}

impl<'a> TerminalDriver<'a> {
    pub fn new(input: &'a mut LineReader, preview_path: Option<PathBuf>) -> Self {
        Self {
            input,
            queued: VecDeque::new(),
            preview_path,
            last_labels: None,
        }
    }
}

impl SessionDriver for TerminalDriver<'_> {
    fn poll_command(&mut self) -> Option<Command> {
        for line in self.input.ready_lines() {
            match parse_command(&line) {
                Some(command) => self.queued.push_back(command),
                None if line.trim().is_empty() => {}
                None => println!("Unknown command {:?}", line.trim()),
            }
        }
        match self.queued.pop_front() {
            Some(command) => Some(command),
            // Nobody can type a quit any more.
            None if self.input.is_eof() => Some(Command::Quit),
            None => None,
        }
    }

    fn render(&mut self, frame: &GrayImage, overlays: &[Overlay]) {
        let labels: Vec<String> = overlays.iter().map(|o| o.label.clone()).collect();
        if self.last_labels.as_ref() != Some(&labels) {
            if labels.is_empty() {
                println!("No face in view");
            } else {
                println!("In view: {}", labels.join(", "));
            }
            self.last_labels = Some(labels);
        }

        if let Some(path) = &self.preview_path {
            if let Err(e) = preview::write(path, frame, overlays) {
                tracing::warn!(path = %path.display(), error = %e, "failed to write preview frame");
            }
        }
    }

    fn notify(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Marked { name, timestamp } => {
                println!("Attendance marked for {name} at {}", timestamp.format(TIMESTAMP_FORMAT));
            }
            SessionEvent::MarkFailed { name, error } => {
                println!("Could not write attendance for {name}: {error}");
            }
            SessionEvent::Paused => println!("Paused. Type 'c' and Enter to continue."),
            SessionEvent::Resumed => println!("Resumed."),
            SessionEvent::NoFaceToSave => println!("No face in view, nothing saved. Try again."),
            SessionEvent::Registered { name, .. } => println!("{name} registered successfully!"),
        }
    }
}
