//! Numbered main menu for interactive use.

use crate::app::App;
use crate::input::LineReader;
use anyhow::Result;
use presence_core::TrackMode;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Register,
    Track,
    ViewLog,
    ClearLog,
    Exit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "1" => Some(Self::Register),
            "2" => Some(Self::Track),
            "3" => Some(Self::ViewLog),
            "4" => Some(Self::ClearLog),
            "5" => Some(Self::Exit),
            _ => None,
        }
    }
}

const MENU: &str = "\
Face Recognition Attendance System
  1. Register Face
  2. Track Attendance
  3. View Attendance Log
  4. Clear Attendance Log
  5. Exit";

pub const CLEAR_QUESTION: &str = "Clear the attendance log?";

/// Print `label` and read one line. `None` once input is closed.
fn prompt(input: &mut LineReader, label: &str) -> io::Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    Ok(input.read_line()?.map(|line| line.trim().to_string()))
}

/// Answers starting with `y` count as yes.
pub fn is_yes(answer: &str) -> bool {
    answer.trim().to_ascii_lowercase().starts_with('y')
}

/// Ask a yes/no question. Closed input answers no.
pub fn confirm(input: &mut LineReader, question: &str) -> io::Result<bool> {
    Ok(prompt(input, &format!("{question} [y/N] "))?.is_some_and(|a| is_yes(&a)))
}

pub fn run(app: &mut App) -> Result<()> {
    loop {
        println!("\n{MENU}");
        let Some(line) = prompt(app.input(), "Select an option: ")? else {
            return Ok(());
        };
        let Some(choice) = MenuChoice::parse(&line) else {
            println!("Please choose a number from 1 to 5.");
            continue;
        };

        let result = match choice {
            MenuChoice::Register => match prompt(app.input(), "Enter the name of the person: ")? {
                Some(name) => app.register(&name).map(drop),
                None => return Ok(()),
            },
            MenuChoice::Track => app.track(TrackMode::Continuous).map(drop),
            MenuChoice::ViewLog => app.show_log(),
            MenuChoice::ClearLog => {
                let confirmed = confirm(app.input(), CLEAR_QUESTION)?;
                app.clear_log(confirmed).map(drop)
            }
            MenuChoice::Exit => return Ok(()),
        };

        if let Err(e) = result {
            tracing::debug!(error = ?e, "menu action failed");
            println!("Error: {e:#}");
        }
    }
}
