//! Command matcher.
//!
//! Inputs are tested against an ordered list of patterns before any
//! knowledge-base lookup. The first pattern that matches decides the
//! command; a matched command bypasses retrieval entirely.
//!
//! | Order | Intent         | Example                          |
//! |-------|----------------|----------------------------------|
//! | 1     | Screen capture | `what's on my screen`            |
//! | 2     | Image file     | `~/Pictures/diagram.png`         |

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use kb_assist_core::models::{ImageData, ImageFormat, Message, Role};

const SCREENSHOT_PATTERN: &str = r"(?i)\b(?:(?:what(?:'s|\s+is)?|show)[\s.,!?]*(?:(?:on|in)[\s.,!?]*)?my[\s.,!?]*screen|screen\s*shot|capture[\s.,!?]*(?:my|the)[\s.,!?]*screen)";

const IMAGE_PATH_PATTERN: &str =
    r"(?i)(?:[a-z]:\\|~?/)?(?:[\w.-]+[\\/])*[\w-]+\.(?:png|jpe?g|gif|webp|bmp)\b";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no screen capture tool available (tried: {0})")]
    CaptureUnavailable(String),
    #[error("screen capture failed: {0}")]
    CaptureFailed(String),
    #[error("invalid command pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Grabs the current screen as PNG bytes.
pub trait ScreenCapture: Send + Sync {
    fn capture(&self) -> Result<Vec<u8>, CommandError>;
}

/// Shells out to the first screenshot tool found on the system.
#[derive(Debug, Default)]
pub struct SystemScreenCapture;

/// (program, arguments before the output path)
const CAPTURE_TOOLS: &[(&str, &[&str])] = &[
    ("screencapture", &["-x"]),
    ("grim", &[]),
    ("gnome-screenshot", &["-f"]),
    ("import", &["-window", "root"]),
];

impl ScreenCapture for SystemScreenCapture {
    fn capture(&self) -> Result<Vec<u8>, CommandError> {
        let out = std::env::temp_dir().join(format!("kba-screen-{}.png", uuid::Uuid::new_v4()));
        let mut failures = Vec::new();

        for (program, args) in CAPTURE_TOOLS {
            let status = Command::new(program)
                .args(*args)
                .arg(&out)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(s) if s.success() && out.exists() => {
                    let bytes = std::fs::read(&out)?;
                    let _ = std::fs::remove_file(&out);
                    return Ok(bytes);
                }
                Ok(s) => {
                    debug!(program, status = %s, "screen capture tool failed");
                    failures.push(format!("{} ({})", program, s));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => failures.push(format!("{} ({})", program, e)),
            }
        }

        let _ = std::fs::remove_file(&out);
        if failures.is_empty() {
            let names: Vec<&str> = CAPTURE_TOOLS.iter().map(|(p, _)| *p).collect();
            Err(CommandError::CaptureUnavailable(names.join(", ")))
        } else {
            Err(CommandError::CaptureFailed(failures.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Screenshot,
    ImageFile,
}

/// What a matched command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// An image message to send to the agent in place of the query.
    Image(Message),
    /// The pattern matched but the command did not apply; the query
    /// continues as an ordinary question.
    Unchanged(String),
}

impl CommandResult {
    pub fn is_image(&self) -> bool {
        matches!(self, CommandResult::Image(_))
    }
}

pub struct CommandMatcher {
    patterns: Vec<(Regex, Handler)>,
    capture: Arc<dyn ScreenCapture>,
}

impl CommandMatcher {
    pub fn new(capture: Arc<dyn ScreenCapture>) -> Result<Self, CommandError> {
        Ok(Self {
            patterns: vec![
                (Regex::new(SCREENSHOT_PATTERN)?, Handler::Screenshot),
                (Regex::new(IMAGE_PATH_PATTERN)?, Handler::ImageFile),
            ],
            capture,
        })
    }

    pub fn with_system_capture() -> Result<Self, CommandError> {
        Self::new(Arc::new(SystemScreenCapture))
    }

    /// Match `query` against the command patterns, first match wins.
    ///
    /// Returns `Ok(None)` when no pattern matches.
    pub fn match_query(&self, query: &str) -> Result<Option<CommandResult>, CommandError> {
        for (pattern, handler) in &self.patterns {
            let Some(found) = pattern.find(query) else {
                continue;
            };
            debug!(?handler, matched = found.as_str(), "command matched");
            let result = match handler {
                Handler::Screenshot => self.screenshot()?,
                Handler::ImageFile => image_file(query, found.as_str())?,
            };
            return Ok(Some(result));
        }
        Ok(None)
    }

    fn screenshot(&self) -> Result<CommandResult, CommandError> {
        let bytes = self.capture.capture()?;
        Ok(CommandResult::Image(Message::image(
            Role::User,
            ImageData::Base64(STANDARD.encode(bytes)),
            ImageFormat::Png,
        )))
    }
}

fn image_file(query: &str, raw_path: &str) -> Result<CommandResult, CommandError> {
    let path = expand_home(raw_path);
    if !path.is_file() {
        return Ok(CommandResult::Unchanged(query.to_string()));
    }
    let Some(format) = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ImageFormat::from_extension)
    else {
        return Ok(CommandResult::Unchanged(query.to_string()));
    };
    match std::fs::read(&path) {
        Ok(bytes) => Ok(CommandResult::Image(Message::image(
            Role::User,
            ImageData::Base64(STANDARD.encode(bytes)),
            format,
        ))),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read image");
            Ok(CommandResult::Unchanged(query.to_string()))
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => return home.join(rest),
            None => debug!(path = raw, "no home directory to expand"),
        }
    }
    PathBuf::from(raw)
}
