//! Serial configuration protocol spoken by the board firmware.
//!
//! Commands are single newline-terminated lines. Responses are free text;
//! each line is classified for display and scanned for the fields printed by
//! the `config` command.

pub mod session;

use std::{fmt, str::FromStr};

use thiserror::Error;

pub use session::SerialSession;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial line codec failed: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),

    #[error("serial port closed")]
    Closed,

    #[error("unknown board type: {0}")]
    UnknownBoard(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoardType {
    #[default]
    DevKit,
    S2Mini,
    Custom,
}

impl BoardType {
    pub fn code(self) -> u8 {
        match self {
            BoardType::DevKit => 0,
            BoardType::S2Mini => 1,
            BoardType::Custom => 2,
        }
    }
}

impl FromStr for BoardType {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(BoardType::DevKit),
            "1" => Ok(BoardType::S2Mini),
            "2" => Ok(BoardType::Custom),
            other => Err(SerialError::UnknownBoard(other.to_owned())),
        }
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoardType::DevKit => "ESP32 DevKit",
            BoardType::S2Mini => "S2 Mini",
            BoardType::Custom => "Custom",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialCommand {
    Wifi { ssid: String, password: String },
    AccessPoint { ssid: String, password: String },
    Name(String),
    Board(BoardType),
    Pin { name: String, number: u8 },
    Restart,
    Config,
}

impl SerialCommand {
    /// Parse a command as typed by an operator, e.g. `pin relay1 26`.
    pub fn parse(line: &str) -> Result<Self, SerialError> {
        let invalid = || SerialError::InvalidCommand(line.to_owned());
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(invalid)?;
        let rest: Vec<&str> = words.collect();

        let cmd = match (verb, rest.as_slice()) {
            ("wifi", [ssid, password]) => SerialCommand::Wifi {
                ssid: (*ssid).to_owned(),
                password: (*password).to_owned(),
            },
            ("ap", [ssid, password]) => SerialCommand::AccessPoint {
                ssid: (*ssid).to_owned(),
                password: (*password).to_owned(),
            },
            ("name", words) if !words.is_empty() => SerialCommand::Name(words.join(" ")),
            ("board", [code]) => SerialCommand::Board(code.parse()?),
            ("pin", [name, number]) => SerialCommand::Pin {
                name: (*name).to_owned(),
                number: number.parse().map_err(|_| invalid())?,
            },
            ("restart", []) => SerialCommand::Restart,
            ("config", []) => SerialCommand::Config,
            _ => return Err(invalid()),
        };
        Ok(cmd)
    }
}

impl fmt::Display for SerialCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialCommand::Wifi { ssid, password } => write!(f, "wifi {ssid} {password}"),
            SerialCommand::AccessPoint { ssid, password } => write!(f, "ap {ssid} {password}"),
            SerialCommand::Name(name) => write!(f, "name {name}"),
            SerialCommand::Board(board) => write!(f, "board {}", board.code()),
            SerialCommand::Pin { name, number } => write!(f, "pin {name} {number}"),
            SerialCommand::Restart => f.write_str("restart"),
            SerialCommand::Config => f.write_str("config"),
        }
    }
}

/// GPIO assignment pushed with `pin` commands, in sending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMap(pub Vec<(String, u8)>);

impl PinMap {
    /// Factory wiring of the DevKit board.
    pub fn devkit() -> Self {
        let pins = [
            ("relay1", 26),
            ("relay2", 27),
            ("relay3", 14),
            ("relay4", 12),
            ("led", 25),
            ("motor", 33),
            ("dht", 32),
            ("light", 34),
            ("motion", 35),
        ];
        Self(pins.iter().map(|(n, p)| ((*n).to_owned(), *p)).collect())
    }

    pub fn commands(&self) -> impl Iterator<Item = SerialCommand> + '_ {
        self.0.iter().map(|(name, number)| SerialCommand::Pin {
            name: name.clone(),
            number: *number,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Success,
    Error,
    Warning,
    Info,
}

impl LineKind {
    pub fn classify(line: &str) -> Self {
        if line.contains('✓') || line.contains("success") {
            LineKind::Success
        } else if line.contains('✗') || line.contains("error") || line.contains("fail") {
            LineKind::Error
        } else if line.contains('!') || line.contains("warning") {
            LineKind::Warning
        } else {
            LineKind::Info
        }
    }
}

/// Board settings as last reported over serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    pub device_name: Option<String>,
    pub wifi_ssid: Option<String>,
    pub ap_ssid: Option<String>,
    pub board: BoardType,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            wifi_ssid: None,
            ap_ssid: Some("ESP32_IoT_Hub".to_owned()),
            board: BoardType::DevKit,
        }
    }
}

impl BoardConfig {
    /// Fold one response line into the config. Returns whether anything matched.
    pub fn apply_line(&mut self, line: &str) -> bool {
        let mut matched = false;
        if line.contains("Device Name:") {
            if let Some(name) = field_value(line) {
                self.device_name = Some(name);
                matched = true;
            }
        }
        if line.contains("SSID:") && !line.contains("AP") {
            if let Some(ssid) = field_value(line).filter(|s| s != "(not set)") {
                self.wifi_ssid = Some(ssid);
                matched = true;
            }
        }
        if line.contains("AP SSID:") {
            if let Some(ssid) = field_value(line) {
                self.ap_ssid = Some(ssid);
                matched = true;
            }
        }
        if line.contains("Board Type:") {
            self.board = if line.contains("S2 Mini") {
                BoardType::S2Mini
            } else if line.contains("Custom") {
                BoardType::Custom
            } else {
                BoardType::DevKit
            };
            matched = true;
        }
        matched
    }
}

/// Text between the first and second `:`, trimmed.
fn field_value(line: &str) -> Option<String> {
    let value = line.split(':').nth(1)?.trim();
    (!value.is_empty()).then(|| value.to_owned())
}
