//! Application errors
use std::fmt;

#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
}

impl std::error::Error for AppError {}

#[derive(Debug)]
pub enum ErrorKind {
    Chip8(chip8::Chip8Error),
    Io(std::io::Error),
    Config(serde_yaml::Error),
    Key(chip8::InvalidKeyCode),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "application error: {}", self.kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chip8(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "invalid config: {err}"),
            Self::Key(err) => write!(f, "invalid config: {err}"),
        }
    }
}

impl From<chip8::Chip8Error> for AppError {
    fn from(err: chip8::Chip8Error) -> Self {
        Self {
            kind: ErrorKind::Chip8(err),
        }
    }
}

impl From<chip8::LoadError> for AppError {
    fn from(err: chip8::LoadError) -> Self {
        chip8::Chip8Error::from(err).into()
    }
}

impl From<chip8::ExecutionError> for AppError {
    fn from(err: chip8::ExecutionError) -> Self {
        chip8::Chip8Error::from(err).into()
    }
}

impl From<std::fmt::Error> for AppError {
    fn from(err: std::fmt::Error) -> Self {
        chip8::Chip8Error::from(err).into()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io(err),
        }
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self {
            kind: ErrorKind::Config(err),
        }
    }
}

impl From<chip8::InvalidKeyCode> for AppError {
    fn from(err: chip8::InvalidKeyCode) -> Self {
        Self {
            kind: ErrorKind::Key(err),
        }
    }
}
