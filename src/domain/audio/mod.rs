//! Audio domain - hold-audio file handling

pub mod wav;

pub use wav::{validate, WavErrorCode, WavFile, WavFormat, WavInfo, WavValidationError};
