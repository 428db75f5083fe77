pub mod generation;

pub use generation::{ApiFlavor, HttpGenerator, classify_status, extract_text};
