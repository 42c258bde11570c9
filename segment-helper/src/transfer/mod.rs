pub mod counter;
pub mod progress;
