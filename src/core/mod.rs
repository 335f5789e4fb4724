pub mod aria2;
pub mod disk;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod ffmpeg;
pub mod filename;
pub mod fragments;
pub mod ids;
pub mod orchestrator;
pub mod package;
pub mod process;
pub mod progress;
pub mod queue;
pub mod refresh;
pub mod temp_files;
pub mod variants;
pub mod ytdlp;

#[cfg(test)]
pub mod testing;
