pub mod actions;
pub mod engine;
pub mod interaction;
pub mod loop_control;
pub mod prompt;
pub mod state;
