pub mod config;
pub mod conversation;
pub mod editor;
pub mod error;
pub mod history;
pub mod io;
pub mod refinement;
pub mod session;
pub mod state;
pub mod supervisor;
