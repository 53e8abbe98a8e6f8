//! Transfer pipeline: chunk reading, progress merging, sender and receiver
//! session state machines.

pub mod chunk;
pub mod progress;
pub mod receiver;
pub mod sender;
