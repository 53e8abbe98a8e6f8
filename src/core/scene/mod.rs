pub mod backend;
pub mod clock;
pub mod descriptor;
pub mod director;
pub mod frames;
pub mod timeline;
